//! Directory-backed blob store with signed links.
//!
//! Links have the form `{base}/blobs/{path}?expires={unix}&sig={hex}` where
//! `sig = HMAC-SHA256(secret, path \n expires)`. The secret is generated per
//! store instance, so links do not survive a daemon restart.

use crate::domain::{RelayError, RelayResult, SessionId, SharedClock};
use crate::store::{BlobStore, SignedLink};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Blob store rooted at a local directory.
#[derive(Debug)]
pub struct LocalBlobStore {
    root: PathBuf,
    base_url: String,
    secret: [u8; 32],
    clock: SharedClock,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, base_url: &str, clock: SharedClock) -> Self {
        let secret: [u8; 32] = rand::thread_rng().gen();
        Self::with_secret(root, base_url, clock, secret)
    }

    pub fn with_secret(
        root: impl Into<PathBuf>,
        base_url: &str,
        clock: SharedClock,
        secret: [u8; 32],
    ) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            secret,
            clock,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a storage path onto the root, refusing anything that is not a
    /// plain relative path.
    fn resolve(&self, path: &str) -> RelayResult<PathBuf> {
        let relative = Path::new(path);
        let plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if path.is_empty() || !plain {
            return Err(RelayError::invalid(format!("bad storage path '{}'", path)));
        }
        Ok(self.root.join(relative))
    }

    fn mac(&self, path: &str, expires: i64) -> RelayResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| RelayError::invalid(format!("bad link secret: {}", e)))?;
        mac.update(path.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    fn signature(&self, path: &str, expires: i64) -> RelayResult<String> {
        Ok(hex::encode(self.mac(path, expires)?.finalize().into_bytes()))
    }

    fn link_prefix(&self) -> String {
        format!("{}/blobs/", self.base_url)
    }

    /// Checks a link and returns the storage path it grants access to.
    pub fn verify(&self, url: &str) -> RelayResult<String> {
        let prefix = self.link_prefix();
        let rest = url
            .strip_prefix(&prefix)
            .ok_or_else(|| rejected("link was not issued by this store"))?;
        let (encoded_path, query) = rest
            .split_once('?')
            .ok_or_else(|| rejected("link has no signature"))?;
        let path = urlencoding::decode(encoded_path)
            .map_err(|_| rejected("link path is not UTF-8"))?
            .into_owned();

        let mut expires = None;
        let mut sig = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("expires", value)) => expires = value.parse::<i64>().ok(),
                Some(("sig", value)) => sig = Some(value),
                _ => {}
            }
        }
        let expires = expires.ok_or_else(|| rejected("missing or bad expiry"))?;
        let sig = sig.ok_or_else(|| rejected("missing signature"))?;

        let sig = hex::decode(sig).map_err(|_| rejected("malformed signature"))?;
        if self.mac(&path, expires)?.verify_slice(&sig).is_err() {
            return Err(rejected("signature mismatch"));
        }
        if self.clock.now().timestamp() > expires {
            return Err(rejected("link expired"));
        }
        Ok(path)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, path: &str, content_type: &str, bytes: Vec<u8>) -> RelayResult<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RelayError::storage(format!("create {}: {}", parent.display(), e)))?;
        }

        // Atomic write via temp file + rename
        let mut temp = target.clone().into_os_string();
        temp.push(".partial");
        let temp = PathBuf::from(temp);
        let size = bytes.len();
        tokio::fs::write(&temp, bytes)
            .await
            .map_err(|e| RelayError::storage(format!("write {}: {}", temp.display(), e)))?;
        tokio::fs::rename(&temp, &target)
            .await
            .map_err(|e| RelayError::storage(format!("rename {}: {}", target.display(), e)))?;

        tracing::debug!(path, content_type, size, "blob stored");
        Ok(())
    }

    async fn read(&self, path: &str) -> RelayResult<Vec<u8>> {
        let target = self.resolve(path)?;
        tokio::fs::read(&target).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => RelayError::FileNotFound {
                file_id: path.to_string(),
            },
            _ => RelayError::storage(format!("read {}: {}", target.display(), e)),
        })
    }

    async fn delete(&self, path: &str) -> RelayResult<()> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RelayError::storage(format!(
                "delete {}: {}",
                target.display(),
                e
            ))),
        }
    }

    async fn delete_session(&self, session_id: &SessionId) -> RelayResult<()> {
        let target = self.resolve(&format!("sessions/{}", session_id))?;
        match tokio::fs::remove_dir_all(&target).await {
            Ok(()) => {
                tracing::debug!(session = %session_id, "session blobs removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RelayError::storage(format!(
                "delete {}: {}",
                target.display(),
                e
            ))),
        }
    }

    fn sign(&self, path: &str, ttl: Duration) -> RelayResult<SignedLink> {
        self.resolve(path)?;
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| RelayError::invalid(format!("bad link ttl: {}", e)))?;
        let expires_at = self.clock.now() + ttl;
        let expires = expires_at.timestamp();

        let url = format!(
            "{}{}?expires={}&sig={}",
            self.link_prefix(),
            encode_path(path),
            expires,
            self.signature(path, expires)?
        );
        Ok(SignedLink {
            url,
            path: path.to_string(),
            expires_at,
        })
    }

    async fn redeem(&self, url: &str) -> RelayResult<Vec<u8>> {
        let path = self.verify(url)?;
        self.read(&path).await
    }
}

fn rejected(message: &str) -> RelayError {
    RelayError::LinkRejected {
        message: message.to_string(),
    }
}

/// Percent-encodes each segment, keeping the separators readable.
fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ManualClock;
    use chrono::Utc;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn store(dir: &Path, clock: &ManualClock) -> LocalBlobStore {
        LocalBlobStore::with_secret(
            dir,
            "http://relay.test/",
            Arc::new(clock.clone()),
            [7u8; 32],
        )
    }

    #[tokio::test]
    async fn test_put_read_delete() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(Utc::now());
        let store = store(dir.path(), &clock);

        store
            .put("sessions/abc1234567/up1234567-a.txt", "text/plain", b"abc".to_vec())
            .await
            .unwrap();
        assert_eq!(
            store.read("sessions/abc1234567/up1234567-a.txt").await.unwrap(),
            b"abc"
        );

        store.delete("sessions/abc1234567/up1234567-a.txt").await.unwrap();
        store.delete("sessions/abc1234567/up1234567-a.txt").await.unwrap();
        assert!(matches!(
            store.read("sessions/abc1234567/up1234567-a.txt").await,
            Err(RelayError::FileNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_session_removes_only_that_session() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(Utc::now());
        let store = store(dir.path(), &clock);
        let gone = SessionId::parse("abc1234567").unwrap();
        store
            .put("sessions/abc1234567/up1234567-a.txt", "text/plain", b"a".to_vec())
            .await
            .unwrap();
        store
            .put("sessions/xyz7654321/up7654321-b.txt", "text/plain", b"b".to_vec())
            .await
            .unwrap();

        store.delete_session(&gone).await.unwrap();
        store.delete_session(&gone).await.unwrap();
        assert!(!dir.path().join("sessions/abc1234567").exists());
        assert_eq!(
            store.read("sessions/xyz7654321/up7654321-b.txt").await.unwrap(),
            b"b"
        );
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(Utc::now());
        let store = store(dir.path(), &clock);
        assert!(store.put("../outside", "x", vec![]).await.is_err());
        assert!(store.put("/etc/passwd", "x", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_signed_link_round_trip_and_expiry() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(Utc::now());
        let store = store(dir.path(), &clock);
        let path = "sessions/abc1234567/up1234567-my photo?.jpg";
        store.put(path, "image/jpeg", b"jpeg".to_vec()).await.unwrap();

        let link = store.sign(path, Duration::from_secs(60)).unwrap();
        assert!(link.url.starts_with("http://relay.test/blobs/sessions/abc1234567/"));
        assert!(link.url.contains("my%20photo%3F.jpg"));
        assert_eq!(store.redeem(&link.url).await.unwrap(), b"jpeg");

        clock.advance(chrono::Duration::seconds(61));
        assert!(matches!(
            store.redeem(&link.url).await,
            Err(RelayError::LinkRejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_tampered_link_rejected() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(Utc::now());
        let store = store(dir.path(), &clock);
        store.put("sessions/s/a", "x", b"1".to_vec()).await.unwrap();
        store.put("sessions/s/b", "x", b"2".to_vec()).await.unwrap();

        let link = store.sign("sessions/s/a", Duration::from_secs(60)).unwrap();
        let forged = link.url.replace("sessions/s/a", "sessions/s/b");
        assert!(matches!(
            store.redeem(&forged).await,
            Err(RelayError::LinkRejected { .. })
        ));
        assert!(store.redeem("http://elsewhere/blobs/sessions/s/a").await.is_err());

        let bad_hex = format!("{}zz", link.url);
        assert!(matches!(
            store.redeem(&bad_hex).await,
            Err(RelayError::LinkRejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_link_from_another_secret_rejected() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(Utc::now());
        let store_a = store(dir.path(), &clock);
        let store_b = LocalBlobStore::with_secret(
            dir.path(),
            "http://relay.test/",
            Arc::new(clock.clone()),
            [9u8; 32],
        );
        store_a.put("sessions/s/a", "x", b"1".to_vec()).await.unwrap();

        let link = store_b.sign("sessions/s/a", Duration::from_secs(60)).unwrap();
        assert!(matches!(
            store_a.redeem(&link.url).await,
            Err(RelayError::LinkRejected { .. })
        ));
        assert_eq!(store_b.redeem(&link.url).await.unwrap(), b"1");
    }
}
