//! Strongly typed domain primitives for sessions, devices and transfers.
//!
//! Identifiers are short URL-safe tokens so they can be embedded in the
//! share link encoded in the QR code.

use crate::domain::errors::RelayError;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Alphabet used for every generated token (URL-safe, no padding).
pub const URL_SAFE_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

/// Length of a session id.
pub const SESSION_ID_LEN: usize = 10;

/// Length of an upload id.
pub const UPLOAD_ID_LEN: usize = 9;

/// Length of a presence user id.
pub const USER_ID_LEN: usize = 5;

/// Longest id accepted from the outside world.
const MAX_ID_LEN: usize = 64;

fn random_token(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..URL_SAFE_ALPHABET.len());
            URL_SAFE_ALPHABET[idx] as char
        })
        .collect()
}

fn check_token(kind: &str, value: &str) -> Result<(), RelayError> {
    if value.is_empty() {
        return Err(RelayError::InvalidInput {
            message: format!("{} must not be empty", kind),
        });
    }
    if value.len() > MAX_ID_LEN {
        return Err(RelayError::InvalidInput {
            message: format!("{} is longer than {} characters", kind, MAX_ID_LEN),
        });
    }
    if !value.bytes().all(|b| URL_SAFE_ALPHABET.contains(&b)) {
        return Err(RelayError::InvalidInput {
            message: format!("{} '{}' contains characters that are not URL-safe", kind, value),
        });
    }
    Ok(())
}

/// Opaque, URL-safe session token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh 10 character session id.
    pub fn generate() -> Self {
        Self(random_token(SESSION_ID_LEN))
    }

    /// Parses an id received from a client or a share link.
    pub fn parse(s: &str) -> Result<Self, RelayError> {
        check_token("session id", s)?;
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one upload attempt; embedded in the storage path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(String);

impl UploadId {
    pub fn generate() -> Self {
        Self(random_token(UPLOAD_ID_LEN))
    }

    pub fn parse(s: &str) -> Result<Self, RelayError> {
        check_token("upload id", s)?;
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Presence key of a connected device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn generate() -> Self {
        Self(random_token(USER_ID_LEN))
    }

    pub fn parse(s: &str) -> Result<Self, RelayError> {
        check_token("user id", s)?;
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a device within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// The device that created the session (the receiver).
    Host,
    /// A device that joined through the share link.
    Guest,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Host => write!(f, "host"),
            DeviceType::Guest => write!(f, "guest"),
        }
    }
}

/// Stored lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    Expired,
}

/// Kind of a quick message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Url,
}

impl MessageKind {
    /// Anything that starts with `http` is treated as a link.
    pub fn classify(content: &str) -> Self {
        if content.starts_with("http") {
            MessageKind::Url
        } else {
            MessageKind::Text
        }
    }
}

/// Status carried by an upload progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Uploading,
    Completed,
    Error,
}

impl UploadStatus {
    /// `completed` and `error` end a progress stream.
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Error)
    }
}

/// UTC timestamp wrapper used across records.
pub type TimestampUtc = DateTime<Utc>;

/// Builds the link encoded in the QR code for a session.
pub fn share_url(base_url: &str, id: &SessionId) -> String {
    format!("{}/session/{}", base_url.trim_end_matches('/'), id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_session_id_is_url_safe() {
        for _ in 0..100 {
            let id = SessionId::generate();
            assert_eq!(id.as_str().len(), SESSION_ID_LEN);
            assert!(SessionId::parse(id.as_str()).is_ok());
        }
    }

    #[test]
    fn test_generated_lengths() {
        assert_eq!(UploadId::generate().as_str().len(), UPLOAD_ID_LEN);
        assert_eq!(UserId::generate().as_str().len(), USER_ID_LEN);
    }

    #[test]
    fn test_parse_rejects_bad_ids() {
        assert!(SessionId::parse("").is_err());
        assert!(SessionId::parse("abc/123").is_err());
        assert!(SessionId::parse("has space").is_err());
        assert!(SessionId::parse(&"a".repeat(65)).is_err());
        assert!(SessionId::parse("abc1234567").is_ok());
    }

    #[test]
    fn test_message_kind_classify() {
        assert_eq!(MessageKind::classify("https://example.com"), MessageKind::Url);
        assert_eq!(MessageKind::classify("http://x"), MessageKind::Url);
        assert_eq!(MessageKind::classify("hello http"), MessageKind::Text);
    }

    #[test]
    fn test_share_url() {
        let id = SessionId::parse("abc1234567").unwrap();
        assert_eq!(
            share_url("https://printf.example/", &id),
            "https://printf.example/session/abc1234567"
        );
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!UploadStatus::Uploading.is_terminal());
        assert!(UploadStatus::Completed.is_terminal());
        assert!(UploadStatus::Error.is_terminal());
    }
}
