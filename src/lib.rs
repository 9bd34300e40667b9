//! printf-relay: short-lived pairing sessions that move files and quick
//! messages between a receiving host and the devices that scan its QR code.
//!
//! # Architecture
//!
//! - **session**: one `ractor` actor per live session owns its lock flag,
//!   presence set and approval state
//! - **broker**: per-session topic fanout over `tokio::sync::broadcast`
//! - **transfer**: uploads, messages and signed download links
//! - **relay**: the facade the daemon drives
//! - **rpc**: tarpc daemon and client, with event push to subscribers

pub mod approval;
pub mod broker;
pub mod cli;
pub mod config;
pub mod domain;
pub mod history;
pub mod logging;
pub mod presence;
pub mod progress;
pub mod relay;
pub mod relay_paths;
pub mod retry;
pub mod rpc;
pub mod session;
pub mod store;
pub mod transfer;

/// Git commit the binary was built from, or `unknown`.
pub const BUILD_SHA: &str = env!("PRINTF_RELAY_GIT_SHA");

/// Commit timestamp (Unix seconds) of the build, 0 when unknown.
pub const BUILD_TIMESTAMP: u64 = parse_timestamp(env!("PRINTF_RELAY_BUILD_TIMESTAMP"));

const fn parse_timestamp(raw: &str) -> u64 {
    let bytes = raw.as_bytes();
    let mut value: u64 = 0;
    let mut i = 0;
    while i < bytes.len() {
        let digit = bytes[i];
        if !digit.is_ascii_digit() {
            return 0;
        }
        value = value * 10 + (digit - b'0') as u64;
        i += 1;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_sha_is_set() {
        assert!(!BUILD_SHA.is_empty());
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("1700000000"), 1_700_000_000);
        assert_eq!(parse_timestamp("not a number"), 0);
        assert_eq!(parse_timestamp(""), 0);
    }
}
