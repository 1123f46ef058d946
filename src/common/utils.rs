//! Utility functions for dynconf

use chrono::{DateTime, Utc};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Percent-encoding set for node names used in file names
const KEY_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b'\\')
    .add(b'%')
    .add(b' ')
    .add(b'?')
    .add(b'#')
    .add(b'&')
    .add(b':')
    .add(b'*');

/// Encode a node name for filesystem usage
pub fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_ENCODE_SET).to_string()
}

/// Decode a percent-encoded node name
pub fn decode_key(encoded: &str) -> crate::Result<String> {
    percent_decode_str(encoded)
        .decode_utf8()
        .map(|s| s.to_string())
        .map_err(|e| crate::Error::Corrupted(format!("Failed to decode key: {}", e)))
}

/// Parse duration string (e.g., "500ms", "30s", "5m")
pub fn parse_duration(s: &str) -> crate::Result<std::time::Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (num_str, unit) = s.split_at(split);

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let duration = match unit {
        "ms" => std::time::Duration::from_millis(num),
        "s" => std::time::Duration::from_secs(num),
        "m" => std::time::Duration::from_secs(num * 60),
        "h" => std::time::Duration::from_secs(num * 3600),
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

/// Current wall-clock time
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Host and user recorded against every mutation a client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub host: String,
    pub user: String,
}

impl Environment {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
        }
    }

    /// Host and user from the process environment, falling back to
    /// "unknown" when neither is set.
    pub fn from_system() -> Self {
        let host = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .or_else(|_| std::fs::read_to_string("/etc/hostname").map(|s| s.trim().to_string()))
            .unwrap_or_else(|_| "unknown".into());
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".into());
        Self { host, user }
    }
}

/// Source of change identifiers.
///
/// Created once per orchestrator and shared; the sequential form makes
/// test runs reproducible.
#[derive(Debug)]
pub enum ChangeIdGenerator {
    Random,
    Sequential(AtomicU64),
}

impl ChangeIdGenerator {
    pub fn random() -> Self {
        ChangeIdGenerator::Random
    }

    pub fn sequential(start: u64) -> Self {
        ChangeIdGenerator::Sequential(AtomicU64::new(start))
    }

    pub fn next_id(&self) -> Uuid {
        match self {
            ChangeIdGenerator::Random => Uuid::new_v4(),
            ChangeIdGenerator::Sequential(counter) => {
                Uuid::from_u128(counter.fetch_add(1, Ordering::SeqCst) as u128)
            }
        }
    }
}

impl Default for ChangeIdGenerator {
    fn default() -> Self {
        Self::random()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_key() {
        let key = "rack/2:node a";
        let encoded = encode_key(key);
        assert!(!encoded.contains('/'));
        assert!(!encoded.contains(' '));

        let decoded = decode_key(&encoded).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(
            parse_duration("500ms").unwrap(),
            std::time::Duration::from_millis(500)
        );
        assert_eq!(
            parse_duration("30s").unwrap(),
            std::time::Duration::from_secs(30)
        );
        assert_eq!(
            parse_duration("5m").unwrap(),
            std::time::Duration::from_secs(300)
        );
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn test_sequential_ids() {
        let ids = ChangeIdGenerator::sequential(7);
        let a = ids.next_id();
        let b = ids.next_id();
        assert_eq!(a, Uuid::from_u128(7));
        assert_eq!(b, Uuid::from_u128(8));
        assert_ne!(ChangeIdGenerator::random().next_id(), Uuid::nil());
    }
}
