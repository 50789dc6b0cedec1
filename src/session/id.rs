use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};

const SESSION_ID_SALT_BITS: u32 = 32;
static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a time-sortable base62 session id.
pub fn generate_session_id() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before UNIX_EPOCH while generating session id")?
        .as_nanos();
    let pid_component = (std::process::id() as u128 & 0xFFFF) << 16;
    let seq_component = (SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed) as u128) & 0xFFFF;
    let entropy = (nanos << SESSION_ID_SALT_BITS) | pid_component | seq_component;
    let id = base62_encode_u128(entropy);
    if id.len() > 22 {
        bail!("session id overflow while generating identifier")
    }
    Ok(id)
}

/// Session ids double as directory and file names.
pub fn validate_session_id(id: &str) -> Result<()> {
    if id.is_empty() {
        bail!("session id must not be empty");
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        bail!("session id must be alphanumeric: {id}");
    }
    Ok(())
}

fn base62_encode_u128(mut value: u128) -> String {
    const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut chars = Vec::new();
    while value > 0 {
        chars.push(ALPHABET[(value % 62) as usize] as char);
        value /= 62;
    }
    chars.iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_valid() {
        let a = generate_session_id().unwrap();
        let b = generate_session_id().unwrap();
        assert_ne!(a, b);
        validate_session_id(&a).unwrap();
        assert_eq!(a.len(), b.len());
    }

    #[test]
    fn test_validate_rejects_paths() {
        assert!(validate_session_id("../etc").is_err());
        assert!(validate_session_id("a/b").is_err());
        assert!(validate_session_id("").is_err());
    }

    #[test]
    fn test_base62() {
        assert_eq!(base62_encode_u128(0), "0");
        assert_eq!(base62_encode_u128(61), "z");
        assert_eq!(base62_encode_u128(62), "10");
    }
}
