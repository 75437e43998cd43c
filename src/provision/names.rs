//! Tenant name and password generation

use rand::Rng;

use crate::types::{FleetError, Result};

/// Prefix used when the caller gives none
pub const DEFAULT_PREFIX: &str = "provision";

/// Longest accepted prefix
pub const MAX_PREFIX_LEN: usize = 32;

/// Length of the random name suffix
pub const SUFFIX_LEN: usize = 8;

/// Length of generated passwords
pub const PASSWORD_LEN: usize = 24;

const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const PASSWORD_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Prefixes end up in database and user names: 1 to 32 of `[A-Za-z0-9_]`
pub fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() || prefix.len() > MAX_PREFIX_LEN {
        return Err(FleetError::Validation(format!(
            "prefix must be 1 to {} characters, got {}",
            MAX_PREFIX_LEN,
            prefix.len()
        )));
    }
    if !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(FleetError::Validation(format!(
            "prefix '{}' may only contain letters, digits and underscores",
            prefix
        )));
    }
    Ok(())
}

fn sample(charset: &[u8], len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| charset[rng.gen_range(0..charset.len())] as char)
        .collect()
}

/// `{prefix}_{8 random lowercase alphanumerics}`
pub fn generate_name(prefix: &str) -> String {
    format!("{}_{}", prefix, sample(SUFFIX_CHARSET, SUFFIX_LEN))
}

pub fn generate_password() -> String {
    sample(PASSWORD_CHARSET, PASSWORD_LEN)
}
