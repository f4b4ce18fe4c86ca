//! Small helpers shared by the configuration, session and maintenance
//! modules.

use rand::RngCore;
use subtle::ConstantTimeEq;

/// A fresh 32 byte secret rendered as 64 lower-case hex characters.
pub fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Constant-time equality for shared secrets.
pub fn secrets_match(supplied: &str, expected: &str) -> bool {
    supplied.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Normalise a mount path to start with a single slash and carry no
/// trailing slash (the root stays `/`).
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_owned()
    } else {
        format!("/{}", trimmed)
    }
}
