//! Admin bootstrap validation.
//!
//! There is no built-in default account. Boot refuses to proceed when the
//! bootstrap credentials are missing, malformed, or hash to a known-weak
//! password.

use sha2::{Digest, Sha256};

pub struct AdminBootstrap {
    pub email: String,
    pub api_token: String,
}

/// Passwords whose SHA-256 must never be accepted as a bootstrap hash.
const WEAK_PASSWORDS: &[&str] = &[
    "admin", "admin123", "password", "password123", "changeme", "letmein", "123456",
    "12345678", "qwerty", "secret",
];

pub fn validate_admin_bootstrap() -> Result<AdminBootstrap, String> {
    let email = std::env::var("ADMIN_BOOTSTRAP_EMAIL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or("ADMIN_BOOTSTRAP_EMAIL is required")?;
    if !email.contains('@') {
        return Err(format!("ADMIN_BOOTSTRAP_EMAIL {email:?} is not an email address"));
    }

    let password_hash = std::env::var("ADMIN_BOOTSTRAP_PASSWORD_HASH")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or("ADMIN_BOOTSTRAP_PASSWORD_HASH is required")?;
    validate_password_hash(&password_hash)?;

    let api_token = std::env::var("ADMIN_API_TOKEN")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or("ADMIN_API_TOKEN is required")?;
    if api_token.len() < 16 {
        return Err("ADMIN_API_TOKEN must be at least 16 characters".into());
    }

    Ok(AdminBootstrap { email, api_token })
}

fn validate_password_hash(hash: &str) -> Result<(), String> {
    let normalized = hash.trim().to_lowercase();
    if normalized.len() != 64 || !normalized.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err("ADMIN_BOOTSTRAP_PASSWORD_HASH must be a SHA-256 hex digest".into());
    }

    for weak in WEAK_PASSWORDS {
        if normalized == sha256_hex(weak) {
            return Err(format!(
                "ADMIN_BOOTSTRAP_PASSWORD_HASH is the hash of the weak password {weak:?}"
            ));
        }
    }
    Ok(())
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weak_password_hash_rejected() {
        let weak = sha256_hex("admin123");
        assert!(validate_password_hash(&weak).is_err());
    }

    #[test]
    fn test_strong_password_hash_accepted() {
        let strong = sha256_hex("correct horse battery staple 9481");
        assert!(validate_password_hash(&strong).is_ok());
    }

    #[test]
    fn test_malformed_hash_rejected() {
        assert!(validate_password_hash("not-a-hash").is_err());
        assert!(validate_password_hash("abcd").is_err());
    }

    #[test]
    fn test_uppercase_hex_is_normalized() {
        let strong = sha256_hex("another strong passphrase 7712").to_uppercase();
        assert!(validate_password_hash(&strong).is_ok());
    }
}
