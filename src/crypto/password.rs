use argon2::{
    password_hash::{PasswordHash, PasswordHasher as _, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::{rngs::OsRng, RngCore};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::config::Argon2Settings;
use crate::error::{AppError, Result};

/// Salt length for new hashes.
const SALT_SIZE: usize = 16;
/// Derived key length for new hashes.
const OUTPUT_SIZE: usize = 32;
/// Upper bound on a decoded PHC salt.
const MAX_SALT_SIZE: usize = 64;

/// Hashes and verifies passwords as self-describing Argon2 PHC strings.
///
/// New hashes use the configured cost; verification always uses whatever
/// the stored string says, so old hashes keep verifying after a cost change.
#[derive(Clone, Debug)]
pub struct PasswordHasher {
    settings: Argon2Settings,
}

impl PasswordHasher {
    pub fn new(settings: Argon2Settings) -> Self {
        Self { settings }
    }

    /// Hashes a password using Argon2id.
    ///
    /// # Returns
    ///
    /// `$argon2id$v=19$m=..,t=..,p=..$<salt>$<hash>`
    pub fn hash(&self, password: &str) -> Result<String> {
        let mut salt_bytes = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt_bytes);

        let salt = SaltString::encode_b64(&salt_bytes)
            .map_err(|e| AppError::Encryption(format!("Salt encoding error: {}", e)))?;

        let params = Params::new(
            self.settings.memory_kib,
            self.settings.iterations,
            self.settings.parallelism,
            Some(OUTPUT_SIZE),
        )
        .map_err(|e| AppError::Encryption(format!("Argon2 params: {}", e)))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let password_hash = argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AppError::Encryption(format!("Argon2 hash error: {}", e)))?
            .to_string();

        tracing::debug!("Password hashed with Argon2id");
        Ok(password_hash)
    }

    /// Verifies a password against a stored hash.
    ///
    /// # Returns
    ///
    /// `Ok(false)` on mismatch. `Err` only when `stored` is malformed.
    pub fn verify(&self, password: &str, stored: &str) -> Result<bool> {
        verify_password(password, stored)
    }
}

/// Re-derives the key with the stored parameters and compares it in constant time.
pub fn verify_password(password: &str, stored: &str) -> Result<bool> {
    let parsed = PasswordHash::new(stored).map_err(malformed)?;

    let algorithm = Algorithm::try_from(parsed.algorithm).map_err(malformed)?;
    let version = match parsed.version {
        Some(v) => Version::try_from(v).map_err(malformed)?,
        None => return Err(malformed("missing version")),
    };
    if version != Version::V0x13 {
        return Err(malformed("incompatible Argon2 version"));
    }

    let params = Params::try_from(&parsed).map_err(malformed)?;

    let salt = parsed.salt.ok_or_else(|| malformed("missing salt"))?;
    let mut salt_buf = [0u8; MAX_SALT_SIZE];
    let salt_bytes = salt.decode_b64(&mut salt_buf).map_err(malformed)?;

    let expected = parsed.hash.ok_or_else(|| malformed("missing hash"))?;

    let mut derived = Zeroizing::new(vec![0u8; expected.len()]);
    Argon2::new(algorithm, version, params)
        .hash_password_into(password.as_bytes(), salt_bytes, &mut derived)
        .map_err(malformed)?;

    let matched: bool = derived.as_slice().ct_eq(expected.as_bytes()).into();
    tracing::debug!("Password verification completed");
    Ok(matched)
}

fn malformed(e: impl std::fmt::Display) -> AppError {
    AppError::Encryption(format!("Malformed password hash: {}", e))
}
