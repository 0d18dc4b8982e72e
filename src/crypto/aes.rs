use aes_gcm::{
    aead::{consts::U12, Aead, KeyInit, OsRng},
    aes::Aes192,
    Aes128Gcm, Aes256Gcm, AesGcm, Nonce,
};
use aes_gcm::aead::rand_core::RngCore;
use crate::error::{AppError, Result};

/// The size of the AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// The size of the AES-GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// AES-GCM keyed with a 128, 192 or 256-bit key.
///
/// The variant is picked from the key length once; the key schedule is kept
/// for the life of the process and shared read-only between requests.
#[derive(Clone)]
pub enum SessionCipher {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

impl SessionCipher {
    /// Builds a cipher from raw key bytes.
    ///
    /// # Arguments
    ///
    /// * `key` - 16, 24 or 32 bytes. Anything else is rejected, never padded.
    pub fn new(key: &[u8]) -> Result<Self> {
        let invalid = |_| AppError::Encryption("Invalid key length".to_string());
        match key.len() {
            16 => Aes128Gcm::new_from_slice(key).map(Self::Aes128).map_err(invalid),
            24 => Aes192Gcm::new_from_slice(key).map(Self::Aes192).map_err(invalid),
            32 => Aes256Gcm::new_from_slice(key).map(Self::Aes256).map_err(invalid),
            n => Err(AppError::Encryption(format!(
                "AES key must be 16, 24 or 32 bytes, got {}",
                n
            ))),
        }
    }

    /// Encrypts `plaintext` under a fresh random nonce.
    ///
    /// # Returns
    ///
    /// `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes = generate_nonce();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = match self {
            Self::Aes128(c) => c.encrypt(nonce, plaintext),
            Self::Aes192(c) => c.encrypt(nonce, plaintext),
            Self::Aes256(c) => c.encrypt(nonce, plaintext),
        }
        .map_err(|e| AppError::Encryption(format!("Encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Inverts [`SessionCipher::seal`].
    ///
    /// Returns `None` for short input or a failed tag check.
    pub fn open(&self, sealed: &[u8]) -> Option<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return None;
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        match self {
            Self::Aes128(c) => c.decrypt(nonce, ciphertext),
            Self::Aes192(c) => c.decrypt(nonce, ciphertext),
            Self::Aes256(c) => c.decrypt(nonce, ciphertext),
        }
        .ok()
    }
}

/// Generates a new random AES-GCM nonce.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seals_and_opens_with_every_key_size() {
        for len in [16, 24, 32] {
            let cipher = SessionCipher::new(&vec![7u8; len]).unwrap();
            let sealed = cipher.seal(b"payload").unwrap();
            assert_eq!(sealed.len(), NONCE_SIZE + 7 + TAG_SIZE);
            assert_eq!(cipher.open(&sealed).unwrap(), b"payload");
        }
    }

    #[test]
    fn rejects_odd_key_sizes() {
        for len in [0, 1, 15, 20, 33, 64] {
            assert!(SessionCipher::new(&vec![0u8; len]).is_err());
        }
    }

    #[test]
    fn nonces_are_fresh() {
        let cipher = SessionCipher::new(&[1u8; 32]).unwrap();
        let a = cipher.seal(b"same").unwrap();
        let b = cipher.seal(b"same").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn short_input_does_not_open() {
        let cipher = SessionCipher::new(&[1u8; 16]).unwrap();
        assert!(cipher.open(&[]).is_none());
        assert!(cipher.open(&[0u8; NONCE_SIZE + TAG_SIZE - 1]).is_none());
    }
}
