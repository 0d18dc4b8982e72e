use base64::{engine::general_purpose, Engine as _};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::aes::SessionCipher;
use crate::error::Result;

/// Separator between the two fields of the sealed payload.
const FIELD_DELIMITER: &str = "::";

/// A bearer token that failed to decode.
///
/// Carries no detail about which step rejected it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid token")]
pub struct InvalidToken;

/// The pair a bearer token stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenClaims {
    pub user_id: i64,
    pub session_id: i64,
}

/// Seals `(user_id, session_id)` into an opaque URL-safe token and back.
#[derive(Clone)]
pub struct TokenCodec {
    cipher: SessionCipher,
}

impl TokenCodec {
    /// Creates a codec from the process-wide secret.
    pub fn new(secret: &[u8]) -> Result<Self> {
        Ok(Self {
            cipher: SessionCipher::new(secret)?,
        })
    }

    /// Produces `base64url(nonce || ciphertext || tag)` over `"<user_id>::<session_id>"`.
    pub fn encrypt(&self, user_id: i64, session_id: i64) -> Result<String> {
        let payload = Zeroizing::new(format!("{}{}{}", user_id, FIELD_DELIMITER, session_id));
        let sealed = self.cipher.seal(payload.as_bytes())?;
        Ok(general_purpose::URL_SAFE_NO_PAD.encode(sealed))
    }

    /// Recovers the claims from a token produced by [`TokenCodec::encrypt`].
    pub fn decrypt(&self, token: &str) -> std::result::Result<TokenClaims, InvalidToken> {
        let sealed = general_purpose::URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| InvalidToken)?;
        let plaintext = Zeroizing::new(self.cipher.open(&sealed).ok_or(InvalidToken)?);
        let payload = std::str::from_utf8(&plaintext).map_err(|_| InvalidToken)?;
        parse_payload(payload)
    }
}

fn parse_payload(payload: &str) -> std::result::Result<TokenClaims, InvalidToken> {
    let mut fields = payload.split(FIELD_DELIMITER);
    let (Some(user), Some(session), None) = (fields.next(), fields.next(), fields.next()) else {
        return Err(InvalidToken);
    };
    Ok(TokenClaims {
        user_id: parse_decimal(user)?,
        session_id: parse_decimal(session)?,
    })
}

/// Strict decimal: optional leading `-`, ASCII digits only.
fn parse_decimal(field: &str) -> std::result::Result<i64, InvalidToken> {
    let digits = field.strip_prefix('-').unwrap_or(field);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(InvalidToken);
    }
    field.parse().map_err(|_| InvalidToken)
}
