//! The `crypto` module on top of `ring`.
//!
//! Sealed messages are `nonce || ciphertext || tag`; every seal draws a fresh
//! 96-bit nonce from the system CSPRNG.

use std::num::NonZeroU32;

use ring::{
    aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN},
    pbkdf2,
    rand::{SecureRandom, SystemRandom},
};
use scriptbot_plugin_sdk::{OperationError, OperationErrorKind};

/// Length of the secret `seal` and `open` expect.
pub const SECRET_LEN: usize = 32;

pub struct CryptoNamespace {
    rng: SystemRandom,
}

impl Default for CryptoNamespace {
    fn default() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }
}

impl CryptoNamespace {
    pub fn random_bytes(&self, count: usize) -> Result<Vec<u8>, OperationError> {
        let mut bytes = vec![0u8; count];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| crypto_error("failed to generate random bytes"))?;
        Ok(bytes)
    }

    /// Derives a `key_bits`-long key. `hash` is one of `sha1`, `sha256`,
    /// `sha384` or `sha512`.
    pub fn pbkdf2(
        &self,
        hash: &str,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        key_bits: usize,
    ) -> Result<Vec<u8>, OperationError> {
        let algorithm = match hash.to_ascii_lowercase().replace('-', "").as_str() {
            "sha1" => pbkdf2::PBKDF2_HMAC_SHA1,
            "sha256" => pbkdf2::PBKDF2_HMAC_SHA256,
            "sha384" => pbkdf2::PBKDF2_HMAC_SHA384,
            "sha512" => pbkdf2::PBKDF2_HMAC_SHA512,
            other => return Err(invalid(format!("unsupported hash `{other}`"))),
        };
        let iterations =
            NonZeroU32::new(iterations).ok_or_else(|| invalid("iterations must be at least 1"))?;
        if key_bits == 0 || key_bits % 8 != 0 {
            return Err(invalid("key length must be a positive multiple of 8 bits"));
        }
        let mut key = vec![0u8; key_bits / 8];
        pbkdf2::derive(algorithm, iterations, salt, password, &mut key);
        Ok(key)
    }

    /// Encrypts `message` with AES-256-GCM under a 32-byte `secret`.
    pub fn seal(&self, secret: &[u8], message: &[u8]) -> Result<Vec<u8>, OperationError> {
        let key = key(secret)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| crypto_error("failed to generate random nonce"))?;

        let mut in_out = message.to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| crypto_error("AES-256-GCM encryption failed"))?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&in_out);
        Ok(sealed)
    }

    /// Reverses [`seal`](Self::seal). Fails on a wrong secret or tampered data.
    pub fn open(&self, secret: &[u8], sealed: &[u8]) -> Result<Vec<u8>, OperationError> {
        let key = key(secret)?;
        if sealed.len() < NONCE_LEN {
            return Err(crypto_error("sealed message is too short"));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| crypto_error("malformed nonce"))?;
        let mut in_out = ciphertext.to_vec();
        let plaintext = key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| crypto_error("AES-256-GCM decryption failed; wrong secret or corrupted data"))?;
        Ok(plaintext.to_vec())
    }
}

fn key(secret: &[u8]) -> Result<LessSafeKey, OperationError> {
    if secret.len() != SECRET_LEN {
        return Err(invalid(format!("secret must be {SECRET_LEN} bytes, got {}", secret.len())));
    }
    let unbound = UnboundKey::new(&AES_256_GCM, secret)
        .map_err(|_| crypto_error("failed to create AES-256-GCM key"))?;
    Ok(LessSafeKey::new(unbound))
}

fn crypto_error(message: &str) -> OperationError {
    OperationError::new(OperationErrorKind::Crypto, message)
}

fn invalid(message: impl Into<String>) -> OperationError {
    OperationError::new(OperationErrorKind::InvalidRequest, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_with_same_secret() {
        let crypto = CryptoNamespace::default();
        let secret = crypto.random_bytes(SECRET_LEN).unwrap();
        let sealed = crypto.seal(&secret, b"attack at dawn").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 14 + 16);
        assert_eq!(crypto.open(&secret, &sealed).unwrap(), b"attack at dawn");
    }

    #[test]
    fn tampered_or_wrong_secret_fails() {
        let crypto = CryptoNamespace::default();
        let secret = [7u8; SECRET_LEN];
        let mut sealed = crypto.seal(&secret, b"payload").unwrap();
        assert_eq!(
            crypto.open(&[8u8; SECRET_LEN], &sealed).unwrap_err().kind,
            OperationErrorKind::Crypto
        );
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(crypto.open(&secret, &sealed).is_err());
        assert_eq!(
            crypto.seal(b"short", b"x").unwrap_err().kind,
            OperationErrorKind::InvalidRequest
        );
    }

    #[test]
    fn pbkdf2_matches_rfc6070_vector() {
        let crypto = CryptoNamespace::default();
        let key = crypto.pbkdf2("sha1", b"password", b"salt", 2, 160).unwrap();
        assert_eq!(hex::encode(key), "ea6c014dc72d6f8ccd1ed92ace1d41f0d8de8957");
        assert!(crypto.pbkdf2("md4", b"p", b"s", 1, 128).is_err());
        assert!(crypto.pbkdf2("sha256", b"p", b"s", 0, 128).is_err());
        assert!(crypto.pbkdf2("sha256", b"p", b"s", 1, 12).is_err());
    }
}
