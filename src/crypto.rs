//! Token encryption using AES-256-GCM
//!
//! Access and refresh tokens are sealed with AES-256-GCM before they reach
//! the store, with additional authenticated data (AAD) binding each
//! ciphertext to its (organization, vendor) context so a ciphertext copied
//! onto another connection fails to open.
//!
//! The cipher requires an explicit 32-byte key at construction and fails
//! fast without one; there is no ephemeral key generation and no plaintext
//! fallback.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

const VERSION_SEALED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_SEALED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("empty ciphertext")]
    EmptyCiphertext,
}

/// 32-byte key wrapper that zeroizes on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TokenKey(Vec<u8>);

impl TokenKey {
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        Ok(TokenKey(bytes))
    }

    /// Decode a key from standard base64 (the form it takes in config).
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        use base64::Engine as _;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::DecryptionFailed(format!("invalid key encoding: {e}")))?;
        Self::new(bytes)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for TokenKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenKey(..)")
    }
}

/// Seals and opens token material for the connection store.
#[derive(Debug, Clone)]
pub struct TokenCipher {
    key: TokenKey,
}

impl TokenCipher {
    pub fn new(key: TokenKey) -> Self {
        Self { key }
    }

    /// Encrypt `plaintext` bound to `aad`. Output layout: version byte,
    /// 12-byte nonce, ciphertext + 16-byte tag.
    pub fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher_key = Key::<Aes256Gcm>::from_slice(self.key.as_bytes());
        let cipher = Aes256Gcm::new(cipher_key);

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut ciphertext = cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut sealed = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
        sealed.push(VERSION_SEALED);
        sealed.extend_from_slice(&nonce);
        sealed.append(&mut ciphertext);
        Ok(sealed)
    }

    /// Decrypt a sealed payload produced by [`TokenCipher::seal`].
    pub fn open(&self, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.is_empty() {
            return Err(CryptoError::EmptyCiphertext);
        }
        if sealed[0] != VERSION_SEALED || sealed.len() < MIN_SEALED_LEN {
            return Err(CryptoError::InvalidFormat);
        }

        let nonce = Nonce::from_slice(&sealed[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
        let ciphertext = &sealed[VERSION_FIELD_LEN + NONCE_LEN..];

        let cipher_key = Key::<Aes256Gcm>::from_slice(self.key.as_bytes());
        let cipher = Aes256Gcm::new(cipher_key);

        cipher
            .decrypt(nonce, Payload { msg: ciphertext, aad })
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }

    /// Seal a token string, returning `None` untouched.
    pub fn seal_token(&self, aad: &str, token: Option<&str>) -> Result<Option<Vec<u8>>, CryptoError> {
        token
            .map(|t| self.seal(aad.as_bytes(), t.as_bytes()))
            .transpose()
    }

    /// Open a sealed token back into a UTF-8 string.
    pub fn open_token(&self, aad: &str, sealed: Option<&[u8]>) -> Result<Option<String>, CryptoError> {
        sealed
            .map(|s| {
                self.open(aad.as_bytes(), s).and_then(|bytes| {
                    String::from_utf8(bytes)
                        .map_err(|e| CryptoError::DecryptionFailed(format!("invalid UTF-8: {e}")))
                })
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> TokenCipher {
        TokenCipher::new(TokenKey::new(vec![7u8; 32]).expect("valid test key"))
    }

    #[test]
    fn seal_open_roundtrip() {
        let cipher = test_cipher();
        let sealed = cipher.seal(b"org|vendor", b"secret token").expect("seal");
        let opened = cipher.open(b"org|vendor", &sealed).expect("open");
        assert_eq!(opened, b"secret token");
    }

    #[test]
    fn different_aad_fails() {
        let cipher = test_cipher();
        let sealed = cipher.seal(b"org-a|vendor", b"secret").expect("seal");
        assert!(cipher.open(b"org-b|vendor", &sealed).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let cipher = test_cipher();
        let mut sealed = cipher.seal(b"aad", b"secret").expect("seal");
        sealed[14] ^= 0x01;
        assert!(cipher.open(b"aad", &sealed).is_err());
    }

    #[test]
    fn nonces_are_unique() {
        let cipher = test_cipher();
        let a = cipher.seal(b"aad", b"secret").expect("seal");
        let b = cipher.seal(b"aad", b"secret").expect("seal");
        assert_ne!(&a[1..13], &b[1..13]);
    }

    #[test]
    fn unversioned_payload_rejected() {
        let cipher = test_cipher();
        assert!(matches!(
            cipher.open(b"aad", b"not-a-sealed-payload"),
            Err(CryptoError::InvalidFormat)
        ));
    }

    #[test]
    fn short_payload_rejected() {
        let cipher = test_cipher();
        assert!(matches!(
            cipher.open(b"aad", &[VERSION_SEALED, 0x02]),
            Err(CryptoError::InvalidFormat)
        ));
        assert!(matches!(
            cipher.open(b"aad", &[]),
            Err(CryptoError::EmptyCiphertext)
        ));
    }

    #[test]
    fn wrong_key_length_rejected() {
        assert!(TokenKey::new(vec![0u8; 16]).is_err());
        assert!(TokenKey::new(vec![0u8; 64]).is_err());
    }

    #[test]
    fn token_helpers_pass_none_through() {
        let cipher = test_cipher();
        assert!(cipher.seal_token("aad", None).expect("seal").is_none());
        assert!(cipher.open_token("aad", None).expect("open").is_none());

        let sealed = cipher.seal_token("aad", Some("tok")).expect("seal").unwrap();
        let opened = cipher.open_token("aad", Some(&sealed)).expect("open");
        assert_eq!(opened.as_deref(), Some("tok"));
    }
}
