//! Symmetric encryption of stored source passwords.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use fernet::Fernet;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("ENCRYPTION_KEY is not set.")]
    MissingKey,
    #[error("derived key was rejected")]
    InvalidKey,
    #[error("stored credential could not be decrypted")]
    Decrypt,
    #[error("decrypted credential is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Explicitly constructed decryption capability, passed to whoever needs it.
pub trait CredentialCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Vec<u8>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<String, CipherError>;
}

/// Fernet tokens keyed by url-safe-base64(SHA-256(secret)).
pub struct FernetCipher {
    fernet: Fernet,
}

impl FernetCipher {
    pub fn from_secret(secret: &str) -> Result<Self, CipherError> {
        if secret.is_empty() {
            return Err(CipherError::MissingKey);
        }
        let digest = Sha256::digest(secret.as_bytes());
        let key = URL_SAFE.encode(digest);
        let fernet = Fernet::new(&key).ok_or(CipherError::InvalidKey)?;
        Ok(Self { fernet })
    }

    pub fn from_optional_secret(secret: Option<&str>) -> Result<Self, CipherError> {
        Self::from_secret(secret.ok_or(CipherError::MissingKey)?)
    }
}

impl fmt::Debug for FernetCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FernetCipher(<key>)")
    }
}

impl CredentialCipher for FernetCipher {
    fn encrypt(&self, plaintext: &str) -> Vec<u8> {
        self.fernet.encrypt(plaintext.as_bytes()).into_bytes()
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<String, CipherError> {
        let token = std::str::from_utf8(ciphertext).map_err(|_| CipherError::Decrypt)?;
        let plain = self
            .fernet
            .decrypt(token)
            .map_err(|_| CipherError::Decrypt)?;
        Ok(String::from_utf8(plain)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypted_password_decrypts_with_same_secret_only() {
        let cipher = FernetCipher::from_secret("correct horse").unwrap();
        let token = cipher.encrypt("p@ssw0rd");
        assert_ne!(token, b"p@ssw0rd".to_vec());
        assert_eq!(cipher.decrypt(&token).unwrap(), "p@ssw0rd");

        let other = FernetCipher::from_secret("battery staple").unwrap();
        assert!(matches!(other.decrypt(&token), Err(CipherError::Decrypt)));
    }

    #[test]
    fn missing_secret_is_a_configuration_error() {
        assert!(matches!(
            FernetCipher::from_optional_secret(None),
            Err(CipherError::MissingKey)
        ));
        assert!(matches!(
            FernetCipher::from_secret(""),
            Err(CipherError::MissingKey)
        ));
    }
}
