use crate::config::EncryptionConfig;
use crate::error::{GatewayError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::Engine as _;
use rand::RngCore;
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;

/// AES-256-GCM encryption for values stored at rest.
///
/// Ciphertexts are base64 (URL-safe) encodings of `nonce || sealed bytes`.
#[derive(Clone)]
pub struct EncryptionClient {
    key: Zeroizing<[u8; 32]>,
}

impl std::fmt::Debug for EncryptionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionClient").finish_non_exhaustive()
    }
}

impl EncryptionClient {
    pub fn new(key: &[u8]) -> Result<Self> {
        let key: [u8; 32] = key.try_into().map_err(|_| {
            GatewayError::encryption(format!("encryption key must be 32 bytes, got {}", key.len()))
        })?;
        Ok(Self {
            key: Zeroizing::new(key),
        })
    }

    /// Derive a key from a seed string. Only suitable for development setups.
    pub fn from_seed(seed: &str) -> Self {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(b"Gram-Environment-Key-v1:");
        hasher.update(seed.as_bytes());

        let mut key = [0u8; 32];
        key.copy_from_slice(&hasher.finalize());
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Client for the configured key, or a seed-derived key when none is set
    pub fn from_config(config: &EncryptionConfig, fallback_seed: &str) -> Result<Self> {
        match config.key_bytes()? {
            Some(bytes) => Self::new(&bytes),
            None => {
                tracing::warn!("No encryption key configured, deriving a development key");
                Ok(Self::from_seed(fallback_seed))
            }
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(self.key.as_ref())
            .map_err(|e| GatewayError::encryption(format!("Failed to create cipher: {}", e)))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| GatewayError::encryption(format!("Failed to encrypt value: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::URL_SAFE.encode(sealed))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let sealed = base64::engine::general_purpose::URL_SAFE
            .decode(encoded)
            .map_err(|e| GatewayError::encryption(format!("Invalid ciphertext encoding: {}", e)))?;
        if sealed.len() < NONCE_LEN {
            return Err(GatewayError::encryption("Invalid encrypted data format"));
        }

        let cipher = Aes256Gcm::new_from_slice(self.key.as_ref())
            .map_err(|e| GatewayError::encryption(format!("Failed to create cipher: {}", e)))?;

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| GatewayError::encryption(format!("Failed to decrypt value: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| GatewayError::encryption(format!("Decrypted value is not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let client = EncryptionClient::new(&[3u8; 32]).unwrap();
        let sealed = client.encrypt("s3cr3t").unwrap();
        assert_ne!(sealed, "s3cr3t");
        assert_eq!(client.decrypt(&sealed).unwrap(), "s3cr3t");
    }

    #[test]
    fn test_nonce_is_random() {
        let client = EncryptionClient::from_seed("dev");
        assert_ne!(client.encrypt("same").unwrap(), client.encrypt("same").unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = EncryptionClient::from_seed("a").encrypt("value").unwrap();
        let err = EncryptionClient::from_seed("b").decrypt(&sealed).unwrap_err();
        assert!(matches!(err, GatewayError::Encryption { .. }));
    }

    #[test]
    fn test_key_length_checked() {
        assert!(EncryptionClient::new(&[0u8; 16]).is_err());
        assert!(EncryptionClient::new(&[0u8; 32]).unwrap().decrypt("AAAA").is_err());
    }
}
