use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use common::{ServiceError, ServiceResult};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::warn;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// AES-256-GCM cipher over mailbox credentials. Payload layout is
/// base64(nonce ‖ ciphertext ‖ tag) with a fresh random nonce per call.
pub struct CredentialCipher {
    cipher: Aes256Gcm,
    version: u32,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher")
            .field("version", &self.version)
            .finish()
    }
}

impl CredentialCipher {
    /// Explicit 32-byte key. The version travels in every response so
    /// callers can tell which key wrote a payload.
    pub fn new(key: &[u8], version: u32) -> anyhow::Result<Self> {
        if key.len() != 32 {
            anyhow::bail!("encryption key must be exactly 32 bytes");
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| anyhow::anyhow!("failed to create cipher: {}", e))?;
        Ok(Self { cipher, version })
    }

    /// Degraded mode: key derived by hashing a shared service secret.
    /// Deterministic, so every instance derives the same key. Reported as
    /// version 0 so consumers can see the weaker posture.
    pub fn derived(secret: &str) -> Self {
        let key = Sha256::digest(secret.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(key.as_slice()).expect("SHA-256 digest is 32 bytes");
        Self { cipher, version: 0 }
    }

    /// Build from the environment: an explicit base64 key when configured,
    /// otherwise the hashed fallback secret.
    pub fn from_env(fallback_secret: Option<&str>) -> anyhow::Result<Self> {
        if let Ok(key_b64) = std::env::var("MAILBOX_CRYPTO_KEY") {
            let key = BASE64
                .decode(key_b64.trim())
                .map_err(|e| anyhow::anyhow!("MAILBOX_CRYPTO_KEY is not valid base64: {}", e))?;
            let version = std::env::var("MAILBOX_CRYPTO_KEY_VERSION")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            return Self::new(&key, version);
        }

        match fallback_secret {
            Some(secret) => {
                warn!("MAILBOX_CRYPTO_KEY not set; deriving key from service secret (degraded mode)");
                Ok(Self::derived(secret))
            }
            None => anyhow::bail!(
                "no key material: set MAILBOX_CRYPTO_KEY or provide a fallback secret"
            ),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn encrypt(&self, plaintext: &str) -> ServiceResult<String> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Encryption failed: {}", e)))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(payload))
    }

    pub fn decrypt(&self, payload: &str) -> ServiceResult<String> {
        let decoded = BASE64
            .decode(payload.trim())
            .map_err(|_| ServiceError::BadRequest("Payload is not valid base64".to_string()))?;

        if decoded.len() < NONCE_LEN + TAG_LEN {
            return Err(ServiceError::BadRequest(
                "Payload too short for nonce and authentication tag".to_string(),
            ));
        }

        let (nonce, ciphertext) = decoded.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                ServiceError::BadRequest(
                    "Decryption failed: authentication error (tampered data or wrong key)"
                        .to_string(),
                )
            })?;

        String::from_utf8(plaintext)
            .map_err(|_| ServiceError::BadRequest("Decrypted data is not valid UTF-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> CredentialCipher {
        CredentialCipher::new(&[7u8; 32], 1).unwrap()
    }

    #[test]
    fn test_rejects_short_key() {
        assert!(CredentialCipher::new(&[0u8; 16], 1).is_err());
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let c = cipher();
        for plaintext in ["", "hunter2", "pässwörd with ünicøde", "{\"imap\":\"secret\"}"] {
            let encrypted = c.encrypt(plaintext).unwrap();
            assert_eq!(c.decrypt(&encrypted).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let c = cipher();
        let a = c.encrypt("same input").unwrap();
        let b = c.encrypt("same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_payload_fails_authentication() {
        let c = cipher();
        let encrypted = c.encrypt("credentials").unwrap();
        let mut raw = BASE64.decode(&encrypted).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(raw);
        assert!(c.decrypt(&tampered).is_err());
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let encrypted = cipher().encrypt("credentials").unwrap();
        let other = CredentialCipher::new(&[8u8; 32], 2).unwrap();
        assert!(other.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_derived_key_is_deterministic() {
        let a = CredentialCipher::derived("shared-secret");
        let b = CredentialCipher::derived("shared-secret");
        let encrypted = a.encrypt("credentials").unwrap();
        assert_eq!(b.decrypt(&encrypted).unwrap(), "credentials");
        assert_eq!(a.version(), 0);
    }

    #[test]
    fn test_rejects_garbage_payloads() {
        let c = cipher();
        assert!(c.decrypt("not base64 !!!").is_err());
        assert!(c.decrypt(&BASE64.encode(b"short")).is_err());
    }
}
