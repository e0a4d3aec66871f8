//! Snapshot payload encoding: JSON -> gzip -> AES-256-GCM -> base64.

use crate::config::BackupPolicy;
use crate::core::{Result, VaultError};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{Engine as _, engine::general_purpose};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

const NONCE_LEN: usize = 12;

/// Result of [`BackupCodec::encode`].
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    pub text: String,
    /// Bytes after compression and encryption, before base64.
    pub stored_size: usize,
    pub compressed: bool,
    pub encrypted: bool,
}

#[derive(Clone)]
pub struct BackupCodec {
    compress: bool,
    key: Option<[u8; 32]>,
}

impl BackupCodec {
    pub fn new(compress: bool, key: Option<[u8; 32]>) -> Self {
        Self { compress, key }
    }

    pub fn from_policy(policy: &BackupPolicy) -> Result<Self> {
        Ok(Self::new(policy.compress, policy.encryption_key_bytes()?))
    }

    pub fn encrypts(&self) -> bool {
        self.key.is_some()
    }

    pub fn encode(&self, plaintext: &[u8]) -> Result<EncodedPayload> {
        let mut bytes = if self.compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(plaintext)?;
            encoder.finish()?
        } else {
            plaintext.to_vec()
        };

        if let Some(key) = &self.key {
            let cipher = Aes256Gcm::new_from_slice(key)
                .map_err(|err| VaultError::Codec(format!("cipher init: {}", err)))?;
            let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
            let ciphertext = cipher
                .encrypt(&nonce, bytes.as_ref())
                .map_err(|err| VaultError::Codec(format!("encrypt: {}", err)))?;
            let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
            sealed.extend_from_slice(nonce.as_slice());
            sealed.extend_from_slice(&ciphertext);
            bytes = sealed;
        }

        Ok(EncodedPayload {
            stored_size: bytes.len(),
            text: general_purpose::STANDARD.encode(&bytes),
            compressed: self.compress,
            encrypted: self.key.is_some(),
        })
    }

    /// Reverses [`encode`](Self::encode) using the flags recorded with the snapshot.
    pub fn decode(&self, text: &str, compressed: bool, encrypted: bool) -> Result<Vec<u8>> {
        let mut bytes = general_purpose::STANDARD
            .decode(text.trim())
            .map_err(|err| VaultError::Codec(format!("base64: {}", err)))?;

        if encrypted {
            let key = self.key.as_ref().ok_or_else(|| {
                VaultError::Codec("snapshot is encrypted but no key is configured".to_string())
            })?;
            if bytes.len() < NONCE_LEN {
                return Err(VaultError::Codec("encrypted payload is truncated".to_string()));
            }
            let cipher = Aes256Gcm::new_from_slice(key)
                .map_err(|err| VaultError::Codec(format!("cipher init: {}", err)))?;
            let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
            bytes = cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|err| VaultError::Codec(format!("decrypt: {}", err)))?;
        }

        if compressed {
            let mut decoder = GzDecoder::new(&bytes[..]);
            let mut plaintext = Vec::new();
            decoder
                .read_to_end(&mut plaintext)
                .map_err(|err| VaultError::Codec(format!("gunzip: {}", err)))?;
            bytes = plaintext;
        }
        Ok(bytes)
    }
}

/// Hex SHA-256 of the plaintext snapshot body.
pub fn checksum(plaintext: &[u8]) -> String {
    hex::encode(Sha256::digest(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_and_encrypted_payload_round_trips() {
        let codec = BackupCodec::new(true, Some([7u8; 32]));
        let plaintext = br#"{"templates":[{"id":"1","name":"A"}]}"#.repeat(20);
        let encoded = codec.encode(&plaintext).unwrap();
        assert!(encoded.compressed && encoded.encrypted);
        assert!(encoded.stored_size < plaintext.len());
        assert_eq!(codec.decode(&encoded.text, true, true).unwrap(), plaintext);
    }

    #[test]
    fn wrong_key_or_missing_key_fails() {
        let encoded = BackupCodec::new(false, Some([1u8; 32])).encode(b"secret").unwrap();
        assert!(BackupCodec::new(false, Some([2u8; 32]))
            .decode(&encoded.text, false, true)
            .is_err());
        assert!(BackupCodec::new(false, None)
            .decode(&encoded.text, false, true)
            .is_err());
    }

    #[test]
    fn checksum_is_stable_hex() {
        assert_eq!(checksum(b"abc").len(), 64);
        assert_eq!(checksum(b"abc"), checksum(b"abc"));
        assert_ne!(checksum(b"abc"), checksum(b"abd"));
    }
}
