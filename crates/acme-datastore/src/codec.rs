//! Record envelope encoding.
//!
//! An envelope is the literal [`ENVELOPE_PREFIX`] followed by the JSON
//! record. With a key configured the whole envelope is sealed with
//! AES-256-GCM and stored as `nonce || ciphertext || tag`.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// Literal prefix every decoded envelope must start with.
pub const ENVELOPE_PREFIX: &[u8] = b"caddy-tlsconsul";

/// Length of an AES-256 key in bytes.
pub const KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Encodes records into envelopes and back.
#[derive(Clone)]
pub struct RecordCodec {
    cipher: Option<Aes256Gcm>,
}

impl RecordCodec {
    /// Create a codec. `None` disables encryption.
    pub fn new(key: Option<&[u8; KEY_LEN]>) -> Self {
        Self {
            cipher: key.map(|k| Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(k))),
        }
    }

    /// Codec that stores plaintext envelopes.
    pub fn plaintext() -> Self {
        Self { cipher: None }
    }

    /// Whether envelopes are encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Serialize `record` into a (possibly sealed) envelope.
    ///
    /// A fresh random nonce is drawn from the OS for every call.
    pub fn encode<T: Serialize>(&self, record: &T) -> Result<Vec<u8>, CodecError> {
        let mut envelope = ENVELOPE_PREFIX.to_vec();
        serde_json::to_writer(&mut envelope, record)
            .map_err(|e| CodecError::Format(format!("unable to marshal: {e}")))?;

        let Some(cipher) = &self.cipher else {
            return Ok(envelope);
        };

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, envelope.as_slice())
            .map_err(|e| CodecError::Format(format!("unable to seal envelope: {e}")))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(blob)
    }

    /// Open an envelope and deserialize the record inside.
    pub fn decode<T: DeserializeOwned>(&self, blob: &[u8]) -> Result<T, CodecError> {
        let envelope = match &self.cipher {
            Some(cipher) => {
                if blob.len() < NONCE_LEN + TAG_LEN {
                    return Err(CodecError::Decryption);
                }
                let (nonce, sealed) = blob.split_at(NONCE_LEN);
                cipher
                    .decrypt(Nonce::from_slice(nonce), sealed)
                    .map_err(|_| CodecError::Decryption)?
            }
            None => blob.to_vec(),
        };

        let payload = envelope
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or_else(|| CodecError::Format("missing envelope prefix".to_string()))?;

        serde_json::from_slice(payload)
            .map_err(|e| CodecError::Format(format!("unable to unmarshal result: {e}")))
    }
}

impl fmt::Debug for RecordCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordCodec")
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}
