//! STREAM receiver
//!
//! Derives per-connection credentials from a single 32-byte server secret:
//!
//! - `shared_secret = HKDF-SHA256(secret, "ilp_stream_shared_secret" || tag)`
//! - `ilp_address = own_address + "." + base64url(AES-256-GCM-SIV(k_tag, tag))`
//!
//! The tag (the owning payment or wallet address id) is encrypted with a
//! key derived from the server secret under a fixed nonce, making the
//! address codec deterministic and reversible: any node holding the server
//! secret can recover the tag from a destination address, and nobody else
//! can correlate addresses with payments.
//!
//! Fulfillments follow the STREAM construction: the fulfillment is an
//! HMAC-SHA256 of the packet data under a key derived from the shared
//! secret, and the condition is its SHA-256 hash.

use aes_gcm_siv::{
    aead::{Aead, KeyInit},
    Aes256GcmSiv, Nonce,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const SHARED_SECRET_INFO: &[u8] = b"ilp_stream_shared_secret";
const TAG_ENCRYPTION_INFO: &[u8] = b"ilp_stream_tag_encryption";
const FULFILLMENT_INFO: &[u8] = b"ilp_stream_fulfillment";

/// STREAM credential failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The destination is not under our address space
    #[error("destination is not a local stream address")]
    NotLocal,
    /// The encrypted tag segment could not be decoded
    #[error("invalid stream tag")]
    InvalidTag,
}

/// Credentials handed to a sender for one STREAM connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCredentials {
    /// Destination ILP address encoding the connection tag
    pub ilp_address: String,
    /// 32-byte shared secret
    pub shared_secret: [u8; 32],
}

/// Derives and verifies STREAM credentials from the server secret
#[derive(Clone)]
pub struct StreamSecrets {
    secret: [u8; 32],
    own_address: String,
}

impl std::fmt::Debug for StreamSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSecrets")
            .field("own_address", &self.own_address)
            .finish_non_exhaustive()
    }
}

impl StreamSecrets {
    /// Create from the configured server secret and ILP address prefix
    pub fn new(secret: [u8; 32], own_address: impl Into<String>) -> Self {
        Self {
            secret,
            own_address: own_address.into(),
        }
    }

    /// The local ILP address prefix
    pub fn own_address(&self) -> &str {
        &self.own_address
    }

    fn derive(&self, info_prefix: &[u8], tag: &[u8], out: &mut [u8]) {
        let hkdf = Hkdf::<Sha256>::new(None, &self.secret);
        let mut info = Vec::with_capacity(info_prefix.len() + tag.len());
        info.extend_from_slice(info_prefix);
        info.extend_from_slice(tag);
        hkdf.expand(&info, out)
            .expect("hkdf output length is valid");
    }

    /// Shared secret for a connection tag
    pub fn shared_secret(&self, tag: &str) -> [u8; 32] {
        let mut out = [0u8; 32];
        self.derive(SHARED_SECRET_INFO, tag.as_bytes(), &mut out);
        out
    }

    fn tag_cipher(&self) -> Aes256GcmSiv {
        let mut key = [0u8; 32];
        self.derive(TAG_ENCRYPTION_INFO, &[], &mut key);
        Aes256GcmSiv::new_from_slice(&key).expect("key length is valid")
    }

    /// Credentials for a connection tag
    pub fn credentials(&self, tag: &str) -> StreamCredentials {
        let cipher = self.tag_cipher();
        // The tag is unique per connection, so the fixed nonce never
        // repeats for distinct plaintexts and SIV tolerates reuse.
        let nonce = Nonce::from_slice(&[0u8; 12]);
        let ciphertext = cipher
            .encrypt(nonce, tag.as_bytes())
            .expect("in-memory encryption");
        let encoded = URL_SAFE_NO_PAD.encode(ciphertext);
        StreamCredentials {
            ilp_address: format!("{}.{}", self.own_address, encoded),
            shared_secret: self.shared_secret(tag),
        }
    }

    /// Recover the connection tag from a destination address
    pub fn decode_destination(&self, destination: &str) -> Result<String, StreamError> {
        let remainder = destination
            .strip_prefix(&self.own_address)
            .and_then(|r| r.strip_prefix('.'))
            .ok_or(StreamError::NotLocal)?;
        // Senders may append connection-local segments after the tag
        let encoded = remainder.split('.').next().ok_or(StreamError::InvalidTag)?;
        let ciphertext = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| StreamError::InvalidTag)?;
        let cipher = self.tag_cipher();
        let nonce = Nonce::from_slice(&[0u8; 12]);
        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| StreamError::InvalidTag)?;
        String::from_utf8(plaintext).map_err(|_| StreamError::InvalidTag)
    }
}

/// Fulfillment for a packet under a shared secret
pub fn fulfillment(shared_secret: &[u8; 32], data: &[u8]) -> [u8; 32] {
    let mut key_mac =
        <HmacSha256 as Mac>::new_from_slice(shared_secret).expect("hmac accepts any key length");
    key_mac.update(FULFILLMENT_INFO);
    let key = key_mac.finalize().into_bytes();

    let mut mac = <HmacSha256 as Mac>::new_from_slice(&key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Condition the sender attaches for a packet under a shared secret
pub fn condition(shared_secret: &[u8; 32], data: &[u8]) -> [u8; 32] {
    Sha256::digest(fulfillment(shared_secret, data)).into()
}

/// Verify a prepare's condition and produce the fulfillment if it matches
pub fn fulfill_if_valid(
    shared_secret: &[u8; 32],
    data: &[u8],
    execution_condition: &[u8; 32],
) -> Option<[u8; 32]> {
    let fulfillment = fulfillment(shared_secret, data);
    let expected: [u8; 32] = Sha256::digest(fulfillment).into();
    if &expected == execution_condition {
        Some(fulfillment)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets() -> StreamSecrets {
        StreamSecrets::new([42u8; 32], "test.engine")
    }

    #[test]
    fn test_address_codec_roundtrip() {
        let secrets = secrets();
        let tag = uuid::Uuid::new_v4().to_string();
        let creds = secrets.credentials(&tag);
        assert!(creds.ilp_address.starts_with("test.engine."));
        assert_eq!(secrets.decode_destination(&creds.ilp_address).unwrap(), tag);
    }

    #[test]
    fn test_codec_is_deterministic() {
        let secrets = secrets();
        let a = secrets.credentials("payment-1");
        let b = secrets.credentials("payment-1");
        assert_eq!(a, b);
    }

    #[test]
    fn test_extra_segments_are_ignored() {
        let secrets = secrets();
        let creds = secrets.credentials("payment-1");
        let with_suffix = format!("{}.extra.segments", creds.ilp_address);
        assert_eq!(
            secrets.decode_destination(&with_suffix).unwrap(),
            "payment-1"
        );
    }

    #[test]
    fn test_foreign_and_garbled_destinations_fail() {
        let secrets = secrets();
        assert_eq!(
            secrets.decode_destination("test.other.abc"),
            Err(StreamError::NotLocal)
        );
        assert_eq!(
            secrets.decode_destination("test.engine.!!!not-base64url!!!"),
            Err(StreamError::InvalidTag)
        );
        // a valid-looking token under a different secret does not decode
        let other = StreamSecrets::new([7u8; 32], "test.engine");
        let creds = other.credentials("payment-1");
        assert_eq!(
            secrets.decode_destination(&creds.ilp_address),
            Err(StreamError::InvalidTag)
        );
    }

    #[test]
    fn test_different_tags_get_different_secrets() {
        let secrets = secrets();
        assert_ne!(secrets.shared_secret("a"), secrets.shared_secret("b"));
    }

    #[test]
    fn test_fulfillment_matches_condition() {
        let shared_secret = secrets().shared_secret("payment-1");
        let data = b"stream frame bytes";
        let condition = condition(&shared_secret, data);
        let fulfillment = fulfill_if_valid(&shared_secret, data, &condition).unwrap();
        let hashed: [u8; 32] = Sha256::digest(fulfillment).into();
        assert_eq!(hashed, condition);
    }

    #[test]
    fn test_wrong_condition_is_not_fulfilled() {
        let shared_secret = secrets().shared_secret("payment-1");
        let condition = [1u8; 32];
        assert!(fulfill_if_valid(&shared_secret, b"data", &condition).is_none());
    }

    #[test]
    fn test_wrong_secret_cannot_fulfill() {
        let right = secrets().shared_secret("payment-1");
        let wrong = secrets().shared_secret("payment-2");
        let data = b"stream frame bytes";
        let condition = condition(&right, data);
        assert!(fulfill_if_valid(&wrong, data, &condition).is_none());
    }
}
