//! Polymorphic byte-string signer: local HMAC-SHA256 over a symmetric key,
//! or delegation to a remote HSM endpoint.
//!
//! `sign` takes `&self` rather than `&mut self`, so `async_trait` is enough
//! here without any lifetime-vs-future juggling.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::edge_hsm::EdgeHsmSigningMechanism;
use crate::error::SigningError;

type HmacSha256 = Hmac<Sha256>;

/// Signs arbitrary byte strings for SAS token generation.
#[async_trait]
pub trait SigningMechanism: Send + Sync {
    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SigningError>;
}

/// Signs locally with HMAC-SHA256 over a base64-decoded shared access key.
pub struct SymmetricKeySigningMechanism {
    key: Vec<u8>,
}

impl SymmetricKeySigningMechanism {
    /// `key` is the base64-encoded `SharedAccessKey` value.
    pub fn new(key_base64: &str) -> Result<Self, SigningError> {
        let key = STANDARD
            .decode(key_base64)
            .map_err(SigningError::InvalidKey)?;
        Ok(Self { key })
    }
}

#[async_trait]
impl SigningMechanism for SymmetricKeySigningMechanism {
    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SigningError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .expect("HMAC accepts a key of any length");
        mac.update(data);
        let digest = mac.finalize().into_bytes();
        Ok(STANDARD.encode(digest).into_bytes())
    }
}

/// Dispatches to whichever concrete signer a session was configured with.
pub enum AnySigningMechanism {
    SymmetricKey(SymmetricKeySigningMechanism),
    EdgeHsm(EdgeHsmSigningMechanism),
}

#[async_trait]
impl SigningMechanism for AnySigningMechanism {
    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SigningError> {
        match self {
            AnySigningMechanism::SymmetricKey(m) => m.sign(data).await,
            AnySigningMechanism::EdgeHsm(m) => m.sign(data).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signs_with_standard_hmac_sha256() {
        let key = STANDARD.encode(b"my-secret-key");
        let mechanism = SymmetricKeySigningMechanism::new(&key).unwrap();
        let signature = mechanism.sign(b"hello world").await.unwrap();

        let mut expected_mac = HmacSha256::new_from_slice(b"my-secret-key").unwrap();
        expected_mac.update(b"hello world");
        let expected = STANDARD.encode(expected_mac.finalize().into_bytes());

        assert_eq!(signature, expected.into_bytes());
    }

    #[tokio::test]
    async fn rejects_invalid_base64_key() {
        assert!(SymmetricKeySigningMechanism::new("not base64!!").is_err());
    }
}
