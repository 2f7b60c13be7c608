//! Node identities, message signatures and proposal digests.
//!
//! Every node owns an Ed25519 keypair. Signatures and public keys travel as
//! lowercase hex; digests are the hex SHA-256 of a value's canonical JSON
//! form (object keys sorted, no insignificant whitespace).

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use remedy_core::{RemedyError, RemedyResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A node's private signing identity.
pub struct NodeKeypair {
    signing_key: SigningKey,
}

impl NodeKeypair {
    /// Generate a fresh keypair from the operating system RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore a keypair from its 32-byte secret.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key())
    }

    /// Sign `bytes` and return the signature as hex.
    pub fn sign(&self, bytes: &[u8]) -> String {
        hex::encode(self.signing_key.sign(bytes).to_bytes())
    }
}

impl fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKeypair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// A node's registered verification key.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_hex(encoded: &str) -> RemedyResult<Self> {
        let bytes = hex::decode(encoded)
            .map_err(|e| RemedyError::Configuration(format!("Invalid public key hex: {e}")))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            RemedyError::Configuration("Invalid public key length (must be 32 bytes)".into())
        })?;
        VerifyingKey::from_bytes(&bytes)
            .map(PublicKey)
            .map_err(|e| RemedyError::Configuration(format!("Invalid public key: {e}")))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    /// Check a hex signature over `bytes`. The error string says what failed.
    pub fn verify(&self, bytes: &[u8], signature_hex: &str) -> Result<(), String> {
        let decoded =
            hex::decode(signature_hex).map_err(|e| format!("Invalid signature hex: {e}"))?;
        let sig_bytes: [u8; 64] = decoded
            .try_into()
            .map_err(|_| "Invalid signature length (must be 64 bytes)".to_string())?;
        let signature = Signature::from_bytes(&sig_bytes);
        self.0
            .verify(bytes, &signature)
            .map_err(|e| format!("Signature verification failed: {e}"))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl TryFrom<String> for PublicKey {
    type Error = RemedyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PublicKey::from_hex(&value)
    }
}

impl From<PublicKey> for String {
    fn from(key: PublicKey) -> Self {
        key.to_hex()
    }
}

/// Canonical JSON bytes of a value.
///
/// Going through `serde_json::Value` sorts object keys, so two nodes that
/// hold equal values always produce identical bytes.
pub fn canonical_bytes<T: Serialize>(value: &T) -> RemedyResult<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Hex SHA-256 of a value's canonical JSON.
pub fn digest<T: Serialize>(value: &T) -> RemedyResult<String> {
    let bytes = canonical_bytes(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sign_and_verify() {
        let keypair = NodeKeypair::generate();
        let public = keypair.public_key();
        let signature = keypair.sign(b"prepare:1:abc");

        assert!(public.verify(b"prepare:1:abc", &signature).is_ok());
        assert!(public.verify(b"prepare:1:abd", &signature).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let signer = NodeKeypair::generate();
        let other = NodeKeypair::generate();
        let signature = signer.sign(b"commit");
        let err = other.public_key().verify(b"commit", &signature).unwrap_err();
        assert!(err.contains("verification failed"));
    }

    #[test]
    fn test_malformed_signature() {
        let public = NodeKeypair::generate().public_key();
        assert!(public.verify(b"x", "zz").unwrap_err().contains("hex"));
        assert!(public.verify(b"x", "abcd").unwrap_err().contains("length"));
    }

    #[test]
    fn test_public_key_hex_roundtrip() {
        let keypair = NodeKeypair::from_secret_bytes(&[7u8; 32]);
        let public = keypair.public_key();
        let parsed = PublicKey::from_hex(&public.to_hex()).unwrap();
        assert_eq!(parsed, public);

        let json = serde_json::to_string(&public).unwrap();
        assert_eq!(json, format!("\"{}\"", public.to_hex()));
        assert!(PublicKey::from_hex("00ff").is_err());
    }

    #[test]
    fn test_digest_ignores_key_order() {
        let a = json!({"action_id": "restart", "confidence": 0.9});
        let b: serde_json::Value =
            serde_json::from_str(r#"{"confidence":0.9,"action_id":"restart"}"#).unwrap();
        assert_eq!(digest(&a).unwrap(), digest(&b).unwrap());
        assert_eq!(digest(&a).unwrap().len(), 64);
        assert_ne!(
            digest(&a).unwrap(),
            digest(&json!({"action_id": "rollback", "confidence": 0.9})).unwrap()
        );
    }
}
