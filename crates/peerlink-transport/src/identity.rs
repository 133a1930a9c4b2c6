//! Node identities and static keys.
//!
//! A [`NodeIdentity`] is the 33-byte compressed secp256k1 public key of a
//! node. Two peers are the same peer iff their identities match, no matter
//! which address they were reached on.

use std::fmt;
use std::str::FromStr;

use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::AddressError;

/// Length of a compressed secp256k1 public key.
pub const IDENTITY_LEN: usize = 33;

/// Length of the hex encoding of a [`NodeIdentity`].
pub const IDENTITY_HEX_LEN: usize = IDENTITY_LEN * 2;

/// The compressed public key that identifies a node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIdentity([u8; IDENTITY_LEN]);

impl NodeIdentity {
    /// Builds an identity from compressed SEC1 bytes, validating the point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AddressError> {
        let key = PublicKey::from_sec1_bytes(bytes)
            .map_err(|e| AddressError::InvalidPublicKey(e.to_string()))?;
        Ok(Self::from_public_key(&key))
    }

    /// Builds an identity from a secp256k1 public key.
    #[must_use]
    pub fn from_public_key(key: &PublicKey) -> Self {
        let encoded = key.to_encoded_point(true);
        let mut bytes = [0u8; IDENTITY_LEN];
        bytes.copy_from_slice(encoded.as_bytes());
        Self(bytes)
    }

    /// Returns the raw compressed key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    /// Decodes the identity back into a curve point.
    pub fn public_key(&self) -> Result<PublicKey, AddressError> {
        PublicKey::from_sec1_bytes(&self.0)
            .map_err(|e| AddressError::InvalidPublicKey(e.to_string()))
    }

    /// Returns the lowercase hex encoding.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns a short prefix for log lines.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeIdentity({})", self.short())
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for NodeIdentity {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != IDENTITY_HEX_LEN {
            return Err(AddressError::PublicKeyLength(s.len()));
        }
        let bytes = hex::decode(s).map_err(|e| AddressError::InvalidPublicKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for NodeIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A node's long-term secp256k1 private key.
#[derive(Clone)]
pub struct StaticKey {
    secret: SecretKey,
    identity: NodeIdentity,
}

impl StaticKey {
    /// Generates a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::random(&mut OsRng))
    }

    /// Wraps an existing secret key.
    #[must_use]
    pub fn from_secret(secret: SecretKey) -> Self {
        let identity = NodeIdentity::from_public_key(&secret.public_key());
        Self { secret, identity }
    }

    /// Parses a 32-byte hex encoded secret.
    pub fn from_hex(s: &str) -> Result<Self, AddressError> {
        let bytes = hex::decode(s.trim()).map_err(|e| AddressError::InvalidPublicKey(e.to_string()))?;
        let secret = SecretKey::from_slice(&bytes)
            .map_err(|e| AddressError::InvalidPublicKey(e.to_string()))?;
        Ok(Self::from_secret(secret))
    }

    /// Returns the identity derived from this key.
    #[must_use]
    pub const fn identity(&self) -> NodeIdentity {
        self.identity
    }

    /// Computes `SHA256(compressed(k * P))` against a remote public key.
    #[must_use]
    pub fn ecdh(&self, remote: &PublicKey) -> [u8; 32] {
        ecdh(&self.secret, remote)
    }

    pub(crate) fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }
}

impl fmt::Debug for StaticKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKey")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Elliptic curve Diffie-Hellman, hashed as in the brontide construction.
pub(crate) fn ecdh(secret: &SecretKey, remote: &PublicKey) -> [u8; 32] {
    let shared = (remote.to_projective() * *secret.to_nonzero_scalar()).to_affine();
    let encoded = shared.to_encoded_point(true);
    let digest = Sha256::digest(encoded.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_hex_roundtrip() {
        let key = StaticKey::generate();
        let id = key.identity();
        let parsed: NodeIdentity = id.to_hex().parse().expect("parse");
        assert_eq!(parsed, id);
    }

    #[test]
    fn identity_rejects_wrong_length() {
        let err = "02abcd".parse::<NodeIdentity>().unwrap_err();
        assert_eq!(err, AddressError::PublicKeyLength(6));
    }

    #[test]
    fn identity_rejects_point_off_curve() {
        let bogus = format!("05{}", "00".repeat(32));
        assert!(matches!(
            bogus.parse::<NodeIdentity>(),
            Err(AddressError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn ecdh_is_symmetric() {
        let a = StaticKey::generate();
        let b = StaticKey::generate();
        assert_eq!(a.ecdh(&b.public_key()), b.ecdh(&a.public_key()));
    }

    #[test]
    fn static_key_from_hex() {
        let hex_secret = "0101010101010101010101010101010101010101010101010101010101010101";
        let a = StaticKey::from_hex(hex_secret).expect("valid secret");
        let b = StaticKey::from_hex(hex_secret).expect("valid secret");
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn identity_serde_as_string() {
        let id = StaticKey::generate().identity();
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: NodeIdentity = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
    }
}
