use serde::{Deserialize, Serialize};
use vault_types::Hash;

use crate::hasher::discovery_key;

pub const PUBLIC_KEY_LENGTH: usize = 32;
/// Secret keys travel in the 64-byte `seed ‖ public` form.
pub const SECRET_KEY_LENGTH: usize = 64;
pub const SIGNATURE_LENGTH: usize = 64;

/// Ed25519 signing key (private).
#[derive(Clone)]
pub struct SecretKey(ed25519_dalek::SigningKey);

/// Ed25519 public key, kept as raw bytes so that keys of feeds nobody can
/// reach still round-trip through storage and the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; PUBLIC_KEY_LENGTH]);

/// Ed25519 signature.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "signature_serde")] [u8; SIGNATURE_LENGTH]);

/// A matching public/secret pair.
#[derive(Clone, Debug)]
pub struct Keypair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        SecretKey::generate().into()
    }
}

impl From<SecretKey> for Keypair {
    fn from(secret: SecretKey) -> Self {
        Self {
            public: secret.public_key(),
            secret,
        }
    }
}

impl SecretKey {
    /// Generate a new random signing key.
    pub fn generate() -> Self {
        let mut csprng = rand::thread_rng();
        Self(ed25519_dalek::SigningKey::generate(&mut csprng))
    }

    /// Create from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self(ed25519_dalek::SigningKey::from_bytes(&seed))
    }

    /// Create from the 64-byte `seed ‖ public` form.
    ///
    /// Fails when the public half does not belong to the seed.
    pub fn from_bytes(bytes: &[u8; SECRET_KEY_LENGTH]) -> Result<Self, SignatureError> {
        ed25519_dalek::SigningKey::from_keypair_bytes(bytes)
            .map(Self)
            .map_err(|_| SignatureError::KeypairMismatch)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, SignatureError> {
        let arr: &[u8; SECRET_KEY_LENGTH] =
            bytes.try_into().map_err(|_| SignatureError::InvalidKey)?;
        Self::from_bytes(arr)
    }

    /// The 64-byte `seed ‖ public` form.
    pub fn to_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.0.to_keypair_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key().to_bytes())
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        use ed25519_dalek::Signer;
        Signature(self.0.sign(message).to_bytes())
    }

    /// Deterministically derive another secret key from this one.
    ///
    /// A drive derives its content feed key this way, so the owner only has
    /// to keep one secret.
    pub fn derive(&self, context: &str) -> SecretKey {
        Self::from_seed(blake3::derive_key(context, self.0.as_bytes()))
    }
}

impl PublicKey {
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, SignatureError> {
        let arr: [u8; PUBLIC_KEY_LENGTH] =
            bytes.try_into().map_err(|_| SignatureError::InvalidKey)?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, SignatureError> {
        let bytes = hex::decode(s).map_err(|_| SignatureError::InvalidKey)?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The hash peers use to name this key's feed on the wire.
    pub fn discovery_key(&self) -> Hash {
        discovery_key(&self.0)
    }

    /// Verify a signature on a message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        use ed25519_dalek::Verifier;
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|_| SignatureError::InvalidKey)?;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify(message, &sig)
            .map_err(|_| SignatureError::InvalidSignature)
    }
}

impl Signature {
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LENGTH] {
        self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey(<redacted>)")
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}...)", hex::encode(&self.0[..8]))
    }
}

/// Errors from signing operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid key")]
    InvalidKey,
    #[error("secret key does not match public key")]
    KeypairMismatch,
    #[error("malformed signed root: {0}")]
    MalformedRoot(String),
}

mod signature_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(sig: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(sig)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 64], D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Vec::deserialize(deserializer)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 64-byte signature"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let kp = Keypair::generate();
        let sig = kp.secret.sign(b"hello world");
        assert!(kp.public.verify(b"hello world", &sig).is_ok());
    }

    #[test]
    fn verify_fails_on_wrong_message() {
        let kp = Keypair::generate();
        let sig = kp.secret.sign(b"correct message");
        assert_eq!(
            kp.public.verify(b"wrong message", &sig),
            Err(SignatureError::InvalidSignature)
        );
    }

    #[test]
    fn verify_fails_with_wrong_key() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let sig = a.secret.sign(b"message");
        assert!(b.public.verify(b"message", &sig).is_err());
    }

    #[test]
    fn secret_key_bytes_carry_public_half() {
        let kp = Keypair::generate();
        let bytes = kp.secret.to_bytes();
        assert_eq!(&bytes[32..], kp.public.as_bytes());
        let back = SecretKey::from_bytes(&bytes).unwrap();
        assert_eq!(back.public_key(), kp.public);
    }

    #[test]
    fn mismatched_secret_rejected() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let mut bytes = a.secret.to_bytes();
        bytes[32..].copy_from_slice(b.public.as_bytes());
        assert_eq!(
            SecretKey::from_bytes(&bytes).unwrap_err(),
            SignatureError::KeypairMismatch
        );
    }

    #[test]
    fn derive_is_deterministic_and_distinct() {
        let kp = Keypair::generate();
        let c1 = kp.secret.derive("vault content v1");
        let c2 = kp.secret.derive("vault content v1");
        assert_eq!(c1.public_key(), c2.public_key());
        assert_ne!(c1.public_key(), kp.public);
    }

    #[test]
    fn public_key_hex_roundtrip() {
        let kp = Keypair::generate();
        assert_eq!(PublicKey::from_hex(&kp.public.to_hex()).unwrap(), kp.public);
        assert!(PublicKey::from_hex("00ff").is_err());
    }

    #[test]
    fn unreachable_key_still_parses() {
        let key = PublicKey::from_hex(
            "1d5e5a628d237787afcbfec7041a16f67ba6895e7aa31500013e94ddc638328d",
        )
        .unwrap();
        assert_eq!(key.as_bytes()[0], 0x1d);
    }

    #[test]
    fn signature_serde_roundtrip() {
        let kp = Keypair::generate();
        let sig = kp.secret.sign(b"test");
        let json = serde_json::to_string(&sig).unwrap();
        let parsed: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(sig, parsed);
    }

    #[test]
    fn debug_redacts_secret_key() {
        let kp = Keypair::generate();
        assert!(format!("{:?}", kp.secret).contains("redacted"));
    }
}
