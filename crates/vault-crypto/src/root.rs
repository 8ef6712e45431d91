use serde::{Deserialize, Serialize};
use vault_types::Hash;

use crate::hasher::DomainHasher;
use crate::signer::{PublicKey, SecretKey, Signature, SignatureError};
use crate::tree::{self, flat, Node};

/// The owner's signature over a feed's root at some length.
///
/// Carries the peaks rather than the bare root hash, so a replica can prove
/// blocks to third parties without having seen every block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRoot {
    pub length: u64,
    pub peaks: Vec<Node>,
    pub signature: Signature,
}

impl SignedRoot {
    pub fn sign(secret: &SecretKey, length: u64, peaks: Vec<Node>) -> Self {
        let message = Self::message(length, &tree::root_hash(&peaks));
        Self {
            length,
            signature: secret.sign(&message),
            peaks,
        }
    }

    pub fn root_hash(&self) -> Hash {
        tree::root_hash(&self.peaks)
    }

    /// Total block bytes below `length`.
    pub fn byte_length(&self) -> u64 {
        self.peaks.iter().map(|p| p.size).sum()
    }

    /// Flat indices of `peaks`, in order.
    pub fn peak_indices(&self) -> Vec<u64> {
        flat::full_roots(self.length)
    }

    /// Check the peak count against `length`, then the signature.
    pub fn verify(&self, key: &PublicKey) -> Result<(), SignatureError> {
        let expected = flat::full_roots(self.length).len();
        if self.peaks.len() != expected {
            return Err(SignatureError::MalformedRoot(format!(
                "length {} needs {expected} peaks, got {}",
                self.length,
                self.peaks.len()
            )));
        }
        key.verify(&Self::message(self.length, &self.root_hash()), &self.signature)
    }

    fn message(length: u64, root: &Hash) -> Vec<u8> {
        DomainHasher::ROOT.message(&[&length.to_be_bytes(), root.as_bytes()])
    }
}

/// Owner-signed pointer from one feed to a paired feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedLink {
    pub key: PublicKey,
    pub signature: Signature,
}

impl FeedLink {
    pub fn sign(owner: &SecretKey, linked: PublicKey) -> Self {
        Self {
            signature: owner.sign(&DomainHasher::LINK.message(&[linked.as_bytes()])),
            key: linked,
        }
    }

    pub fn verify(&self, owner: &PublicKey) -> Result<(), SignatureError> {
        owner.verify(
            &DomainHasher::LINK.message(&[self.key.as_bytes()]),
            &self.signature,
        )
    }
}
