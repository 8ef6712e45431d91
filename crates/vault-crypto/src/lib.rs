//! Cryptographic primitives for Vault.
//!
//! Provides domain-separated BLAKE3 hashing, Ed25519 keys and signatures,
//! the flat-tree Merkle scheme that every feed block is verified against,
//! and the owner-signed root and link records exchanged between peers.
//!
//! All crypto operations wrap established libraries; there is no custom cryptography.

pub mod hasher;
pub mod root;
pub mod signer;
pub mod tree;

pub use hasher::{discovery_key, DomainHasher};
pub use root::{FeedLink, SignedRoot};
pub use signer::{
    Keypair, PublicKey, SecretKey, Signature, SignatureError, PUBLIC_KEY_LENGTH,
    SECRET_KEY_LENGTH, SIGNATURE_LENGTH,
};
pub use tree::{Node, Proof};
