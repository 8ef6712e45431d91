//! Foundation types for Vault.
//!
//! Every other Vault crate depends on `vault-types`. It is intentionally
//! small: the 32-byte [`Hash`] used for tree nodes, roots and discovery keys,
//! and the [`TypeError`] produced when parsing them.

pub mod error;
pub mod hash;

pub use error::TypeError;
pub use hash::Hash;
