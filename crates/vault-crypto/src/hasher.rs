use vault_types::Hash;

/// Domain-separated BLAKE3 hasher.
///
/// Each hasher carries a domain tag that is prepended to every hash
/// computation, so a leaf and a parent over identical bytes never collide,
/// and a signature over a root can never be replayed as a link.
pub struct DomainHasher {
    domain: &'static str,
}

impl DomainHasher {
    /// Leaf nodes: `len ‖ block bytes`.
    pub const LEAF: Self = Self::new("vault-leaf-v1");
    /// Parent nodes: `size ‖ left ‖ right`.
    pub const PARENT: Self = Self::new("vault-parent-v1");
    /// Root of a feed with no blocks.
    pub const EMPTY: Self = Self::new("vault-empty-v1");
    /// Message signed by the feed owner for each new length.
    pub const ROOT: Self = Self::new("vault-root-v1");
    /// Message signed by the feed owner to link a paired feed.
    pub const LINK: Self = Self::new("vault-link-v1");

    /// Create a hasher with a custom domain tag.
    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    /// Hash a single byte string with domain separation.
    pub fn hash(&self, data: &[u8]) -> Hash {
        self.hash_parts(&[data])
    }

    /// Hash the concatenation of `parts` with domain separation.
    pub fn hash_parts(&self, parts: &[&[u8]]) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        for part in parts {
            hasher.update(part);
        }
        Hash::from_bytes(*hasher.finalize().as_bytes())
    }

    /// The domain-tagged byte string itself, for signing.
    pub fn message(&self, parts: &[&[u8]]) -> Vec<u8> {
        let len = parts.iter().map(|p| p.len()).sum::<usize>();
        let mut out = Vec::with_capacity(self.domain.len() + 1 + len);
        out.extend_from_slice(self.domain.as_bytes());
        out.push(b':');
        for part in parts {
            out.extend_from_slice(part);
        }
        out
    }

    pub fn domain(&self) -> &str {
        self.domain
    }
}

/// Name of a feed on the wire.
///
/// Peers that do not already know a feed's public key cannot learn it from
/// the discovery key.
pub fn discovery_key(public_key: &[u8; 32]) -> Hash {
    Hash::from_bytes(*blake3::keyed_hash(public_key, b"vault").as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domains_separate_identical_input() {
        let data = b"same bytes";
        assert_ne!(DomainHasher::LEAF.hash(data), DomainHasher::PARENT.hash(data));
        assert_ne!(DomainHasher::ROOT.hash(data), DomainHasher::LINK.hash(data));
    }

    #[test]
    fn parts_equal_concatenation() {
        let joined = DomainHasher::LEAF.hash(b"abcdef");
        let split = DomainHasher::LEAF.hash_parts(&[b"ab", b"cd", b"ef"]);
        assert_eq!(joined, split);
    }

    #[test]
    fn message_is_tagged() {
        let msg = DomainHasher::ROOT.message(&[b"xy"]);
        assert_eq!(msg, b"vault-root-v1:xy");
    }

    #[test]
    fn discovery_key_hides_public_key() {
        let key = [7u8; 32];
        let dk = discovery_key(&key);
        assert_ne!(dk.as_bytes(), &key);
        assert_eq!(dk, discovery_key(&key));
    }
}
