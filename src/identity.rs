//! Node identity: ed25519 keys doubling as overlay addresses.
//!
//! A `NodeKey` is both who a node is and where it lives. The key ordering
//! is load-bearing: the spanning tree is rooted at the globally smallest
//! key, so `a < b` literally means "a beats b in the root election". The
//! per-bit accessors exist for the Merkle trie, which is keyed by the bits
//! of a `NodeKey`, most significant first.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

pub(crate) const KEY_LEN: usize = 32;
pub(crate) const SIG_LEN: usize = 64;

/// Detached ed25519 signature bytes.
pub(crate) type Sig = [u8; SIG_LEN];

/// A node's public signing key, used as its address in the overlay.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeKey([u8; KEY_LEN]);

impl NodeKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; KEY_LEN] {
        self.0
    }

    /// Bit `idx` of the key, MSB of byte 0 first. Positions index the
    /// Merkle trie: depth n branches on bit n.
    pub(crate) fn bit(&self, idx: usize) -> bool {
        (self.0[idx / 8] >> (7 - idx % 8)) & 1 == 1
    }

    /// This key with bit `idx` forced to `set`. Used to derive the child
    /// prefixes of a trie node.
    pub(crate) fn with_bit(&self, idx: usize, set: bool) -> NodeKey {
        let mut bytes = self.0;
        let mask = 1u8 << (7 - idx % 8);
        if set {
            bytes[idx / 8] |= mask;
        } else {
            bytes[idx / 8] &= !mask;
        }
        NodeKey(bytes)
    }

    /// Check a detached signature made by the holder of this key.
    pub(crate) fn verifies(&self, message: &[u8], sig: &Sig) -> bool {
        let Ok(verifying) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(sig) else {
            return false;
        };
        verifying.verify(message, &signature).is_ok()
    }

    /// Short hex form for log lines.
    pub(crate) fn fingerprint(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKey({})", self.fingerprint())
    }
}

impl From<[u8; KEY_LEN]> for NodeKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// The local node's signing identity.
pub(crate) struct Identity {
    secret: SigningKey,
    key: NodeKey,
}

impl Identity {
    pub fn from_signing_key(secret: SigningKey) -> Self {
        let key = NodeKey(secret.verifying_key().to_bytes());
        Self { secret, key }
    }

    pub fn key(&self) -> NodeKey {
        self.key
    }

    pub fn sign(&self, message: &[u8]) -> Sig {
        self.secret.sign(message).to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn fresh() -> Identity {
        Identity::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    #[test]
    fn signatures_verify_against_the_signing_key_only() {
        let us = fresh();
        let them = fresh();
        let sig = us.sign(b"attestation");
        assert!(us.key().verifies(b"attestation", &sig));
        assert!(!us.key().verifies(b"something else", &sig));
        assert!(!them.key().verifies(b"attestation", &sig));
    }

    #[test]
    fn ordering_is_lexicographic_over_bytes() {
        let a = NodeKey::from([0u8; 32]);
        let mut high_tail = [0u8; 32];
        high_tail[31] = 1;
        let b = NodeKey::from(high_tail);
        let mut high_head = [0u8; 32];
        high_head[0] = 1;
        let c = NodeKey::from(high_head);
        assert!(a < b && b < c);
        // The smallest key wins the root election.
        assert_eq!([c, a, b].iter().min(), Some(&a));
    }

    #[test]
    fn bits_are_msb_first() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0b1000_0000;
        bytes[1] = 0b0000_0001;
        let key = NodeKey::from(bytes);
        assert!(key.bit(0));
        assert!(!key.bit(7));
        assert!(key.bit(15));
    }

    #[test]
    fn with_bit_flips_exactly_one_position() {
        let zero = NodeKey::from([0u8; 32]);
        let set = zero.with_bit(3, true);
        assert!(set.bit(3));
        assert_eq!(set.as_bytes()[0], 0b0001_0000);
        assert_eq!(set.with_bit(3, false), zero);
        assert_eq!(zero.with_bit(3, false), zero);
    }
}
