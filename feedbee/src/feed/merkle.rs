//! Hashing, signed heads and inclusion proofs.

use feedbee_base::{Hash, PublicKey, SecretKey, Signature};
use serde::{Deserialize, Serialize};
use snafu::{Snafu, ensure};

use super::flat_tree;

const LEAF_TAG: u8 = 0x00;
const PARENT_TAG: u8 = 0x01;
const ROOT_TAG: u8 = 0x02;
const HEAD_DOMAIN: &[u8] = b"feedbee/head/v1";

/// Longest feed a proof can describe, so flat tree indices fit in a `u64`.
pub const MAX_LENGTH: u64 = 1 << 62;

/// Hash of an entry, i.e. a leaf of the tree.
pub fn leaf_hash(data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_TAG]);
    hasher.update(&(data.len() as u64).to_le_bytes());
    hasher.update(data);
    Hash::from_bytes(*hasher.finalize().as_bytes())
}

/// Hash of an inner node from its two children.
pub fn parent_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[PARENT_TAG]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash::from_bytes(*hasher.finalize().as_bytes())
}

/// Hash committing to all peaks of a tree.
///
/// `peaks` pairs each flat index from [`flat_tree::full_roots`] with its hash.
pub fn root_hash(peaks: &[(u64, Hash)]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[ROOT_TAG]);
    for (index, hash) in peaks {
        hasher.update(&index.to_le_bytes());
        hasher.update(hash.as_bytes());
    }
    Hash::from_bytes(*hasher.finalize().as_bytes())
}

/// The writer's signed statement about the state of a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedHead {
    /// Number of entries.
    pub length: u64,
    /// Root hash over all entries.
    pub root: Hash,
    /// Signature of the writer over `length` and `root`.
    pub signature: Signature,
}

impl SignedHead {
    /// Signs the head for `length` entries with root `root`.
    pub fn sign(secret_key: &SecretKey, length: u64, root: Hash) -> Self {
        let signature = secret_key.sign(&Self::signable(length, &root));
        Self {
            length,
            root,
            signature,
        }
    }

    /// Verifies the signature against the feed's public key.
    pub fn verify(&self, key: &PublicKey) -> Result<(), VerifyError> {
        key.verify(&Self::signable(self.length, &self.root), &self.signature)
            .map_err(|_| BadSignatureSnafu.build())
    }

    fn signable(length: u64, root: &Hash) -> Vec<u8> {
        let mut msg = Vec::with_capacity(HEAD_DOMAIN.len() + 8 + 32);
        msg.extend_from_slice(HEAD_DOMAIN);
        msg.extend_from_slice(&length.to_le_bytes());
        msg.extend_from_slice(root.as_bytes());
        msg
    }
}

/// Inclusion proof of one entry against the root at `length`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// The entry number.
    pub index: u64,
    /// The feed length the proof was built against.
    pub length: u64,
    /// Sibling hashes from the leaf up to (excluding) its peak.
    pub nodes: Vec<Hash>,
    /// All peak hashes of `length`, left to right.
    pub peaks: Vec<Hash>,
}

/// Why a proof or head did not verify.
#[allow(missing_docs)]
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum VerifyError {
    #[snafu(display("signature on head does not verify"))]
    BadSignature {},
    #[snafu(display("proof for length {proof} does not match head length {head}"))]
    LengthMismatch { proof: u64, head: u64 },
    #[snafu(display("entry {index} is outside of length {length}"))]
    OutOfBounds { index: u64, length: u64 },
    #[snafu(display("proof has the wrong shape"))]
    Shape {},
    #[snafu(display("computed peak does not match the proof"))]
    PeakMismatch {},
    #[snafu(display("computed root does not match the signed root"))]
    RootMismatch {},
    #[snafu(display("tree node {index} conflicts with a stored node"))]
    Fork { index: u64 },
}

impl Proof {
    /// Verifies `data` as entry `self.index` of the feed described by `head`.
    ///
    /// The head signature is checked against `key`. On success returns every tree node the
    /// proof establishes, as `(flat index, hash)` pairs, so they can be stored.
    pub fn verify(
        &self,
        data: &[u8],
        head: &SignedHead,
        key: &PublicKey,
    ) -> Result<Vec<(u64, Hash)>, VerifyError> {
        head.verify(key)?;
        ensure!(
            self.length == head.length,
            LengthMismatchSnafu {
                proof: self.length,
                head: head.length
            }
        );
        self.verify_root(data, &head.root)
    }

    /// Verifies `data` against an already trusted root.
    pub fn verify_root(&self, data: &[u8], root: &Hash) -> Result<Vec<(u64, Hash)>, VerifyError> {
        ensure!(
            self.index < self.length,
            OutOfBoundsSnafu {
                index: self.index,
                length: self.length
            }
        );
        ensure!(self.length <= MAX_LENGTH, ShapeSnafu);
        let roots = flat_tree::full_roots(self.length);
        ensure!(roots.len() == self.peaks.len(), ShapeSnafu);
        let peak_index = flat_tree::peak_for(self.index, self.length).ok_or_else(|| {
            OutOfBoundsSnafu {
                index: self.index,
                length: self.length,
            }
            .build()
        })?;
        let mut established = Vec::with_capacity(self.nodes.len() * 2 + roots.len() + 1);

        let mut index = 2 * self.index;
        let mut hash = leaf_hash(data);
        established.push((index, hash));
        let mut siblings = self.nodes.iter();
        while index != peak_index {
            let sibling = siblings.next().ok_or_else(|| ShapeSnafu.build())?;
            let sibling_index = flat_tree::sibling(index);
            established.push((sibling_index, *sibling));
            hash = if flat_tree::is_left(index) {
                parent_hash(&hash, sibling)
            } else {
                parent_hash(sibling, &hash)
            };
            index = flat_tree::parent(index);
            established.push((index, hash));
        }
        ensure!(siblings.next().is_none(), ShapeSnafu);

        let position = roots
            .iter()
            .position(|root| *root == peak_index)
            .ok_or_else(|| ShapeSnafu.build())?;
        ensure!(self.peaks[position] == hash, PeakMismatchSnafu);

        let peaks: Vec<(u64, Hash)> = roots.into_iter().zip(self.peaks.iter().copied()).collect();
        ensure!(root_hash(&peaks) == *root, RootMismatchSnafu);
        established.extend(peaks);
        Ok(established)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds every node of a tree over `entries` with a plain recursive definition.
    fn reference_tree(entries: &[&[u8]]) -> std::collections::BTreeMap<u64, Hash> {
        let mut nodes = std::collections::BTreeMap::new();
        for (i, entry) in entries.iter().enumerate() {
            nodes.insert(2 * i as u64, leaf_hash(entry));
        }
        let mut depth = 1;
        loop {
            let mut added = false;
            let width = 1u64 << depth;
            let mut offset = 0;
            while (offset + 1) * width <= entries.len() as u64 {
                let index = flat_tree::index(depth, offset);
                let (left, right) = flat_tree::children(index).unwrap();
                let hash = parent_hash(&nodes[&left], &nodes[&right]);
                nodes.insert(index, hash);
                added = true;
                offset += 1;
            }
            if !added {
                break;
            }
            depth += 1;
        }
        nodes
    }

    fn build_proof(
        nodes: &std::collections::BTreeMap<u64, Hash>,
        index: u64,
        length: u64,
    ) -> Proof {
        let peak = flat_tree::peak_for(index, length).unwrap();
        let mut node = 2 * index;
        let mut siblings = vec![];
        while node != peak {
            siblings.push(nodes[&flat_tree::sibling(node)]);
            node = flat_tree::parent(node);
        }
        Proof {
            index,
            length,
            nodes: siblings,
            peaks: flat_tree::full_roots(length)
                .iter()
                .map(|r| nodes[r])
                .collect(),
        }
    }

    #[test]
    fn test_proofs_verify_for_every_entry() {
        let secret = SecretKey::generate(&mut rand::rngs::OsRng);
        let entries: Vec<Vec<u8>> = (0..11u8).map(|i| vec![i; i as usize]).collect();
        let refs: Vec<&[u8]> = entries.iter().map(|e| e.as_slice()).collect();
        let nodes = reference_tree(&refs);
        let length = entries.len() as u64;
        let peaks: Vec<_> = flat_tree::full_roots(length)
            .into_iter()
            .map(|r| (r, nodes[&r]))
            .collect();
        let head = SignedHead::sign(&secret, length, root_hash(&peaks));

        for i in 0..length {
            let proof = build_proof(&nodes, i, length);
            let established = proof
                .verify(&entries[i as usize], &head, &secret.public())
                .unwrap();
            assert!(established.contains(&(2 * i, leaf_hash(&entries[i as usize]))));
        }
    }

    #[test]
    fn test_corrupted_entry_fails() {
        let secret = SecretKey::generate(&mut rand::rngs::OsRng);
        let entries: Vec<&[u8]> = vec![b"a", b"bb", b"ccc"];
        let nodes = reference_tree(&entries);
        let peaks: Vec<_> = flat_tree::full_roots(3)
            .into_iter()
            .map(|r| (r, nodes[&r]))
            .collect();
        let head = SignedHead::sign(&secret, 3, root_hash(&peaks));
        let proof = build_proof(&nodes, 1, 3);

        assert_eq!(
            proof.verify(b"bx", &head, &secret.public()),
            Err(VerifyError::PeakMismatch {})
        );

        let other = SecretKey::generate(&mut rand::rngs::OsRng);
        assert_eq!(
            proof.verify(b"bb", &head, &other.public()),
            Err(VerifyError::BadSignature {})
        );

        let mut truncated = proof.clone();
        truncated.nodes.pop();
        assert!(truncated.verify(b"bb", &head, &secret.public()).is_err());
    }

    #[test]
    fn test_malformed_shapes_are_rejected() {
        let secret = SecretKey::generate(&mut rand::rngs::OsRng);
        let entries: Vec<&[u8]> = vec![b"a", b"bb", b"ccc"];
        let nodes = reference_tree(&entries);
        let peaks: Vec<_> = flat_tree::full_roots(3)
            .into_iter()
            .map(|r| (r, nodes[&r]))
            .collect();
        let root = root_hash(&peaks);
        let head = SignedHead::sign(&secret, 3, root);

        let huge = Proof {
            index: 1 << 63,
            length: u64::MAX,
            nodes: vec![],
            peaks: vec![],
        };
        assert_eq!(
            huge.verify(b"x", &head, &secret.public()),
            Err(VerifyError::LengthMismatch {
                proof: u64::MAX,
                head: 3
            })
        );
        assert_eq!(huge.verify_root(b"x", &root), Err(VerifyError::Shape {}));

        let beyond = Proof {
            index: MAX_LENGTH,
            length: MAX_LENGTH + 1,
            ..huge.clone()
        };
        assert_eq!(beyond.verify_root(b"x", &root), Err(VerifyError::Shape {}));

        let outside = Proof {
            index: 3,
            ..build_proof(&nodes, 2, 3)
        };
        assert!(matches!(
            outside.verify(b"ccc", &head, &secret.public()),
            Err(VerifyError::OutOfBounds { .. })
        ));
    }
}
