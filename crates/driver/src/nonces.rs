//! Merkle-committed batches of one-time signing nonces.
use crate::math::{derive_nonce_pair, encode_point};
use crate::{Error, Result};
use frostnode_protocol::{
    keccak, merkle, Hash32, NonceCommitments, NonceRoot,
};
use k256::{ProjectivePoint, Scalar};
use std::collections::BTreeSet;

/// Number of nonce pairs in one batch; sequence numbers map onto
/// batches as `chunk = sequence / CHUNK_SIZE`.
pub const CHUNK_SIZE: u64 = 1024;

/// A leaf revealed from a nonce batch, together with its inclusion
/// proof and the secret pair that opens it.
pub struct RevealedNonce {
    /// Public commitment pair.
    pub commitments: NonceCommitments,
    /// Merkle inclusion proof of the pair.
    pub proof: Vec<Hash32>,
    /// Secret hiding nonce.
    pub hiding: Scalar,
    /// Secret binding nonce.
    pub binding: Scalar,
}

/// An ordered, fixed-size batch of one-time nonce commitments.
///
/// Leaves are derived deterministically from the signing share and a
/// global sequence base; a leaf revealed once is burned and can never
/// be revealed again.
pub struct NonceTree {
    base_sequence: u64,
    commitments: Vec<NonceCommitments>,
    leaves: Vec<Hash32>,
    root: NonceRoot,
    revealed: BTreeSet<u64>,
}

impl NonceTree {
    /// Derive the batch covering sequences
    /// `[base_sequence, base_sequence + CHUNK_SIZE)`.
    pub fn generate(
        signing_share: &Scalar,
        base_sequence: u64,
    ) -> Self {
        let mut commitments = Vec::with_capacity(CHUNK_SIZE as usize);
        let mut leaves = Vec::with_capacity(CHUNK_SIZE as usize);
        for offset in 0..CHUNK_SIZE {
            let (hiding, binding) = derive_nonce_pair(
                signing_share,
                base_sequence + offset,
            );
            let pair = NonceCommitments {
                hiding: encode_point(
                    &(ProjectivePoint::GENERATOR * hiding),
                ),
                binding: encode_point(
                    &(ProjectivePoint::GENERATOR * binding),
                ),
            };
            leaves.push(Hash32::from(keccak(&[
                &pair.hiding.0,
                &pair.binding.0,
            ])));
            commitments.push(pair);
        }
        let root = merkle::merkle_root(&leaves);
        Self {
            base_sequence,
            commitments,
            leaves,
            root,
            revealed: BTreeSet::new(),
        }
    }

    /// Merkle root of the batch.
    pub fn root(&self) -> NonceRoot {
        self.root
    }

    /// Number of leaves that have not been revealed yet.
    pub fn available(&self) -> u64 {
        CHUNK_SIZE - self.revealed.len() as u64
    }

    /// Reveal the leaf at `offset`, burning it.
    pub fn reveal(
        &mut self,
        signing_share: &Scalar,
        offset: u64,
    ) -> Result<RevealedNonce> {
        let sequence = self.base_sequence + offset;
        if offset >= CHUNK_SIZE {
            return Err(Error::NonceReused(sequence));
        }
        if !self.revealed.insert(offset) {
            return Err(Error::NonceReused(sequence));
        }
        let (hiding, binding) =
            derive_nonce_pair(signing_share, sequence);
        let proof = merkle::merkle_proof(
            &self.leaves,
            offset as usize,
        )
        .ok_or(Error::NonceReused(sequence))?;
        Ok(RevealedNonce {
            commitments: self.commitments[offset as usize],
            proof,
            hiding,
            binding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::elliptic_curve::Field;
    use rand::rngs::OsRng;

    #[test]
    fn distinct_sequences_give_distinct_commitments() {
        let share = Scalar::random(&mut OsRng);
        let mut tree = NonceTree::generate(&share, 0);
        let a = tree.reveal(&share, 0).unwrap();
        let b = tree.reveal(&share, 1).unwrap();
        assert_ne!(a.commitments, b.commitments);
    }

    #[test]
    fn revealed_leaves_are_burned() {
        let share = Scalar::random(&mut OsRng);
        let mut tree = NonceTree::generate(&share, 0);
        tree.reveal(&share, 17).unwrap();
        assert!(matches!(
            tree.reveal(&share, 17),
            Err(Error::NonceReused(17))
        ));
        assert_eq!(tree.available(), CHUNK_SIZE - 1);
    }

    #[test]
    fn revealed_leaves_prove_against_the_root() {
        let share = Scalar::random(&mut OsRng);
        let mut tree = NonceTree::generate(&share, CHUNK_SIZE);
        let root = tree.root();
        let revealed = tree.reveal(&share, 5).unwrap();
        let leaf = Hash32::from(keccak(&[
            &revealed.commitments.hiding.0,
            &revealed.commitments.binding.0,
        ]));
        assert!(merkle::verify_proof(
            &root,
            &leaf,
            5,
            &revealed.proof
        ));
    }

    #[test]
    fn secret_pair_opens_the_commitments() {
        let share = Scalar::random(&mut OsRng);
        let mut tree = NonceTree::generate(&share, 0);
        let revealed = tree.reveal(&share, 3).unwrap();
        assert_eq!(
            encode_point(
                &(ProjectivePoint::GENERATOR * revealed.hiding)
            ),
            revealed.commitments.hiding,
        );
        assert_eq!(
            encode_point(
                &(ProjectivePoint::GENERATOR * revealed.binding)
            ),
            revealed.commitments.binding,
        );
    }

    #[test]
    fn batches_at_different_bases_differ() {
        let share = Scalar::random(&mut OsRng);
        let a = NonceTree::generate(&share, 0);
        let b = NonceTree::generate(&share, CHUNK_SIZE);
        assert_ne!(a.root(), b.root());
    }
}
