//! Merkle commitments over rosters, signer sets and nonce batches.
//!
//! Binary keccak trees; a level with an odd node count duplicates its
//! last node. Roster roots sort by participant index first, so two
//! rosters with the same members hash identically regardless of the
//! order the caller assembled them in.
use crate::{keccak, Hash32, Participant};

const LEAF_TAG: &[u8] = b"frostnode/merkle-leaf/v1";

/// Compute the root over a slice of leaf hashes.
///
/// An empty slice hashes to the zero digest.
pub fn merkle_root(leaves: &[Hash32]) -> Hash32 {
    if leaves.is_empty() {
        return Hash32::default();
    }
    let mut nodes: Vec<Hash32> = leaves.to_vec();
    while nodes.len() > 1 {
        if nodes.len() % 2 != 0 {
            let last = nodes[nodes.len() - 1];
            nodes.push(last);
        }
        let mut parents = Vec::with_capacity(nodes.len() / 2);
        for pair in nodes.chunks_exact(2) {
            parents.push(Hash32::from(keccak(&[
                pair[0].as_bytes(),
                pair[1].as_bytes(),
            ])));
        }
        nodes = parents;
    }
    nodes[0]
}

/// Generate the sibling path proving the leaf at `position`.
///
/// Returns `None` when `position` is out of range.
pub fn merkle_proof(
    leaves: &[Hash32],
    position: usize,
) -> Option<Vec<Hash32>> {
    if position >= leaves.len() {
        return None;
    }
    let mut nodes: Vec<Hash32> = leaves.to_vec();
    let mut index = position;
    let mut proof = Vec::new();
    while nodes.len() > 1 {
        if nodes.len() % 2 != 0 {
            let last = nodes[nodes.len() - 1];
            nodes.push(last);
        }
        let sibling = index ^ 1;
        proof.push(nodes[sibling]);
        let mut parents = Vec::with_capacity(nodes.len() / 2);
        for pair in nodes.chunks_exact(2) {
            parents.push(Hash32::from(keccak(&[
                pair[0].as_bytes(),
                pair[1].as_bytes(),
            ])));
        }
        nodes = parents;
        index /= 2;
    }
    Some(proof)
}

/// Check a sibling path against a root.
pub fn verify_proof(
    root: &Hash32,
    leaf: &Hash32,
    position: usize,
    proof: &[Hash32],
) -> bool {
    let mut node = *leaf;
    let mut index = position;
    for sibling in proof {
        node = if index % 2 == 0 {
            Hash32::from(keccak(&[node.as_bytes(), sibling.as_bytes()]))
        } else {
            Hash32::from(keccak(&[sibling.as_bytes(), node.as_bytes()]))
        };
        index /= 2;
    }
    node == *root
}

fn sorted_roster(participants: &[Participant]) -> Vec<Participant> {
    let mut roster = participants.to_vec();
    roster.sort_by_key(|p| p.index);
    roster
}

/// Leaf hash of a roster entry.
pub fn participant_leaf(participant: &Participant) -> Hash32 {
    Hash32::from(keccak(&[
        LEAF_TAG,
        &participant.index.to_be_bytes(),
        participant.address.as_bytes(),
    ]))
}

/// Root over a roster, invariant under permutation of the input.
pub fn participants_root(participants: &[Participant]) -> Hash32 {
    let leaves: Vec<Hash32> = sorted_roster(participants)
        .iter()
        .map(participant_leaf)
        .collect();
    merkle_root(&leaves)
}

/// Proof of roster membership for the participant with the given
/// index ("proof of attestation participation").
pub fn membership_proof(
    participants: &[Participant],
    index: u16,
) -> Option<Vec<Hash32>> {
    let roster = sorted_roster(participants);
    let position = roster.iter().position(|p| p.index == index)?;
    let leaves: Vec<Hash32> =
        roster.iter().map(participant_leaf).collect();
    merkle_proof(&leaves, position)
}

/// Position of a participant index within the canonically sorted
/// roster, the position [`membership_proof`] proves against.
pub fn roster_position(
    participants: &[Participant],
    index: u16,
) -> Option<usize> {
    let roster = sorted_roster(participants);
    roster.iter().position(|p| p.index == index)
}

/// Leaf hash of a signer index.
pub fn signer_leaf(index: u16) -> Hash32 {
    Hash32::from(keccak(&[LEAF_TAG, &index.to_be_bytes()]))
}

/// Root over a signer set, invariant under permutation.
pub fn signer_set_root(signers: &[u16]) -> Hash32 {
    let mut signers = signers.to_vec();
    signers.sort_unstable();
    let leaves: Vec<Hash32> =
        signers.iter().map(|i| signer_leaf(*i)).collect();
    merkle_root(&leaves)
}

/// Proof that `index` belongs to the signer set.
pub fn signer_proof(signers: &[u16], index: u16) -> Option<Vec<Hash32>> {
    let mut signers = signers.to_vec();
    signers.sort_unstable();
    let position = signers.iter().position(|i| *i == index)?;
    let leaves: Vec<Hash32> =
        signers.iter().map(|i| signer_leaf(*i)).collect();
    merkle_proof(&leaves, position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Address;

    fn roster(indices: &[u16]) -> Vec<Participant> {
        indices
            .iter()
            .map(|i| Participant {
                index: *i,
                address: Address::from([*i as u8; 20]),
            })
            .collect()
    }

    #[test]
    fn empty_roster_hashes_to_zero() {
        assert_eq!(participants_root(&[]), Hash32::default());
    }

    #[test]
    fn root_is_permutation_invariant() {
        let a = roster(&[1, 2, 3, 4]);
        let mut b = a.clone();
        b.reverse();
        b.swap(0, 2);
        assert_eq!(participants_root(&a), participants_root(&b));
    }

    #[test]
    fn root_commits_to_addresses() {
        let a = roster(&[1, 2, 3]);
        let mut b = a.clone();
        b[1].address = Address::from([9u8; 20]);
        assert_ne!(participants_root(&a), participants_root(&b));
    }

    #[test]
    fn membership_proofs_verify() {
        for size in [1u16, 2, 3, 4, 5, 8] {
            let indices: Vec<u16> = (1..=size).collect();
            let participants = roster(&indices);
            let root = participants_root(&participants);
            for participant in &participants {
                let proof =
                    membership_proof(&participants, participant.index)
                        .unwrap();
                let position =
                    roster_position(&participants, participant.index)
                        .unwrap();
                assert!(verify_proof(
                    &root,
                    &participant_leaf(participant),
                    position,
                    &proof,
                ));
            }
        }
    }

    #[test]
    fn membership_proof_rejects_wrong_leaf() {
        let participants = roster(&[1, 2, 3, 4]);
        let root = participants_root(&participants);
        let proof = membership_proof(&participants, 2).unwrap();
        let foreign = Participant {
            index: 2,
            address: Address::from([0xee; 20]),
        };
        assert!(!verify_proof(
            &root,
            &participant_leaf(&foreign),
            1,
            &proof,
        ));
    }

    #[test]
    fn unknown_index_has_no_proof() {
        let participants = roster(&[1, 2, 3]);
        assert!(membership_proof(&participants, 9).is_none());
    }

    #[test]
    fn signer_set_root_sorts_input() {
        assert_eq!(
            signer_set_root(&[3, 1, 2]),
            signer_set_root(&[1, 2, 3])
        );
    }

    #[test]
    fn odd_signer_sets_prove() {
        let signers = [4u16, 1, 3];
        let root = signer_set_root(&signers);
        let proof = signer_proof(&signers, 4).unwrap();
        // Sorted set is [1, 3, 4], so index 4 sits at position 2.
        assert!(verify_proof(&root, &signer_leaf(4), 2, &proof));
    }
}
