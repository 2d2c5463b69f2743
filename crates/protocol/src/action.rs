//! Outbound actions submitted to the consensus core contract.
use crate::{
    GroupId, Hash32, MessageId, NonceCommitments, NonceRoot,
    PointBytes, ProofOfKnowledge, ScalarBytes, SignatureId,
};
use serde::{Deserialize, Serialize};

/// Action the validator asks the chain protocol collaborator to
/// submit.
///
/// Each variant is a flat record of the values the corresponding
/// contract call takes; submission, nonce management and retries are
/// owned by the collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "snake_case")]
pub enum ProtocolAction {
    /// Register a group and publish the local commitments.
    KeyGenStart {
        /// Group being generated.
        group_id: GroupId,
        /// Merkle root of the roster.
        participants_root: Hash32,
        /// Number of participants.
        count: u16,
        /// Signing threshold.
        threshold: u16,
        /// Context the group id was derived with.
        context: Hash32,
        /// Index of the local participant.
        participant_index: u16,
        /// Feldman commitment vector.
        commitments: Vec<PointBytes>,
        /// Proof of knowledge of the constant term.
        pok: ProofOfKnowledge,
        /// Merkle proof of roster membership.
        poap: Vec<Hash32>,
    },
    /// Publish the local verification share and the masked shares for
    /// all peers.
    KeyGenPublishSecretShares {
        /// Group being generated.
        group_id: GroupId,
        /// Index of the local participant.
        participant_index: u16,
        /// Public verification share.
        verification_share: PointBytes,
        /// Masked shares ordered by receiver index, local slot
        /// skipped.
        encrypted_shares: Vec<ScalarBytes>,
    },
    /// Accuse a participant of distributing an invalid share.
    ///
    /// The accusation flow is a protocol extension point; the state
    /// machine never fabricates this action.
    KeyGenComplain {
        /// Group being generated.
        group_id: GroupId,
        /// Accused participant.
        accused: u16,
    },
    /// Reveal the share addressed to a plaintiff in response to an
    /// accusation. Extension point, see [`ProtocolAction::KeyGenComplain`].
    KeyGenComplaintResponse {
        /// Group being generated.
        group_id: GroupId,
        /// Accusing participant.
        plaintiff: u16,
        /// Plain share addressed to the plaintiff.
        secret_share: ScalarBytes,
    },
    /// Confirm a completed key generation.
    KeyGenConfirm {
        /// Completed group.
        group_id: GroupId,
        /// Index of the local participant.
        participant_index: u16,
    },
    /// Request a signature over a verified message.
    SignRequest {
        /// Group asked to sign.
        group_id: GroupId,
        /// Message to sign.
        message: MessageId,
    },
    /// Register the root of a freshly preprocessed nonce batch.
    SignRegisterNonceCommitments {
        /// Group the batch belongs to.
        group_id: GroupId,
        /// Root of the batch.
        nonce_root: NonceRoot,
    },
    /// Reveal the one-time nonce commitments for a signature run.
    SignRevealNonceCommitments {
        /// Signature run.
        signature_id: SignatureId,
        /// Nonce commitment pair.
        commitments: NonceCommitments,
        /// Merkle proof of the pair within its registered batch.
        proof: Vec<Hash32>,
    },
    /// Publish the local partial signature.
    SignPublishSignatureShare {
        /// Signature run.
        signature_id: SignatureId,
        /// Merkle root of the signer set.
        signers_root: Hash32,
        /// Proof of the local signer within the set.
        signers_proof: Vec<Hash32>,
        /// Aggregate nonce commitment of the signer set.
        group_commitment: PointBytes,
        /// Bound local nonce commitment.
        commitment_share: PointBytes,
        /// Partial signature scalar.
        signature_share: ScalarBytes,
        /// Lagrange coefficient of the local signer over the set.
        lagrange_coefficient: ScalarBytes,
    },
    /// Record a transaction attestation.
    ConsensusAttestTransaction {
        /// Epoch the attestation belongs to.
        epoch: u64,
        /// Canonical hash of the attested transaction.
        transaction_hash: Hash32,
        /// Signature run that produced the attestation.
        signature_id: SignatureId,
    },
    /// Stage the next epoch with its attested group.
    ConsensusStageEpoch {
        /// Epoch to stage.
        proposed_epoch: u64,
        /// First block of the staged epoch.
        rollover_block: u64,
        /// Group serving the staged epoch.
        group_id: GroupId,
        /// Signature run that attested the rollover.
        signature_id: SignatureId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_tag_with_id() {
        let action = ProtocolAction::SignRequest {
            group_id: GroupId::from([1u8; 32]),
            message: MessageId::from([2u8; 32]),
        };
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["id"], "sign_request");
        assert_eq!(value["message"], "02".repeat(32));
    }
}
