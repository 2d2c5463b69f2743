//! Ordered chain events and the transition queue contract.
use crate::{
    GroupId, Hash32, MessageId, MetaTransaction, NonceRoot,
    PointBytes, ProofOfKnowledge, ScalarBytes, SignatureId,
};
use serde::{Deserialize, Serialize};

/// Decoded event observed on the consensus core contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChainEvent {
    /// Key generation for a new group was started.
    KeyGenInit {
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
    },
    /// A participant published their polynomial commitments.
    KeyGenCommitted {
        /// Group being generated.
        group_id: GroupId,
        /// Publishing participant.
        index: u16,
        /// Feldman commitment vector.
        commitments: Vec<PointBytes>,
        /// Proof of knowledge of the constant term.
        pok: ProofOfKnowledge,
    },
    /// A participant published their encrypted secret shares.
    KeyGenSecretShared {
        /// Group being generated.
        group_id: GroupId,
        /// Publishing participant.
        index: u16,
        /// The participant's public verification share.
        verification_share: PointBytes,
        /// Masked shares ordered by receiver index, sender slot
        /// skipped.
        encrypted_shares: Vec<ScalarBytes>,
        /// Whether this submission was the last one of the group.
        ///
        /// Set by the chain, so every validator agrees on which
        /// event closed the round regardless of when its own
        /// session completed locally.
        completed: bool,
    },
    /// Key generation for a group was aborted on chain.
    KeyGenAborted {
        /// Aborted group.
        group_id: GroupId,
    },
    /// A participant linked a nonce batch to a chunk.
    Preprocess {
        /// Group the batch belongs to.
        group_id: GroupId,
        /// Registering participant.
        index: u16,
        /// Root of the nonce batch.
        nonce_root: NonceRoot,
        /// Chunk the batch serves.
        chunk: u64,
    },
    /// A signature over a verified message was requested.
    Sign {
        /// Group asked to sign.
        group_id: GroupId,
        /// Identifier of the signature run.
        signature_id: SignatureId,
        /// Message being signed.
        message: MessageId,
        /// Global nonce sequence assigned to the run.
        sequence: u64,
    },
    /// A signer revealed their one-time nonce commitments.
    SignRevealedNonces {
        /// Signature run.
        signature_id: SignatureId,
        /// Revealing signer.
        index: u16,
        /// Commitment to the hiding nonce.
        hiding: PointBytes,
        /// Commitment to the binding nonce.
        binding: PointBytes,
    },
    /// A signer published their partial signature.
    SignShared {
        /// Signature run.
        signature_id: SignatureId,
        /// Publishing signer.
        index: u16,
    },
    /// All partial signatures were aggregated on chain.
    SignCompleted {
        /// Completed signature run.
        signature_id: SignatureId,
    },
    /// A new epoch was staged with its attested group key.
    EpochStaged {
        /// Epoch that was staged.
        proposed_epoch: u64,
        /// First block of the staged epoch.
        rollover_block: u64,
        /// Group serving the staged epoch.
        group_id: GroupId,
    },
    /// A transaction was proposed for attestation.
    TransactionProposed {
        /// Epoch whose group attests.
        epoch: u64,
        /// Proposed transaction.
        transaction: MetaTransaction,
    },
    /// A transaction attestation was recorded on chain.
    TransactionAttested {
        /// Epoch the attestation belongs to.
        epoch: u64,
        /// Message that was attested.
        message: MessageId,
    },
}

/// One item of the strictly ordered transition queue.
///
/// Events carry a `(block, log_index)` position and must arrive in
/// strictly increasing order; block ticks at or before the last
/// processed block are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transition {
    /// Periodic block tick.
    Block {
        /// Observed block height.
        block: u64,
    },
    /// Decoded contract event.
    Event {
        /// Block containing the event.
        block: u64,
        /// Position of the event within the block.
        log_index: u32,
        /// The decoded event.
        event: ChainEvent,
    },
}

impl Transition {
    /// Block height this transition was observed at.
    pub fn block(&self) -> u64 {
        match self {
            Transition::Block { block } => *block,
            Transition::Event { block, .. } => *block,
        }
    }
}
