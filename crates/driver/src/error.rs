use frostnode_protocol::{Address, GroupId, NonceRoot, SignatureId};
use thiserror::Error;

/// Severity class of a driver error, deciding how the orchestrator
/// reacts to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Fatal to the affected session; never silently retried.
    ProtocolViolation,
    /// Rejects only the offending contribution; the session stays
    /// open for a corrected resubmission.
    VerificationFailure,
    /// Preprocessing has not kept up; an operational condition, not a
    /// safety fault.
    LivenessGap,
}

/// Errors raised by the key generation and signing engines.
#[derive(Debug, Error)]
pub enum Error {
    /// No session or key material exists for the group.
    #[error("unknown group {0}")]
    UnknownGroup(GroupId),

    /// A session or key material already exists for the group.
    #[error("group {0} already initialized")]
    DuplicateGroup(GroupId),

    /// The roster does not hash to the announced participants root.
    #[error("participants root mismatch for group {0}")]
    ParticipantsRootMismatch(GroupId),

    /// Announced participant count does not match the roster.
    #[error("participant count mismatch: expected {expected}, got {actual}")]
    CountMismatch {
        /// Roster size.
        expected: u16,
        /// Announced count.
        actual: u16,
    },

    /// The local validator is not part of the roster.
    #[error("validator {0} is not part of the roster")]
    ParticipantNotFound(Address),

    /// A contribution named an index outside the roster.
    #[error("participant index {0} is not part of the group")]
    UnknownParticipant(u16),

    /// A second commitment vector arrived for the same index.
    #[error("commitments from participant {0} already recorded")]
    DuplicateCommitments(u16),

    /// Commitment vector length does not match the threshold.
    #[error("commitment vector of length {actual}, expected {expected}")]
    CommitmentVectorLength {
        /// Expected length (the threshold).
        expected: u16,
        /// Received length.
        actual: u16,
    },

    /// A second share vector arrived for the same index.
    #[error("secret shares from participant {0} already recorded")]
    DuplicateSecretShares(u16),

    /// Share vector length does not match `count - 1`.
    #[error("share vector of length {actual}, expected {expected}")]
    ShareVectorLength {
        /// Expected length.
        expected: usize,
        /// Received length.
        actual: usize,
    },

    /// A commitment arrived while the session was not collecting
    /// commitments.
    #[error("group {0} is not awaiting commitments")]
    NotAwaitingCommitments(GroupId),

    /// A share arrived while the session was not collecting shares.
    #[error("group {0} is not awaiting secret shares")]
    NotAwaitingShares(GroupId),

    /// Key generation for the group has not completed.
    #[error("key generation for group {0} is not complete")]
    KeyGenIncomplete(GroupId),

    /// The proof of knowledge did not verify against the first
    /// commitment.
    #[error("invalid proof of knowledge from participant {0}")]
    InvalidProofOfKnowledge(u16),

    /// A decrypted share did not match the sender's commitment
    /// evaluation. This is the byzantine-fault detection point.
    #[error("invalid secret share from participant {0}")]
    InvalidSecretShare(u16),

    /// The summed signing share does not match the group verification
    /// share.
    #[error("signing share does not match the group verification share")]
    InvalidSigningShare,

    /// A nonce batch was already linked for the chunk.
    #[error("chunk {chunk} of group {group} already linked")]
    ChunkAlreadyLinked {
        /// Affected group.
        group: GroupId,
        /// Chunk number.
        chunk: u64,
    },

    /// No nonce batch is linked for the chunk.
    #[error("no nonce batch linked for chunk {chunk} of group {group}")]
    UnknownChunk {
        /// Affected group.
        group: GroupId,
        /// Chunk number.
        chunk: u64,
    },

    /// No nonce batch is stored under the root.
    #[error("unknown nonce batch {0}")]
    UnknownNonceTree(NonceRoot),

    /// The nonce leaf for the sequence was already revealed.
    #[error("nonce at sequence {0} already revealed")]
    NonceReused(u64),

    /// A request is already open for the signature id.
    #[error("signature request {0} already open")]
    DuplicateSignatureRequest(SignatureId),

    /// No request is open for the signature id.
    #[error("unknown signature request {0}")]
    UnknownSignatureRequest(SignatureId),

    /// A contribution arrived from an index outside the signer set.
    #[error("participant {0} is not a designated signer")]
    UnknownSigner(u16),

    /// A second nonce commitment pair arrived for the same signer.
    #[error("nonce commitments from signer {0} already recorded")]
    DuplicateNonceCommitments(u16),

    /// A wire value did not decode to a curve point.
    #[error("invalid point encoding")]
    InvalidPoint,

    /// A wire value did not decode to a scalar.
    #[error("invalid scalar encoding")]
    InvalidScalar,

    /// The signer set admits no Lagrange interpolation (duplicate or
    /// zero indices).
    #[error("lagrange coefficient undefined for the signer set")]
    InvalidSignerSet,
}

impl Error {
    /// Severity class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidProofOfKnowledge(_)
            | Error::InvalidSecretShare(_)
            | Error::InvalidSigningShare
            | Error::InvalidPoint
            | Error::InvalidScalar => ErrorClass::VerificationFailure,
            Error::UnknownChunk { .. }
            | Error::UnknownNonceTree(_) => ErrorClass::LivenessGap,
            _ => ErrorClass::ProtocolViolation,
        }
    }
}

/// Result type for the driver library.
pub type Result<T> = std::result::Result<T, Error>;
