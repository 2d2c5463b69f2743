use frostnode_protocol::PacketKind;
use thiserror::Error;

/// Errors raised by the validator state machine.
#[derive(Debug, Error)]
pub enum Error {
    /// An event arrived at or before the last processed queue
    /// position. Fatal: the transition source broke its ordering
    /// contract.
    #[error(
        "out of order transition: block {block} index {index} \
         after block {last_block} index {last_index}"
    )]
    OutOfOrderTransition {
        /// Block of the offending event.
        block: u64,
        /// Log index of the offending event.
        index: u32,
        /// Last processed block.
        last_block: u64,
        /// Last processed log index.
        last_index: u32,
    },

    /// No verifier is registered for a packet kind. A programming
    /// contract failure, not a normal rejection.
    #[error("no verifier registered for packet kind {0:?}")]
    UnregisteredPacketType(PacketKind),

    /// No group is recorded for an epoch the machine must act on.
    #[error("unknown group for epoch {0}")]
    UnknownEpochGroup(u64),

    /// A key generation cannot start with fewer than two
    /// participants.
    #[error("not enough participants for key generation: {0}")]
    NotEnoughParticipants(usize),

    /// An invariant of the machine state was violated.
    #[error("inconsistent machine state: {0}")]
    InvalidState(&'static str),

    /// Error propagated from the protocol engines.
    #[error(transparent)]
    Driver(#[from] frostnode_driver::Error),
}

/// Result type for the machine library.
pub type Result<T> = std::result::Result<T, Error>;
