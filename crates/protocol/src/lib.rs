//! Types and encoding shared by the frostnode validator engine.
#![deny(missing_docs)]
#![forbid(unsafe_code)]

mod action;
mod error;
mod event;
mod hashing;
pub mod merkle;
mod packet;
mod types;

pub use action::ProtocolAction;
pub use error::Error;
pub use event::{ChainEvent, Transition};
pub use hashing::{
    epoch_rollover_hash, group_id, keccak, meta_transaction_hash,
    transaction_packet_hash,
};
pub use packet::{
    EpochRolloverPacket, MetaTransaction, Packet, PacketDomain,
    PacketKind, TransactionPacket, OPERATION_CALL,
    OPERATION_DELEGATE_CALL,
};
pub use types::{
    Address, GroupId, GroupInfo, Hash32, MessageId, NonceCommitments,
    NonceRoot, Parameters, Participant, PointBytes, ProofOfKnowledge,
    ScalarBytes, SignatureId,
};

pub use hex;

/// Result type for the protocol library.
pub type Result<T> = std::result::Result<T, Error>;
