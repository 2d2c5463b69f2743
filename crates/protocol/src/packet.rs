//! Typed packets admitted to threshold signing.
use crate::{
    epoch_rollover_hash, transaction_packet_hash, Address, MessageId,
    PointBytes,
};
use serde::{Deserialize, Serialize};

/// Plain call operation of a transaction.
pub const OPERATION_CALL: u8 = 0;

/// Delegate-call operation of a transaction.
pub const OPERATION_DELEGATE_CALL: u8 = 1;

/// Chain and contract a packet is bound to, preventing replay across
/// deployments.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct PacketDomain {
    /// Chain identifier.
    pub chain_id: u64,
    /// Address of the consensus core contract.
    pub consensus: Address,
}

/// Transaction proposed for attestation by the signing group.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct MetaTransaction {
    /// Call target.
    pub to: Address,
    /// Native value transferred with the call.
    pub value: u128,
    /// Call data.
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
    /// Call operation, [`OPERATION_CALL`] or
    /// [`OPERATION_DELEGATE_CALL`].
    pub operation: u8,
    /// Account transaction nonce.
    pub nonce: u64,
    /// Chain the transaction executes on.
    pub chain_id: u64,
    /// Account executing the transaction.
    pub account: Address,
}

/// Packet proposing a transaction for attestation.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPacket {
    /// Domain separator.
    pub domain: PacketDomain,
    /// Epoch whose group attests the transaction.
    pub epoch: u64,
    /// Proposed transaction.
    pub transaction: MetaTransaction,
}

/// Packet attesting the key of a freshly generated epoch group.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct EpochRolloverPacket {
    /// Domain separator.
    pub domain: PacketDomain,
    /// Epoch the retiring group is serving.
    pub active_epoch: u64,
    /// Epoch the new group will serve.
    pub proposed_epoch: u64,
    /// First block of the proposed epoch.
    pub rollover_block: u64,
    /// Public key of the new group.
    pub group_key: PointBytes,
}

/// Kind discriminator of a [`Packet`].
#[derive(
    Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    /// An [`EpochRolloverPacket`].
    EpochRollover,
    /// A [`TransactionPacket`].
    Transaction,
}

/// A typed payload whose canonical hash becomes the message that is
/// threshold-signed.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Packet {
    /// Epoch rollover attestation payload.
    EpochRollover(EpochRolloverPacket),
    /// Transaction attestation payload.
    Transaction(TransactionPacket),
}

impl Packet {
    /// Kind discriminator of this packet.
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::EpochRollover(_) => PacketKind::EpochRollover,
            Packet::Transaction(_) => PacketKind::Transaction,
        }
    }

    /// Canonical hash of this packet.
    pub fn message_id(&self) -> MessageId {
        match self {
            Packet::EpochRollover(packet) => {
                epoch_rollover_hash(packet)
            }
            Packet::Transaction(packet) => {
                transaction_packet_hash(packet)
            }
        }
    }
}
