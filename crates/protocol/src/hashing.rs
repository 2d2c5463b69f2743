//! Canonical keccak hashing for identifiers and packets.
//!
//! Every digest that leaves this node (group identifiers, packet
//! hashes, merkle nodes) is keccak-256 over fixed-width big-endian
//! encodings so independently written implementations agree on the
//! bytes.
use crate::{
    EpochRolloverPacket, GroupId, Hash32, MessageId, MetaTransaction,
    TransactionPacket,
};
use sha3::{Digest, Keccak256};

const META_TRANSACTION_TAG: &[u8] = b"frostnode/meta-transaction/v1";
const TRANSACTION_PACKET_TAG: &[u8] = b"frostnode/transaction-packet/v1";
const EPOCH_ROLLOVER_TAG: &[u8] = b"frostnode/epoch-rollover/v1";

/// Keccak-256 over the concatenation of the given parts.
pub fn keccak(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Derive a group identifier from the roster root, the group
/// parameters and a context value.
///
/// The low eight bytes of the digest are zeroed; the chain reserves
/// them for sub-identifiers scoped to the group.
pub fn group_id(
    participants_root: &Hash32,
    count: u16,
    threshold: u16,
    context: &Hash32,
) -> GroupId {
    let mut digest = keccak(&[
        participants_root.as_bytes(),
        &count.to_be_bytes(),
        &threshold.to_be_bytes(),
        context.as_bytes(),
    ]);
    for byte in digest[24..].iter_mut() {
        *byte = 0;
    }
    GroupId::from(digest)
}

/// Canonical hash of a proposed transaction.
pub fn meta_transaction_hash(tx: &MetaTransaction) -> Hash32 {
    Hash32::from(keccak(&[
        META_TRANSACTION_TAG,
        tx.account.as_bytes(),
        &tx.chain_id.to_be_bytes(),
        &tx.nonce.to_be_bytes(),
        tx.to.as_bytes(),
        &tx.value.to_be_bytes(),
        &[tx.operation],
        &tx.data,
    ]))
}

/// Canonical hash of a transaction packet.
pub fn transaction_packet_hash(packet: &TransactionPacket) -> MessageId {
    let transaction_hash = meta_transaction_hash(&packet.transaction);
    MessageId::from(keccak(&[
        TRANSACTION_PACKET_TAG,
        &packet.domain.chain_id.to_be_bytes(),
        packet.domain.consensus.as_bytes(),
        &packet.epoch.to_be_bytes(),
        transaction_hash.as_bytes(),
    ]))
}

/// Canonical hash of an epoch rollover packet.
pub fn epoch_rollover_hash(packet: &EpochRolloverPacket) -> MessageId {
    MessageId::from(keccak(&[
        EPOCH_ROLLOVER_TAG,
        &packet.domain.chain_id.to_be_bytes(),
        packet.domain.consensus.as_bytes(),
        &packet.active_epoch.to_be_bytes(),
        &packet.proposed_epoch.to_be_bytes(),
        &packet.rollover_block.to_be_bytes(),
        &packet.group_key.0,
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Address, PacketDomain, PointBytes};

    fn transaction() -> MetaTransaction {
        MetaTransaction {
            to: Address::from([1u8; 20]),
            value: 0,
            data: vec![0xca, 0xfe],
            operation: 0,
            nonce: 7,
            chain_id: 1,
            account: Address::from([2u8; 20]),
        }
    }

    #[test]
    fn group_id_low_bytes_are_masked() {
        let gid = group_id(
            &Hash32::from([3u8; 32]),
            4,
            3,
            &Hash32::default(),
        );
        assert_eq!(&gid.as_bytes()[24..], &[0u8; 8]);
        assert_ne!(&gid.as_bytes()[..24], &[0u8; 24]);
    }

    #[test]
    fn group_id_depends_on_parameters() {
        let root = Hash32::from([3u8; 32]);
        let context = Hash32::default();
        assert_ne!(
            group_id(&root, 4, 3, &context),
            group_id(&root, 4, 2, &context)
        );
    }

    #[test]
    fn packet_hash_is_deterministic() {
        let packet = TransactionPacket {
            domain: PacketDomain {
                chain_id: 1,
                consensus: Address::from([9u8; 20]),
            },
            epoch: 22,
            transaction: transaction(),
        };
        assert_eq!(
            transaction_packet_hash(&packet),
            transaction_packet_hash(&packet)
        );
    }

    #[test]
    fn packet_hash_commits_to_payload() {
        let domain = PacketDomain {
            chain_id: 1,
            consensus: Address::from([9u8; 20]),
        };
        let a = TransactionPacket {
            domain: domain.clone(),
            epoch: 22,
            transaction: transaction(),
        };
        let mut changed = transaction();
        changed.nonce = 8;
        let b = TransactionPacket {
            domain,
            epoch: 22,
            transaction: changed,
        };
        assert_ne!(
            transaction_packet_hash(&a),
            transaction_packet_hash(&b)
        );
    }

    #[test]
    fn rollover_hash_commits_to_group_key() {
        let domain = PacketDomain {
            chain_id: 1,
            consensus: Address::from([9u8; 20]),
        };
        let packet = |key: u8| EpochRolloverPacket {
            domain: domain.clone(),
            active_epoch: 0,
            proposed_epoch: 1,
            rollover_block: 17_280,
            group_key: PointBytes([key; 33]),
        };
        assert_ne!(
            epoch_rollover_hash(&packet(2)),
            epoch_rollover_hash(&packet(3))
        );
    }
}
