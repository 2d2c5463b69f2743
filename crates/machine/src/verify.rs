//! Packet verification engine and transaction checks.
use crate::{Error, Result};
use frostnode_protocol::{
    Address, MessageId, MetaTransaction, Packet, PacketKind,
    OPERATION_CALL, OPERATION_DELEGATE_CALL,
};
use std::collections::{HashMap, HashSet};
use thiserror::Error as ThisError;
use tracing::debug;

/// Reason a registered verifier rejected a packet.
///
/// Rejections are reported as values, never raised; only a missing
/// verifier registration raises.
#[derive(Debug, Clone, ThisError)]
#[error("{0}")]
pub struct PacketRejection(pub String);

impl PacketRejection {
    /// Rejection with the given reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Outcome of verifying a packet.
#[derive(Debug, Clone)]
pub enum Verification {
    /// The packet is valid; its canonical hash was recorded.
    Valid {
        /// Canonical hash of the packet.
        message: MessageId,
    },
    /// The packet was rejected by its verifier.
    Invalid {
        /// Why the verifier rejected it.
        reason: String,
    },
}

/// Verifier for one packet kind.
pub trait PacketVerifier: Send + Sync {
    /// Check the packet, rejecting it with a reason when invalid.
    fn verify(
        &self,
        packet: &Packet,
    ) -> std::result::Result<(), PacketRejection>;
}

/// Verifies and deduplicates typed packets.
///
/// The verified-message cache is monotonic for the life of the
/// process: once a message id is recorded it stays verified.
pub struct VerificationEngine {
    verifiers: HashMap<PacketKind, Box<dyn PacketVerifier>>,
    verified: HashSet<MessageId>,
    packets: HashMap<MessageId, Packet>,
}

impl VerificationEngine {
    /// Engine without any registered verifiers.
    pub fn new() -> Self {
        Self {
            verifiers: HashMap::new(),
            verified: HashSet::new(),
            packets: HashMap::new(),
        }
    }

    /// Register the verifier for a packet kind, replacing any
    /// previous registration.
    pub fn register(
        &mut self,
        kind: PacketKind,
        verifier: Box<dyn PacketVerifier>,
    ) {
        self.verifiers.insert(kind, verifier);
    }

    /// Verify a packet.
    ///
    /// A missing verifier registration is a programming contract
    /// failure and raises before any state mutation; a verifier
    /// rejection is returned as [`Verification::Invalid`].
    pub fn verify(&mut self, packet: &Packet) -> Result<Verification> {
        let verifier = self
            .verifiers
            .get(&packet.kind())
            .ok_or(Error::UnregisteredPacketType(packet.kind()))?;
        match verifier.verify(packet) {
            Ok(()) => {
                let message = packet.message_id();
                self.verified.insert(message);
                self.packets.insert(message, packet.clone());
                debug!(%message, "packet verified");
                Ok(Verification::Valid { message })
            }
            Err(rejection) => Ok(Verification::Invalid {
                reason: rejection.to_string(),
            }),
        }
    }

    /// Whether a message id was produced by a successful
    /// verification.
    pub fn is_verified(&self, message: &MessageId) -> bool {
        self.verified.contains(message)
    }

    /// The verified packet behind a message id.
    pub fn packet(&self, message: &MessageId) -> Option<&Packet> {
        self.packets.get(message)
    }
}

impl Default for VerificationEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Check applied to a proposed transaction.
pub trait TransactionCheck: Send + Sync {
    /// Check the transaction, rejecting it with a reason when it is
    /// not allowed.
    fn check(
        &self,
        transaction: &MetaTransaction,
    ) -> std::result::Result<(), PacketRejection>;
}

/// Rejects every transaction; the default delegate-call policy.
pub struct Forbidden;

impl TransactionCheck for Forbidden {
    fn check(
        &self,
        _transaction: &MetaTransaction,
    ) -> std::result::Result<(), PacketRejection> {
        Err(PacketRejection::new("operation not allowed"))
    }
}

/// Pins selected transaction fields to fixed values; unpinned fields
/// pass unchecked.
#[derive(Default)]
pub struct FixedParams {
    /// Required operation.
    pub operation: Option<u8>,
    /// Required call target.
    pub to: Option<Address>,
    /// Required value.
    pub value: Option<u128>,
    /// Required call data.
    pub data: Option<Vec<u8>>,
}

impl TransactionCheck for FixedParams {
    fn check(
        &self,
        transaction: &MetaTransaction,
    ) -> std::result::Result<(), PacketRejection> {
        if let Some(operation) = self.operation {
            if transaction.operation != operation {
                return Err(PacketRejection::new(format!(
                    "expected operation {operation}, got {}",
                    transaction.operation
                )));
            }
        }
        if let Some(to) = self.to {
            if transaction.to != to {
                return Err(PacketRejection::new(format!(
                    "expected target {to}, got {}",
                    transaction.to
                )));
            }
        }
        if let Some(value) = self.value {
            if transaction.value != value {
                return Err(PacketRejection::new(format!(
                    "expected value {value}, got {}",
                    transaction.value
                )));
            }
        }
        if let Some(data) = &self.data {
            if &transaction.data != data {
                return Err(PacketRejection::new(
                    "unexpected call data",
                ));
            }
        }
        Ok(())
    }
}

/// Verifier for transaction packets, dispatching on the call
/// operation.
pub struct TransactionPacketVerifier {
    call_check: Box<dyn TransactionCheck>,
    delegate_call_check: Box<dyn TransactionCheck>,
}

impl TransactionPacketVerifier {
    /// Verifier with explicit per-operation checks.
    pub fn new(
        call_check: Box<dyn TransactionCheck>,
        delegate_call_check: Box<dyn TransactionCheck>,
    ) -> Self {
        Self {
            call_check,
            delegate_call_check,
        }
    }

    /// The default policy: plain calls pass, delegate calls are
    /// rejected.
    pub fn no_delegate_calls() -> Self {
        Self::new(
            Box::new(FixedParams::default()),
            Box::new(Forbidden),
        )
    }
}

impl PacketVerifier for TransactionPacketVerifier {
    fn verify(
        &self,
        packet: &Packet,
    ) -> std::result::Result<(), PacketRejection> {
        let Packet::Transaction(packet) = packet else {
            return Err(PacketRejection::new(
                "expected a transaction packet",
            ));
        };
        match packet.transaction.operation {
            OPERATION_CALL => {
                self.call_check.check(&packet.transaction)
            }
            OPERATION_DELEGATE_CALL => {
                self.delegate_call_check.check(&packet.transaction)
            }
            operation => Err(PacketRejection::new(format!(
                "unknown operation {operation}"
            ))),
        }
    }
}

/// Verifier for epoch rollover packets, checking the domain and the
/// epoch arithmetic.
pub struct EpochRolloverVerifier {
    chain_id: u64,
    consensus: Address,
    blocks_per_epoch: u64,
}

impl EpochRolloverVerifier {
    /// Verifier bound to the given deployment.
    pub fn new(
        chain_id: u64,
        consensus: Address,
        blocks_per_epoch: u64,
    ) -> Self {
        Self {
            chain_id,
            consensus,
            blocks_per_epoch,
        }
    }
}

impl PacketVerifier for EpochRolloverVerifier {
    fn verify(
        &self,
        packet: &Packet,
    ) -> std::result::Result<(), PacketRejection> {
        let Packet::EpochRollover(packet) = packet else {
            return Err(PacketRejection::new(
                "expected an epoch rollover packet",
            ));
        };
        if packet.domain.chain_id != self.chain_id
            || packet.domain.consensus != self.consensus
        {
            return Err(PacketRejection::new("domain mismatch"));
        }
        if packet.proposed_epoch <= packet.active_epoch {
            return Err(PacketRejection::new(format!(
                "proposed epoch {} does not follow active epoch {}",
                packet.proposed_epoch, packet.active_epoch
            )));
        }
        let expected =
            packet.proposed_epoch * self.blocks_per_epoch;
        if packet.rollover_block != expected {
            return Err(PacketRejection::new(format!(
                "rollover block {} is not the start of epoch {}",
                packet.rollover_block, packet.proposed_epoch
            )));
        }
        Ok(())
    }
}
