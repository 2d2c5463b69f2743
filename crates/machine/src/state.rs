//! Machine state, state diffs and the reducer applying them.
//!
//! Handlers never mutate state directly; they return [`StateDiff`]
//! values that the orchestrator applies atomically once a transition
//! completes. Diffs are serializable, forming the persistence
//! boundary for durable storage collaborators.
use frostnode_protocol::{
    GroupId, GroupInfo, MessageId, Packet, ProtocolAction,
    SignatureId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Lifecycle of the single process-wide rollover instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(tag = "id", rename_all = "snake_case")]
pub enum RolloverState {
    /// No rollover in progress.
    WaitingForRollover,
    /// Key generation commitments are being collected.
    CollectingCommitments {
        /// Group being generated.
        group_id: GroupId,
        /// Epoch the group will serve.
        next_epoch: u64,
        /// Block the round times out at.
        deadline: u64,
    },
    /// Encrypted secret shares are being collected.
    CollectingShares {
        /// Group being generated.
        group_id: GroupId,
        /// Epoch the group will serve.
        next_epoch: u64,
        /// Block the round times out at.
        deadline: u64,
        /// Participant whose share arrived last.
        last_participant: Option<u16>,
    },
    /// The new group key awaits its rollover attestation.
    SignRollover {
        /// Freshly generated group.
        group_id: GroupId,
        /// Epoch the group will serve.
        next_epoch: u64,
        /// Rollover packet message being signed.
        message: MessageId,
        /// Participant responsible for requesting the signature.
        responsible: u16,
    },
}

/// Phase of one in-flight message signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "snake_case")]
pub enum SigningPhase {
    /// A signature request is expected on chain.
    WaitingForRequest {
        /// Specifically responsible participant, or everyone.
        responsible: Option<u16>,
        /// Signer set for the next request.
        signers: Vec<u16>,
        /// Block the state times out at.
        deadline: u64,
    },
    /// Signers are revealing their nonce commitments.
    CollectNonceCommitments {
        /// Signature run.
        signature_id: SignatureId,
        /// Signer whose contribution arrived last.
        last_signer: Option<u16>,
        /// Block the state times out at.
        deadline: u64,
    },
    /// Signers are publishing their partial signatures.
    CollectSigningShares {
        /// Signature run.
        signature_id: SignatureId,
        /// Signers that have published so far.
        shares_from: Vec<u16>,
        /// Signer whose contribution arrived last.
        last_signer: Option<u16>,
        /// Block the state times out at.
        deadline: u64,
    },
    /// The signature is complete and awaits its on-chain
    /// attestation.
    WaitingForAttestation {
        /// Signature run.
        signature_id: SignatureId,
        /// Specifically responsible participant, or everyone.
        responsible: Option<u16>,
        /// Block the state times out at.
        deadline: u64,
    },
}

impl SigningPhase {
    /// Block the phase times out at.
    pub fn deadline(&self) -> u64 {
        match self {
            SigningPhase::WaitingForRequest { deadline, .. }
            | SigningPhase::CollectNonceCommitments {
                deadline, ..
            }
            | SigningPhase::CollectSigningShares { deadline, .. }
            | SigningPhase::WaitingForAttestation {
                deadline, ..
            } => *deadline,
        }
    }

    /// Signature run of the phase, when one is assigned.
    pub fn signature_id(&self) -> Option<SignatureId> {
        match self {
            SigningPhase::WaitingForRequest { .. } => None,
            SigningPhase::CollectNonceCommitments {
                signature_id,
                ..
            }
            | SigningPhase::CollectSigningShares {
                signature_id,
                ..
            }
            | SigningPhase::WaitingForAttestation {
                signature_id,
                ..
            } => Some(*signature_id),
        }
    }
}

/// State of one in-flight message signature, keyed by message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningState {
    /// Verified packet behind the message.
    pub packet: Packet,
    /// Epoch whose group signs.
    pub epoch: u64,
    /// Current phase.
    pub phase: SigningPhase,
}

/// Consensus bookkeeping owned by the orchestrator.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct ConsensusState {
    /// Group generated at genesis, exempt from abort rules.
    pub genesis_group_id: Option<GroupId>,
    /// Epoch whose group key is currently authoritative.
    pub active_epoch: u64,
    /// Epoch staged for activation at its rollover block.
    pub staged_epoch: u64,
    /// Group serving each epoch.
    pub epoch_groups: BTreeMap<u64, GroupInfo>,
    /// Groups with a nonce batch registered but not yet linked.
    pub group_pending_nonces: BTreeSet<GroupId>,
    /// Exactly-once admission table from message to its open
    /// signature run.
    pub message_signatures: BTreeMap<MessageId, SignatureId>,
}

/// Lifecycle states owned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineStates {
    /// The single rollover instance.
    pub rollover: RolloverState,
    /// In-flight message signatures.
    pub signing: BTreeMap<MessageId, SigningState>,
}

impl Default for MachineStates {
    fn default() -> Self {
        Self {
            rollover: RolloverState::WaitingForRollover,
            signing: BTreeMap::new(),
        }
    }
}

/// Add or remove instruction for a set-valued field.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SetOp {
    /// Insert the value.
    Add,
    /// Remove the value.
    Remove,
}

/// Overwrites for the consensus bookkeeping.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct ConsensusDiff {
    /// Overwrite the active epoch.
    pub active_epoch: Option<u64>,
    /// Overwrite the staged epoch.
    pub staged_epoch: Option<u64>,
    /// Record the genesis group.
    pub genesis_group_id: Option<GroupId>,
    /// Record the group serving an epoch.
    pub epoch_group: Option<(u64, GroupInfo)>,
    /// Mark or clear a group's pending nonce registration.
    pub pending_nonces: Option<(SetOp, GroupId)>,
    /// Record or clear the admission entry of a message.
    pub message_signature: Option<(MessageId, Option<SignatureId>)>,
}

/// Atomic unit of state change produced by one handler.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct StateDiff {
    /// Consensus bookkeeping changes.
    pub consensus: Option<ConsensusDiff>,
    /// Replacement rollover state.
    pub rollover: Option<RolloverState>,
    /// Replacement (or removal, on `None`) of one signing state.
    pub signing: Option<(MessageId, Option<SigningState>)>,
    /// Actions to submit once the diff is committed.
    pub actions: Vec<ProtocolAction>,
}

impl StateDiff {
    /// Whether the diff changes nothing and carries no actions.
    pub fn is_empty(&self) -> bool {
        self.consensus.is_none()
            && self.rollover.is_none()
            && self.signing.is_none()
            && self.actions.is_empty()
    }
}

/// Apply a diff to the owned state. Pure with respect to the diff:
/// applying the same diffs in the same order always yields the same
/// state.
pub fn apply(
    consensus: &mut ConsensusState,
    machines: &mut MachineStates,
    diff: &StateDiff,
) {
    if let Some((message, state)) = &diff.signing {
        match state {
            Some(state) => {
                machines.signing.insert(*message, state.clone());
            }
            None => {
                machines.signing.remove(message);
            }
        }
    }
    if let Some(rollover) = &diff.rollover {
        machines.rollover = rollover.clone();
    }
    if let Some(consensus_diff) = &diff.consensus {
        if let Some((op, group_id)) = &consensus_diff.pending_nonces {
            match op {
                SetOp::Add => {
                    consensus.group_pending_nonces.insert(*group_id);
                }
                SetOp::Remove => {
                    consensus.group_pending_nonces.remove(group_id);
                }
            }
        }
        if let Some(epoch) = consensus_diff.active_epoch {
            consensus.active_epoch = epoch;
        }
        if let Some(epoch) = consensus_diff.staged_epoch {
            consensus.staged_epoch = epoch;
        }
        if let Some(group_id) = consensus_diff.genesis_group_id {
            consensus.genesis_group_id = Some(group_id);
        }
        if let Some((epoch, info)) = consensus_diff.epoch_group {
            consensus.epoch_groups.insert(epoch, info);
        }
        if let Some((message, signature)) =
            &consensus_diff.message_signature
        {
            match signature {
                Some(signature) => {
                    consensus
                        .message_signatures
                        .insert(*message, *signature);
                }
                None => {
                    consensus.message_signatures.remove(message);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_is_field_wise() {
        let mut consensus = ConsensusState::default();
        let mut machines = MachineStates::default();
        let group = GroupId::from([1u8; 32]);
        apply(
            &mut consensus,
            &mut machines,
            &StateDiff {
                consensus: Some(ConsensusDiff {
                    active_epoch: Some(3),
                    pending_nonces: Some((SetOp::Add, group)),
                    ..Default::default()
                }),
                rollover: Some(RolloverState::CollectingCommitments {
                    group_id: group,
                    next_epoch: 4,
                    deadline: 100,
                }),
                ..Default::default()
            },
        );
        assert_eq!(consensus.active_epoch, 3);
        assert!(consensus.group_pending_nonces.contains(&group));
        assert!(matches!(
            machines.rollover,
            RolloverState::CollectingCommitments { .. }
        ));

        apply(
            &mut consensus,
            &mut machines,
            &StateDiff {
                consensus: Some(ConsensusDiff {
                    pending_nonces: Some((SetOp::Remove, group)),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        assert!(!consensus.group_pending_nonces.contains(&group));
        assert_eq!(consensus.active_epoch, 3);
    }

    #[test]
    fn diffs_survive_the_persistence_boundary() {
        let group = GroupId::from([3u8; 32]);
        let diff = StateDiff {
            consensus: Some(ConsensusDiff {
                staged_epoch: Some(2),
                pending_nonces: Some((SetOp::Remove, group)),
                ..Default::default()
            }),
            rollover: Some(RolloverState::SignRollover {
                group_id: group,
                next_epoch: 2,
                message: MessageId::from([4u8; 32]),
                responsible: 3,
            }),
            signing: None,
            actions: vec![ProtocolAction::SignRequest {
                group_id: group,
                message: MessageId::from([4u8; 32]),
            }],
        };
        let encoded = serde_json::to_string(&diff).unwrap();
        let decoded: StateDiff =
            serde_json::from_str(&encoded).unwrap();
        assert_eq!(diff, decoded);
    }

    #[test]
    fn signing_slot_none_removes() {
        let mut consensus = ConsensusState::default();
        let mut machines = MachineStates::default();
        let message = MessageId::from([2u8; 32]);
        let state = SigningState {
            packet: Packet::Transaction(
                frostnode_protocol::TransactionPacket {
                    domain: frostnode_protocol::PacketDomain {
                        chain_id: 1,
                        consensus:
                            frostnode_protocol::Address::default(),
                    },
                    epoch: 0,
                    transaction:
                        frostnode_protocol::MetaTransaction {
                            to: frostnode_protocol::Address::default(
                            ),
                            value: 0,
                            data: vec![],
                            operation: 0,
                            nonce: 0,
                            chain_id: 1,
                            account:
                                frostnode_protocol::Address::default(
                                ),
                        },
                },
            ),
            epoch: 0,
            phase: SigningPhase::WaitingForRequest {
                responsible: None,
                signers: vec![1, 2],
                deadline: 10,
            },
        };
        apply(
            &mut consensus,
            &mut machines,
            &StateDiff {
                signing: Some((message, Some(state))),
                ..Default::default()
            },
        );
        assert!(machines.signing.contains_key(&message));
        apply(
            &mut consensus,
            &mut machines,
            &StateDiff {
                signing: Some((message, None)),
                ..Default::default()
            },
        );
        assert!(!machines.signing.contains_key(&message));
    }
}
