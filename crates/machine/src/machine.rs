//! The validator state machine orchestrator.
//!
//! Consumes strictly ordered transitions, runs the handlers against a
//! copy-on-write overlay, commits the resulting diffs atomically and
//! only then releases the outbound actions.
use crate::config::MachineConfig;
use crate::overlay::TransitionState;
use crate::state::{
    apply, ConsensusState, MachineStates, StateDiff,
};
use crate::verify::VerificationEngine;
use crate::{rollover, signing, Error, Result};
use frostnode_driver::{KeyGenEngine, SigningEngine};
use frostnode_protocol::{ChainEvent, ProtocolAction, Transition};
use tracing::debug;

/// Result of one committed transition.
#[derive(Debug, Default)]
pub struct TransitionOutcome {
    /// Diffs committed by the transition, in application order.
    pub diffs: Vec<StateDiff>,
    /// Actions released for submission after the commit.
    pub actions: Vec<ProtocolAction>,
}

impl TransitionOutcome {
    fn merge(&mut self, other: TransitionOutcome) {
        self.diffs.extend(other.diffs);
        self.actions.extend(other.actions);
    }
}

/// Top-level orchestrator owning the engines, the lifecycle states
/// and the consensus bookkeeping.
pub struct ValidatorStateMachine {
    config: MachineConfig,
    verifier: VerificationEngine,
    keygen: KeyGenEngine,
    signing: SigningEngine,
    consensus: ConsensusState,
    machines: MachineStates,
    last_block: u64,
    last_event: Option<(u64, u32)>,
}

impl ValidatorStateMachine {
    /// Machine starting from empty state.
    pub fn new(
        config: MachineConfig,
        verifier: VerificationEngine,
    ) -> Self {
        Self::with_state(
            config,
            verifier,
            ConsensusState::default(),
            MachineStates::default(),
        )
    }

    /// Machine resuming from persisted state.
    pub fn with_state(
        config: MachineConfig,
        verifier: VerificationEngine,
        consensus: ConsensusState,
        machines: MachineStates,
    ) -> Self {
        let keygen = KeyGenEngine::new(config.local_address);
        Self {
            config,
            verifier,
            keygen,
            signing: SigningEngine::new(),
            consensus,
            machines,
            last_block: 0,
            last_event: None,
        }
    }

    /// Consensus bookkeeping, read-only.
    pub fn consensus_state(&self) -> &ConsensusState {
        &self.consensus
    }

    /// Lifecycle states, read-only.
    pub fn machine_states(&self) -> &MachineStates {
        &self.machines
    }

    /// Process one transition to completion.
    ///
    /// Block ticks at or before the last processed block are no-ops;
    /// an event at or before the last processed `(block, log_index)`
    /// is a fatal [`Error::OutOfOrderTransition`].
    pub fn handle_transition(
        &mut self,
        transition: Transition,
    ) -> Result<TransitionOutcome> {
        match transition {
            Transition::Block { block } => {
                if block <= self.last_block {
                    return Ok(TransitionOutcome::default());
                }
                self.process_block(block)
            }
            Transition::Event {
                block,
                log_index,
                event,
            } => {
                let (last_block, last_index) = self
                    .last_event
                    .unwrap_or((self.last_block, 0));
                let stale = block < self.last_block
                    || self.last_event.is_some_and(|(b, i)| {
                        block < b
                            || (block == b && log_index <= i)
                    });
                if stale {
                    return Err(Error::OutOfOrderTransition {
                        block,
                        index: log_index,
                        last_block,
                        last_index,
                    });
                }
                let mut outcome = if block > self.last_block {
                    self.process_block(block)?
                } else {
                    TransitionOutcome::default()
                };
                self.last_event = Some((block, log_index));
                outcome.merge(self.process_event(block, event)?);
                Ok(outcome)
            }
        }
    }

    fn process_block(
        &mut self,
        block: u64,
    ) -> Result<TransitionOutcome> {
        debug!(block, "progressing to block");
        self.last_block = block;
        let mut ts =
            TransitionState::new(&self.consensus, &self.machines);
        let diff = rollover::check_rollover_abort(
            &self.config,
            &mut self.keygen,
            &ts,
            block,
        );
        ts.apply(diff);
        let diff = rollover::check_key_gen_timeout(
            &self.config,
            &mut self.keygen,
            &ts,
            block,
        )?;
        ts.apply(diff);
        for message in ts.signing_messages() {
            let diff = signing::check_signing_timeout(
                &self.config,
                &self.signing,
                &ts,
                block,
                message,
            )?;
            ts.apply(diff);
        }
        let diff = rollover::check_epoch_activation(
            &self.config,
            &ts,
            block,
        );
        ts.apply(diff);
        let diff = rollover::check_epoch_rollover(
            &self.config,
            &mut self.keygen,
            &ts,
            block,
        )?;
        ts.apply(diff);
        let diffs = ts.into_diffs();
        Ok(self.commit(diffs))
    }

    fn process_event(
        &mut self,
        block: u64,
        event: ChainEvent,
    ) -> Result<TransitionOutcome> {
        let mut ts =
            TransitionState::new(&self.consensus, &self.machines);
        let diff = match event {
            ChainEvent::KeyGenInit {
                group_id,
                participants_root,
                count,
                threshold,
                context,
            } => rollover::handle_key_gen_init(
                &self.config,
                &mut self.keygen,
                &ts,
                block,
                group_id,
                participants_root,
                count,
                threshold,
                context,
            )?,
            ChainEvent::KeyGenCommitted {
                group_id,
                index,
                commitments,
                pok,
            } => rollover::handle_key_gen_committed(
                &self.config,
                &mut self.keygen,
                &ts,
                block,
                group_id,
                index,
                &commitments,
                &pok,
            ),
            ChainEvent::KeyGenSecretShared {
                group_id,
                index,
                verification_share: _,
                encrypted_shares,
                completed,
            } => rollover::handle_key_gen_secret_shared(
                &self.config,
                &mut self.keygen,
                &mut self.signing,
                &mut self.verifier,
                &ts,
                block,
                group_id,
                index,
                &encrypted_shares,
                completed,
            )?,
            ChainEvent::KeyGenAborted { group_id } => {
                rollover::handle_key_gen_aborted(
                    &mut self.keygen,
                    &ts,
                    group_id,
                )
            }
            ChainEvent::Preprocess {
                group_id,
                index,
                nonce_root,
                chunk,
            } => signing::handle_preprocess(
                &mut self.signing,
                &ts,
                group_id,
                index,
                nonce_root,
                chunk,
            ),
            ChainEvent::Sign {
                group_id,
                signature_id,
                message,
                sequence,
            } => signing::handle_sign(
                &self.config,
                &mut self.signing,
                &self.verifier,
                &ts,
                block,
                group_id,
                signature_id,
                message,
                sequence,
            ),
            ChainEvent::SignRevealedNonces {
                signature_id,
                index,
                hiding,
                binding,
            } => signing::handle_revealed_nonces(
                &self.config,
                &mut self.signing,
                &ts,
                block,
                signature_id,
                index,
                hiding,
                binding,
            ),
            ChainEvent::SignShared {
                signature_id,
                index,
            } => signing::handle_sign_shared(
                &self.signing,
                &ts,
                signature_id,
                index,
            ),
            ChainEvent::SignCompleted { signature_id } => {
                signing::handle_sign_completed(
                    &self.config,
                    &self.signing,
                    &ts,
                    block,
                    signature_id,
                )
            }
            ChainEvent::EpochStaged {
                proposed_epoch,
                rollover_block: _,
                group_id,
            } => rollover::handle_epoch_staged(
                &ts,
                proposed_epoch,
                group_id,
            ),
            ChainEvent::TransactionProposed {
                epoch,
                transaction,
            } => signing::handle_transaction_proposed(
                &self.config,
                &self.signing,
                &mut self.verifier,
                &ts,
                block,
                epoch,
                transaction,
            )?,
            ChainEvent::TransactionAttested {
                epoch: _,
                message,
            } => signing::handle_transaction_attested(&ts, message),
        };
        ts.apply(diff);
        // A completed event may have unblocked the next rollover.
        let diff = rollover::check_epoch_rollover(
            &self.config,
            &mut self.keygen,
            &ts,
            block,
        )?;
        ts.apply(diff);
        Ok(self.commit(ts.into_diffs()))
    }

    fn commit(&mut self, diffs: Vec<StateDiff>) -> TransitionOutcome {
        let mut actions = Vec::new();
        for diff in &diffs {
            apply(&mut self.consensus, &mut self.machines, diff);
            actions.extend(diff.actions.iter().cloned());
        }
        TransitionOutcome { diffs, actions }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{RolloverState, SigningPhase, SigningState};
    use frostnode_protocol::{
        Address, GroupId, GroupInfo, MessageId, MetaTransaction,
        Packet, PacketDomain, Participant, SignatureId,
        TransactionPacket,
    };

    fn participants() -> Vec<Participant> {
        (1u16..=3)
            .map(|i| Participant {
                index: i,
                address: Address::from([i as u8; 20]),
            })
            .collect()
    }

    fn config_for(local: u16) -> MachineConfig {
        let mut config = MachineConfig::new(
            participants(),
            Address::from([local as u8; 20]),
            1,
            Address::from([0x99; 20]),
        );
        config.signing_timeout = 20;
        config.key_gen_timeout = 20;
        config.blocks_per_epoch = 100;
        config
    }

    fn transaction_packet() -> Packet {
        Packet::Transaction(TransactionPacket {
            domain: PacketDomain {
                chain_id: 1,
                consensus: Address::from([0x99; 20]),
            },
            epoch: 0,
            transaction: MetaTransaction {
                to: Address::from([7u8; 20]),
                value: 0,
                data: vec![],
                operation: 0,
                nonce: 0,
                chain_id: 1,
                account: Address::from([8u8; 20]),
            },
        })
    }

    fn machine_with_waiting_request(
        local: u16,
        responsible: Option<u16>,
    ) -> (ValidatorStateMachine, MessageId) {
        let message = MessageId::from([0x5a; 32]);
        let mut consensus = ConsensusState::default();
        consensus.epoch_groups.insert(
            0,
            GroupInfo {
                group_id: GroupId::from([0x11; 32]),
                participant_index: local,
            },
        );
        let mut machines = MachineStates::default();
        machines.signing.insert(
            message,
            SigningState {
                packet: transaction_packet(),
                epoch: 0,
                phase: SigningPhase::WaitingForRequest {
                    responsible,
                    signers: vec![1, 2, 3],
                    deadline: 23,
                },
            },
        );
        let machine = ValidatorStateMachine::with_state(
            config_for(local),
            VerificationEngine::new(),
            consensus,
            machines,
        );
        (machine, message)
    }

    #[test]
    fn out_of_order_events_are_fatal() {
        let mut machine = ValidatorStateMachine::new(
            config_for(1),
            VerificationEngine::new(),
        );
        let event = |block, log_index| Transition::Event {
            block,
            log_index,
            event: ChainEvent::SignCompleted {
                signature_id: SignatureId::from([1u8; 32]),
            },
        };
        machine.handle_transition(event(5, 2)).unwrap();
        assert!(matches!(
            machine.handle_transition(event(5, 2)),
            Err(Error::OutOfOrderTransition { .. })
        ));
        assert!(matches!(
            machine.handle_transition(event(5, 1)),
            Err(Error::OutOfOrderTransition { .. })
        ));
        assert!(matches!(
            machine.handle_transition(event(4, 9)),
            Err(Error::OutOfOrderTransition { .. })
        ));
        // A later position is fine.
        machine.handle_transition(event(5, 3)).unwrap();
        machine.handle_transition(event(6, 0)).unwrap();
    }

    #[test]
    fn stale_block_ticks_are_ignored() {
        let mut machine = ValidatorStateMachine::new(
            config_for(1),
            VerificationEngine::new(),
        );
        machine
            .handle_transition(Transition::Block { block: 10 })
            .unwrap();
        let outcome = machine
            .handle_transition(Transition::Block { block: 10 })
            .unwrap();
        assert!(outcome.diffs.is_empty());
        assert!(outcome.actions.is_empty());
    }

    #[test]
    fn request_timeout_demotes_the_responsible_participant() {
        // The local validator holds index one and is responsible.
        let (mut machine, message) =
            machine_with_waiting_request(1, Some(1));
        let outcome = machine
            .handle_transition(Transition::Block { block: 24 })
            .unwrap();
        let state =
            machine.machine_states().signing.get(&message).unwrap();
        match &state.phase {
            SigningPhase::WaitingForRequest {
                responsible,
                signers,
                deadline,
            } => {
                assert_eq!(*responsible, None);
                // The stalled participant loses its signer slot.
                assert_eq!(signers, &vec![2, 3]);
                assert_eq!(*deadline, 24 + 20);
            }
            other => panic!("unexpected phase {other:?}"),
        }
        assert_eq!(outcome.actions.len(), 1);
        assert!(matches!(
            outcome.actions[0],
            ProtocolAction::SignRequest { .. }
        ));
    }

    #[test]
    fn request_timeout_stays_quiet_for_bystanders() {
        // The local validator holds index two; index one was
        // responsible.
        let (mut machine, message) =
            machine_with_waiting_request(2, Some(1));
        let outcome = machine
            .handle_transition(Transition::Block { block: 24 })
            .unwrap();
        assert!(outcome.actions.is_empty());
        let state =
            machine.machine_states().signing.get(&message).unwrap();
        match &state.phase {
            SigningPhase::WaitingForRequest {
                responsible,
                signers,
                ..
            } => {
                assert_eq!(*responsible, None);
                assert_eq!(signers, &vec![2, 3]);
            }
            other => panic!("unexpected phase {other:?}"),
        }
    }

    #[test]
    fn request_timeout_with_everyone_drops_the_state() {
        let (mut machine, message) =
            machine_with_waiting_request(1, None);
        let outcome = machine
            .handle_transition(Transition::Block { block: 24 })
            .unwrap();
        assert!(machine
            .machine_states()
            .signing
            .get(&message)
            .is_none());
        assert!(matches!(
            outcome.actions[0],
            ProtocolAction::SignRequest { .. }
        ));
    }

    #[test]
    fn states_within_deadline_are_untouched() {
        let (mut machine, message) =
            machine_with_waiting_request(1, Some(1));
        let outcome = machine
            .handle_transition(Transition::Block { block: 22 })
            .unwrap();
        assert!(outcome.actions.is_empty());
        let state =
            machine.machine_states().signing.get(&message).unwrap();
        assert!(matches!(
            state.phase,
            SigningPhase::WaitingForRequest {
                responsible: Some(1),
                ..
            }
        ));
    }

    #[test]
    fn attestation_timeout_emits_for_the_responsible_validator() {
        let message = MessageId::from([0x5a; 32]);
        let signature_id = SignatureId::from([0x5f; 32]);
        let mut consensus = ConsensusState::default();
        consensus.epoch_groups.insert(
            0,
            GroupInfo {
                group_id: GroupId::from([0x11; 32]),
                participant_index: 1,
            },
        );
        consensus.message_signatures.insert(message, signature_id);
        let mut machines = MachineStates::default();
        machines.signing.insert(
            message,
            SigningState {
                packet: transaction_packet(),
                epoch: 0,
                phase: SigningPhase::WaitingForAttestation {
                    signature_id,
                    responsible: Some(1),
                    deadline: 23,
                },
            },
        );
        let mut machine = ValidatorStateMachine::with_state(
            config_for(1),
            VerificationEngine::new(),
            consensus,
            machines,
        );
        let outcome = machine
            .handle_transition(Transition::Block { block: 24 })
            .unwrap();
        assert_eq!(outcome.actions.len(), 1);
        match &outcome.actions[0] {
            ProtocolAction::ConsensusAttestTransaction {
                epoch,
                signature_id: sid,
                ..
            } => {
                assert_eq!(*epoch, 0);
                assert_eq!(*sid, signature_id);
            }
            other => panic!("unexpected action {other:?}"),
        }
        // Demoted to everyone with a fresh deadline; the admission
        // entry was released.
        let state =
            machine.machine_states().signing.get(&message).unwrap();
        assert!(matches!(
            state.phase,
            SigningPhase::WaitingForAttestation {
                responsible: None,
                deadline: 44,
                ..
            }
        ));
        assert!(machine
            .consensus_state()
            .message_signatures
            .is_empty());
    }

    #[test]
    fn rollover_state_is_not_aborted_for_genesis() {
        let group_id = GroupId::from([0x22; 32]);
        let mut consensus = ConsensusState::default();
        consensus.genesis_group_id = Some(group_id);
        let mut machines = MachineStates::default();
        machines.rollover = RolloverState::CollectingCommitments {
            group_id,
            next_epoch: 0,
            deadline: u64::MAX,
        };
        let mut machine = ValidatorStateMachine::with_state(
            config_for(1),
            VerificationEngine::new(),
            consensus,
            machines,
        );
        machine
            .handle_transition(Transition::Block { block: 500 })
            .unwrap();
        assert!(matches!(
            machine.machine_states().rollover,
            RolloverState::CollectingCommitments { .. }
        ));
    }
}
