//! Async service loop wiring transitions to the machine, the state
//! store and the action dispatcher.
use crate::dispatch::{ActionDispatcher, ActionSubmitter};
use crate::machine::ValidatorStateMachine;
use crate::state::{apply, ConsensusState, MachineStates, StateDiff};
use crate::{Error, Result};
use frostnode_protocol::Transition;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Default time an action stays valid in the submission queue.
pub const DEFAULT_ACTION_TTL: Duration = Duration::from_secs(60);

/// Durable storage collaborator for the machine state.
///
/// Committed diffs are the persistence boundary: persisting them (or
/// the state snapshot they produce) lets the machine resume after a
/// restart without reprocessing applied transitions.
pub trait StateStore: Send {
    /// Durably record committed diffs.
    fn persist(&mut self, diffs: &[StateDiff]);

    /// Load the last persisted snapshot.
    fn load(&self) -> (ConsensusState, MachineStates);
}

/// In-memory store maintaining the snapshot produced by the
/// persisted diffs. Useful for tests and as a reference for durable
/// implementations.
#[derive(Default)]
pub struct MemoryStateStore {
    consensus: ConsensusState,
    machines: MachineStates,
}

impl MemoryStateStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn persist(&mut self, diffs: &[StateDiff]) {
        for diff in diffs {
            apply(&mut self.consensus, &mut self.machines, diff);
        }
    }

    fn load(&self) -> (ConsensusState, MachineStates) {
        (self.consensus.clone(), self.machines.clone())
    }
}

/// Service loop draining an ordered transition channel.
///
/// Each transition is processed to completion before the next one is
/// taken; diffs are persisted before any action is handed to the
/// dispatcher, so a crash between commit and dispatch is recoverable
/// without reprocessing the triggering event.
pub struct Service<S: ActionSubmitter, T: StateStore> {
    machine: ValidatorStateMachine,
    dispatcher: ActionDispatcher<S>,
    store: T,
    transitions: mpsc::Receiver<Transition>,
    action_ttl: Duration,
}

impl<S: ActionSubmitter, T: StateStore> Service<S, T> {
    /// Service around an initialized machine.
    pub fn new(
        machine: ValidatorStateMachine,
        dispatcher: ActionDispatcher<S>,
        store: T,
        transitions: mpsc::Receiver<Transition>,
        action_ttl: Duration,
    ) -> Self {
        Self {
            machine,
            dispatcher,
            store,
            transitions,
            action_ttl,
        }
    }

    /// Drain transitions until the channel closes.
    ///
    /// An out-of-order transition terminates the loop: the event
    /// source broke its contract and resuming would corrupt state.
    /// Every other failure is logged and the loop continues.
    pub async fn run(mut self) -> Result<()> {
        while let Some(transition) = self.transitions.recv().await {
            match self.machine.handle_transition(transition) {
                Ok(outcome) => {
                    self.store.persist(&outcome.diffs);
                    for action in outcome.actions {
                        self.dispatcher
                            .enqueue(action, self.action_ttl);
                    }
                    self.dispatcher.run_pending().await;
                }
                Err(
                    fatal @ Error::OutOfOrderTransition { .. },
                ) => {
                    error!(%fatal, "transition source broke ordering");
                    return Err(fatal);
                }
                Err(error) => {
                    error!(%error, "transition failed");
                }
            }
        }
        info!("transition channel closed");
        Ok(())
    }
}
