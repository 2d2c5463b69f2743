//! Submission of protocol actions with retry, backoff and expiry.
use async_trait::async_trait;
use frostnode_protocol::{Address, Hash32, ProtocolAction};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, warn};

/// First retry delay.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Cap applied to the retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Error returned by an action submission attempt.
#[derive(Debug, ThisError)]
pub enum SubmitError {
    /// The account nonce was already consumed: the action executed
    /// through another path and counts as completed.
    #[error("nonce too low")]
    NonceTooLow,

    /// Temporary failure; the action is retried on the next tick.
    #[error("transient submission failure: {0}")]
    Transient(String),

    /// Unexpected failure; logged and dropped, never retried.
    #[error("submission failed: {0}")]
    Other(String),
}

/// Static identity of the chain deployment.
pub trait ChainIdentity {
    /// Chain identifier.
    fn chain_id(&self) -> u64;
    /// Address of the consensus core contract.
    fn consensus(&self) -> Address;
    /// Address of the signing coordinator contract.
    fn coordinator(&self) -> Address;
}

/// Collaborator submitting actions to the chain.
#[async_trait]
pub trait ActionSubmitter: Send + Sync {
    /// Attempt one submission, returning the transaction hash.
    async fn submit(
        &self,
        action: &ProtocolAction,
    ) -> std::result::Result<Hash32, SubmitError>;
}

struct QueuedAction {
    action: ProtocolAction,
    valid_until: Instant,
}

/// FIFO dispatcher guaranteeing at most one in-flight submission
/// attempt per action.
///
/// Failed attempts retry with a linearly growing delay capped at
/// [`MAX_BACKOFF`]; the delay resets for every freshly dequeued
/// action. An action still unacknowledged when its ttl elapses is
/// dropped and never retried again.
pub struct ActionDispatcher<S> {
    submitter: Arc<S>,
    queue: VecDeque<QueuedAction>,
    attempt: u32,
}

impl<S: ActionSubmitter> ActionDispatcher<S> {
    /// Dispatcher feeding the given submitter.
    pub fn new(submitter: Arc<S>) -> Self {
        Self {
            submitter,
            queue: VecDeque::new(),
            attempt: 0,
        }
    }

    /// Queue an action valid for `ttl` from now.
    pub fn enqueue(&mut self, action: ProtocolAction, ttl: Duration) {
        self.queue.push_back(QueuedAction {
            action,
            valid_until: Instant::now() + ttl,
        });
    }

    /// Whether anything is waiting for submission.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drive the queue until it drains.
    pub async fn run_pending(&mut self) {
        while let Some(front) = self.queue.front() {
            if Instant::now() >= front.valid_until {
                warn!("action expired before submission, dropping");
                self.queue.pop_front();
                self.attempt = 0;
                continue;
            }
            match self.submitter.submit(&front.action).await {
                Ok(hash) => {
                    debug!(%hash, "action submitted");
                    self.queue.pop_front();
                    self.attempt = 0;
                }
                Err(SubmitError::NonceTooLow) => {
                    // Already executed through another path.
                    debug!("action already executed, completing");
                    self.queue.pop_front();
                    self.attempt = 0;
                }
                Err(SubmitError::Transient(reason)) => {
                    self.attempt += 1;
                    let delay = INITIAL_BACKOFF
                        .saturating_mul(self.attempt)
                        .min(MAX_BACKOFF);
                    warn!(
                        %reason,
                        attempt = self.attempt,
                        delay_ms = delay.as_millis() as u64,
                        "submission failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(SubmitError::Other(reason)) => {
                    error!(%reason, "submission failed, dropping");
                    self.queue.pop_front();
                    self.attempt = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frostnode_protocol::{GroupId, MessageId};
    use std::sync::Mutex;

    fn action() -> ProtocolAction {
        ProtocolAction::SignRequest {
            group_id: GroupId::from([1u8; 32]),
            message: MessageId::from([2u8; 32]),
        }
    }

    /// Submitter scripted with a sequence of outcomes; records the
    /// virtual time of every attempt.
    struct ScriptedSubmitter {
        script: Mutex<Vec<std::result::Result<(), SubmitError>>>,
        attempts: Mutex<Vec<Instant>>,
    }

    impl ScriptedSubmitter {
        fn always_transient() -> Self {
            Self {
                script: Mutex::new(Vec::new()),
                attempts: Mutex::new(Vec::new()),
            }
        }

        fn scripted(
            script: Vec<std::result::Result<(), SubmitError>>,
        ) -> Self {
            Self {
                script: Mutex::new(script),
                attempts: Mutex::new(Vec::new()),
            }
        }

        fn attempt_gaps_ms(&self) -> Vec<u64> {
            let attempts = self.attempts.lock().unwrap();
            attempts
                .windows(2)
                .map(|pair| {
                    (pair[1] - pair[0]).as_millis() as u64
                })
                .collect()
        }
    }

    #[async_trait]
    impl ActionSubmitter for ScriptedSubmitter {
        async fn submit(
            &self,
            _action: &ProtocolAction,
        ) -> std::result::Result<Hash32, SubmitError> {
            self.attempts.lock().unwrap().push(Instant::now());
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Err(SubmitError::Transient(
                    "unreachable".into(),
                ));
            }
            match script.remove(0) {
                Ok(()) => Ok(Hash32::from([0xaa; 32])),
                Err(error) => Err(error),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_until_the_ttl_drops_the_action() {
        let submitter =
            Arc::new(ScriptedSubmitter::always_transient());
        let mut dispatcher = ActionDispatcher::new(submitter.clone());
        dispatcher.enqueue(action(), Duration::from_millis(10_000));
        dispatcher.run_pending().await;

        // Attempts at 0, 1000, 3000 and 6000 ms; the next retry
        // would land at 10000 ms where the ttl cuts it off.
        assert_eq!(
            submitter.attempts.lock().unwrap().len(),
            4
        );
        assert_eq!(
            submitter.attempt_gaps_ms(),
            vec![1000, 2000, 3000]
        );
        assert!(dispatcher.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_capped_at_five_seconds() {
        let submitter =
            Arc::new(ScriptedSubmitter::always_transient());
        let mut dispatcher = ActionDispatcher::new(submitter.clone());
        dispatcher.enqueue(action(), Duration::from_millis(30_000));
        dispatcher.run_pending().await;

        // Gaps 1, 2, 3, 4 then capped at 5 seconds.
        assert_eq!(
            submitter.attempt_gaps_ms(),
            vec![1000, 2000, 3000, 4000, 5000, 5000, 5000]
        );
        assert!(dispatcher.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn nonce_too_low_counts_as_executed() {
        let submitter = Arc::new(ScriptedSubmitter::scripted(vec![
            Err(SubmitError::NonceTooLow),
        ]));
        let mut dispatcher = ActionDispatcher::new(submitter.clone());
        dispatcher.enqueue(action(), Duration::from_millis(10_000));
        dispatcher.run_pending().await;
        assert_eq!(submitter.attempts.lock().unwrap().len(), 1);
        assert!(dispatcher.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_errors_drop_without_retry() {
        let submitter = Arc::new(ScriptedSubmitter::scripted(vec![
            Err(SubmitError::Other("abi mismatch".into())),
            Ok(()),
        ]));
        let mut dispatcher = ActionDispatcher::new(submitter.clone());
        dispatcher.enqueue(action(), Duration::from_millis(10_000));
        dispatcher.enqueue(action(), Duration::from_millis(10_000));
        dispatcher.run_pending().await;
        // The failed action is dropped, the next one proceeds.
        assert_eq!(submitter.attempts.lock().unwrap().len(), 2);
        assert!(dispatcher.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delay_resets_between_actions() {
        let submitter = Arc::new(ScriptedSubmitter::scripted(vec![
            Err(SubmitError::Transient("busy".into())),
            Err(SubmitError::Transient("busy".into())),
            Ok(()),
            Err(SubmitError::Transient("busy".into())),
            Ok(()),
        ]));
        let mut dispatcher = ActionDispatcher::new(submitter.clone());
        dispatcher.enqueue(action(), Duration::from_millis(60_000));
        dispatcher.enqueue(action(), Duration::from_millis(60_000));
        dispatcher.run_pending().await;
        // First action: gaps 1000, 2000. Second action starts over
        // at 1000.
        assert_eq!(
            submitter.attempt_gaps_ms(),
            vec![1000, 2000, 0, 1000]
        );
        assert!(dispatcher.is_empty());
    }
}
