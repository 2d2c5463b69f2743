//! Copy-on-write view of the machine state during one transition.
//!
//! Handlers read through this overlay so diffs applied earlier in the
//! same transition are observable, while the base state stays
//! untouched until the orchestrator commits the whole batch. Nothing
//! partial is ever visible to other transitions.
use crate::state::{
    ConsensusState, MachineStates, RolloverState, SetOp,
    SigningState, StateDiff,
};
use frostnode_protocol::{GroupId, GroupInfo, MessageId, SignatureId};
use std::collections::BTreeMap;

#[derive(Default)]
struct PendingState {
    active_epoch: Option<u64>,
    staged_epoch: Option<u64>,
    genesis_group_id: Option<GroupId>,
    epoch_groups: BTreeMap<u64, GroupInfo>,
    pending_nonces: BTreeMap<GroupId, bool>,
    message_signatures: BTreeMap<MessageId, Option<SignatureId>>,
    rollover: Option<RolloverState>,
    signing: BTreeMap<MessageId, Option<SigningState>>,
}

/// Overlay over the base state for the in-flight transition.
pub struct TransitionState<'a> {
    consensus: &'a ConsensusState,
    machines: &'a MachineStates,
    pending: PendingState,
    diffs: Vec<StateDiff>,
}

impl<'a> TransitionState<'a> {
    /// Open an overlay over the given base state.
    pub fn new(
        consensus: &'a ConsensusState,
        machines: &'a MachineStates,
    ) -> Self {
        Self {
            consensus,
            machines,
            pending: PendingState::default(),
            diffs: Vec::new(),
        }
    }

    /// Current rollover state.
    pub fn rollover(&self) -> &RolloverState {
        self.pending
            .rollover
            .as_ref()
            .unwrap_or(&self.machines.rollover)
    }

    /// Current signing state of a message.
    pub fn signing(
        &self,
        message: &MessageId,
    ) -> Option<&SigningState> {
        match self.pending.signing.get(message) {
            Some(state) => state.as_ref(),
            None => self.machines.signing.get(message),
        }
    }

    /// Messages with a signing state, as visible through the overlay.
    pub fn signing_messages(&self) -> Vec<MessageId> {
        let mut messages: Vec<MessageId> = self
            .machines
            .signing
            .keys()
            .filter(|message| {
                !matches!(
                    self.pending.signing.get(*message),
                    Some(None)
                )
            })
            .copied()
            .collect();
        for (message, state) in &self.pending.signing {
            if state.is_some() && !messages.contains(message) {
                messages.push(*message);
            }
        }
        messages
    }

    /// Current active epoch.
    pub fn active_epoch(&self) -> u64 {
        self.pending
            .active_epoch
            .unwrap_or(self.consensus.active_epoch)
    }

    /// Current staged epoch.
    pub fn staged_epoch(&self) -> u64 {
        self.pending
            .staged_epoch
            .unwrap_or(self.consensus.staged_epoch)
    }

    /// Recorded genesis group, if any.
    pub fn genesis_group_id(&self) -> Option<GroupId> {
        self.pending
            .genesis_group_id
            .or(self.consensus.genesis_group_id)
    }

    /// Group serving an epoch.
    pub fn epoch_group(&self, epoch: u64) -> Option<GroupInfo> {
        self.pending
            .epoch_groups
            .get(&epoch)
            .copied()
            .or_else(|| {
                self.consensus.epoch_groups.get(&epoch).copied()
            })
    }

    /// Whether a group has an unlinked nonce registration pending.
    pub fn has_pending_nonces(&self, group_id: &GroupId) -> bool {
        match self.pending.pending_nonces.get(group_id) {
            Some(present) => *present,
            None => {
                self.consensus.group_pending_nonces.contains(group_id)
            }
        }
    }

    /// Open signature run admitted for a message.
    pub fn signature_for_message(
        &self,
        message: &MessageId,
    ) -> Option<SignatureId> {
        match self.pending.message_signatures.get(message) {
            Some(signature) => *signature,
            None => {
                self.consensus.message_signatures.get(message).copied()
            }
        }
    }

    /// Stage a diff so later handlers in this transition observe it.
    pub fn apply(&mut self, diff: StateDiff) {
        if diff.is_empty() {
            return;
        }
        if let Some((message, state)) = &diff.signing {
            self.pending.signing.insert(*message, state.clone());
        }
        if let Some(rollover) = &diff.rollover {
            self.pending.rollover = Some(rollover.clone());
        }
        if let Some(consensus) = &diff.consensus {
            if let Some((op, group_id)) = &consensus.pending_nonces {
                self.pending.pending_nonces.insert(
                    *group_id,
                    matches!(op, SetOp::Add),
                );
            }
            if let Some(epoch) = consensus.active_epoch {
                self.pending.active_epoch = Some(epoch);
            }
            if let Some(epoch) = consensus.staged_epoch {
                self.pending.staged_epoch = Some(epoch);
            }
            if let Some(group_id) = consensus.genesis_group_id {
                self.pending.genesis_group_id = Some(group_id);
            }
            if let Some((epoch, info)) = consensus.epoch_group {
                self.pending.epoch_groups.insert(epoch, info);
            }
            if let Some((message, signature)) =
                &consensus.message_signature
            {
                self.pending
                    .message_signatures
                    .insert(*message, *signature);
            }
        }
        self.diffs.push(diff);
    }

    /// Release the staged diffs for atomic commit.
    pub fn into_diffs(self) -> Vec<StateDiff> {
        self.diffs
    }
}
