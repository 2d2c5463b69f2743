//! Rollover lifecycle: genesis and epoch-boundary key generation,
//! abort and timeout policy.
use crate::config::MachineConfig;
use crate::overlay::TransitionState;
use crate::state::{
    ConsensusDiff, RolloverState, SetOp, SigningPhase, SigningState,
    StateDiff,
};
use crate::verify::{Verification, VerificationEngine};
use crate::{Error, Result};
use frostnode_driver::{
    ErrorClass, KeyGenEngine, SigningEngine,
};
use frostnode_protocol::{
    group_id as derive_group_id, keccak, merkle, EpochRolloverPacket,
    GroupId, Hash32, Packet, PacketDomain, Parameters, Participant,
    PointBytes, ProofOfKnowledge, ProtocolAction, ScalarBytes,
};
use rand::rngs::OsRng;
use tracing::{debug, error, info, warn};

/// Deadline value of rounds that never time out (genesis).
pub const NO_DEADLINE: u64 = u64::MAX;

const EPOCH_CONTEXT_TAG: &[u8] = b"frostnode/epoch-context/v1";

/// Context value binding a group id to the epoch it is generated
/// for.
pub fn epoch_context(epoch: u64) -> Hash32 {
    Hash32::from(keccak(&[
        EPOCH_CONTEXT_TAG,
        &epoch.to_be_bytes(),
    ]))
}

/// Log a driver error with the severity its class calls for.
pub(crate) fn log_driver_error(
    context: &'static str,
    error: &frostnode_driver::Error,
) {
    match error.class() {
        ErrorClass::VerificationFailure => {
            warn!(%error, context, "contribution rejected");
        }
        ErrorClass::LivenessGap => {
            warn!(%error, context, "preprocessing gap");
        }
        ErrorClass::ProtocolViolation => {
            error!(%error, context, "protocol violation");
        }
    }
}

fn reindexed(
    participants: &[Participant],
    excluded: &[frostnode_protocol::Address],
) -> Vec<Participant> {
    participants
        .iter()
        .filter(|p| !excluded.contains(&p.address))
        .enumerate()
        .map(|(position, p)| Participant {
            index: position as u16 + 1,
            address: p.address,
        })
        .collect()
}

/// Open a key generation session and produce the diff announcing it.
fn trigger_key_gen(
    keygen: &mut KeyGenEngine,
    epoch: u64,
    deadline: u64,
    roster: Vec<Participant>,
    context: Hash32,
) -> Result<(GroupId, StateDiff)> {
    if roster.len() < 2 {
        return Err(Error::NotEnoughParticipants(roster.len()));
    }
    let parameters = Parameters::for_roster(roster.len() as u16);
    let participants_root = merkle::participants_root(&roster);
    let group_id = derive_group_id(
        &participants_root,
        parameters.count,
        parameters.threshold,
        &context,
    );
    let publication = keygen.init(
        group_id,
        participants_root,
        parameters.count,
        parameters.threshold,
        roster,
        &mut OsRng,
    )?;
    info!(group = %group_id, epoch, "triggered key generation");
    let diff = StateDiff {
        consensus: Some(ConsensusDiff {
            epoch_group: Some((
                epoch,
                frostnode_protocol::GroupInfo {
                    group_id,
                    participant_index: publication.participant_index,
                },
            )),
            ..Default::default()
        }),
        rollover: Some(RolloverState::CollectingCommitments {
            group_id,
            next_epoch: epoch,
            deadline,
        }),
        signing: None,
        actions: vec![ProtocolAction::KeyGenStart {
            group_id,
            participants_root,
            count: parameters.count,
            threshold: parameters.threshold,
            context,
            participant_index: publication.participant_index,
            commitments: publication.commitments,
            pok: publication.pok,
            poap: publication.poap,
        }],
    };
    Ok((group_id, diff))
}

/// React to a `KeyGenInit` event: join the genesis run, or a
/// boundary run another validator registered first.
#[allow(clippy::too_many_arguments)]
pub(crate) fn handle_key_gen_init(
    config: &MachineConfig,
    keygen: &mut KeyGenEngine,
    ts: &TransitionState<'_>,
    block: u64,
    group_id: GroupId,
    _participants_root: Hash32,
    _count: u16,
    _threshold: u16,
    _context: Hash32,
) -> Result<StateDiff> {
    if !matches!(ts.rollover(), RolloverState::WaitingForRollover) {
        debug!(group = %group_id, "key generation already in progress");
        return Ok(StateDiff::default());
    }

    // Genesis: no epochs yet and the announced group matches the
    // derivation from the default roster.
    if ts.active_epoch() == 0
        && ts.staged_epoch() == 0
        && ts.genesis_group_id().is_none()
        && group_id == config.genesis_group_id()
    {
        info!(group = %group_id, "joining genesis key generation");
        let (group_id, mut diff) = trigger_key_gen(
            keygen,
            0,
            NO_DEADLINE,
            config.participants.clone(),
            config.genesis_context,
        )?;
        diff.consensus
            .get_or_insert_with(ConsensusDiff::default)
            .genesis_group_id = Some(group_id);
        return Ok(diff);
    }

    // Boundary run registered by a peer before the local tick fired.
    if ts.genesis_group_id().is_some()
        && ts.staged_epoch() == ts.active_epoch()
    {
        let next_epoch = config.epoch_at(block) + 1;
        let context = epoch_context(next_epoch);
        let parameters = config.genesis_parameters();
        let expected = derive_group_id(
            &merkle::participants_root(&config.participants),
            parameters.count,
            parameters.threshold,
            &context,
        );
        if group_id == expected {
            info!(group = %group_id, next_epoch, "joining boundary key generation");
            let deadline = (block + config.key_gen_timeout)
                .min(config.rollover_block(next_epoch));
            let (_, diff) = trigger_key_gen(
                keygen,
                next_epoch,
                deadline,
                config.participants.clone(),
                context,
            )?;
            return Ok(diff);
        }
    }
    debug!(group = %group_id, "ignoring unrelated key generation");
    Ok(StateDiff::default())
}

/// Record a peer's commitments; advance to the share round once the
/// commitment round completes.
pub(crate) fn handle_key_gen_committed(
    config: &MachineConfig,
    keygen: &mut KeyGenEngine,
    ts: &TransitionState<'_>,
    block: u64,
    group_id: GroupId,
    index: u16,
    commitments: &[PointBytes],
    pok: &ProofOfKnowledge,
) -> StateDiff {
    let RolloverState::CollectingCommitments {
        group_id: expected,
        next_epoch,
        deadline,
    } = *ts.rollover()
    else {
        debug!(group = %group_id, "not collecting commitments");
        return StateDiff::default();
    };
    if expected != group_id {
        debug!(group = %group_id, "commitment for unexpected group");
        return StateDiff::default();
    }
    match keygen.handle_commitments(group_id, index, commitments, pok)
    {
        Ok(None) => StateDiff::default(),
        Ok(Some(publication)) => {
            let share_deadline = if deadline == NO_DEADLINE {
                NO_DEADLINE
            } else {
                block + config.key_gen_timeout
            };
            StateDiff {
                rollover: Some(RolloverState::CollectingShares {
                    group_id,
                    next_epoch,
                    deadline: share_deadline,
                    last_participant: None,
                }),
                actions: vec![
                    ProtocolAction::KeyGenPublishSecretShares {
                        group_id,
                        participant_index: publication
                            .participant_index,
                        verification_share: publication
                            .verification_share,
                        encrypted_shares: publication
                            .encrypted_shares,
                    },
                ],
                ..Default::default()
            }
        }
        Err(error) => {
            log_driver_error("key generation commitment", &error);
            StateDiff::default()
        }
    }
}

/// Record a peer's secret shares; when the chain marks the round
/// closed, complete the session and either finish genesis or move
/// the rollover to its signing phase.
///
/// Completion is keyed off the event's `completed` flag rather than
/// the local session state, so every validator agrees on the last
/// contributor (the engine finishes early on nodes whose own
/// submission echoes back after their peers').
#[allow(clippy::too_many_arguments)]
pub(crate) fn handle_key_gen_secret_shared(
    config: &MachineConfig,
    keygen: &mut KeyGenEngine,
    signing: &mut SigningEngine,
    verifier: &mut VerificationEngine,
    ts: &TransitionState<'_>,
    block: u64,
    group_id: GroupId,
    index: u16,
    encrypted_shares: &[ScalarBytes],
    completed: bool,
) -> Result<StateDiff> {
    let RolloverState::CollectingShares {
        group_id: expected,
        next_epoch,
        deadline,
        ..
    } = *ts.rollover()
    else {
        debug!(group = %group_id, "not collecting secret shares");
        return Ok(StateDiff::default());
    };
    if expected != group_id {
        debug!(group = %group_id, "shares for unexpected group");
        return Ok(StateDiff::default());
    }
    if let Err(error) = keygen.handle_secret_shares(
        group_id,
        index,
        encrypted_shares,
    ) {
        log_driver_error("key generation share", &error);
        return Ok(StateDiff::default());
    }
    let collecting = StateDiff {
        rollover: Some(RolloverState::CollectingShares {
            group_id,
            next_epoch,
            deadline,
            last_participant: Some(index),
        }),
        ..Default::default()
    };
    if !completed {
        return Ok(collecting);
    }
    if !keygen.is_complete(&group_id) {
        // The chain saw every submission but at least one share did
        // not verify locally; stay in the round and let the timeout
        // policy deal with the faulty contributor.
        warn!(group = %group_id, "round closed with rejected shares");
        return Ok(collecting);
    }

    // The group is ready; hand the key material over and preprocess
    // the first nonce batch.
    let group_key = keygen.group_public_key(&group_id)?;
    let material = keygen.export_key_material(&group_id)?;
    let local_index = material.local_index;
    let mut group_signers: Vec<u16> =
        material.participants.iter().map(|p| p.index).collect();
    group_signers.sort_unstable();
    if let Err(error) = signing.install_key_material(material) {
        log_driver_error("key material handoff", &error);
    }
    let nonce_root = signing.generate_nonce_tree(&group_id)?;
    let mut actions =
        vec![ProtocolAction::SignRegisterNonceCommitments {
            group_id,
            nonce_root,
        }];
    let consensus = ConsensusDiff {
        pending_nonces: Some((SetOp::Add, group_id)),
        ..Default::default()
    };

    if ts.genesis_group_id() == Some(group_id) {
        info!(group = %group_id, "genesis group ready");
        return Ok(StateDiff {
            consensus: Some(consensus),
            rollover: Some(RolloverState::WaitingForRollover),
            signing: None,
            actions,
        });
    }

    // The new key must itself be attested: verify the rollover
    // packet and hand the message to the signing lifecycle.
    let packet = Packet::EpochRollover(EpochRolloverPacket {
        domain: PacketDomain {
            chain_id: config.chain_id,
            consensus: config.consensus,
        },
        active_epoch: ts.active_epoch(),
        proposed_epoch: next_epoch,
        rollover_block: config.rollover_block(next_epoch),
        group_key,
    });
    let message = match verifier.verify(&packet)? {
        Verification::Valid { message } => message,
        Verification::Invalid { reason } => {
            error!(%reason, "own rollover packet rejected");
            return Ok(StateDiff {
                consensus: Some(consensus),
                rollover: Some(RolloverState::WaitingForRollover),
                signing: None,
                actions,
            });
        }
    };
    let responsible = index;
    if local_index == responsible {
        actions.push(ProtocolAction::SignRequest {
            group_id,
            message,
        });
    }
    info!(group = %group_id, %message, responsible, "rollover awaiting attestation");
    Ok(StateDiff {
        consensus: Some(consensus),
        rollover: Some(RolloverState::SignRollover {
            group_id,
            next_epoch,
            message,
            responsible,
        }),
        signing: Some((
            message,
            Some(SigningState {
                packet,
                epoch: next_epoch,
                phase: SigningPhase::WaitingForRequest {
                    responsible: Some(responsible),
                    signers: group_signers,
                    deadline: block + config.signing_timeout,
                },
            }),
        )),
        actions,
    })
}

/// React to an on-chain abort of a key generation.
pub(crate) fn handle_key_gen_aborted(
    keygen: &mut KeyGenEngine,
    ts: &TransitionState<'_>,
    group_id: GroupId,
) -> StateDiff {
    keygen.abort(&group_id);
    let relevant = match ts.rollover() {
        RolloverState::CollectingCommitments {
            group_id: current,
            ..
        }
        | RolloverState::CollectingShares {
            group_id: current, ..
        }
        | RolloverState::SignRollover {
            group_id: current, ..
        } => *current == group_id,
        RolloverState::WaitingForRollover => false,
    };
    if relevant {
        warn!(group = %group_id, "key generation aborted on chain");
        StateDiff {
            rollover: Some(RolloverState::WaitingForRollover),
            ..Default::default()
        }
    } else {
        StateDiff::default()
    }
}

/// Abandon a rollover whose epoch boundary has passed. The genesis
/// group is exempt.
pub(crate) fn check_rollover_abort(
    config: &MachineConfig,
    keygen: &mut KeyGenEngine,
    ts: &TransitionState<'_>,
    block: u64,
) -> StateDiff {
    let (group_id, next_epoch) = match ts.rollover() {
        RolloverState::CollectingCommitments {
            group_id,
            next_epoch,
            ..
        }
        | RolloverState::CollectingShares {
            group_id,
            next_epoch,
            ..
        } => (*group_id, *next_epoch),
        _ => return StateDiff::default(),
    };
    if ts.genesis_group_id() == Some(group_id) {
        return StateDiff::default();
    }
    if config.epoch_at(block) < next_epoch {
        return StateDiff::default();
    }
    warn!(
        group = %group_id,
        next_epoch,
        "abandoning rollover past its epoch boundary"
    );
    keygen.abort(&group_id);
    StateDiff {
        rollover: Some(RolloverState::WaitingForRollover),
        ..Default::default()
    }
}

/// Restart a timed-out key generation round without the participants
/// that failed to contribute.
pub(crate) fn check_key_gen_timeout(
    config: &MachineConfig,
    keygen: &mut KeyGenEngine,
    ts: &TransitionState<'_>,
    block: u64,
) -> Result<StateDiff> {
    let (group_id, next_epoch, missing) = match ts.rollover() {
        RolloverState::CollectingCommitments {
            group_id,
            next_epoch,
            deadline,
        } if *deadline <= block => (
            *group_id,
            *next_epoch,
            keygen.missing_commitments(group_id),
        ),
        RolloverState::CollectingShares {
            group_id,
            next_epoch,
            deadline,
            ..
        } if *deadline <= block => (
            *group_id,
            *next_epoch,
            keygen.missing_shares(group_id),
        ),
        _ => return Ok(StateDiff::default()),
    };
    let abandoned = StateDiff {
        rollover: Some(RolloverState::WaitingForRollover),
        ..Default::default()
    };
    let missing = match missing {
        Ok(missing) => missing,
        Err(error) => {
            error!(%error, group = %group_id, "timed-out session is gone");
            return Ok(abandoned);
        }
    };
    warn!(
        group = %group_id,
        missing = missing.len(),
        "key generation round timed out"
    );
    keygen.abort(&group_id);
    let roster = reindexed(&config.participants, &missing);
    if roster.len() < 2 {
        warn!(group = %group_id, "not enough responsive participants left");
        return Ok(abandoned);
    }
    let deadline = (block + config.key_gen_timeout)
        .min(config.rollover_block(next_epoch));
    let (_, diff) = trigger_key_gen(
        keygen,
        next_epoch,
        deadline,
        roster,
        epoch_context(next_epoch),
    )?;
    Ok(diff)
}

/// Start the next epoch's key generation once the previous rollover
/// has fully settled.
pub(crate) fn check_epoch_rollover(
    config: &MachineConfig,
    keygen: &mut KeyGenEngine,
    ts: &TransitionState<'_>,
    block: u64,
) -> Result<StateDiff> {
    if !matches!(ts.rollover(), RolloverState::WaitingForRollover) {
        return Ok(StateDiff::default());
    }
    if ts.genesis_group_id().is_none() {
        return Ok(StateDiff::default());
    }
    if ts.staged_epoch() != ts.active_epoch() {
        return Ok(StateDiff::default());
    }
    let next_epoch = config.epoch_at(block) + 1;
    if ts.epoch_group(next_epoch).is_some() {
        return Ok(StateDiff::default());
    }
    let deadline = (block + config.key_gen_timeout)
        .min(config.rollover_block(next_epoch));
    let (_, diff) = trigger_key_gen(
        keygen,
        next_epoch,
        deadline,
        config.participants.clone(),
        epoch_context(next_epoch),
    )?;
    Ok(diff)
}

/// Activate a staged epoch once its rollover block is reached.
pub(crate) fn check_epoch_activation(
    config: &MachineConfig,
    ts: &TransitionState<'_>,
    block: u64,
) -> StateDiff {
    let staged = ts.staged_epoch();
    if staged <= ts.active_epoch()
        || block < config.rollover_block(staged)
    {
        return StateDiff::default();
    }
    info!(epoch = staged, "activating staged epoch");
    StateDiff {
        consensus: Some(ConsensusDiff {
            active_epoch: Some(staged),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// React to a staged epoch: the rollover is attested, clean up its
/// signing state.
pub(crate) fn handle_epoch_staged(
    ts: &TransitionState<'_>,
    proposed_epoch: u64,
    group_id: GroupId,
) -> StateDiff {
    let RolloverState::SignRollover {
        group_id: expected,
        message,
        ..
    } = *ts.rollover()
    else {
        debug!("epoch staged outside a rollover");
        return StateDiff::default();
    };
    if expected != group_id {
        debug!(group = %group_id, "staged epoch for unexpected group");
        return StateDiff::default();
    }
    let mut consensus = ConsensusDiff {
        staged_epoch: Some(proposed_epoch),
        ..Default::default()
    };
    if ts.signature_for_message(&message).is_some() {
        consensus.message_signature = Some((message, None));
    }
    info!(epoch = proposed_epoch, group = %group_id, "epoch staged");
    StateDiff {
        consensus: Some(consensus),
        rollover: Some(RolloverState::WaitingForRollover),
        signing: Some((message, None)),
        ..Default::default()
    }
}
