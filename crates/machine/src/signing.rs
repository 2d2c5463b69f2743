//! Per-message signing lifecycle and its timeout policy.
use crate::config::MachineConfig;
use crate::overlay::TransitionState;
use crate::rollover::log_driver_error;
use crate::state::{
    ConsensusDiff, RolloverState, SetOp, SigningPhase, SigningState,
    StateDiff,
};
use crate::verify::{Verification, VerificationEngine};
use crate::{Error, Result};
use frostnode_driver::{SigningEngine, CHUNK_SIZE};
use frostnode_protocol::{
    meta_transaction_hash, GroupId, MessageId, MetaTransaction,
    NonceCommitments, NonceRoot, Packet, PacketDomain,
    PointBytes, ProtocolAction, SignatureId, TransactionPacket,
};
use tracing::{debug, info, warn};

/// Preprocess a fresh nonce batch once fewer than this many nonces
/// remain ahead of the current sequence.
pub(crate) const NONCE_THRESHOLD: u64 = 100;

fn some_if_nonempty(diff: ConsensusDiff) -> Option<ConsensusDiff> {
    (diff != ConsensusDiff::default()).then_some(diff)
}

/// Admit a proposed transaction: verify its packet and open the
/// signing state waiting for a signature request.
pub(crate) fn handle_transaction_proposed(
    config: &MachineConfig,
    signing: &SigningEngine,
    verifier: &mut VerificationEngine,
    ts: &TransitionState<'_>,
    block: u64,
    epoch: u64,
    transaction: MetaTransaction,
) -> Result<StateDiff> {
    let Some(group) = ts.epoch_group(epoch) else {
        warn!(epoch, "transaction proposed for an unknown epoch");
        return Ok(StateDiff::default());
    };
    let packet = Packet::Transaction(TransactionPacket {
        domain: PacketDomain {
            chain_id: config.chain_id,
            consensus: config.consensus,
        },
        epoch,
        transaction,
    });
    match verifier.verify(&packet)? {
        Verification::Valid { message } => {
            info!(%message, "transaction proposal verified");
            Ok(StateDiff {
                signing: Some((
                    message,
                    Some(SigningState {
                        packet,
                        epoch: ts.active_epoch(),
                        phase: SigningPhase::WaitingForRequest {
                            responsible: None,
                            signers: signing
                                .group_signers(&group.group_id)
                                .unwrap_or_else(|_| {
                                    config.default_signers()
                                }),
                            deadline: block + config.signing_timeout,
                        },
                    }),
                )),
                ..Default::default()
            })
        }
        Verification::Invalid { reason } => {
            warn!(%reason, "transaction proposal rejected");
            Ok(StateDiff::default())
        }
    }
}

/// Keep the active group preprocessed ahead of the sequence: count
/// the nonces left in the linked chunks and derive a fresh batch
/// once the budget drops below [`NONCE_THRESHOLD`].
fn check_available_nonces(
    signing: &mut SigningEngine,
    ts: &TransitionState<'_>,
    sequence: u64,
) -> (Option<GroupId>, Vec<ProtocolAction>) {
    if ts.active_epoch() == 0
        && !matches!(
            ts.rollover(),
            RolloverState::WaitingForRollover
        )
    {
        // Genesis is still being set up.
        return (None, Vec::new());
    }
    let Some(group) = ts.epoch_group(ts.active_epoch()) else {
        return (None, Vec::new());
    };
    if ts.has_pending_nonces(&group.group_id) {
        return (None, Vec::new());
    }
    let mut chunk = sequence / CHUNK_SIZE;
    let mut offset = sequence % CHUNK_SIZE;
    let mut available: u64 = 0;
    loop {
        let in_chunk =
            signing.available_nonces(&group.group_id, chunk);
        if in_chunk == 0 {
            break;
        }
        available += in_chunk.saturating_sub(offset);
        chunk += 1;
        offset = 0;
    }
    if available >= NONCE_THRESHOLD {
        return (None, Vec::new());
    }
    match signing.generate_nonce_tree(&group.group_id) {
        Ok(nonce_root) => {
            info!(
                group = %group.group_id,
                available,
                "preprocessing fresh nonce batch"
            );
            (
                Some(group.group_id),
                vec![ProtocolAction::SignRegisterNonceCommitments {
                    group_id: group.group_id,
                    nonce_root,
                }],
            )
        }
        Err(error) => {
            log_driver_error("nonce preprocessing", &error);
            (None, Vec::new())
        }
    }
}

/// React to a signature request: admit the message once, open the
/// engine session and reveal the local nonce commitments.
#[allow(clippy::too_many_arguments)]
pub(crate) fn handle_sign(
    config: &MachineConfig,
    signing: &mut SigningEngine,
    verifier: &VerificationEngine,
    ts: &TransitionState<'_>,
    block: u64,
    group_id: GroupId,
    signature_id: SignatureId,
    message: MessageId,
    sequence: u64,
) -> StateDiff {
    let (pending, mut actions) =
        check_available_nonces(signing, ts, sequence);
    let mut consensus = ConsensusDiff::default();
    if let Some(pending_group) = pending {
        consensus.pending_nonces =
            Some((SetOp::Add, pending_group));
    }
    let bail = |consensus, actions| StateDiff {
        consensus: some_if_nonempty(consensus),
        actions,
        ..Default::default()
    };

    let status = ts.signing(&message).cloned();
    if let Some(state) = &status {
        if !matches!(
            state.phase,
            SigningPhase::WaitingForRequest { .. }
        ) {
            debug!(%message, "signature already in progress");
            return bail(consensus, actions);
        }
    }
    if !verifier.is_verified(&message) {
        warn!(%message, "signature requested for unverified message");
        return bail(consensus, actions);
    }
    if ts.signature_for_message(&message).is_some() {
        debug!(%message, "message already admitted");
        return bail(consensus, actions);
    }
    let signers = match &status {
        Some(SigningState {
            phase: SigningPhase::WaitingForRequest { signers, .. },
            ..
        }) => signers.clone(),
        _ => signing
            .group_signers(&group_id)
            .unwrap_or_else(|_| config.default_signers()),
    };
    let (packet, epoch) = match status {
        Some(state) => (state.packet, state.epoch),
        None => match verifier.packet(&message) {
            Some(packet) => (packet.clone(), ts.active_epoch()),
            None => {
                warn!(%message, "no packet behind verified message");
                return bail(consensus, actions);
            }
        },
    };

    match signing.handle_signature_request(
        &group_id,
        signature_id,
        message,
        sequence,
        signers,
    ) {
        Ok(reveal) => {
            info!(
                %message,
                signature = %signature_id,
                "revealing nonce commitments"
            );
            actions.push(
                ProtocolAction::SignRevealNonceCommitments {
                    signature_id,
                    commitments: reveal.commitments,
                    proof: reveal.proof,
                },
            );
            consensus.message_signature =
                Some((message, Some(signature_id)));
            StateDiff {
                consensus: some_if_nonempty(consensus),
                signing: Some((
                    message,
                    Some(SigningState {
                        packet,
                        epoch,
                        phase:
                            SigningPhase::CollectNonceCommitments {
                                signature_id,
                                last_signer: None,
                                deadline: block
                                    + config.signing_timeout,
                            },
                    }),
                )),
                actions,
                ..Default::default()
            }
        }
        Err(error) => {
            log_driver_error("signature request", &error);
            bail(consensus, actions)
        }
    }
}

/// Link a registered nonce batch to its chain-assigned chunk.
pub(crate) fn handle_preprocess(
    signing: &mut SigningEngine,
    ts: &TransitionState<'_>,
    group_id: GroupId,
    index: u16,
    nonce_root: NonceRoot,
    chunk: u64,
) -> StateDiff {
    debug!(group = %group_id, chunk, "linking nonce batch");
    let mut consensus = ConsensusDiff::default();
    let local = signing
        .participant_index(&group_id)
        .map(|local| local == index)
        .unwrap_or(false);
    if local && ts.has_pending_nonces(&group_id) {
        consensus.pending_nonces =
            Some((SetOp::Remove, group_id));
    }
    if let Err(error) =
        signing.link_nonce_root(&group_id, index, nonce_root, chunk)
    {
        log_driver_error("nonce batch link", &error);
    }
    StateDiff {
        consensus: some_if_nonempty(consensus),
        ..Default::default()
    }
}

/// Record a revealed nonce pair; publish the local signature share
/// once the signer set is complete.
#[allow(clippy::too_many_arguments)]
pub(crate) fn handle_revealed_nonces(
    config: &MachineConfig,
    signing: &mut SigningEngine,
    ts: &TransitionState<'_>,
    block: u64,
    signature_id: SignatureId,
    index: u16,
    hiding: PointBytes,
    binding: PointBytes,
) -> StateDiff {
    let Ok(message) = signing.message(&signature_id) else {
        debug!(signature = %signature_id, "nonces for unknown request");
        return StateDiff::default();
    };
    let Some(state) = ts.signing(&message).cloned() else {
        debug!(%message, "nonces without signing state");
        return StateDiff::default();
    };
    let SigningPhase::CollectNonceCommitments {
        signature_id: expected,
        ..
    } = state.phase.clone()
    else {
        debug!(%message, "not collecting nonce commitments");
        return StateDiff::default();
    };
    if expected != signature_id {
        debug!(%message, "nonces for a superseded request");
        return StateDiff::default();
    }
    let commitments = NonceCommitments { hiding, binding };
    match signing.handle_nonce_commitments(
        signature_id,
        index,
        &commitments,
    ) {
        Ok(None) => StateDiff {
            signing: Some((
                message,
                Some(SigningState {
                    phase: SigningPhase::CollectNonceCommitments {
                        signature_id,
                        last_signer: Some(index),
                        deadline: state.phase.deadline(),
                    },
                    ..state
                }),
            )),
            ..Default::default()
        },
        Ok(Some(publication)) => {
            info!(
                signature = %signature_id,
                "publishing signature share"
            );
            StateDiff {
                signing: Some((
                    message,
                    Some(SigningState {
                        phase: SigningPhase::CollectSigningShares {
                            signature_id,
                            shares_from: Vec::new(),
                            last_signer: Some(index),
                            deadline: block + config.signing_timeout,
                        },
                        ..state
                    }),
                )),
                actions: vec![
                    ProtocolAction::SignPublishSignatureShare {
                        signature_id,
                        signers_root: publication.signers_root,
                        signers_proof: publication.signers_proof,
                        group_commitment: publication
                            .group_commitment,
                        commitment_share: publication
                            .commitment_share,
                        signature_share: publication
                            .signature_share,
                        lagrange_coefficient: publication
                            .lagrange_coefficient,
                    },
                ],
                ..Default::default()
            }
        }
        Err(error) => {
            log_driver_error("nonce commitment", &error);
            StateDiff::default()
        }
    }
}

/// Track a published signature share.
pub(crate) fn handle_sign_shared(
    signing: &SigningEngine,
    ts: &TransitionState<'_>,
    signature_id: SignatureId,
    index: u16,
) -> StateDiff {
    let Ok(message) = signing.message(&signature_id) else {
        return StateDiff::default();
    };
    let Some(state) = ts.signing(&message).cloned() else {
        return StateDiff::default();
    };
    let SigningPhase::CollectSigningShares {
        signature_id: expected,
        mut shares_from,
        deadline,
        ..
    } = state.phase.clone()
    else {
        return StateDiff::default();
    };
    if expected != signature_id {
        return StateDiff::default();
    }
    shares_from.push(index);
    StateDiff {
        signing: Some((
            message,
            Some(SigningState {
                phase: SigningPhase::CollectSigningShares {
                    signature_id,
                    shares_from,
                    last_signer: Some(index),
                    deadline,
                },
                ..state
            }),
        )),
        ..Default::default()
    }
}

/// The chain aggregated the signature; wait for its attestation.
pub(crate) fn handle_sign_completed(
    config: &MachineConfig,
    signing: &SigningEngine,
    ts: &TransitionState<'_>,
    block: u64,
    signature_id: SignatureId,
) -> StateDiff {
    let Ok(message) = signing.message(&signature_id) else {
        return StateDiff::default();
    };
    let Some(state) = ts.signing(&message).cloned() else {
        return StateDiff::default();
    };
    let SigningPhase::CollectSigningShares {
        signature_id: expected,
        last_signer,
        ..
    } = state.phase.clone()
    else {
        return StateDiff::default();
    };
    if expected != signature_id {
        return StateDiff::default();
    }
    if last_signer.is_none() {
        warn!(signature = %signature_id, "completed without a recorded signer");
    }
    info!(signature = %signature_id, "signature complete");
    StateDiff {
        signing: Some((
            message,
            Some(SigningState {
                phase: SigningPhase::WaitingForAttestation {
                    signature_id,
                    responsible: last_signer,
                    deadline: block + config.signing_timeout,
                },
                ..state
            }),
        )),
        ..Default::default()
    }
}

/// The attestation landed on chain; drop the signing state.
pub(crate) fn handle_transaction_attested(
    ts: &TransitionState<'_>,
    message: MessageId,
) -> StateDiff {
    let Some(state) = ts.signing(&message) else {
        return StateDiff::default();
    };
    if !matches!(
        state.phase,
        SigningPhase::WaitingForAttestation { .. }
    ) {
        return StateDiff::default();
    }
    let mut consensus = ConsensusDiff::default();
    if ts.signature_for_message(&message).is_some() {
        consensus.message_signature = Some((message, None));
    }
    info!(%message, "attestation observed");
    StateDiff {
        consensus: some_if_nonempty(consensus),
        signing: Some((message, None)),
        ..Default::default()
    }
}

/// Apply the timeout policy to one signing state.
///
/// A named responsible participant gets one grace retry with
/// universal responsibility; a state already owned by everyone is
/// dropped after acting. Collection phases shrink the signer set by
/// the non-responders and restart from the request phase.
pub(crate) fn check_signing_timeout(
    config: &MachineConfig,
    signing: &SigningEngine,
    ts: &TransitionState<'_>,
    block: u64,
    message: MessageId,
) -> Result<StateDiff> {
    let Some(state) = ts.signing(&message).cloned() else {
        return Ok(StateDiff::default());
    };
    if state.phase.deadline() > block {
        return Ok(StateDiff::default());
    }
    let mut consensus = ConsensusDiff::default();
    if ts.signature_for_message(&message).is_some() {
        consensus.message_signature = Some((message, None));
    }
    match state.phase.clone() {
        SigningPhase::WaitingForAttestation {
            signature_id,
            responsible,
            ..
        } => {
            let everyone = responsible.is_none();
            let signing_slot = if everyone {
                (message, None)
            } else {
                (
                    message,
                    Some(SigningState {
                        phase:
                            SigningPhase::WaitingForAttestation {
                                signature_id,
                                responsible: None,
                                deadline: block
                                    + config.signing_timeout,
                            },
                        ..state.clone()
                    }),
                )
            };
            let group = ts
                .epoch_group(state.epoch)
                .ok_or(Error::UnknownEpochGroup(state.epoch))?;
            let act = everyone
                || responsible == Some(group.participant_index);
            let mut actions = Vec::new();
            if act {
                if let RolloverState::SignRollover {
                    group_id,
                    next_epoch,
                    message: rollover_message,
                    ..
                } = *ts.rollover()
                {
                    if rollover_message == message {
                        actions.push(
                            ProtocolAction::ConsensusStageEpoch {
                                proposed_epoch: next_epoch,
                                rollover_block: config
                                    .rollover_block(next_epoch),
                                group_id,
                                signature_id,
                            },
                        );
                    }
                }
                if actions.is_empty() {
                    if let Packet::Transaction(packet) =
                        &state.packet
                    {
                        actions.push(
                            ProtocolAction::ConsensusAttestTransaction {
                                epoch: packet.epoch,
                                transaction_hash:
                                    meta_transaction_hash(
                                        &packet.transaction,
                                    ),
                                signature_id,
                            },
                        );
                    }
                }
            }
            warn!(%message, everyone, "attestation timed out");
            Ok(StateDiff {
                consensus: some_if_nonempty(consensus),
                rollover: None,
                signing: Some(signing_slot),
                actions,
            })
        }
        SigningPhase::WaitingForRequest {
            responsible,
            signers,
            ..
        } => {
            let everyone = responsible.is_none();
            let signing_slot = if everyone {
                (message, None)
            } else {
                let reduced: Vec<u16> = signers
                    .iter()
                    .copied()
                    .filter(|signer| Some(*signer) != responsible)
                    .collect();
                (
                    message,
                    Some(SigningState {
                        phase: SigningPhase::WaitingForRequest {
                            responsible: None,
                            signers: reduced,
                            deadline: block
                                + config.signing_timeout,
                        },
                        ..state.clone()
                    }),
                )
            };
            let group = ts
                .epoch_group(state.epoch)
                .ok_or(Error::UnknownEpochGroup(state.epoch))?;
            let act = everyone
                || responsible == Some(group.participant_index);
            let actions = if act {
                vec![ProtocolAction::SignRequest {
                    group_id: group.group_id,
                    message,
                }]
            } else {
                Vec::new()
            };
            warn!(%message, everyone, "signature request timed out");
            Ok(StateDiff {
                consensus: some_if_nonempty(consensus),
                rollover: None,
                signing: Some(signing_slot),
                actions,
            })
        }
        SigningPhase::CollectNonceCommitments {
            signature_id,
            last_signer,
            ..
        }
        | SigningPhase::CollectSigningShares {
            signature_id,
            last_signer,
            ..
        } => {
            let missing: Vec<u16> = match &state.phase {
                SigningPhase::CollectNonceCommitments { .. } => {
                    signing
                        .missing_nonces(&signature_id)
                        .unwrap_or_else(|error| {
                            warn!(%error, "cannot resolve missing signers");
                            Vec::new()
                        })
                }
                SigningPhase::CollectSigningShares {
                    shares_from,
                    ..
                } => signing
                    .signers(&signature_id)
                    .map(|all| {
                        all.into_iter()
                            .filter(|signer| {
                                !shares_from.contains(signer)
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
                _ => Vec::new(),
            };
            let group = ts
                .epoch_group(state.epoch)
                .ok_or(Error::UnknownEpochGroup(state.epoch))?;
            let signers: Vec<u16> = signing
                .group_signers(&group.group_id)
                .unwrap_or_else(|_| config.default_signers())
                .into_iter()
                .filter(|signer| !missing.contains(signer))
                .collect();
            warn!(
                %message,
                missing = missing.len(),
                "signing round timed out, restarting request"
            );
            Ok(StateDiff {
                consensus: some_if_nonempty(consensus),
                rollover: None,
                signing: Some((
                    message,
                    Some(SigningState {
                        phase: SigningPhase::WaitingForRequest {
                            responsible: last_signer,
                            signers,
                            deadline: block
                                + config.signing_timeout,
                        },
                        ..state.clone()
                    }),
                )),
                actions: vec![ProtocolAction::SignRequest {
                    group_id: group.group_id,
                    message,
                }],
            })
        }
    }
}
