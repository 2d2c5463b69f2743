//! Distributed key generation engine.
//!
//! One session per group id walks
//! `awaiting_commitments → awaiting_shares → complete`; aborting
//! discards the session. The engine is pure protocol logic: callers
//! feed it ordered contributions and publish whatever it returns.
use crate::math::{
    commit_polynomial, create_proof_of_knowledge, decode_point,
    decode_scalar, encode_point, encode_scalar, eval_commitments,
    eval_polynomial, index_scalar, mask_share, random_polynomial,
    share_mask, unmask_share, verify_proof_of_knowledge,
};
use crate::{Error, Result};
use frostnode_protocol::{
    merkle, Address, GroupId, Hash32, Participant, PointBytes,
    ProofOfKnowledge, ScalarBytes,
};
use k256::elliptic_curve::Field;
use k256::{ProjectivePoint, Scalar};
use rand::{CryptoRng, RngCore};
use std::collections::BTreeMap;
use tracing::debug;

/// Values published when a key generation session is opened.
#[derive(Debug, Clone)]
pub struct KeyGenPublication {
    /// Group being generated.
    pub group_id: GroupId,
    /// Merkle root of the roster.
    pub participants_root: Hash32,
    /// Index of the local participant.
    pub participant_index: u16,
    /// Feldman commitment vector.
    pub commitments: Vec<PointBytes>,
    /// Proof of knowledge of the constant term.
    pub pok: ProofOfKnowledge,
    /// Merkle proof of roster membership.
    pub poap: Vec<Hash32>,
}

/// Values published once every commitment has been observed.
#[derive(Debug, Clone)]
pub struct SecretSharePublication {
    /// Group being generated.
    pub group_id: GroupId,
    /// Index of the local participant.
    pub participant_index: u16,
    /// Public verification share of the local participant.
    pub verification_share: PointBytes,
    /// Masked shares ordered by receiver index, local slot skipped.
    pub encrypted_shares: Vec<ScalarBytes>,
}

/// Result of a completed key generation session.
#[derive(Debug, Clone)]
pub struct KeyGenOutcome {
    /// Completed group.
    pub group_id: GroupId,
    /// Public key of the group.
    pub group_key: PointBytes,
}

/// Completed key material handed over to the signing engine.
///
/// The signing share is secret and never leaves the process.
#[derive(Clone)]
pub struct KeyMaterial {
    /// Group the material belongs to.
    pub group_id: GroupId,
    /// Index of the local participant.
    pub local_index: u16,
    /// Group roster.
    pub participants: Vec<Participant>,
    /// Signing threshold.
    pub threshold: u16,
    /// Secret signing share.
    pub signing_share: Scalar,
    /// Public image of the signing share.
    pub verification_share: ProjectivePoint,
    /// Public key of the group.
    pub group_key: ProjectivePoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    AwaitingCommitments,
    AwaitingShares,
    Complete,
}

struct KeyGenSession {
    participants: Vec<Participant>,
    count: u16,
    threshold: u16,
    local_index: u16,
    // Secret polynomial; never leaves the session.
    coefficients: Vec<Scalar>,
    commitments: BTreeMap<u16, Vec<ProjectivePoint>>,
    secret_shares: BTreeMap<u16, Scalar>,
    phase: SessionPhase,
    verification_share: Option<ProjectivePoint>,
    signing_share: Option<Scalar>,
    group_key: Option<ProjectivePoint>,
}

impl KeyGenSession {
    fn participant(&self, index: u16) -> Option<&Participant> {
        self.participants.iter().find(|p| p.index == index)
    }

    /// Roster indices in canonical order with `skipped` removed; the
    /// slot arithmetic both sides of the share exchange agree on.
    fn peer_indices(&self, skipped: u16) -> Vec<u16> {
        let mut indices: Vec<u16> =
            self.participants.iter().map(|p| p.index).collect();
        indices.sort_unstable();
        indices.retain(|i| *i != skipped);
        indices
    }
}

/// Engine owning one key generation session per group id.
pub struct KeyGenEngine {
    local_address: Address,
    sessions: BTreeMap<GroupId, KeyGenSession>,
}

impl KeyGenEngine {
    /// Create an engine for the validator with the given address.
    pub fn new(local_address: Address) -> Self {
        Self {
            local_address,
            sessions: BTreeMap::new(),
        }
    }

    /// Open a session for a group and produce the local commitment
    /// publication.
    pub fn init<R: RngCore + CryptoRng>(
        &mut self,
        group_id: GroupId,
        participants_root: Hash32,
        count: u16,
        threshold: u16,
        roster: Vec<Participant>,
        rng: &mut R,
    ) -> Result<KeyGenPublication> {
        if self.sessions.contains_key(&group_id) {
            return Err(Error::DuplicateGroup(group_id));
        }
        let computed_root = merkle::participants_root(&roster);
        if computed_root != participants_root {
            return Err(Error::ParticipantsRootMismatch(group_id));
        }
        if roster.len() != count as usize {
            return Err(Error::CountMismatch {
                expected: roster.len() as u16,
                actual: count,
            });
        }
        let local = roster
            .iter()
            .find(|p| p.address == self.local_address)
            .copied()
            .ok_or(Error::ParticipantNotFound(self.local_address))?;

        let coefficients = random_polynomial(threshold, rng);
        let commitments = commit_polynomial(&coefficients);
        let pok = create_proof_of_knowledge(
            &group_id,
            local.index,
            &coefficients[0],
            rng,
        );
        let poap = merkle::membership_proof(&roster, local.index)
            .ok_or(Error::ParticipantNotFound(self.local_address))?;

        let own_share = eval_polynomial(
            &coefficients,
            &index_scalar(local.index),
        );
        let mut session = KeyGenSession {
            participants: roster,
            count,
            threshold,
            local_index: local.index,
            coefficients,
            commitments: BTreeMap::new(),
            secret_shares: BTreeMap::new(),
            phase: SessionPhase::AwaitingCommitments,
            verification_share: None,
            signing_share: None,
            group_key: None,
        };
        session
            .commitments
            .insert(local.index, commitments.clone());
        session.secret_shares.insert(local.index, own_share);

        debug!(group = %group_id, index = local.index, "opened key generation session");
        let publication = KeyGenPublication {
            group_id,
            participants_root,
            participant_index: local.index,
            commitments: commitments.iter().map(encode_point).collect(),
            pok,
            poap,
        };
        self.sessions.insert(group_id, session);
        Ok(publication)
    }

    /// Record a peer's commitment vector.
    ///
    /// Returns the secret share publication once commitments from
    /// every participant are present. Self-originated echoes are
    /// ignored.
    pub fn handle_commitments(
        &mut self,
        group_id: GroupId,
        index: u16,
        commitments: &[PointBytes],
        pok: &ProofOfKnowledge,
    ) -> Result<Option<SecretSharePublication>> {
        let session = self
            .sessions
            .get_mut(&group_id)
            .ok_or(Error::UnknownGroup(group_id))?;
        if index == session.local_index {
            return Ok(None);
        }
        if session.participant(index).is_none() {
            return Err(Error::UnknownParticipant(index));
        }
        if session.phase != SessionPhase::AwaitingCommitments {
            return Err(Error::NotAwaitingCommitments(group_id));
        }
        if session.commitments.contains_key(&index) {
            return Err(Error::DuplicateCommitments(index));
        }
        if commitments.len() != session.threshold as usize {
            return Err(Error::CommitmentVectorLength {
                expected: session.threshold,
                actual: commitments.len() as u16,
            });
        }
        let decoded: Vec<ProjectivePoint> = commitments
            .iter()
            .map(decode_point)
            .collect::<Result<_>>()
            .map_err(|_| Error::InvalidProofOfKnowledge(index))?;
        verify_proof_of_knowledge(
            &group_id, index, &decoded[0], pok,
        )?;
        session.commitments.insert(index, decoded);
        debug!(
            group = %group_id,
            index,
            received = session.commitments.len(),
            expected = session.count,
            "recorded peer commitments"
        );

        if session.commitments.len() < session.count as usize {
            return Ok(None);
        }
        Ok(Some(Self::publish_secret_shares(group_id, session)))
    }

    fn publish_secret_shares(
        group_id: GroupId,
        session: &mut KeyGenSession,
    ) -> SecretSharePublication {
        let local_x = index_scalar(session.local_index);
        let mut verification_share = ProjectivePoint::IDENTITY;
        for commitments in session.commitments.values() {
            verification_share +=
                eval_commitments(commitments, &local_x);
        }
        session.verification_share = Some(verification_share);

        let mut encrypted_shares = Vec::new();
        for peer in session.peer_indices(session.local_index) {
            let share = eval_polynomial(
                &session.coefficients,
                &index_scalar(peer),
            );
            // Commitments for every peer exist here: the round only
            // completes once all of them were recorded.
            let peer_first = session.commitments[&peer][0];
            let shared = peer_first * session.coefficients[0];
            let mask = share_mask(
                &shared,
                &group_id,
                session.local_index,
                peer,
            );
            encrypted_shares.push(encode_scalar(&mask_share(
                &share, &mask,
            )));
        }
        session.phase = SessionPhase::AwaitingShares;
        SecretSharePublication {
            group_id,
            participant_index: session.local_index,
            verification_share: encode_point(&verification_share),
            encrypted_shares,
        }
    }

    /// Record a peer's masked share vector, decrypt and verify the
    /// slot addressed to the local participant.
    ///
    /// Returns the session outcome once verified shares from every
    /// participant are present. Self-originated echoes are ignored.
    pub fn handle_secret_shares(
        &mut self,
        group_id: GroupId,
        index: u16,
        encrypted_shares: &[ScalarBytes],
    ) -> Result<Option<KeyGenOutcome>> {
        let session = self
            .sessions
            .get_mut(&group_id)
            .ok_or(Error::UnknownGroup(group_id))?;
        if index == session.local_index {
            return Ok(None);
        }
        if session.participant(index).is_none() {
            return Err(Error::UnknownParticipant(index));
        }
        if session.phase != SessionPhase::AwaitingShares {
            return Err(Error::NotAwaitingShares(group_id));
        }
        if session.secret_shares.contains_key(&index) {
            return Err(Error::DuplicateSecretShares(index));
        }
        let expected = session.count as usize - 1;
        if encrypted_shares.len() != expected {
            return Err(Error::ShareVectorLength {
                expected,
                actual: encrypted_shares.len(),
            });
        }
        let slot = session
            .peer_indices(index)
            .iter()
            .position(|i| *i == session.local_index)
            .ok_or(Error::UnknownParticipant(index))?;
        let sender_commitments = session
            .commitments
            .get(&index)
            .ok_or(Error::InvalidSecretShare(index))?;

        let shared = sender_commitments[0] * session.coefficients[0];
        let mask = share_mask(
            &shared,
            &group_id,
            index,
            session.local_index,
        );
        let masked = decode_scalar(&encrypted_shares[slot])
            .map_err(|_| Error::InvalidSecretShare(index))?;
        let share = unmask_share(&masked, &mask);

        let local_x = index_scalar(session.local_index);
        let expected_image =
            eval_commitments(sender_commitments, &local_x);
        if ProjectivePoint::GENERATOR * share != expected_image {
            return Err(Error::InvalidSecretShare(index));
        }
        session.secret_shares.insert(index, share);
        debug!(
            group = %group_id,
            index,
            received = session.secret_shares.len(),
            expected = session.count,
            "recorded peer secret share"
        );

        if session.secret_shares.len() < session.count as usize {
            return Ok(None);
        }

        let mut signing_share = Scalar::ZERO;
        for share in session.secret_shares.values() {
            signing_share += share;
        }
        let verification_share = session
            .verification_share
            .ok_or(Error::NotAwaitingShares(group_id))?;
        if ProjectivePoint::GENERATOR * signing_share
            != verification_share
        {
            return Err(Error::InvalidSigningShare);
        }
        let mut group_key = ProjectivePoint::IDENTITY;
        for commitments in session.commitments.values() {
            group_key += commitments[0];
        }
        session.signing_share = Some(signing_share);
        session.group_key = Some(group_key);
        session.phase = SessionPhase::Complete;
        debug!(group = %group_id, "key generation complete");
        Ok(Some(KeyGenOutcome {
            group_id,
            group_key: encode_point(&group_key),
        }))
    }

    /// Discard the session for a group. A no-op for unknown groups.
    pub fn abort(&mut self, group_id: &GroupId) {
        if self.sessions.remove(group_id).is_some() {
            debug!(group = %group_id, "aborted key generation session");
        }
    }

    /// Index of the local participant within a group.
    pub fn participant_index(&self, group_id: &GroupId) -> Result<u16> {
        self.sessions
            .get(group_id)
            .map(|s| s.local_index)
            .ok_or(Error::UnknownGroup(*group_id))
    }

    /// Public key of a completed group.
    pub fn group_public_key(
        &self,
        group_id: &GroupId,
    ) -> Result<PointBytes> {
        let session = self
            .sessions
            .get(group_id)
            .ok_or(Error::UnknownGroup(*group_id))?;
        session
            .group_key
            .as_ref()
            .map(encode_point)
            .ok_or(Error::KeyGenIncomplete(*group_id))
    }

    /// Whether the session for a group has completed.
    pub fn is_complete(&self, group_id: &GroupId) -> bool {
        self.sessions
            .get(group_id)
            .map(|s| s.phase == SessionPhase::Complete)
            .unwrap_or(false)
    }

    /// Addresses of participants whose commitments are missing.
    pub fn missing_commitments(
        &self,
        group_id: &GroupId,
    ) -> Result<Vec<Address>> {
        let session = self
            .sessions
            .get(group_id)
            .ok_or(Error::UnknownGroup(*group_id))?;
        Ok(session
            .participants
            .iter()
            .filter(|p| !session.commitments.contains_key(&p.index))
            .map(|p| p.address)
            .collect())
    }

    /// Addresses of participants whose secret shares are missing.
    pub fn missing_shares(
        &self,
        group_id: &GroupId,
    ) -> Result<Vec<Address>> {
        let session = self
            .sessions
            .get(group_id)
            .ok_or(Error::UnknownGroup(*group_id))?;
        Ok(session
            .participants
            .iter()
            .filter(|p| !session.secret_shares.contains_key(&p.index))
            .map(|p| p.address)
            .collect())
    }

    /// Hand the completed key material to the signing side.
    pub fn export_key_material(
        &self,
        group_id: &GroupId,
    ) -> Result<KeyMaterial> {
        let session = self
            .sessions
            .get(group_id)
            .ok_or(Error::UnknownGroup(*group_id))?;
        match (
            session.signing_share,
            session.verification_share,
            session.group_key,
        ) {
            (
                Some(signing_share),
                Some(verification_share),
                Some(group_key),
            ) => Ok(KeyMaterial {
                group_id: *group_id,
                local_index: session.local_index,
                participants: session.participants.clone(),
                threshold: session.threshold,
                signing_share,
                verification_share,
                group_key,
            }),
            _ => Err(Error::KeyGenIncomplete(*group_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::lagrange_coefficient;
    use frostnode_protocol::group_id;
    use rand::rngs::OsRng;

    fn roster(size: u16) -> Vec<Participant> {
        (1..=size)
            .map(|i| Participant {
                index: i,
                address: Address::from([i as u8; 20]),
            })
            .collect()
    }

    /// Drive a complete session across `size` engines and return
    /// them together with the group id.
    fn run_dkg(
        size: u16,
        threshold: u16,
    ) -> (Vec<KeyGenEngine>, GroupId) {
        let roster = roster(size);
        let root = merkle::participants_root(&roster);
        let gid = group_id(
            &root,
            size,
            threshold,
            &Hash32::default(),
        );
        let mut engines: Vec<KeyGenEngine> = roster
            .iter()
            .map(|p| KeyGenEngine::new(p.address))
            .collect();
        let publications: Vec<KeyGenPublication> = engines
            .iter_mut()
            .map(|engine| {
                engine
                    .init(
                        gid,
                        root,
                        size,
                        threshold,
                        roster.clone(),
                        &mut OsRng,
                    )
                    .unwrap()
            })
            .collect();

        let mut share_publications = Vec::new();
        for publication in &publications {
            for engine in engines.iter_mut() {
                if let Some(shares) = engine
                    .handle_commitments(
                        gid,
                        publication.participant_index,
                        &publication.commitments,
                        &publication.pok,
                    )
                    .unwrap()
                {
                    share_publications.push(shares);
                }
            }
        }
        assert_eq!(share_publications.len(), size as usize);

        let mut outcomes = Vec::new();
        for shares in &share_publications {
            for engine in engines.iter_mut() {
                if let Some(outcome) = engine
                    .handle_secret_shares(
                        gid,
                        shares.participant_index,
                        &shares.encrypted_shares,
                    )
                    .unwrap()
                {
                    outcomes.push(outcome);
                }
            }
        }
        assert_eq!(outcomes.len(), size as usize);
        let first = outcomes[0].group_key;
        assert!(outcomes.iter().all(|o| o.group_key == first));
        (engines, gid)
    }

    #[test]
    fn four_party_dkg_completes() {
        let (engines, gid) = run_dkg(4, 3);
        for engine in &engines {
            assert!(engine.is_complete(&gid));
            let material = engine.export_key_material(&gid).unwrap();
            assert_eq!(
                ProjectivePoint::GENERATOR * material.signing_share,
                material.verification_share,
            );
        }
    }

    #[test]
    fn threshold_subset_interpolates_group_key() {
        let (engines, gid) = run_dkg(4, 3);
        let group_key =
            engines[0].export_key_material(&gid).unwrap().group_key;

        let signers = [1u16, 2, 4];
        let mut secret_image = ProjectivePoint::IDENTITY;
        for signer in signers {
            let material = engines[signer as usize - 1]
                .export_key_material(&gid)
                .unwrap();
            let coefficient =
                lagrange_coefficient(signer, &signers).unwrap();
            secret_image += ProjectivePoint::GENERATOR
                * (material.signing_share * coefficient);
        }
        assert_eq!(secret_image, group_key);

        // One signer short of the threshold lands elsewhere.
        let short = [1u16, 2];
        let mut partial = ProjectivePoint::IDENTITY;
        for signer in short {
            let material = engines[signer as usize - 1]
                .export_key_material(&gid)
                .unwrap();
            let coefficient =
                lagrange_coefficient(signer, &short).unwrap();
            partial += ProjectivePoint::GENERATOR
                * (material.signing_share * coefficient);
        }
        assert_ne!(partial, group_key);
    }

    #[test]
    fn init_rejects_foreign_roster() {
        let roster = roster(3);
        let root = merkle::participants_root(&roster);
        let gid = group_id(&root, 3, 3, &Hash32::default());
        let mut outsider =
            KeyGenEngine::new(Address::from([0xee; 20]));
        let result = outsider.init(
            gid,
            root,
            3,
            3,
            roster,
            &mut OsRng,
        );
        assert!(matches!(
            result,
            Err(Error::ParticipantNotFound(_))
        ));
    }

    #[test]
    fn init_rejects_count_mismatch() {
        let roster = roster(3);
        let root = merkle::participants_root(&roster);
        let gid = group_id(&root, 4, 3, &Hash32::default());
        let mut engine = KeyGenEngine::new(roster[0].address);
        let result = engine.init(
            gid,
            root,
            4,
            3,
            roster,
            &mut OsRng,
        );
        assert!(matches!(result, Err(Error::CountMismatch { .. })));
    }

    #[test]
    fn duplicate_commitments_are_a_violation() {
        let roster = roster(3);
        let root = merkle::participants_root(&roster);
        let gid = group_id(&root, 3, 3, &Hash32::default());
        let mut engines: Vec<KeyGenEngine> = roster
            .iter()
            .map(|p| KeyGenEngine::new(p.address))
            .collect();
        let publications: Vec<KeyGenPublication> = engines
            .iter_mut()
            .map(|e| {
                e.init(gid, root, 3, 3, roster.clone(), &mut OsRng)
                    .unwrap()
            })
            .collect();
        engines[0]
            .handle_commitments(
                gid,
                2,
                &publications[1].commitments,
                &publications[1].pok,
            )
            .unwrap();
        let result = engines[0].handle_commitments(
            gid,
            2,
            &publications[1].commitments,
            &publications[1].pok,
        );
        assert!(matches!(
            result,
            Err(Error::DuplicateCommitments(2))
        ));
    }

    #[test]
    fn forged_proof_of_knowledge_rejects_contribution() {
        let roster = roster(3);
        let root = merkle::participants_root(&roster);
        let gid = group_id(&root, 3, 3, &Hash32::default());
        let mut engines: Vec<KeyGenEngine> = roster
            .iter()
            .map(|p| KeyGenEngine::new(p.address))
            .collect();
        let publications: Vec<KeyGenPublication> = engines
            .iter_mut()
            .map(|e| {
                e.init(gid, root, 3, 3, roster.clone(), &mut OsRng)
                    .unwrap()
            })
            .collect();
        // Proof stolen from participant three does not fit
        // participant two's commitments.
        let result = engines[0].handle_commitments(
            gid,
            2,
            &publications[1].commitments,
            &publications[2].pok,
        );
        assert!(matches!(
            result,
            Err(Error::InvalidProofOfKnowledge(2))
        ));
        // The session remains open for a corrected resubmission.
        assert!(engines[0]
            .handle_commitments(
                gid,
                2,
                &publications[1].commitments,
                &publications[1].pok,
            )
            .unwrap()
            .is_none());
    }

    #[test]
    fn tampered_share_is_detected() {
        let roster = roster(3);
        let root = merkle::participants_root(&roster);
        let gid = group_id(&root, 3, 3, &Hash32::default());
        let mut engines: Vec<KeyGenEngine> = roster
            .iter()
            .map(|p| KeyGenEngine::new(p.address))
            .collect();
        let publications: Vec<KeyGenPublication> = engines
            .iter_mut()
            .map(|e| {
                e.init(gid, root, 3, 3, roster.clone(), &mut OsRng)
                    .unwrap()
            })
            .collect();
        let mut share_publications = Vec::new();
        for publication in &publications {
            for engine in engines.iter_mut() {
                if let Some(shares) = engine
                    .handle_commitments(
                        gid,
                        publication.participant_index,
                        &publication.commitments,
                        &publication.pok,
                    )
                    .unwrap()
                {
                    share_publications.push(shares);
                }
            }
        }
        let mut tampered = share_publications
            .iter()
            .find(|p| p.participant_index == 2)
            .unwrap()
            .clone();
        tampered.encrypted_shares[0].0[31] ^= 1;
        let result = engines[0].handle_secret_shares(
            gid,
            2,
            &tampered.encrypted_shares,
        );
        assert!(matches!(
            result,
            Err(Error::InvalidSecretShare(2))
        ));
    }

    #[test]
    fn abort_is_idempotent() {
        let mut engine = KeyGenEngine::new(Address::from([1u8; 20]));
        let gid = GroupId::from([9u8; 32]);
        engine.abort(&gid);
        engine.abort(&gid);
        assert!(matches!(
            engine.participant_index(&gid),
            Err(Error::UnknownGroup(_))
        ));
    }
}
