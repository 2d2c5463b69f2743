//! Threshold signing engine: nonce preprocessing and per-signature
//! sessions.
use crate::keygen::KeyMaterial;
use crate::math::{
    binding_factor, challenge, decode_point, encode_point,
    encode_scalar, lagrange_coefficient,
};
use crate::nonces::{NonceTree, CHUNK_SIZE};
use crate::{Error, Result};
use frostnode_protocol::{
    keccak, merkle, GroupId, Hash32, MessageId, NonceCommitments,
    NonceRoot, PointBytes, ScalarBytes, SignatureId,
};
use k256::elliptic_curve::Field;
use k256::{ProjectivePoint, Scalar};
use std::collections::BTreeMap;
use tracing::debug;

/// Reveal payload for the local participant's nonce commitments.
#[derive(Debug, Clone)]
pub struct NonceReveal {
    /// Signature run the reveal belongs to.
    pub signature_id: SignatureId,
    /// Public commitment pair.
    pub commitments: NonceCommitments,
    /// Merkle proof of the pair within its registered batch.
    pub proof: Vec<Hash32>,
}

/// The local partial signature, ready for publication.
#[derive(Debug, Clone)]
pub struct SignatureSharePublication {
    /// Signature run the share belongs to.
    pub signature_id: SignatureId,
    /// Merkle root of the signer set.
    pub signers_root: Hash32,
    /// Proof of the local signer within the set.
    pub signers_proof: Vec<Hash32>,
    /// Aggregate nonce commitment of the signer set.
    pub group_commitment: PointBytes,
    /// Bound local nonce commitment.
    pub commitment_share: PointBytes,
    /// Partial signature scalar.
    pub signature_share: ScalarBytes,
    /// Lagrange coefficient of the local signer over the set.
    pub lagrange_coefficient: ScalarBytes,
}

struct SignatureRequest {
    group_id: GroupId,
    message: MessageId,
    signers: Vec<u16>,
    // Secret pair backing the local commitments.
    hiding: Scalar,
    binding: Scalar,
    commitments: BTreeMap<u16, (ProjectivePoint, ProjectivePoint)>,
}

struct GroupSigning {
    material: KeyMaterial,
    trees_generated: u64,
}

/// Engine owning nonce batches and one signing session per signature
/// id.
pub struct SigningEngine {
    groups: BTreeMap<GroupId, GroupSigning>,
    trees: BTreeMap<NonceRoot, NonceTree>,
    chunk_links: BTreeMap<Hash32, NonceRoot>,
    requests: BTreeMap<SignatureId, SignatureRequest>,
}

fn chunk_key(group_id: &GroupId, chunk: u64) -> Hash32 {
    Hash32::from(keccak(&[
        group_id.as_bytes(),
        &chunk.to_be_bytes(),
    ]))
}

impl SigningEngine {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self {
            groups: BTreeMap::new(),
            trees: BTreeMap::new(),
            chunk_links: BTreeMap::new(),
            requests: BTreeMap::new(),
        }
    }

    /// Install the key material of a completed group.
    pub fn install_key_material(
        &mut self,
        material: KeyMaterial,
    ) -> Result<()> {
        if self.groups.contains_key(&material.group_id) {
            return Err(Error::DuplicateGroup(material.group_id));
        }
        debug!(group = %material.group_id, "installed key material");
        self.groups.insert(
            material.group_id,
            GroupSigning {
                material,
                trees_generated: 0,
            },
        );
        Ok(())
    }

    /// Whether key material for the group is installed.
    pub fn has_group(&self, group_id: &GroupId) -> bool {
        self.groups.contains_key(group_id)
    }

    /// Index of the local participant within a group.
    pub fn participant_index(
        &self,
        group_id: &GroupId,
    ) -> Result<u16> {
        self.groups
            .get(group_id)
            .map(|g| g.material.local_index)
            .ok_or(Error::UnknownGroup(*group_id))
    }

    /// Participant indices of a group in canonical order.
    pub fn group_signers(
        &self,
        group_id: &GroupId,
    ) -> Result<Vec<u16>> {
        let group = self
            .groups
            .get(group_id)
            .ok_or(Error::UnknownGroup(*group_id))?;
        let mut signers: Vec<u16> = group
            .material
            .participants
            .iter()
            .map(|p| p.index)
            .collect();
        signers.sort_unstable();
        Ok(signers)
    }

    /// Derive the next nonce batch for a group and return its root
    /// for registration.
    pub fn generate_nonce_tree(
        &mut self,
        group_id: &GroupId,
    ) -> Result<NonceRoot> {
        let group = self
            .groups
            .get_mut(group_id)
            .ok_or(Error::UnknownGroup(*group_id))?;
        let base = group.trees_generated * CHUNK_SIZE;
        let tree = NonceTree::generate(
            &group.material.signing_share,
            base,
        );
        group.trees_generated += 1;
        let root = tree.root();
        self.trees.insert(root, tree);
        debug!(group = %group_id, %root, base, "generated nonce batch");
        Ok(root)
    }

    /// Link a registered nonce batch to the chunk the chain assigned
    /// it. Registrations by other participants are ignored.
    pub fn link_nonce_root(
        &mut self,
        group_id: &GroupId,
        index: u16,
        nonce_root: NonceRoot,
        chunk: u64,
    ) -> Result<()> {
        let group = self
            .groups
            .get(group_id)
            .ok_or(Error::UnknownGroup(*group_id))?;
        if group.material.local_index != index {
            return Ok(());
        }
        if !self.trees.contains_key(&nonce_root) {
            return Err(Error::UnknownNonceTree(nonce_root));
        }
        let key = chunk_key(group_id, chunk);
        if self.chunk_links.contains_key(&key) {
            return Err(Error::ChunkAlreadyLinked {
                group: *group_id,
                chunk,
            });
        }
        debug!(group = %group_id, chunk, %nonce_root, "linked nonce batch");
        self.chunk_links.insert(key, nonce_root);
        Ok(())
    }

    /// Number of unrevealed nonces in a linked chunk; zero when the
    /// chunk was never linked.
    pub fn available_nonces(
        &self,
        group_id: &GroupId,
        chunk: u64,
    ) -> u64 {
        self.chunk_links
            .get(&chunk_key(group_id, chunk))
            .and_then(|root| self.trees.get(root))
            .map(|tree| tree.available())
            .unwrap_or(0)
    }

    /// Open a signing session for a requested signature and produce
    /// the local nonce reveal.
    pub fn handle_signature_request(
        &mut self,
        group_id: &GroupId,
        signature_id: SignatureId,
        message: MessageId,
        sequence: u64,
        signers: Vec<u16>,
    ) -> Result<NonceReveal> {
        let group = self
            .groups
            .get(group_id)
            .ok_or(Error::UnknownGroup(*group_id))?;
        if self.requests.contains_key(&signature_id) {
            return Err(Error::DuplicateSignatureRequest(
                signature_id,
            ));
        }
        let chunk = sequence / CHUNK_SIZE;
        let offset = sequence % CHUNK_SIZE;
        let root = self
            .chunk_links
            .get(&chunk_key(group_id, chunk))
            .copied()
            .ok_or(Error::UnknownChunk {
                group: *group_id,
                chunk,
            })?;
        let tree = self
            .trees
            .get_mut(&root)
            .ok_or(Error::UnknownNonceTree(root))?;
        let revealed =
            tree.reveal(&group.material.signing_share, offset)?;

        let local_index = group.material.local_index;
        let mut commitments = BTreeMap::new();
        commitments.insert(
            local_index,
            (
                decode_point(&revealed.commitments.hiding)?,
                decode_point(&revealed.commitments.binding)?,
            ),
        );
        self.requests.insert(
            signature_id,
            SignatureRequest {
                group_id: *group_id,
                message,
                signers,
                hiding: revealed.hiding,
                binding: revealed.binding,
                commitments,
            },
        );
        debug!(
            group = %group_id,
            signature = %signature_id,
            sequence,
            "opened signing session"
        );
        Ok(NonceReveal {
            signature_id,
            commitments: revealed.commitments,
            proof: revealed.proof,
        })
    }

    /// Record a peer signer's nonce commitment pair.
    ///
    /// Returns the local partial signature once every designated
    /// signer has contributed. Self-originated echoes are ignored.
    pub fn handle_nonce_commitments(
        &mut self,
        signature_id: SignatureId,
        index: u16,
        commitments: &NonceCommitments,
    ) -> Result<Option<SignatureSharePublication>> {
        let request = self
            .requests
            .get_mut(&signature_id)
            .ok_or(Error::UnknownSignatureRequest(signature_id))?;
        let group = self
            .groups
            .get(&request.group_id)
            .ok_or(Error::UnknownGroup(request.group_id))?;
        if index == group.material.local_index {
            return Ok(None);
        }
        if !request.signers.contains(&index) {
            return Err(Error::UnknownSigner(index));
        }
        if request.commitments.contains_key(&index) {
            return Err(Error::DuplicateNonceCommitments(index));
        }
        request.commitments.insert(
            index,
            (
                decode_point(&commitments.hiding)?,
                decode_point(&commitments.binding)?,
            ),
        );
        if request.commitments.len() < request.signers.len() {
            return Ok(None);
        }
        Ok(Some(Self::create_signature_share(
            signature_id,
            request,
            group,
        )?))
    }

    fn create_signature_share(
        signature_id: SignatureId,
        request: &SignatureRequest,
        group: &GroupSigning,
    ) -> Result<SignatureSharePublication> {
        let local_index = group.material.local_index;
        let signers_root = merkle::signer_set_root(&request.signers);
        let signers_proof =
            merkle::signer_proof(&request.signers, local_index)
                .ok_or(Error::UnknownSigner(local_index))?;

        let mut group_commitment = ProjectivePoint::IDENTITY;
        let mut commitment_share = ProjectivePoint::IDENTITY;
        let mut local_factor = Scalar::ZERO;
        for (index, (hiding, binding)) in &request.commitments {
            let factor = binding_factor(
                &request.message,
                &signers_root,
                *index,
            );
            let bound = *hiding + *binding * factor;
            group_commitment += bound;
            if *index == local_index {
                commitment_share = bound;
                local_factor = factor;
            }
        }
        let challenge_scalar = challenge(
            &group_commitment,
            &group.material.group_key,
            &request.message,
        );
        let coefficient = lagrange_coefficient(
            local_index,
            &request.signers,
        )?;
        let share = request.hiding
            + request.binding * local_factor
            + coefficient
                * group.material.signing_share
                * challenge_scalar;

        Ok(SignatureSharePublication {
            signature_id,
            signers_root,
            signers_proof,
            group_commitment: encode_point(&group_commitment),
            commitment_share: encode_point(&commitment_share),
            signature_share: encode_scalar(&share),
            lagrange_coefficient: encode_scalar(&coefficient),
        })
    }

    /// Signer indices that have not revealed nonce commitments yet.
    pub fn missing_nonces(
        &self,
        signature_id: &SignatureId,
    ) -> Result<Vec<u16>> {
        let request = self
            .requests
            .get(signature_id)
            .ok_or(Error::UnknownSignatureRequest(*signature_id))?;
        Ok(request
            .signers
            .iter()
            .copied()
            .filter(|s| !request.commitments.contains_key(s))
            .collect())
    }

    /// Designated signer set of an open session.
    pub fn signers(
        &self,
        signature_id: &SignatureId,
    ) -> Result<Vec<u16>> {
        self.requests
            .get(signature_id)
            .map(|r| r.signers.clone())
            .ok_or(Error::UnknownSignatureRequest(*signature_id))
    }

    /// Message of an open session.
    pub fn message(
        &self,
        signature_id: &SignatureId,
    ) -> Result<MessageId> {
        self.requests
            .get(signature_id)
            .map(|r| r.message)
            .ok_or(Error::UnknownSignatureRequest(*signature_id))
    }
}

impl Default for SigningEngine {
    fn default() -> Self {
        Self::new()
    }
}
