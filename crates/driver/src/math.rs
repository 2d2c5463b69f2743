//! Group arithmetic for the key generation and signing protocols.
//!
//! Everything operates on secp256k1 via `k256`; values cross the
//! module boundary as compressed SEC1 points and big-endian scalars.
use crate::{Error, Result};
use frostnode_protocol::{
    GroupId, Hash32, MessageId, PointBytes, ProofOfKnowledge,
    ScalarBytes,
};
use k256::elliptic_curve::generic_array::GenericArray;
use k256::elliptic_curve::{
    group::GroupEncoding, ops::Reduce, Field, PrimeField,
};
use k256::{AffinePoint, ProjectivePoint, Scalar, U256};
use rand::{CryptoRng, RngCore};
use sha3::{Digest, Keccak256};

const POK_TAG: &[u8] = b"frostnode/keygen/pok/v1";
const SHARE_MASK_TAG: &[u8] = b"frostnode/keygen/share-mask/v1";
const NONCE_HIDING_TAG: &[u8] = b"frostnode/sign/nonce-hiding/v1";
const NONCE_BINDING_TAG: &[u8] = b"frostnode/sign/nonce-binding/v1";
const BINDING_FACTOR_TAG: &[u8] = b"frostnode/sign/binding-factor/v1";
const CHALLENGE_TAG: &[u8] = b"frostnode/sign/challenge/v1";

/// Hash a domain tag and parts onto the scalar field.
pub fn hash_to_scalar(tag: &[u8], parts: &[&[u8]]) -> Scalar {
    let mut hasher = Keccak256::new();
    hasher.update(tag);
    for part in parts {
        hasher.update(part);
    }
    <Scalar as Reduce<U256>>::reduce_bytes(&hasher.finalize())
}

/// Encode a point as a compressed SEC1 wire value.
pub fn encode_point(point: &ProjectivePoint) -> PointBytes {
    let bytes = point.to_affine().to_bytes();
    let mut out = [0u8; 33];
    out.copy_from_slice(&bytes);
    PointBytes(out)
}

/// Decode a compressed SEC1 wire value.
pub fn decode_point(bytes: &PointBytes) -> Result<ProjectivePoint> {
    let point =
        AffinePoint::from_bytes(GenericArray::from_slice(&bytes.0));
    Option::<AffinePoint>::from(point)
        .map(ProjectivePoint::from)
        .ok_or(Error::InvalidPoint)
}

/// Encode a scalar as a big-endian wire value.
pub fn encode_scalar(scalar: &Scalar) -> ScalarBytes {
    ScalarBytes(scalar.to_bytes().into())
}

/// Decode a big-endian wire value to a scalar.
pub fn decode_scalar(bytes: &ScalarBytes) -> Result<Scalar> {
    Option::<Scalar>::from(Scalar::from_repr(bytes.0.into()))
        .ok_or(Error::InvalidScalar)
}

/// The participant index as a polynomial evaluation point.
pub fn index_scalar(index: u16) -> Scalar {
    Scalar::from(index as u64)
}

/// Sample a random secret polynomial of degree `threshold - 1`.
pub fn random_polynomial<R: RngCore + CryptoRng>(
    threshold: u16,
    rng: &mut R,
) -> Vec<Scalar> {
    (0..threshold).map(|_| Scalar::random(&mut *rng)).collect()
}

/// Evaluate a polynomial at `x` (Horner form).
pub fn eval_polynomial(coefficients: &[Scalar], x: &Scalar) -> Scalar {
    let mut acc = Scalar::ZERO;
    for coefficient in coefficients.iter().rev() {
        acc = acc * x + coefficient;
    }
    acc
}

/// Feldman commitments to a polynomial's coefficients.
pub fn commit_polynomial(
    coefficients: &[Scalar],
) -> Vec<ProjectivePoint> {
    coefficients
        .iter()
        .map(|c| ProjectivePoint::GENERATOR * c)
        .collect()
}

/// Evaluate a commitment vector at `x`, the public image of
/// [`eval_polynomial`].
pub fn eval_commitments(
    commitments: &[ProjectivePoint],
    x: &Scalar,
) -> ProjectivePoint {
    let mut acc = ProjectivePoint::IDENTITY;
    for commitment in commitments.iter().rev() {
        acc = acc * x + commitment;
    }
    acc
}

fn pok_challenge(
    group_id: &GroupId,
    index: u16,
    first_commitment: &ProjectivePoint,
    nonce_commitment: &ProjectivePoint,
) -> Scalar {
    hash_to_scalar(
        POK_TAG,
        &[
            group_id.as_bytes(),
            &index.to_be_bytes(),
            &encode_point(first_commitment).0,
            &encode_point(nonce_commitment).0,
        ],
    )
}

/// Prove knowledge of the polynomial's constant term, bound to the
/// group and the prover's index so the proof cannot be replayed
/// across groups or identities.
pub fn create_proof_of_knowledge<R: RngCore + CryptoRng>(
    group_id: &GroupId,
    index: u16,
    constant_term: &Scalar,
    rng: &mut R,
) -> ProofOfKnowledge {
    let nonce = Scalar::random(&mut *rng);
    let nonce_commitment = ProjectivePoint::GENERATOR * nonce;
    let first_commitment = ProjectivePoint::GENERATOR * constant_term;
    let challenge = pok_challenge(
        group_id,
        index,
        &first_commitment,
        &nonce_commitment,
    );
    ProofOfKnowledge {
        r: encode_point(&nonce_commitment),
        mu: encode_scalar(&(nonce + *constant_term * challenge)),
    }
}

/// Verify a proof of knowledge against the first commitment of a
/// published vector.
pub fn verify_proof_of_knowledge(
    group_id: &GroupId,
    index: u16,
    first_commitment: &ProjectivePoint,
    proof: &ProofOfKnowledge,
) -> Result<()> {
    let nonce_commitment = decode_point(&proof.r)
        .map_err(|_| Error::InvalidProofOfKnowledge(index))?;
    let mu = decode_scalar(&proof.mu)
        .map_err(|_| Error::InvalidProofOfKnowledge(index))?;
    let challenge = pok_challenge(
        group_id,
        index,
        first_commitment,
        &nonce_commitment,
    );
    let expected = nonce_commitment + *first_commitment * challenge;
    if ProjectivePoint::GENERATOR * mu == expected {
        Ok(())
    } else {
        Err(Error::InvalidProofOfKnowledge(index))
    }
}

/// Masking scalar for a share in transit, derived from the
/// authenticated ECDH point between the sender's and receiver's
/// constant-term keys.
pub fn share_mask(
    shared_point: &ProjectivePoint,
    group_id: &GroupId,
    sender: u16,
    receiver: u16,
) -> Scalar {
    hash_to_scalar(
        SHARE_MASK_TAG,
        &[
            &encode_point(shared_point).0,
            group_id.as_bytes(),
            &sender.to_be_bytes(),
            &receiver.to_be_bytes(),
        ],
    )
}

/// Blind a share for publication.
pub fn mask_share(share: &Scalar, mask: &Scalar) -> Scalar {
    share + mask
}

/// Recover a share from its blinded form.
pub fn unmask_share(masked: &Scalar, mask: &Scalar) -> Scalar {
    masked - mask
}

/// Deterministic one-time nonce pair for a sequence number.
///
/// Both scalars bind to the signing share, so a batch can be
/// regenerated from key material alone but never collides across
/// sequences.
pub fn derive_nonce_pair(
    signing_share: &Scalar,
    sequence: u64,
) -> (Scalar, Scalar) {
    let share = signing_share.to_bytes();
    let hiding = hash_to_scalar(
        NONCE_HIDING_TAG,
        &[&share, &sequence.to_be_bytes()],
    );
    let binding = hash_to_scalar(
        NONCE_BINDING_TAG,
        &[&share, &sequence.to_be_bytes()],
    );
    (hiding, binding)
}

/// Binding factor tying a signer's nonce pair to the message and the
/// signer set.
pub fn binding_factor(
    message: &MessageId,
    signers_root: &Hash32,
    index: u16,
) -> Scalar {
    hash_to_scalar(
        BINDING_FACTOR_TAG,
        &[
            message.as_bytes(),
            signers_root.as_bytes(),
            &index.to_be_bytes(),
        ],
    )
}

/// Schnorr challenge over the aggregate commitment, group key and
/// message.
pub fn challenge(
    group_commitment: &ProjectivePoint,
    group_key: &ProjectivePoint,
    message: &MessageId,
) -> Scalar {
    hash_to_scalar(
        CHALLENGE_TAG,
        &[
            &encode_point(group_commitment).0,
            &encode_point(group_key).0,
            message.as_bytes(),
        ],
    )
}

/// Lagrange coefficient of `index` over the signer set, evaluated at
/// zero.
pub fn lagrange_coefficient(
    index: u16,
    signers: &[u16],
) -> Result<Scalar> {
    let mut seen = std::collections::BTreeSet::new();
    for signer in signers {
        if *signer == 0 || !seen.insert(*signer) {
            return Err(Error::InvalidSignerSet);
        }
    }
    let own = index_scalar(index);
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;
    for other in signers {
        if *other == index {
            continue;
        }
        let other = index_scalar(*other);
        numerator *= other;
        denominator *= other - own;
    }
    let inverted = Option::<Scalar>::from(denominator.invert())
        .ok_or(Error::InvalidSignerSet)?;
    Ok(numerator * inverted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn polynomial_and_commitments_agree() {
        let coefficients = random_polynomial(3, &mut OsRng);
        let commitments = commit_polynomial(&coefficients);
        for index in 1u16..=5 {
            let x = index_scalar(index);
            let value = eval_polynomial(&coefficients, &x);
            assert_eq!(
                ProjectivePoint::GENERATOR * value,
                eval_commitments(&commitments, &x),
            );
        }
    }

    #[test]
    fn proof_of_knowledge_round_trip() {
        let group_id = GroupId::from([7u8; 32]);
        let secret = Scalar::random(&mut OsRng);
        let first = ProjectivePoint::GENERATOR * secret;
        let proof = create_proof_of_knowledge(
            &group_id, 1, &secret, &mut OsRng,
        );
        verify_proof_of_knowledge(&group_id, 1, &first, &proof)
            .unwrap();
    }

    #[test]
    fn proof_of_knowledge_binds_to_index() {
        let group_id = GroupId::from([7u8; 32]);
        let secret = Scalar::random(&mut OsRng);
        let first = ProjectivePoint::GENERATOR * secret;
        let proof = create_proof_of_knowledge(
            &group_id, 1, &secret, &mut OsRng,
        );
        assert!(verify_proof_of_knowledge(
            &group_id, 2, &first, &proof
        )
        .is_err());
    }

    #[test]
    fn share_mask_is_symmetric() {
        let sender_secret = Scalar::random(&mut OsRng);
        let receiver_secret = Scalar::random(&mut OsRng);
        let sender_public =
            ProjectivePoint::GENERATOR * sender_secret;
        let receiver_public =
            ProjectivePoint::GENERATOR * receiver_secret;
        let group_id = GroupId::from([1u8; 32]);

        let share = Scalar::random(&mut OsRng);
        let sender_mask = share_mask(
            &(receiver_public * sender_secret),
            &group_id,
            1,
            2,
        );
        let masked = mask_share(&share, &sender_mask);

        let receiver_mask = share_mask(
            &(sender_public * receiver_secret),
            &group_id,
            1,
            2,
        );
        assert_eq!(unmask_share(&masked, &receiver_mask), share);
    }

    #[test]
    fn nonce_pairs_never_collide() {
        let share = Scalar::random(&mut OsRng);
        let (d0, e0) = derive_nonce_pair(&share, 0);
        let (d1, e1) = derive_nonce_pair(&share, 1);
        assert_ne!(d0, d1);
        assert_ne!(e0, e1);
        assert_ne!(d0, e0);
    }

    #[test]
    fn lagrange_interpolates_at_zero() {
        let coefficients = random_polynomial(3, &mut OsRng);
        let secret = coefficients[0];
        let signers = [1u16, 3, 5];
        let mut interpolated = Scalar::ZERO;
        for signer in signers {
            let value = eval_polynomial(
                &coefficients,
                &index_scalar(signer),
            );
            let coefficient =
                lagrange_coefficient(signer, &signers).unwrap();
            interpolated += value * coefficient;
        }
        assert_eq!(interpolated, secret);
    }

    #[test]
    fn duplicate_signers_are_rejected() {
        assert!(lagrange_coefficient(1, &[1, 2, 2]).is_err());
    }

    #[test]
    fn point_codec_round_trip() {
        let point =
            ProjectivePoint::GENERATOR * Scalar::random(&mut OsRng);
        let decoded = decode_point(&encode_point(&point)).unwrap();
        assert_eq!(point, decoded);
    }
}
