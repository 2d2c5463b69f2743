//! Identifiers, participants and wire primitives.
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! digest_id {
    ($(#[$docs:meta])* $name:ident) => {
        $(#[$docs])*
        #[derive(
            Default,
            Debug,
            Clone,
            Copy,
            Hash,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Serialize,
            Deserialize,
        )]
        pub struct $name(#[serde(with = "hex::serde")] [u8; 32]);

        impl $name {
            /// Identifier as raw bytes.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(value: [u8; 32]) -> Self {
                Self(value)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(value: &str) -> Result<Self> {
                let value = value.strip_prefix("0x").unwrap_or(value);
                let bytes = hex::decode(value)?;
                let bytes: [u8; 32] = bytes.try_into().map_err(
                    |bytes: Vec<u8>| Error::InvalidLength {
                        expected: 32,
                        actual: bytes.len(),
                    },
                )?;
                Ok(Self(bytes))
            }
        }
    };
}

digest_id!(
    /// Generic 32-byte keccak digest (merkle nodes and roots).
    Hash32
);

digest_id!(
    /// Identifier of a signing group, derived from its roster,
    /// parameters and context.
    GroupId
);

digest_id!(
    /// Identifier assigned to one threshold-signature run.
    SignatureId
);

digest_id!(
    /// Canonical hash of a verified packet; the value that gets
    /// threshold-signed.
    MessageId
);

/// Root of a Merkle-committed nonce batch.
pub type NonceRoot = Hash32;

/// Chain account identifier of a validator.
#[derive(
    Default,
    Debug,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub struct Address(#[serde(with = "hex::serde")] [u8; 20]);

impl Address {
    /// Address as raw bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl From<[u8; 20]> for Address {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.strip_prefix("0x").unwrap_or(value);
        let bytes = hex::decode(value)?;
        let bytes: [u8; 20] =
            bytes.try_into().map_err(|bytes: Vec<u8>| {
                Error::InvalidLength {
                    expected: 20,
                    actual: bytes.len(),
                }
            })?;
        Ok(Self(bytes))
    }
}

/// Compressed SEC1 elliptic-curve point on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointBytes(pub [u8; 33]);

impl Serialize for PointBytes {
    fn serialize<S>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        hex::serde::serialize(self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for PointBytes {
    fn deserialize<D>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        hex::serde::deserialize(deserializer).map(Self)
    }
}

impl fmt::Display for PointBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Big-endian scalar on the wire.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct ScalarBytes(#[serde(with = "hex::serde")] pub [u8; 32]);

impl fmt::Display for ScalarBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Member of a signing group roster.
///
/// The index is the FROST polynomial evaluation point and must be
/// unique and non-zero within a group; the address is the validator
/// identity on chain. Entries are immutable once a group is formed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct Participant {
    /// Evaluation point, starting at one.
    pub index: u16,
    /// Validator account.
    pub address: Address,
}

/// Which group serves an epoch and the index the local validator
/// holds in it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct GroupInfo {
    /// Group serving the epoch.
    pub group_id: GroupId,
    /// Index of the local validator within the group.
    pub participant_index: u16,
}

/// Parameters used during key generation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct Parameters {
    /// Number of participants `n`.
    pub count: u16,
    /// Number of signers `t` required for a signature.
    pub threshold: u16,
}

impl Parameters {
    /// Parameters for a roster of the given size.
    ///
    /// The threshold tolerates `(n - 1) / 3` missing signers, so a
    /// roster of four yields a threshold of three.
    pub fn for_roster(count: u16) -> Self {
        Self {
            count,
            threshold: count - (count.saturating_sub(1)) / 3,
        }
    }
}

/// Schnorr proof of knowledge of a committed polynomial's constant
/// term, bound to a group and participant index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct ProofOfKnowledge {
    /// Commitment to the proof nonce.
    pub r: PointBytes,
    /// Proof response scalar.
    pub mu: ScalarBytes,
}

/// One-time nonce commitment pair revealed for a signature.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct NonceCommitments {
    /// Commitment to the hiding nonce.
    pub hiding: PointBytes,
    /// Commitment to the binding nonce.
    pub binding: PointBytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_id_hex_round_trip() {
        let id = GroupId::from([0x5a; 32]);
        let encoded = serde_json::to_string(&id).unwrap();
        assert_eq!(encoded, format!("\"{}\"", "5a".repeat(32)));
        let decoded: GroupId = serde_json::from_str(&encoded).unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn address_from_str_accepts_prefix() {
        let plain: Address = "11".repeat(20).parse().unwrap();
        let prefixed: Address =
            format!("0x{}", "11".repeat(20)).parse().unwrap();
        assert_eq!(plain, prefixed);
    }

    #[test]
    fn parameters_for_roster() {
        assert_eq!(Parameters::for_roster(2).threshold, 2);
        assert_eq!(Parameters::for_roster(4).threshold, 3);
        assert_eq!(Parameters::for_roster(7).threshold, 5);
        assert_eq!(Parameters::for_roster(10).threshold, 7);
    }
}
