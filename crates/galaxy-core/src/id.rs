//! Network identifiers.
//!
//! Every long-lived entity addressable over the network carries an opaque
//! 32-byte identifier. Node ids are derived from an ed25519 public key by a
//! proof-of-work scheme: the id is the SHA3-256 of the key, and its
//! "difficulty" is the number of trailing zero bits. Higher id versions
//! require more difficulty, which rate-limits Sybil identity generation.
//!
//! Piece ids are derived per piece from a segment's root piece id, so a
//! satellite only stores the root and each node's piece number.

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;

use crate::error::{Error, Result};

/// Length in bytes of all network identifiers.
pub const ID_LENGTH: usize = 32;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub [u8; ID_LENGTH]);

        impl $name {
            pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
                let arr: [u8; ID_LENGTH] =
                    bytes.try_into().map_err(|_| Error::InvalidIdLength {
                        expected: ID_LENGTH,
                        got: bytes.len(),
                    })?;
                Ok(Self(arr))
            }

            pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
                &self.0
            }

            pub fn to_vec(&self) -> Vec<u8> {
                self.0.to_vec()
            }

            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; ID_LENGTH]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), &hex::encode(self.0)[..12])
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self([0u8; ID_LENGTH])
            }
        }
    };
}

opaque_id!(NodeId);
opaque_id!(PieceId);

impl NodeId {
    /// Derive a node id from an ed25519 public key.
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        let digest = Sha3_256::digest(key.as_bytes());
        Self(digest.into())
    }

    /// Count of trailing zero bits in the id. This is the proof-of-work
    /// measure: ids with more trailing zeros took longer to mine.
    pub fn difficulty(&self) -> u16 {
        let mut count = 0u16;
        for byte in self.0.iter().rev() {
            if *byte == 0 {
                count += 8;
            } else {
                count += byte.trailing_zeros() as u16;
                break;
            }
        }
        count
    }
}

impl PieceId {
    /// Derive the id of piece `piece_number` from a segment's root piece id.
    pub fn derive(&self, piece_number: u16) -> PieceId {
        let mut hasher = Sha3_256::new();
        hasher.update(self.0);
        hasher.update(piece_number.to_le_bytes());
        PieceId(hasher.finalize().into())
    }
}

/// Identity version. Later versions demand more proof-of-work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdVersion(pub u16);

impl IdVersion {
    pub const V0: IdVersion = IdVersion(0);

    /// Minimum trailing-zero-bit difficulty required for this version.
    pub fn min_difficulty(&self) -> u16 {
        self.0 * 8
    }
}

impl Default for IdVersion {
    fn default() -> Self {
        IdVersion::V0
    }
}

/// A full node identity: the keypair plus the derived id.
pub struct NodeIdentity {
    pub id: NodeId,
    pub version: IdVersion,
    pub signing_key: SigningKey,
}

impl NodeIdentity {
    /// Mine a fresh identity satisfying the version's difficulty. Version 0
    /// returns on the first candidate.
    pub fn generate(version: IdVersion) -> Self {
        loop {
            let signing_key = SigningKey::generate(&mut OsRng);
            let id = NodeId::from_public_key(&signing_key.verifying_key());
            if id.difficulty() >= version.min_difficulty() {
                return Self {
                    id,
                    version,
                    signing_key,
                };
            }
        }
    }

    /// Check a claimed id against the public key and version difficulty.
    pub fn verify(id: NodeId, key: &VerifyingKey, version: IdVersion) -> Result<()> {
        let derived = NodeId::from_public_key(key);
        if derived != id {
            return Err(Error::BadSignature);
        }
        if id.difficulty() < version.min_difficulty() {
            return Err(Error::InsufficientDifficulty {
                got: id.difficulty(),
                required: version.min_difficulty(),
            });
        }
        Ok(())
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

/// A 16-byte serial number identifying one order limit.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SerialNumber(pub [u8; 16]);

impl SerialNumber {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SerialNumber({})", hex::encode(self.0))
    }
}
