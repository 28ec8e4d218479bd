//! Order limits and piece hashes.
//!
//! An order limit is a satellite-signed ticket authorizing exactly one
//! piecestore operation on one piece. The uplink then signs incremental
//! `Order`s as it streams data, each covering the cumulative byte count, so
//! the node can settle bandwidth with the satellite afterwards. On commit the
//! node signs a `PieceHash` over what it stored, giving the uplink a receipt
//! it can later hand to auditors.
//!
//! Signing uses canonical byte encodings rather than serialized structs so
//! the signature does not depend on any wire format.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{NodeId, PieceId, SerialNumber};

/// The operation an order limit authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum Action {
    Put = 0,
    Get = 1,
    GetAudit = 2,
    GetRepair = 3,
    PutRepair = 4,
    Delete = 5,
}

impl Action {
    pub fn from_i32(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::Put),
            1 => Ok(Self::Get),
            2 => Ok(Self::GetAudit),
            3 => Ok(Self::GetRepair),
            4 => Ok(Self::PutRepair),
            5 => Ok(Self::Delete),
            other => Err(Error::UnknownAction(other)),
        }
    }

    /// Whether this action stores data on the node.
    pub fn is_put(&self) -> bool {
        matches!(self, Action::Put | Action::PutRepair)
    }

    /// Whether this action reads data from the node.
    pub fn is_get(&self) -> bool {
        matches!(self, Action::Get | Action::GetAudit | Action::GetRepair)
    }
}

/// Hash algorithm an uplink asks the node to use for the piece hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum PieceHashAlgorithm {
    #[default]
    Sha256 = 0,
    Sha3_256 = 1,
}

impl PieceHashAlgorithm {
    pub fn from_i32(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::Sha256),
            1 => Ok(Self::Sha3_256),
            other => Err(Error::UnknownHashAlgorithm(other)),
        }
    }
}

/// Satellite-signed authorization for one operation on one piece.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLimit {
    pub satellite_id: NodeId,
    pub uplink_public_key: [u8; 32],
    pub storage_node_id: NodeId,
    pub piece_id: PieceId,
    pub action: Action,
    pub serial_number: SerialNumber,
    pub order_creation: DateTime<Utc>,
    pub order_expiration: DateTime<Utc>,
    pub piece_expiration: Option<DateTime<Utc>>,
    pub limit: u64,
    pub satellite_signature: Vec<u8>,
}

impl OrderLimit {
    /// The canonical bytes covered by the satellite signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(192);
        buf.extend_from_slice(self.satellite_id.as_bytes());
        buf.extend_from_slice(&self.uplink_public_key);
        buf.extend_from_slice(self.storage_node_id.as_bytes());
        buf.extend_from_slice(self.piece_id.as_bytes());
        buf.extend_from_slice(&(self.action as i32).to_be_bytes());
        buf.extend_from_slice(&self.serial_number.0);
        buf.extend_from_slice(&self.order_creation.timestamp_micros().to_be_bytes());
        buf.extend_from_slice(&self.order_expiration.timestamp_micros().to_be_bytes());
        let piece_exp = self
            .piece_expiration
            .map(|t| t.timestamp_micros())
            .unwrap_or(0);
        buf.extend_from_slice(&piece_exp.to_be_bytes());
        buf.extend_from_slice(&self.limit.to_be_bytes());
        buf
    }

    pub fn sign(&mut self, satellite_key: &SigningKey) {
        self.satellite_signature = satellite_key.sign(&self.signing_bytes()).to_vec();
    }

    pub fn verify(&self, satellite_key: &VerifyingKey) -> Result<()> {
        let sig = Signature::from_slice(&self.satellite_signature)
            .map_err(|e| Error::MalformedSignature(e.to_string()))?;
        satellite_key
            .verify(&self.signing_bytes(), &sig)
            .map_err(|_| Error::BadSignature)
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now > self.order_expiration
    }
}

/// Uplink-signed acknowledgement covering bytes transferred so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub serial_number: SerialNumber,
    pub amount: u64,
    pub uplink_signature: Vec<u8>,
}

impl Order {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24);
        buf.extend_from_slice(&self.serial_number.0);
        buf.extend_from_slice(&self.amount.to_be_bytes());
        buf
    }

    pub fn sign(serial_number: SerialNumber, amount: u64, uplink_key: &SigningKey) -> Self {
        let mut order = Self {
            serial_number,
            amount,
            uplink_signature: Vec::new(),
        };
        order.uplink_signature = uplink_key.sign(&order.signing_bytes()).to_vec();
        order
    }

    pub fn verify(&self, uplink_public_key: &[u8; 32]) -> Result<()> {
        let key = VerifyingKey::from_bytes(uplink_public_key)
            .map_err(|e| Error::MalformedSignature(e.to_string()))?;
        let sig = Signature::from_slice(&self.uplink_signature)
            .map_err(|e| Error::MalformedSignature(e.to_string()))?;
        key.verify(&self.signing_bytes(), &sig)
            .map_err(|_| Error::BadSignature)
    }
}

/// Signed statement about a stored piece's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceHash {
    pub piece_id: PieceId,
    pub hash: Vec<u8>,
    pub hash_algorithm: PieceHashAlgorithm,
    pub piece_size: u64,
    pub timestamp: DateTime<Utc>,
    pub signature: Vec<u8>,
}

impl PieceHash {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(96);
        buf.extend_from_slice(self.piece_id.as_bytes());
        buf.extend_from_slice(&self.hash);
        buf.extend_from_slice(&(self.hash_algorithm as i32).to_be_bytes());
        buf.extend_from_slice(&self.piece_size.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.timestamp_micros().to_be_bytes());
        buf
    }

    pub fn sign(&mut self, key: &SigningKey) {
        self.signature = key.sign(&self.signing_bytes()).to_vec();
    }

    pub fn verify(&self, key: &VerifyingKey) -> Result<()> {
        let sig = Signature::from_slice(&self.signature)
            .map_err(|e| Error::MalformedSignature(e.to_string()))?;
        key.verify(&self.signing_bytes(), &sig)
            .map_err(|_| Error::BadSignature)
    }
}
