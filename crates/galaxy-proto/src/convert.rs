//! Conversions between wire messages and core types.
//!
//! The proto structs are byte-bag mirrors of the signed core types; every
//! conversion validates lengths and enum values so the endpoint only ever
//! handles well-formed values.

use chrono::{DateTime, TimeZone, Utc};
use galaxy_core::{
    Action, NodeId, Order, OrderLimit, PieceHash, PieceHashAlgorithm, PieceId, SerialNumber,
};
use thiserror::Error as ThisError;

use crate::piecestore as pb;

pub type Result<T> = std::result::Result<T, ConvertError>;

/// Malformed wire values detected while mapping onto core types.
#[derive(Debug, ThisError)]
pub enum ConvertError {
    #[error("missing piece id")]
    MissingPieceId,

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

pub fn timestamp_to_micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

pub fn micros_to_timestamp(micros: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(micros).single().unwrap_or_default()
}

fn node_id(bytes: &[u8], what: &str) -> Result<NodeId> {
    NodeId::from_bytes(bytes).map_err(|_| ConvertError::InvalidMessage(format!("bad {what} id")))
}

fn serial(bytes: &[u8]) -> Result<SerialNumber> {
    let arr: [u8; 16] = bytes
        .try_into()
        .map_err(|_| ConvertError::InvalidMessage("bad serial number".to_string()))?;
    Ok(SerialNumber(arr))
}

pub fn order_limit_from_proto(proto: &pb::OrderLimit) -> Result<OrderLimit> {
    if proto.piece_id.is_empty() {
        return Err(ConvertError::MissingPieceId);
    }
    let uplink_public_key: [u8; 32] = proto
        .uplink_public_key
        .as_slice()
        .try_into()
        .map_err(|_| ConvertError::InvalidMessage("bad uplink public key".to_string()))?;
    Ok(OrderLimit {
        satellite_id: node_id(&proto.satellite_id, "satellite")?,
        uplink_public_key,
        storage_node_id: node_id(&proto.storage_node_id, "storage node")?,
        piece_id: PieceId::from_bytes(&proto.piece_id).map_err(|_| ConvertError::MissingPieceId)?,
        action: Action::from_i32(proto.action)
            .map_err(|_| ConvertError::InvalidMessage(format!("bad action {}", proto.action)))?,
        serial_number: serial(&proto.serial_number)?,
        order_creation: micros_to_timestamp(proto.order_creation),
        order_expiration: micros_to_timestamp(proto.order_expiration),
        piece_expiration: if proto.piece_expiration == 0 {
            None
        } else {
            Some(micros_to_timestamp(proto.piece_expiration))
        },
        limit: proto.limit,
        satellite_signature: proto.satellite_signature.clone(),
    })
}

pub fn order_limit_to_proto(limit: &OrderLimit) -> pb::OrderLimit {
    pb::OrderLimit {
        satellite_id: limit.satellite_id.to_vec(),
        uplink_public_key: limit.uplink_public_key.to_vec(),
        storage_node_id: limit.storage_node_id.to_vec(),
        piece_id: limit.piece_id.to_vec(),
        action: limit.action as i32,
        serial_number: limit.serial_number.0.to_vec(),
        order_creation: timestamp_to_micros(limit.order_creation),
        order_expiration: timestamp_to_micros(limit.order_expiration),
        piece_expiration: limit
            .piece_expiration
            .map(timestamp_to_micros)
            .unwrap_or(0),
        limit: limit.limit,
        satellite_signature: limit.satellite_signature.clone(),
    }
}

pub fn order_from_proto(proto: &pb::Order) -> Result<Order> {
    Ok(Order {
        serial_number: serial(&proto.serial_number)?,
        amount: proto.amount,
        uplink_signature: proto.uplink_signature.clone(),
    })
}

pub fn piece_hash_from_proto(proto: &pb::PieceHash) -> Result<PieceHash> {
    Ok(PieceHash {
        piece_id: PieceId::from_bytes(&proto.piece_id).map_err(|_| ConvertError::MissingPieceId)?,
        hash: proto.hash.clone(),
        hash_algorithm: PieceHashAlgorithm::from_i32(proto.hash_algorithm)
            .map_err(|_| ConvertError::InvalidMessage("bad hash algorithm".to_string()))?,
        piece_size: proto.piece_size,
        timestamp: micros_to_timestamp(proto.timestamp),
        signature: proto.signature.clone(),
    })
}

pub fn piece_hash_to_proto(hash: &PieceHash) -> pb::PieceHash {
    pb::PieceHash {
        piece_id: hash.piece_id.to_vec(),
        hash: hash.hash.clone(),
        hash_algorithm: hash.hash_algorithm as i32,
        piece_size: hash.piece_size,
        timestamp: timestamp_to_micros(hash.timestamp),
        signature: hash.signature.clone(),
    }
}
