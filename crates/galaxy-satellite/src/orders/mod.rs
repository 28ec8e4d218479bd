//! Order limit issuing.
//!
//! Every piecestore operation is authorized by a satellite-signed order
//! limit naming one piece on one node. Uploads and repairs get one limit
//! per selected node, each with its own serial number and the piece id
//! derived from the segment's root, so a node can never replay a limit
//! against a different piece.

use std::sync::Arc;

use chrono::Duration;
use ed25519_dalek::SigningKey;
use galaxy_core::{Action, Clock, NodeId, OrderLimit, PieceId, SerialNumber};

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct OrdersConfig {
    /// How long issued limits stay valid.
    pub order_expiration: Duration,
}

impl Default for OrdersConfig {
    fn default() -> Self {
        Self {
            order_expiration: Duration::hours(24),
        }
    }
}

/// One addressed limit: which node it is for and the signed ticket.
#[derive(Debug, Clone)]
pub struct AddressedOrderLimit {
    pub node_id: NodeId,
    pub limit: OrderLimit,
}

pub struct OrdersService {
    satellite_id: NodeId,
    signing_key: SigningKey,
    config: OrdersConfig,
    clock: Arc<dyn Clock>,
}

impl OrdersService {
    pub fn new(
        satellite_id: NodeId,
        signing_key: SigningKey,
        config: OrdersConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            satellite_id,
            signing_key,
            config,
            clock,
        }
    }

    pub fn satellite_id(&self) -> NodeId {
        self.satellite_id
    }

    /// Issue one signed limit per `(piece_number, node)` pair. The per-piece
    /// byte limit bounds what the node may accept or serve for this serial.
    pub fn create_order_limits(
        &self,
        action: Action,
        root_piece_id: PieceId,
        pieces: &[(u16, NodeId)],
        uplink_public_key: [u8; 32],
        per_piece_limit: u64,
        piece_expiration: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<AddressedOrderLimit>> {
        let now = self.clock.now();
        let mut limits = Vec::with_capacity(pieces.len());
        for (piece_number, node_id) in pieces {
            let mut limit = OrderLimit {
                satellite_id: self.satellite_id,
                uplink_public_key,
                storage_node_id: *node_id,
                piece_id: root_piece_id.derive(*piece_number),
                action,
                serial_number: SerialNumber::random(),
                order_creation: now,
                order_expiration: now + self.config.order_expiration,
                piece_expiration,
                limit: per_piece_limit,
                satellite_signature: Vec::new(),
            };
            limit.sign(&self.signing_key);
            limits.push(AddressedOrderLimit {
                node_id: *node_id,
                limit,
            });
        }
        Ok(limits)
    }
}
