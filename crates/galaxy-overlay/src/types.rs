//! Overlay record types.

use chrono::{DateTime, Utc};
use galaxy_core::NodeId;
use serde::{Deserialize, Serialize};

/// Everything the overlay knows about one storage node. Dossiers are created
/// on first check-in and never deleted, only flagged.
#[derive(Debug, Clone)]
pub struct NodeDossier {
    pub node_id: NodeId,
    pub address: String,
    pub last_ip_port: String,
    /// The /24 subnet of the last contact address.
    pub last_net: String,
    pub country_code: String,
    pub version: String,
    pub free_disk: i64,
    pub operator_email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_contact_success: Option<DateTime<Utc>>,
    pub last_contact_failure: Option<DateTime<Utc>>,
    pub vetted_at: Option<DateTime<Utc>>,
    pub disqualified: Option<DateTime<Utc>>,
    pub unknown_audit_suspended: Option<DateTime<Utc>>,
    pub offline_suspended: Option<DateTime<Utc>>,
    pub exit_initiated_at: Option<DateTime<Utc>>,
    pub exit_finished_at: Option<DateTime<Utc>>,
    pub exit_success: bool,
    pub contained: bool,
    pub last_offline_email: Option<DateTime<Utc>>,
    pub last_software_update_email: Option<DateTime<Utc>>,
}

impl NodeDossier {
    /// A node counts as online when its last success is more recent than its
    /// last failure.
    pub fn is_online(&self) -> bool {
        match (self.last_contact_success, self.last_contact_failure) {
            (Some(success), Some(failure)) => success > failure,
            (Some(_), None) => true,
            _ => false,
        }
    }

    pub fn is_exiting(&self) -> bool {
        self.exit_initiated_at.is_some() && self.exit_finished_at.is_none()
    }

    /// Usable for uploads: online, vetted or not, and not disqualified,
    /// suspended, or on the way out.
    pub fn is_selectable(&self) -> bool {
        self.disqualified.is_none()
            && self.unknown_audit_suspended.is_none()
            && self.offline_suspended.is_none()
            && self.exit_initiated_at.is_none()
            && self.is_online()
    }
}

/// Periodic report a node sends about itself.
#[derive(Debug, Clone)]
pub struct NodeCheckIn {
    pub node_id: NodeId,
    pub address: String,
    pub last_ip_port: String,
    pub last_net: String,
    pub country_code: String,
    pub version: String,
    pub free_disk: i64,
    pub operator_email: Option<String>,
    pub is_up: bool,
}

/// Reputation timestamps applied in one update.
#[derive(Debug, Clone, Default)]
pub struct ReputationStatus {
    pub disqualified: Option<DateTime<Utc>>,
    pub unknown_audit_suspended: Option<DateTime<Utc>>,
    pub offline_suspended: Option<DateTime<Utc>>,
    pub vetted_at: Option<DateTime<Utc>>,
}

/// Exit status mutation for a node.
#[derive(Debug, Clone)]
pub struct ExitStatusRequest {
    pub node_id: NodeId,
    pub exit_initiated_at: Option<DateTime<Utc>>,
    pub exit_finished_at: Option<DateTime<Utc>>,
    pub exit_success: bool,
}

/// Addressed events emitted by check-in and reputation changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum NodeEventKind {
    Online = 0,
    Offline = 1,
    BelowMinVersion = 2,
    Disqualified = 3,
    UnknownAuditSuspended = 4,
    UnknownAuditUnsuspended = 5,
    OfflineSuspended = 6,
    OfflineUnsuspended = 7,
    Vetted = 8,
}

impl NodeEventKind {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Online),
            1 => Some(Self::Offline),
            2 => Some(Self::BelowMinVersion),
            3 => Some(Self::Disqualified),
            4 => Some(Self::UnknownAuditSuspended),
            5 => Some(Self::UnknownAuditUnsuspended),
            6 => Some(Self::OfflineSuspended),
            7 => Some(Self::OfflineUnsuspended),
            8 => Some(Self::Vetted),
            _ => None,
        }
    }
}

/// A persisted node event.
#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub node_id: NodeId,
    pub email: Option<String>,
    pub kind: NodeEventKind,
    pub created_at: DateTime<Utc>,
}

/// Slim node view used by selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedNode {
    pub id: NodeId,
    pub last_net: String,
    pub last_ip_port: String,
    pub country_code: String,
    pub vetted: bool,
}

impl From<&NodeDossier> for SelectedNode {
    fn from(dossier: &NodeDossier) -> Self {
        SelectedNode {
            id: dossier.node_id,
            last_net: dossier.last_net.clone(),
            last_ip_port: dossier.last_ip_port.clone(),
            country_code: dossier.country_code.clone(),
            vetted: dossier.vetted_at.is_some(),
        }
    }
}
