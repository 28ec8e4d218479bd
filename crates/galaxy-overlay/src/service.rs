//! The overlay service: check-ins, reputation updates, and exit status.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use galaxy_core::{Clock, NodeId};
use tracing::{debug, info};

use crate::db::OverlayDb;
use crate::error::{Error, Result};
use crate::types::{
    ExitStatusRequest, NodeCheckIn, NodeDossier, NodeEvent, NodeEventKind, ReputationStatus,
    SelectedNode,
};

#[derive(Debug, Clone)]
pub struct Config {
    /// Nodes reporting a version below this trigger a BelowMinVersion event.
    pub minimum_version: String,
    /// How often the BelowMinVersion event may repeat per node.
    pub version_event_cooldown: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            minimum_version: String::new(),
            version_event_cooldown: Duration::hours(24),
        }
    }
}

pub struct Service {
    db: Arc<OverlayDb>,
    config: Config,
    clock: Arc<dyn Clock>,
}

impl Service {
    pub fn new(db: Arc<OverlayDb>, config: Config, clock: Arc<dyn Clock>) -> Self {
        Self { db, config, clock }
    }

    pub fn db(&self) -> &Arc<OverlayDb> {
        &self.db
    }

    /// Process one node check-in. Creates the dossier on first contact.
    /// `last_contact_success` only moves forward; a failure report never
    /// touches it. An offline-to-online transition clears the pending
    /// offline-email marker and emits an Online event.
    pub async fn check_in(&self, check_in: NodeCheckIn) -> Result<NodeDossier> {
        if check_in.address.is_empty() {
            return Err(Error::InvalidCheckIn("missing address".to_string()));
        }
        let now = self.clock.now();

        let mut dossier = match self.db.get(&check_in.node_id).await? {
            Some(existing) => existing,
            None => {
                let dossier = NodeDossier {
                    node_id: check_in.node_id,
                    address: check_in.address.clone(),
                    last_ip_port: check_in.last_ip_port.clone(),
                    last_net: check_in.last_net.clone(),
                    country_code: check_in.country_code.clone(),
                    version: check_in.version.clone(),
                    free_disk: check_in.free_disk,
                    operator_email: check_in.operator_email.clone(),
                    created_at: now,
                    last_contact_success: None,
                    last_contact_failure: None,
                    vetted_at: None,
                    disqualified: None,
                    unknown_audit_suspended: None,
                    offline_suspended: None,
                    exit_initiated_at: None,
                    exit_finished_at: None,
                    exit_success: false,
                    contained: false,
                    last_offline_email: None,
                    last_software_update_email: None,
                };
                self.db.insert_dossier(&dossier).await?;
                info!(node = %dossier.node_id, "new node checked in");
                dossier
            }
        };

        let was_online = dossier.is_online();

        dossier.address = check_in.address;
        dossier.last_ip_port = check_in.last_ip_port;
        dossier.last_net = check_in.last_net;
        dossier.country_code = check_in.country_code;
        dossier.version = check_in.version.clone();
        dossier.free_disk = check_in.free_disk;
        if check_in.operator_email.is_some() {
            dossier.operator_email = check_in.operator_email.clone();
        }

        if check_in.is_up {
            dossier.last_contact_success = Some(now);
            if !was_online {
                dossier.last_offline_email = None;
                self.emit(
                    &dossier,
                    check_in.operator_email.clone(),
                    NodeEventKind::Online,
                    now,
                )
                .await?;
            }
        } else {
            dossier.last_contact_failure = Some(now);
        }

        if !self.config.minimum_version.is_empty()
            && version_below(&check_in.version, &self.config.minimum_version)
        {
            let last = self
                .db
                .last_event_of_kind(&dossier.node_id, NodeEventKind::BelowMinVersion)
                .await?;
            let cooled_down = match last {
                Some(at) => now - at >= self.config.version_event_cooldown,
                None => true,
            };
            if cooled_down {
                self.emit(
                    &dossier,
                    check_in.operator_email,
                    NodeEventKind::BelowMinVersion,
                    now,
                )
                .await?;
            }
        }

        self.db.update_dossier(&dossier).await?;
        Ok(dossier)
    }

    /// Apply reputation timestamps and persist the accompanying events.
    /// Once a node has finished graceful exit, disqualification attempts are
    /// ignored.
    pub async fn update_reputation(
        &self,
        node_id: NodeId,
        email: Option<String>,
        status: ReputationStatus,
        events: Vec<NodeEventKind>,
    ) -> Result<NodeDossier> {
        let mut dossier = self
            .db
            .get(&node_id)
            .await?
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;

        let exit_finished = dossier.exit_finished_at.is_some();
        if !(exit_finished && status.disqualified.is_some()) {
            dossier.disqualified = status.disqualified;
        } else {
            debug!(node = %node_id, "ignoring disqualification after finished exit");
        }
        dossier.unknown_audit_suspended = status.unknown_audit_suspended;
        dossier.offline_suspended = status.offline_suspended;
        dossier.vetted_at = status.vetted_at;

        let now = self.clock.now();
        for kind in events {
            if exit_finished && kind == NodeEventKind::Disqualified {
                continue;
            }
            self.emit(&dossier, email.clone(), kind, now).await?;
        }

        self.db.update_dossier(&dossier).await?;
        Ok(dossier)
    }

    /// Mutate a node's graceful-exit status.
    pub async fn update_exit_status(&self, request: ExitStatusRequest) -> Result<NodeDossier> {
        let mut dossier = self
            .db
            .get(&request.node_id)
            .await?
            .ok_or_else(|| Error::NodeNotFound(request.node_id.to_string()))?;
        dossier.exit_initiated_at = request.exit_initiated_at;
        dossier.exit_finished_at = request.exit_finished_at;
        dossier.exit_success = request.exit_success;
        self.db.update_dossier(&dossier).await?;
        Ok(dossier)
    }

    pub async fn get(&self, node_id: &NodeId) -> Result<NodeDossier> {
        self.db
            .get(node_id)
            .await?
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))
    }

    pub async fn exiting_nodes(&self) -> Result<Vec<NodeDossier>> {
        self.db.exiting_nodes().await
    }

    /// Nodes currently usable for uploads, as slim selection views.
    pub async fn selectable_nodes(&self) -> Result<Vec<SelectedNode>> {
        Ok(self
            .db
            .all()
            .await?
            .iter()
            .filter(|d| d.is_selectable())
            .map(SelectedNode::from)
            .collect())
    }

    /// All dossiers, for the repair checker's reliability cache.
    pub async fn all_nodes(&self) -> Result<Vec<NodeDossier>> {
        self.db.all().await
    }

    async fn emit(
        &self,
        dossier: &NodeDossier,
        email: Option<String>,
        kind: NodeEventKind,
        now: DateTime<Utc>,
    ) -> Result<()> {
        debug!(node = %dossier.node_id, event = ?kind, "node event");
        self.db
            .insert_event(&NodeEvent {
                node_id: dossier.node_id,
                email: email.or_else(|| dossier.operator_email.clone()),
                kind,
                created_at: now,
            })
            .await
    }
}

/// Compare dotted version strings numerically, missing parts are zero.
fn version_below(version: &str, minimum: &str) -> bool {
    let parse = |s: &str| -> Vec<u64> {
        s.trim_start_matches('v')
            .split('.')
            .map(|p| p.parse().unwrap_or(0))
            .collect()
    };
    let a = parse(version);
    let b = parse(minimum);
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        if x != y {
            return x < y;
        }
    }
    false
}
