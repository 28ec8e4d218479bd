//! SQLite-backed overlay storage.
//!
//! Runtime sqlx queries over two tables: `nodes` (one dossier per node,
//! upserted by check-ins) and `node_events` (append-only event log). The
//! event log is the only reputation history; dossiers carry current state.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use galaxy_core::NodeId;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::error::{Error, Result};
use crate::types::{NodeDossier, NodeEvent, NodeEventKind};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS nodes (
    node_id BLOB PRIMARY KEY,
    address TEXT NOT NULL,
    last_ip_port TEXT NOT NULL,
    last_net TEXT NOT NULL,
    country_code TEXT NOT NULL DEFAULT '',
    version TEXT NOT NULL DEFAULT '',
    free_disk INTEGER NOT NULL DEFAULT 0,
    operator_email TEXT,
    created_at TEXT NOT NULL,
    last_contact_success TEXT,
    last_contact_failure TEXT,
    vetted_at TEXT,
    disqualified TEXT,
    unknown_audit_suspended TEXT,
    offline_suspended TEXT,
    exit_initiated_at TEXT,
    exit_finished_at TEXT,
    exit_success INTEGER NOT NULL DEFAULT 0,
    contained INTEGER NOT NULL DEFAULT 0,
    last_offline_email TEXT,
    last_software_update_email TEXT
);

CREATE TABLE IF NOT EXISTS node_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id BLOB NOT NULL,
    email TEXT,
    event INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
"#;

pub struct OverlayDb {
    pool: SqlitePool,
}

impl OverlayDb {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))
                .map_err(sqlx::Error::from)?
                .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;
        Self::apply_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::apply_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn apply_schema(pool: &SqlitePool) -> Result<()> {
        for statement in SCHEMA.split(';') {
            if statement.trim().is_empty() {
                continue;
            }
            sqlx::query(statement).execute(pool).await?;
        }
        Ok(())
    }

    fn row_to_dossier(row: &SqliteRow) -> Result<NodeDossier> {
        let node_id: Vec<u8> = row.try_get("node_id")?;
        Ok(NodeDossier {
            node_id: NodeId::from_bytes(&node_id)
                .map_err(|e| Error::InvalidCheckIn(e.to_string()))?,
            address: row.try_get("address")?,
            last_ip_port: row.try_get("last_ip_port")?,
            last_net: row.try_get("last_net")?,
            country_code: row.try_get("country_code")?,
            version: row.try_get("version")?,
            free_disk: row.try_get("free_disk")?,
            operator_email: row.try_get("operator_email")?,
            created_at: row.try_get("created_at")?,
            last_contact_success: row.try_get("last_contact_success")?,
            last_contact_failure: row.try_get("last_contact_failure")?,
            vetted_at: row.try_get("vetted_at")?,
            disqualified: row.try_get("disqualified")?,
            unknown_audit_suspended: row.try_get("unknown_audit_suspended")?,
            offline_suspended: row.try_get("offline_suspended")?,
            exit_initiated_at: row.try_get("exit_initiated_at")?,
            exit_finished_at: row.try_get("exit_finished_at")?,
            exit_success: row.try_get::<i64, _>("exit_success")? != 0,
            contained: row.try_get::<i64, _>("contained")? != 0,
            last_offline_email: row.try_get("last_offline_email")?,
            last_software_update_email: row.try_get("last_software_update_email")?,
        })
    }

    pub async fn get(&self, node_id: &NodeId) -> Result<Option<NodeDossier>> {
        let row = sqlx::query("SELECT * FROM nodes WHERE node_id = ?")
            .bind(node_id.to_vec())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_dossier).transpose()
    }

    pub async fn insert_dossier(&self, dossier: &NodeDossier) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO nodes (
                node_id, address, last_ip_port, last_net, country_code, version,
                free_disk, operator_email, created_at, last_contact_success,
                last_contact_failure, vetted_at, disqualified,
                unknown_audit_suspended, offline_suspended, exit_initiated_at,
                exit_finished_at, exit_success, contained, last_offline_email,
                last_software_update_email
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(dossier.node_id.to_vec())
        .bind(&dossier.address)
        .bind(&dossier.last_ip_port)
        .bind(&dossier.last_net)
        .bind(&dossier.country_code)
        .bind(&dossier.version)
        .bind(dossier.free_disk)
        .bind(&dossier.operator_email)
        .bind(dossier.created_at)
        .bind(dossier.last_contact_success)
        .bind(dossier.last_contact_failure)
        .bind(dossier.vetted_at)
        .bind(dossier.disqualified)
        .bind(dossier.unknown_audit_suspended)
        .bind(dossier.offline_suspended)
        .bind(dossier.exit_initiated_at)
        .bind(dossier.exit_finished_at)
        .bind(dossier.exit_success as i64)
        .bind(dossier.contained as i64)
        .bind(dossier.last_offline_email)
        .bind(dossier.last_software_update_email)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_dossier(&self, dossier: &NodeDossier) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE nodes SET
                address = ?, last_ip_port = ?, last_net = ?, country_code = ?,
                version = ?, free_disk = ?, operator_email = ?,
                last_contact_success = ?, last_contact_failure = ?,
                vetted_at = ?, disqualified = ?, unknown_audit_suspended = ?,
                offline_suspended = ?, exit_initiated_at = ?, exit_finished_at = ?,
                exit_success = ?, contained = ?, last_offline_email = ?,
                last_software_update_email = ?
            WHERE node_id = ?
            "#,
        )
        .bind(&dossier.address)
        .bind(&dossier.last_ip_port)
        .bind(&dossier.last_net)
        .bind(&dossier.country_code)
        .bind(&dossier.version)
        .bind(dossier.free_disk)
        .bind(&dossier.operator_email)
        .bind(dossier.last_contact_success)
        .bind(dossier.last_contact_failure)
        .bind(dossier.vetted_at)
        .bind(dossier.disqualified)
        .bind(dossier.unknown_audit_suspended)
        .bind(dossier.offline_suspended)
        .bind(dossier.exit_initiated_at)
        .bind(dossier.exit_finished_at)
        .bind(dossier.exit_success as i64)
        .bind(dossier.contained as i64)
        .bind(dossier.last_offline_email)
        .bind(dossier.last_software_update_email)
        .bind(dossier.node_id.to_vec())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn all(&self) -> Result<Vec<NodeDossier>> {
        let rows = sqlx::query("SELECT * FROM nodes")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_dossier).collect()
    }

    pub async fn exiting_nodes(&self) -> Result<Vec<NodeDossier>> {
        let rows = sqlx::query(
            "SELECT * FROM nodes WHERE exit_initiated_at IS NOT NULL AND exit_finished_at IS NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_dossier).collect()
    }

    pub async fn insert_event(&self, event: &NodeEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO node_events (node_id, email, event, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(event.node_id.to_vec())
        .bind(&event.email)
        .bind(event.kind as i64)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn events_for(&self, node_id: &NodeId) -> Result<Vec<NodeEvent>> {
        let rows = sqlx::query(
            "SELECT node_id, email, event, created_at FROM node_events WHERE node_id = ? ORDER BY id",
        )
        .bind(node_id.to_vec())
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Vec<u8> = row.try_get("node_id")?;
            let kind: i64 = row.try_get("event")?;
            events.push(NodeEvent {
                node_id: NodeId::from_bytes(&id)
                    .map_err(|e| Error::InvalidCheckIn(e.to_string()))?,
                email: row.try_get("email")?,
                kind: NodeEventKind::from_i64(kind)
                    .ok_or_else(|| Error::InvalidCheckIn(format!("bad event kind {kind}")))?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(events)
    }

    /// Latest event of a kind for a node, used for event cooldowns.
    pub async fn last_event_of_kind(
        &self,
        node_id: &NodeId,
        kind: NodeEventKind,
    ) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT created_at FROM node_events WHERE node_id = ? AND event = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(node_id.to_vec())
        .bind(kind as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("created_at")?),
            None => None,
        })
    }
}
