//! The account-freeze chore.
//!
//! Runs on a timer over users with unpaid invoices and escalates:
//!
//! ```text
//! unpaid, unfrozen      --invoice older than warn grace-->   BillingWarning
//! BillingWarning        --warning older than warn grace-->   BillingFreeze
//! BillingFreeze         --freeze older than freeze grace-->  PendingDeletion
//! invoice paid          ----------------------------------->  warning/freeze cleared
//! ```
//!
//! `ViolationFreeze` and `LegalFreeze` are administrative: they suppress all
//! billing transitions and paying does not clear them. Deleted users are
//! skipped but keep their markers. Every transition fires exactly one
//! analytics event; the chore is idempotent across runs so a missed tick is
//! harmless.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use galaxy_core::Clock;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id BLOB PRIMARY KEY,
    email TEXT NOT NULL,
    status INTEGER NOT NULL DEFAULT 0,
    external_payments INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS invoices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id BLOB NOT NULL,
    status INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS freeze_events (
    user_id BLOB NOT NULL,
    kind INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    days_till_escalation INTEGER,
    PRIMARY KEY (user_id, kind)
);
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum UserStatus {
    Active = 0,
    PendingDeletion = 1,
    Deleted = 2,
}

impl UserStatus {
    fn from_i64(value: i64) -> UserStatus {
        match value {
            1 => UserStatus::PendingDeletion,
            2 => UserStatus::Deleted,
            _ => UserStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum FreezeKind {
    BillingWarning = 0,
    BillingFreeze = 1,
    ViolationFreeze = 2,
    LegalFreeze = 3,
}

/// Current freeze markers for one user.
#[derive(Debug, Clone, Default)]
pub struct UserFreezes {
    pub billing_warning: Option<FreezeEvent>,
    pub billing_freeze: Option<FreezeEvent>,
    pub violation_freeze: Option<FreezeEvent>,
    pub legal_freeze: Option<FreezeEvent>,
}

#[derive(Debug, Clone)]
pub struct FreezeEvent {
    pub created_at: DateTime<Utc>,
    pub days_till_escalation: Option<i64>,
}

/// Emits tracking events; exactly one per transition.
pub trait Analytics: Send + Sync {
    fn track(&self, user_id: Uuid, event: &str);
}

/// Analytics sink that drops everything, for wiring without a vendor.
pub struct NoopAnalytics;

impl Analytics for NoopAnalytics {
    fn track(&self, _user_id: Uuid, _event: &str) {}
}

#[derive(Debug, Clone)]
pub struct FreezeConfig {
    pub billing_warn_grace_period: Duration,
    pub billing_freeze_grace_period: Duration,
    /// Skip users paying through the blockchain-scan path.
    pub exclude_external_payments: bool,
}

impl Default for FreezeConfig {
    fn default() -> Self {
        Self {
            billing_warn_grace_period: Duration::days(15),
            billing_freeze_grace_period: Duration::days(30),
            exclude_external_payments: false,
        }
    }
}

pub struct AccountFreezeService {
    pool: SqlitePool,
}

impl AccountFreezeService {
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

    pub async fn create_user(
        &self,
        id: Uuid,
        email: &str,
        external_payments: bool,
    ) -> Result<()> {
        sqlx::query("INSERT INTO users (id, email, status, external_payments) VALUES (?, ?, 0, ?)")
            .bind(id.as_bytes().to_vec())
            .bind(email)
            .bind(external_payments as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn user_status(&self, id: Uuid) -> Result<UserStatus> {
        let row = sqlx::query("SELECT status FROM users WHERE id = ?")
            .bind(id.as_bytes().to_vec())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::UserNotFound)?;
        Ok(UserStatus::from_i64(row.try_get("status")?))
    }

    pub async fn set_user_status(&self, id: Uuid, status: UserStatus) -> Result<()> {
        sqlx::query("UPDATE users SET status = ? WHERE id = ?")
            .bind(status as i64)
            .bind(id.as_bytes().to_vec())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_invoice(&self, user_id: Uuid, created_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("INSERT INTO invoices (user_id, status, created_at) VALUES (?, 0, ?)")
            .bind(user_id.as_bytes().to_vec())
            .bind(created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn pay_invoices(&self, user_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE invoices SET status = 1 WHERE user_id = ?")
            .bind(user_id.as_bytes().to_vec())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Administrative freezes; applied outside the chore.
    pub async fn violation_freeze_user(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.upsert_event(user_id, FreezeKind::ViolationFreeze, now, None)
            .await
    }

    pub async fn legal_freeze_user(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.upsert_event(user_id, FreezeKind::LegalFreeze, now, None)
            .await
    }

    pub async fn freezes(&self, user_id: Uuid) -> Result<UserFreezes> {
        let rows = sqlx::query(
            "SELECT kind, created_at, days_till_escalation FROM freeze_events WHERE user_id = ?",
        )
        .bind(user_id.as_bytes().to_vec())
        .fetch_all(&self.pool)
        .await?;

        let mut freezes = UserFreezes::default();
        for row in rows {
            let kind: i64 = row.try_get("kind")?;
            let event = FreezeEvent {
                created_at: row.try_get("created_at")?,
                days_till_escalation: row.try_get("days_till_escalation")?,
            };
            match kind {
                0 => freezes.billing_warning = Some(event),
                1 => freezes.billing_freeze = Some(event),
                2 => freezes.violation_freeze = Some(event),
                3 => freezes.legal_freeze = Some(event),
                _ => {}
            }
        }
        Ok(freezes)
    }

    async fn upsert_event(
        &self,
        user_id: Uuid,
        kind: FreezeKind,
        now: DateTime<Utc>,
        days_till_escalation: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO freeze_events (user_id, kind, created_at, days_till_escalation)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(user_id.as_bytes().to_vec())
        .bind(kind as i64)
        .bind(now)
        .bind(days_till_escalation)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_event(&self, user_id: Uuid, kind: FreezeKind) -> Result<bool> {
        let result = sqlx::query("DELETE FROM freeze_events WHERE user_id = ? AND kind = ?")
            .bind(user_id.as_bytes().to_vec())
            .bind(kind as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn null_escalation(&self, user_id: Uuid, kind: FreezeKind) -> Result<()> {
        sqlx::query(
            "UPDATE freeze_events SET days_till_escalation = NULL WHERE user_id = ? AND kind = ?",
        )
        .bind(user_id.as_bytes().to_vec())
        .bind(kind as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Users with at least one open invoice.
    async fn users_with_open_invoices(&self) -> Result<Vec<(Uuid, UserStatus, bool, DateTime<Utc>)>> {
        let rows = sqlx::query(
            r#"
            SELECT u.id, u.status, u.external_payments, MIN(i.created_at) AS oldest
            FROM users u JOIN invoices i ON i.user_id = u.id
            WHERE i.status = 0
            GROUP BY u.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut users = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Vec<u8> = row.try_get("id")?;
            let status: i64 = row.try_get("status")?;
            let external: i64 = row.try_get("external_payments")?;
            users.push((
                Uuid::from_slice(&id).unwrap_or_default(),
                UserStatus::from_i64(status),
                external != 0,
                row.try_get("oldest")?,
            ));
        }
        Ok(users)
    }

    /// Billing-frozen or warned users with no open invoices left.
    async fn billing_frozen_users_fully_paid(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT f.user_id
            FROM freeze_events f
            WHERE f.kind IN (0, 1)
              AND NOT EXISTS (
                SELECT 1 FROM invoices i WHERE i.user_id = f.user_id AND i.status = 0
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut users = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Vec<u8> = row.try_get("user_id")?;
            users.push(Uuid::from_slice(&id).unwrap_or_default());
        }
        Ok(users)
    }
}

pub struct AccountFreezeChore {
    service: Arc<AccountFreezeService>,
    analytics: Arc<dyn Analytics>,
    config: FreezeConfig,
    clock: Arc<dyn Clock>,
}

impl AccountFreezeChore {
    pub fn new(
        service: Arc<AccountFreezeService>,
        analytics: Arc<dyn Analytics>,
        config: FreezeConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            service,
            analytics,
            config,
            clock,
        }
    }

    /// One chore tick. Safe to re-run at the same instant: all transitions
    /// check the current state first, so each fires at most once.
    pub async fn run_once(&self) -> Result<()> {
        let now = self.clock.now();
        let mut warned = 0u64;
        let mut frozen = 0u64;
        let mut escalated = 0u64;
        let mut unfrozen = 0u64;

        for (user_id, status, external, oldest_open) in
            self.service.users_with_open_invoices().await?
        {
            if status == UserStatus::Deleted {
                continue;
            }
            if self.config.exclude_external_payments && external {
                continue;
            }

            let freezes = self.service.freezes(user_id).await?;
            // administrative freezes suppress every billing transition
            if freezes.violation_freeze.is_some() || freezes.legal_freeze.is_some() {
                continue;
            }

            if let Some(billing_freeze) = &freezes.billing_freeze {
                if now - billing_freeze.created_at >= self.config.billing_freeze_grace_period
                    && status != UserStatus::PendingDeletion
                {
                    self.service
                        .set_user_status(user_id, UserStatus::PendingDeletion)
                        .await?;
                    self.service
                        .null_escalation(user_id, FreezeKind::BillingFreeze)
                        .await?;
                    self.analytics.track(user_id, "account marked for deletion");
                    escalated += 1;
                }
            } else if let Some(warning) = &freezes.billing_warning {
                if now - warning.created_at >= self.config.billing_warn_grace_period {
                    self.service
                        .upsert_event(
                            user_id,
                            FreezeKind::BillingFreeze,
                            now,
                            Some(self.config.billing_freeze_grace_period.num_days()),
                        )
                        .await?;
                    self.analytics.track(user_id, "account frozen");
                    frozen += 1;
                }
            } else if now - oldest_open >= self.config.billing_warn_grace_period {
                self.service
                    .upsert_event(user_id, FreezeKind::BillingWarning, now, None)
                    .await?;
                self.analytics.track(user_id, "account freeze warning");
                warned += 1;
            }
        }

        // paying clears the billing markers, never the administrative ones
        for user_id in self.service.billing_frozen_users_fully_paid().await? {
            let removed_warning = self
                .service
                .remove_event(user_id, FreezeKind::BillingWarning)
                .await?;
            let removed_freeze = self
                .service
                .remove_event(user_id, FreezeKind::BillingFreeze)
                .await?;
            if removed_warning || removed_freeze {
                self.analytics.track(user_id, "account unfrozen");
                unfrozen += 1;
            }
        }

        info!(warned, frozen, escalated, unfrozen, "account freeze tick done");
        Ok(())
    }
}
