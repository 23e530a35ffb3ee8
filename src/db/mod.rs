//! Database persistence for copying sessions.
//!
//! Stores everything needed to resume after restart:
//! - The replication policy and its symbol filters
//! - Copying sessions (started/stopped, follower ids)
//! - The append-only outcome log, folded on load to one outcome per pair

#[cfg(test)]
pub mod memory;

use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use uuid::Uuid;

use crate::models::{AccountId, OutcomeEntry, OutcomeLog, ReplicationOutcome, ReplicationPolicy};

/// Persistence seen by the coordinator.
#[async_trait]
pub trait OutcomeStore: Send + Sync + 'static {
    async fn load_policy(&self) -> Result<Option<ReplicationPolicy>>;

    async fn save_policy(&self, policy: &ReplicationPolicy) -> Result<()>;

    /// Record that a copying session started (or was resumed).
    async fn begin_session(&self, session_id: Uuid, followers: &[AccountId]) -> Result<()>;

    async fn end_session(&self, session_id: Uuid) -> Result<()>;

    /// Append one outcome transition. Never rewrites earlier rows.
    async fn append_outcome(&self, entry: &OutcomeEntry) -> Result<()>;

    /// Latest outcome per (trade, follower) for a session.
    async fn load_outcomes(&self, session_id: Uuid) -> Result<Vec<OutcomeEntry>>;
}

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Stored copying session with its outcome count.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredSession {
    pub id: String,
    pub followers: String,
    pub started_at: String,
    pub stopped_at: Option<String>,
    pub outcome_count: i64,
}

/// Stored outcome log row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredOutcome {
    pub seq: i64,
    pub session_id: String,
    pub trade_id: String,
    pub follower: String,
    pub status: String,
    pub reason: Option<String>,
    pub reference: Option<String>,
    pub amount: Option<String>,
    pub recorded_at: String,
}

impl StoredOutcome {
    fn into_entry(self) -> Result<OutcomeEntry> {
        let outcome = ReplicationOutcome::from_parts(&self.status, self.reason, self.reference)
            .with_context(|| format!("Unknown outcome status '{}' at seq {}", self.status, self.seq))?;
        let amount = self
            .amount
            .as_deref()
            .map(Decimal::from_str)
            .transpose()
            .with_context(|| format!("Bad amount at seq {}", self.seq))?;

        Ok(OutcomeEntry {
            session_id: Uuid::parse_str(&self.session_id).context("Bad session id in outcome log")?,
            trade_id: self.trade_id,
            follower: AccountId::new(self.follower),
            outcome,
            amount,
            recorded_at: parse_timestamp(&self.recorded_at)?,
        })
    }
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Single-connection in-memory database; every pooled connection to
    /// `sqlite::memory:` would otherwise see its own empty database.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Single policy row
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS policy (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                copy_ratio TEXT NOT NULL,
                max_stake TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS symbol_filters (
                symbol TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS copy_sessions (
                id TEXT PRIMARY KEY,
                followers TEXT NOT NULL,
                started_at TEXT NOT NULL,
                stopped_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Append-only; the latest row per (session, trade, follower) wins
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outcome_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                trade_id TEXT NOT NULL,
                follower TEXT NOT NULL,
                status TEXT NOT NULL,
                reason TEXT,
                reference TEXT,
                amount TEXT,
                recorded_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_outcome_session ON outcome_log(session_id, trade_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Sessions ====================

    /// Most recent copying sessions first.
    pub async fn list_sessions(&self, limit: i64) -> Result<Vec<StoredSession>> {
        let sessions = sqlx::query_as::<_, StoredSession>(
            r#"
            SELECT s.id, s.followers, s.started_at, s.stopped_at,
                   (SELECT COUNT(DISTINCT o.trade_id || '/' || o.follower)
                      FROM outcome_log o WHERE o.session_id = s.id) AS outcome_count
            FROM copy_sessions s
            ORDER BY s.started_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list sessions")?;

        Ok(sessions)
    }

    /// Raw outcome log of a session in append order.
    pub async fn outcome_history(&self, session_id: Uuid) -> Result<Vec<StoredOutcome>> {
        let rows = sqlx::query_as::<_, StoredOutcome>(
            r#"
            SELECT seq, session_id, trade_id, follower, status, reason, reference, amount, recorded_at
            FROM outcome_log
            WHERE session_id = ?
            ORDER BY seq
            "#,
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to load outcome history")?;

        Ok(rows)
    }
}

#[async_trait]
impl OutcomeStore for Database {
    // ==================== Policy ====================

    async fn load_policy(&self) -> Result<Option<ReplicationPolicy>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT copy_ratio, max_stake FROM policy WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .context("Failed to load policy")?;

        let Some((copy_ratio, max_stake)) = row else {
            return Ok(None);
        };

        let mut policy = ReplicationPolicy::new(
            Decimal::from_str(&copy_ratio).context("Bad stored copy ratio")?,
            Decimal::from_str(&max_stake).context("Bad stored max stake")?,
        );

        let filters: Vec<(String, bool)> =
            sqlx::query_as("SELECT symbol, enabled FROM symbol_filters ORDER BY symbol")
                .fetch_all(&self.pool)
                .await
                .context("Failed to load symbol filters")?;
        for (symbol, enabled) in filters {
            policy.set_symbol(&symbol, enabled);
        }

        Ok(Some(policy))
    }

    async fn save_policy(&self, policy: &ReplicationPolicy) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO policy (id, copy_ratio, max_stake, updated_at)
            VALUES (1, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                copy_ratio = excluded.copy_ratio,
                max_stake = excluded.max_stake,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(policy.copy_ratio.to_string())
        .bind(policy.max_stake.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM symbol_filters")
            .execute(&mut *tx)
            .await?;
        for (symbol, enabled) in &policy.symbol_enabled {
            sqlx::query("INSERT INTO symbol_filters (symbol, enabled) VALUES (?, ?)")
                .bind(symbol)
                .bind(*enabled)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await.context("Failed to save policy")?;
        Ok(())
    }

    async fn begin_session(&self, session_id: Uuid, followers: &[AccountId]) -> Result<()> {
        let followers = followers
            .iter()
            .map(AccountId::as_str)
            .collect::<Vec<_>>()
            .join(",");

        sqlx::query(
            r#"
            INSERT INTO copy_sessions (id, followers, started_at)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                followers = excluded.followers,
                stopped_at = NULL
            "#,
        )
        .bind(session_id.to_string())
        .bind(followers)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to record session start")?;

        Ok(())
    }

    async fn end_session(&self, session_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE copy_sessions SET stopped_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to record session stop")?;

        Ok(())
    }

    // ==================== Outcomes ====================

    async fn append_outcome(&self, entry: &OutcomeEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outcome_log
                (session_id, trade_id, follower, status, reason, reference, amount, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.session_id.to_string())
        .bind(&entry.trade_id)
        .bind(entry.follower.as_str())
        .bind(entry.outcome.status())
        .bind(entry.outcome.reason())
        .bind(entry.outcome.reference())
        .bind(entry.amount.map(|a| a.to_string()))
        .bind(entry.recorded_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to append outcome")?;

        Ok(())
    }

    async fn load_outcomes(&self, session_id: Uuid) -> Result<Vec<OutcomeEntry>> {
        let entries = self
            .outcome_history(session_id)
            .await?
            .into_iter()
            .map(StoredOutcome::into_entry)
            .collect::<Result<Vec<_>>>()?;

        Ok(OutcomeLog::from_entries(entries).into_entries())
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Bad timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry(session_id: Uuid, trade: &str, follower: &str, outcome: ReplicationOutcome) -> OutcomeEntry {
        OutcomeEntry {
            session_id,
            trade_id: trade.to_string(),
            follower: AccountId::new(follower),
            outcome,
            amount: Some(dec!(12.5)),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_policy_round_trip() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.load_policy().await.unwrap().is_none());

        let policy = ReplicationPolicy::new(dec!(0.5), dec!(40))
            .with_symbol("EURUSD", true)
            .with_symbol("R_100", false);
        db.save_policy(&policy).await.unwrap();

        // Overwrite drops filters that are no longer present
        let policy = policy.with_symbol("GBPUSD", true);
        let mut trimmed = policy.clone();
        trimmed.symbol_enabled.remove("R_100");
        db.save_policy(&trimmed).await.unwrap();

        let loaded = db.load_policy().await.unwrap().unwrap();
        assert_eq!(loaded, trimmed);
        assert!(loaded.is_enabled("gbpusd"));
    }

    #[tokio::test]
    async fn test_outcomes_fold_to_latest() {
        let db = Database::in_memory().await.unwrap();
        let session = Uuid::new_v4();
        let other = Uuid::new_v4();

        db.append_outcome(&entry(session, "t1", "f1", ReplicationOutcome::Pending))
            .await
            .unwrap();
        db.append_outcome(&entry(
            session,
            "t1",
            "f2",
            ReplicationOutcome::Suppressed {
                reason: "symbol filtered".into(),
            },
        ))
        .await
        .unwrap();
        db.append_outcome(&entry(
            session,
            "t1",
            "f1",
            ReplicationOutcome::Sent {
                reference: Some("c-9".into()),
            },
        ))
        .await
        .unwrap();
        db.append_outcome(&entry(other, "t7", "f1", ReplicationOutcome::Pending))
            .await
            .unwrap();

        let loaded = db.load_outcomes(session).await.unwrap();
        assert_eq!(loaded.len(), 2);
        let f1 = loaded
            .iter()
            .find(|e| e.follower == AccountId::new("f1"))
            .unwrap();
        assert_eq!(f1.outcome.reference(), Some("c-9"));
        assert_eq!(f1.amount, Some(dec!(12.5)));

        // The raw log keeps every transition
        assert_eq!(db.outcome_history(session).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_sessions_listing() {
        let db = Database::in_memory().await.unwrap();
        let session = Uuid::new_v4();

        db.begin_session(session, &[AccountId::new("f1"), AccountId::new("f2")])
            .await
            .unwrap();
        db.append_outcome(&entry(session, "t1", "f1", ReplicationOutcome::Pending))
            .await
            .unwrap();
        db.append_outcome(&entry(
            session,
            "t1",
            "f1",
            ReplicationOutcome::Failed {
                reason: "timeout".into(),
            },
        ))
        .await
        .unwrap();
        db.end_session(session).await.unwrap();

        let sessions = db.list_sessions(10).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, session.to_string());
        assert_eq!(sessions[0].followers, "f1,f2");
        assert_eq!(sessions[0].outcome_count, 1);
        assert!(sessions[0].stopped_at.is_some());
    }
}
