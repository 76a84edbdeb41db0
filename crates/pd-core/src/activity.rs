//! Append-only activity log: the audit trail every component writes to.

use async_trait::async_trait;
use pd_db::{decode_json_opt, encode_json_opt, now_ms, Database};
use serde::Serialize;
use serde_json::Value;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::warn;

use crate::{
    error::{CoreError, CoreResult, ErrorCode},
    events::EventKind,
    identity::pattern_to_like,
};

const RECENT_LIMIT_MAX: i64 = 1_000;
const RECENT_LIMIT_DEFAULT: i64 = 100;
const RANGE_LIMIT_MAX: i64 = 10_000;
const RANGE_LIMIT_DEFAULT: i64 = 1_000;

/// One record to append. `details` is a short human string; `metadata` an
/// opaque JSON blob.
#[derive(Debug, Clone, Default)]
pub struct NewActivity {
    pub agent_id: Option<String>,
    pub target_id: Option<String>,
    pub details: Option<String>,
    pub metadata: Option<Value>,
}

impl NewActivity {
    pub fn target(target_id: impl Into<String>) -> Self {
        Self {
            target_id: Some(target_id.into()),
            ..Self::default()
        }
    }
}

/// Capability injected into the other components; failures are logged and
/// swallowed so a full activity table can never fail a claim or a publish.
#[async_trait]
pub trait ActivitySink: Send + Sync {
    async fn record(&self, kind: EventKind, entry: NewActivity);
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub id: i64,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub agent_id: Option<String>,
    pub target_id: Option<String>,
    pub details: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct RecentFilter {
    pub kind: Option<String>,
    pub agent_id: Option<String>,
    pub target_pattern: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeCount {
    #[serde(rename = "type")]
    pub kind: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySummary {
    pub summary: Vec<TypeCount>,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityStats {
    pub total_entries: i64,
    pub oldest_entry: Option<i64>,
    pub newest_entry: Option<i64>,
    pub retention_ms: i64,
    pub max_entries: i64,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityCleanup {
    pub deleted_old: i64,
    pub deleted_excess: i64,
    pub total: i64,
}

/// The component. Retention is time-based first, then count-based.
pub struct ActivityLog {
    db: Database,
    retention_ms: i64,
    max_entries: i64,
}

impl ActivityLog {
    pub fn new(db: Database, retention_ms: i64, max_entries: i64) -> Self {
        Self {
            db,
            retention_ms,
            max_entries,
        }
    }

    /// Appends one record and returns its millisecond timestamp.
    pub async fn log(&self, kind: EventKind, entry: NewActivity) -> CoreResult<i64> {
        let timestamp = now_ms();
        sqlx::query(
            "INSERT INTO activity (timestamp, kind, agent_id, target_id, details, metadata)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(timestamp)
        .bind(kind.as_str())
        .bind(&entry.agent_id)
        .bind(&entry.target_id)
        .bind(&entry.details)
        .bind(encode_json_opt(entry.metadata.as_ref()))
        .execute(self.db.pool())
        .await?;
        Ok(timestamp)
    }

    /// Newest-first slice with optional type/agent/target filters. The limit
    /// is clamped to `[1, 1000]`, defaulting to 100.
    pub async fn get_recent(&self, filter: RecentFilter) -> CoreResult<Vec<ActivityRecord>> {
        let limit = filter
            .limit
            .unwrap_or(RECENT_LIMIT_DEFAULT)
            .clamp(1, RECENT_LIMIT_MAX);

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, timestamp, kind, agent_id, target_id, details, metadata FROM activity",
        );
        let mut has_where = false;

        if let Some(kind) = &filter.kind {
            builder.push(" WHERE kind = ").push_bind(kind.clone());
            has_where = true;
        }
        if let Some(agent) = &filter.agent_id {
            builder.push(if has_where { " AND " } else { " WHERE " });
            has_where = true;
            builder.push("agent_id = ").push_bind(agent.clone());
        }
        if let Some(pattern) = &filter.target_pattern {
            let like = pattern_to_like(pattern).ok_or_else(|| {
                CoreError::new(ErrorCode::IdentityInvalid, "invalid target pattern")
            })?;
            builder.push(if has_where { " AND " } else { " WHERE " });
            builder.push("target_id LIKE ").push_bind(like);
        }

        builder.push(" ORDER BY id DESC LIMIT ").push_bind(limit);

        let rows = builder.build().fetch_all(self.db.pool()).await?;
        rows.into_iter().map(map_record).collect()
    }

    /// Ascending slice between two timestamps, limit clamped to `[1, 10000]`.
    pub async fn get_by_time_range(
        &self,
        start: i64,
        end: i64,
        limit: Option<i64>,
    ) -> CoreResult<Vec<ActivityRecord>> {
        let limit = limit.unwrap_or(RANGE_LIMIT_DEFAULT).clamp(1, RANGE_LIMIT_MAX);
        let rows = sqlx::query(
            "SELECT id, timestamp, kind, agent_id, target_id, details, metadata
             FROM activity WHERE timestamp >= ? AND timestamp <= ?
             ORDER BY id ASC LIMIT ?",
        )
        .bind(start)
        .bind(end)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;
        rows.into_iter().map(map_record).collect()
    }

    /// Per-type counts (descending) plus the grand total.
    pub async fn get_summary(&self, since: Option<i64>) -> CoreResult<ActivitySummary> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT kind, COUNT(*) AS count FROM activity");
        if let Some(since) = since {
            builder.push(" WHERE timestamp >= ").push_bind(since);
        }
        builder.push(" GROUP BY kind ORDER BY count DESC");

        let rows = builder.build().fetch_all(self.db.pool()).await?;
        let mut summary = Vec::with_capacity(rows.len());
        let mut total = 0;
        for row in rows {
            let count: i64 = row.try_get("count").map_err(CoreError::from)?;
            total += count;
            summary.push(TypeCount {
                kind: row.try_get("kind").map_err(CoreError::from)?,
                count,
            });
        }
        Ok(ActivitySummary { summary, total })
    }

    pub async fn get_stats(&self) -> CoreResult<ActivityStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, MIN(timestamp) AS oldest, MAX(timestamp) AS newest
             FROM activity",
        )
        .fetch_one(self.db.pool())
        .await?;
        Ok(ActivityStats {
            total_entries: row.try_get("total").map_err(CoreError::from)?,
            oldest_entry: row.try_get("oldest").map_err(CoreError::from)?,
            newest_entry: row.try_get("newest").map_err(CoreError::from)?,
            retention_ms: self.retention_ms,
            max_entries: self.max_entries,
        })
    }

    /// Deletes entries past the retention window, then trims the oldest
    /// excess rows if the table still exceeds `max_entries`. Idempotent.
    pub async fn cleanup(&self) -> CoreResult<ActivityCleanup> {
        let cutoff = now_ms() - self.retention_ms;
        let deleted_old = sqlx::query("DELETE FROM activity WHERE timestamp < ?")
            .bind(cutoff)
            .execute(self.db.pool())
            .await?
            .rows_affected() as i64;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM activity")
            .fetch_one(self.db.pool())
            .await?;

        let mut deleted_excess = 0;
        if total > self.max_entries {
            deleted_excess = sqlx::query(
                "DELETE FROM activity WHERE id IN
                 (SELECT id FROM activity ORDER BY id ASC LIMIT ?)",
            )
            .bind(total - self.max_entries)
            .execute(self.db.pool())
            .await?
            .rows_affected() as i64;
        }

        Ok(ActivityCleanup {
            deleted_old,
            deleted_excess,
            total: total - deleted_excess,
        })
    }
}

#[async_trait]
impl ActivitySink for ActivityLog {
    async fn record(&self, kind: EventKind, entry: NewActivity) {
        if let Err(error) = self.log(kind, entry).await {
            warn!(kind = %kind, %error, "failed to append activity record");
        }
    }
}

fn map_record(row: sqlx::sqlite::SqliteRow) -> CoreResult<ActivityRecord> {
    Ok(ActivityRecord {
        id: row.try_get("id").map_err(CoreError::from)?,
        timestamp: row.try_get("timestamp").map_err(CoreError::from)?,
        kind: row.try_get("kind").map_err(CoreError::from)?,
        agent_id: row.try_get("agent_id").map_err(CoreError::from)?,
        target_id: row.try_get("target_id").map_err(CoreError::from)?,
        details: row.try_get("details").map_err(CoreError::from)?,
        metadata: decode_json_opt(row.try_get("metadata").map_err(CoreError::from)?),
    })
}
