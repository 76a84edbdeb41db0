//! Agent registry: registration, heartbeats, resource-limit accounting and
//! stale-agent cleanup.

use std::sync::Arc;

use async_trait::async_trait;
use pd_db::{decode_json_opt, encode_json_opt, now_ms, Database};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::Row;
use tracing::{info, instrument};

use crate::{
    activity::{ActivitySink, NewActivity},
    error::{CoreError, CoreResult, ErrorCode},
    events::{EventKind, EventSink},
    locks::LockReleaser,
};

const MAX_AGENT_ID_LEN: usize = 100;
const DEFAULT_KIND: &str = "cli";
const DEFAULT_MAX_SERVICES: i64 = 50;
const DEFAULT_MAX_LOCKS: i64 = 20;

/// Limit-accounting capability handed to the services and locks components.
#[async_trait]
pub trait LimitGate: Send + Sync {
    async fn can_claim_service(&self, agent_id: &str) -> CoreResult<Allowance>;
    async fn can_acquire_lock(&self, agent_id: &str) -> CoreResult<Allowance>;
}

#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    pub name: Option<String>,
    pub pid: Option<i64>,
    pub kind: Option<String>,
    pub max_services: Option<i64>,
    pub max_locks: Option<i64>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: String,
    pub name: Option<String>,
    pub pid: Option<i64>,
    #[serde(rename = "type")]
    pub kind: String,
    pub registered_at: i64,
    pub last_heartbeat: i64,
    pub max_services: i64,
    pub max_locks: i64,
    pub metadata: Option<Value>,
    pub is_active: bool,
    pub time_since_heartbeat: i64,
}

/// Result of a limit check. Unregistered agents are unrestricted and carry
/// no counts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Allowance {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Allowance {
    fn unrestricted() -> Self {
        Self {
            allowed: true,
            current: None,
            max: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCleanup {
    pub cleaned: i64,
    pub released_locks: i64,
}

pub struct AgentRegistry {
    db: Database,
    activity: Arc<dyn ActivitySink>,
    events: Arc<dyn EventSink>,
    agent_ttl_ms: i64,
}

impl AgentRegistry {
    pub fn new(
        db: Database,
        activity: Arc<dyn ActivitySink>,
        events: Arc<dyn EventSink>,
        agent_ttl_ms: i64,
    ) -> Self {
        Self {
            db,
            activity,
            events,
            agent_ttl_ms,
        }
    }

    /// Registers (or re-registers) an agent. A fresh row stamps
    /// `registered_at`; re-registration preserves it and updates the rest.
    #[instrument(skip(self, opts))]
    pub async fn register(&self, id: &str, opts: RegisterOptions) -> CoreResult<AgentInfo> {
        validate_agent_id(id)?;
        let now = now_ms();

        let existing = self.fetch(id).await?;
        match existing {
            None => {
                sqlx::query(
                    "INSERT INTO agents
                     (id, name, pid, kind, registered_at, last_heartbeat,
                      max_services, max_locks, metadata)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(id)
                .bind(&opts.name)
                .bind(opts.pid)
                .bind(opts.kind.as_deref().unwrap_or(DEFAULT_KIND))
                .bind(now)
                .bind(now)
                .bind(opts.max_services.unwrap_or(DEFAULT_MAX_SERVICES))
                .bind(opts.max_locks.unwrap_or(DEFAULT_MAX_LOCKS))
                .bind(encode_json_opt(opts.metadata.as_ref()))
                .execute(self.db.pool())
                .await?;
                info!(agent = id, "agent registered");
            }
            Some(previous) => {
                sqlx::query(
                    "UPDATE agents SET name = ?, pid = ?, kind = ?, last_heartbeat = ?,
                     max_services = ?, max_locks = ?, metadata = ? WHERE id = ?",
                )
                .bind(opts.name.as_ref().or(previous.name.as_ref()))
                .bind(opts.pid.or(previous.pid))
                .bind(opts.kind.as_deref().unwrap_or(&previous.kind))
                .bind(now)
                .bind(opts.max_services.unwrap_or(previous.max_services))
                .bind(opts.max_locks.unwrap_or(previous.max_locks))
                .bind(
                    encode_json_opt(opts.metadata.as_ref())
                        .or_else(|| previous.metadata.as_ref().map(Value::to_string)),
                )
                .bind(id)
                .execute(self.db.pool())
                .await?;
            }
        }

        self.activity
            .record(EventKind::AgentRegister, NewActivity {
                agent_id: Some(id.to_owned()),
                target_id: Some(id.to_owned()),
                ..NewActivity::default()
            })
            .await;
        self.events
            .emit(EventKind::AgentRegister, json!({ "agentId": id }), Some(id))
            .await;

        self.fetch(id)
            .await?
            .ok_or_else(|| CoreError::internal("agent missing after register"))
    }

    /// Refreshes the liveness stamp, auto-registering unknown agents.
    pub async fn heartbeat(&self, id: &str, pid: Option<i64>) -> CoreResult<AgentInfo> {
        validate_agent_id(id)?;
        let updated = sqlx::query(
            "UPDATE agents SET last_heartbeat = ?, pid = COALESCE(?, pid) WHERE id = ?",
        )
        .bind(now_ms())
        .bind(pid)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        if updated.rows_affected() == 0 {
            return self
                .register(id, RegisterOptions {
                    pid,
                    ..RegisterOptions::default()
                })
                .await;
        }

        // Heartbeats fan out to webhooks but stay out of the activity log;
        // they would crowd out everything else at normal cadence.
        self.events
            .emit(EventKind::AgentHeartbeat, json!({ "agentId": id }), Some(id))
            .await;

        self.fetch(id)
            .await?
            .ok_or_else(|| CoreError::internal("agent missing after heartbeat"))
    }

    /// Removes the agent row. A missing agent is not an error.
    pub async fn unregister(&self, id: &str) -> CoreResult<bool> {
        let deleted = sqlx::query("DELETE FROM agents WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?
            .rows_affected();

        if deleted > 0 {
            self.activity
                .record(EventKind::AgentUnregister, NewActivity {
                    agent_id: Some(id.to_owned()),
                    target_id: Some(id.to_owned()),
                    ..NewActivity::default()
                })
                .await;
            self.events
                .emit(EventKind::AgentUnregister, json!({ "agentId": id }), Some(id))
                .await;
        }
        Ok(deleted > 0)
    }

    pub async fn get(&self, id: &str) -> CoreResult<Option<AgentInfo>> {
        self.fetch(id).await
    }

    /// Agents ordered by most-recent heartbeat; `active_only` keeps rows
    /// inside the liveness window.
    pub async fn list(&self, active_only: bool) -> CoreResult<Vec<AgentInfo>> {
        let rows = if active_only {
            sqlx::query("SELECT * FROM agents WHERE last_heartbeat > ? ORDER BY last_heartbeat DESC")
                .bind(now_ms() - self.agent_ttl_ms)
                .fetch_all(self.db.pool())
                .await?
        } else {
            sqlx::query("SELECT * FROM agents ORDER BY last_heartbeat DESC")
                .fetch_all(self.db.pool())
                .await?
        };
        rows.into_iter()
            .map(|row| map_agent(row, self.agent_ttl_ms))
            .collect()
    }

    /// Removes every agent whose heartbeat is older than the liveness
    /// window, force-releasing the locks each one still owned.
    #[instrument(skip(self, locks))]
    pub async fn cleanup(&self, locks: &dyn LockReleaser) -> CoreResult<AgentCleanup> {
        let cutoff = now_ms() - self.agent_ttl_ms;
        let stale: Vec<String> =
            sqlx::query_scalar("SELECT id FROM agents WHERE last_heartbeat < ?")
                .bind(cutoff)
                .fetch_all(self.db.pool())
                .await?;

        let mut released_locks = 0;
        for id in &stale {
            released_locks += locks.force_release_owned(id).await?;
            sqlx::query("DELETE FROM agents WHERE id = ?")
                .bind(id)
                .execute(self.db.pool())
                .await?;
            self.activity
                .record(EventKind::AgentStale, NewActivity {
                    agent_id: Some(id.clone()),
                    target_id: Some(id.clone()),
                    details: Some("removed by stale-agent cleanup".into()),
                    ..NewActivity::default()
                })
                .await;
            self.events
                .emit(EventKind::AgentStale, json!({ "agentId": id }), Some(id.as_str()))
                .await;
        }

        if !stale.is_empty() {
            info!(cleaned = stale.len(), released_locks, "stale agents removed");
        }
        Ok(AgentCleanup {
            cleaned: stale.len() as i64,
            released_locks,
        })
    }

    async fn fetch(&self, id: &str) -> CoreResult<Option<AgentInfo>> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        row.map(|row| map_agent(row, self.agent_ttl_ms)).transpose()
    }

    async fn allowance(&self, agent_id: &str, which: Limit) -> CoreResult<Allowance> {
        let Some(agent) = self.fetch(agent_id).await? else {
            // Anonymous clients are unrestricted.
            return Ok(Allowance::unrestricted());
        };

        let current: i64 = match which {
            Limit::Services => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM services WHERE agent_id = ? AND status = 'assigned'",
                )
                .bind(agent_id)
                .fetch_one(self.db.pool())
                .await?
            }
            Limit::Locks => {
                sqlx::query_scalar("SELECT COUNT(*) FROM locks WHERE owner = ? AND expires_at > ?")
                    .bind(agent_id)
                    .bind(now_ms())
                    .fetch_one(self.db.pool())
                    .await?
            }
        };
        let max = match which {
            Limit::Services => agent.max_services,
            Limit::Locks => agent.max_locks,
        };

        let allowed = current < max;
        Ok(Allowance {
            allowed,
            current: Some(current),
            max: Some(max),
            error: (!allowed).then(|| match which {
                Limit::Services => format!("agent {agent_id} is at its service limit"),
                Limit::Locks => format!("agent {agent_id} is at its lock limit"),
            }),
        })
    }
}

#[derive(Clone, Copy)]
enum Limit {
    Services,
    Locks,
}

#[async_trait]
impl LimitGate for AgentRegistry {
    async fn can_claim_service(&self, agent_id: &str) -> CoreResult<Allowance> {
        self.allowance(agent_id, Limit::Services).await
    }

    async fn can_acquire_lock(&self, agent_id: &str) -> CoreResult<Allowance> {
        self.allowance(agent_id, Limit::Locks).await
    }
}

fn validate_agent_id(id: &str) -> CoreResult<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_AGENT_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(CoreError::with_details(
            ErrorCode::AgentIdInvalid,
            "agent id must be 1-100 characters of [A-Za-z0-9._:-]",
            json!({ "agentId": id }),
        ))
    }
}

fn map_agent(row: sqlx::sqlite::SqliteRow, agent_ttl_ms: i64) -> CoreResult<AgentInfo> {
    let last_heartbeat: i64 = row.try_get("last_heartbeat").map_err(CoreError::from)?;
    let elapsed = now_ms() - last_heartbeat;
    Ok(AgentInfo {
        id: row.try_get("id").map_err(CoreError::from)?,
        name: row.try_get("name").map_err(CoreError::from)?,
        pid: row.try_get("pid").map_err(CoreError::from)?,
        kind: row.try_get("kind").map_err(CoreError::from)?,
        registered_at: row.try_get("registered_at").map_err(CoreError::from)?,
        last_heartbeat,
        max_services: row.try_get("max_services").map_err(CoreError::from)?,
        max_locks: row.try_get("max_locks").map_err(CoreError::from)?,
        metadata: decode_json_opt(row.try_get("metadata").map_err(CoreError::from)?),
        is_active: elapsed < agent_ttl_ms,
        time_since_heartbeat: elapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{noop_activity, noop_events, AGENT_TTL_FOR_TESTS};

    async fn registry() -> AgentRegistry {
        let db = Database::open_in_memory().await.unwrap();
        AgentRegistry::new(db, noop_activity(), noop_events(), AGENT_TTL_FOR_TESTS)
    }

    #[tokio::test]
    async fn register_validates_the_id() {
        let agents = registry().await;
        for bad in ["", "has space", "tab\there", &"x".repeat(101)] {
            let err = agents
                .register(bad, RegisterOptions::default())
                .await
                .unwrap_err();
            assert_eq!(err.code, ErrorCode::AgentIdInvalid);
        }
        // Colons, dots and dashes are all legal.
        agents
            .register("build.bot:ci-1", RegisterOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reregistration_preserves_registered_at() {
        let agents = registry().await;
        let first = agents
            .register("a1", RegisterOptions {
                max_locks: Some(5),
                ..RegisterOptions::default()
            })
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = agents
            .register("a1", RegisterOptions {
                name: Some("renamed".into()),
                ..RegisterOptions::default()
            })
            .await
            .unwrap();

        assert_eq!(second.registered_at, first.registered_at);
        assert_eq!(second.name.as_deref(), Some("renamed"));
        // Unspecified limits survive the re-register.
        assert_eq!(second.max_locks, 5);
        assert!(second.last_heartbeat >= first.last_heartbeat);
    }

    #[tokio::test]
    async fn heartbeat_auto_registers() {
        let agents = registry().await;
        let info = agents.heartbeat("fresh", Some(1234)).await.unwrap();
        assert_eq!(info.pid, Some(1234));
        assert!(info.is_active);

        let info = agents.heartbeat("fresh", None).await.unwrap();
        assert_eq!(info.pid, Some(1234));
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let agents = registry().await;
        agents.register("a1", RegisterOptions::default()).await.unwrap();
        assert!(agents.unregister("a1").await.unwrap());
        assert!(!agents.unregister("a1").await.unwrap());
        assert!(agents.get("a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_agents_are_unrestricted() {
        let agents = registry().await;
        let allowance = agents.can_acquire_lock("ghost").await.unwrap();
        assert!(allowance.allowed);
        assert!(allowance.current.is_none());
        assert!(allowance.max.is_none());
    }
}
