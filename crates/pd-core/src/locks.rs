//! Advisory named locks with TTLs.
//!
//! A lock is *held* while its row exists and `expires_at` is in the future;
//! every public operation sweeps expired rows first, so a crashed owner can
//! wedge nothing for longer than its TTL.

use std::sync::Arc;

use async_trait::async_trait;
use pd_db::{decode_json_opt, encode_json_opt, is_unique_violation, now_ms, Database};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::Row;
use tracing::{debug, info, instrument};

use crate::{
    activity::{ActivitySink, NewActivity},
    agents::LimitGate,
    duration::{parse_duration, DurationInput},
    error::{CoreError, CoreResult, ErrorCode},
    events::{EventKind, EventSink},
    identity::Identity,
};

/// Force-release capability handed to the agent registry's stale cleanup.
#[async_trait]
pub trait LockReleaser: Send + Sync {
    async fn force_release_owned(&self, owner: &str) -> CoreResult<i64>;
}

#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    pub owner: Option<String>,
    pub pid: Option<i64>,
    pub ttl: Option<DurationInput>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub name: String,
    pub owner: String,
    pub pid: Option<i64>,
    pub acquired_at: i64,
    pub expires_at: i64,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockCheck {
    pub held: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquired_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockReleaseOutcome {
    pub released: bool,
}

pub struct LockRegistry {
    db: Database,
    activity: Arc<dyn ActivitySink>,
    events: Arc<dyn EventSink>,
    limits: Arc<dyn LimitGate>,
    default_ttl_ms: i64,
    max_ttl_ms: i64,
}

impl LockRegistry {
    pub fn new(
        db: Database,
        activity: Arc<dyn ActivitySink>,
        events: Arc<dyn EventSink>,
        limits: Arc<dyn LimitGate>,
        default_ttl_ms: i64,
        max_ttl_ms: i64,
    ) -> Self {
        Self {
            db,
            activity,
            events,
            limits,
            default_ttl_ms,
            max_ttl_ms,
        }
    }

    /// Acquires the named lock or fails with `LOCK_HELD` carrying the current
    /// holder. Owner defaults to `agent-<pid>`, TTL to five minutes, capped
    /// at one hour.
    #[instrument(skip(self, opts))]
    pub async fn acquire(&self, name: &str, opts: AcquireOptions) -> CoreResult<LockInfo> {
        Identity::parse(name)?;
        self.cleanup().await?;

        let pid = opts.pid.unwrap_or_else(|| std::process::id() as i64);
        let owner = opts.owner.unwrap_or_else(|| format!("agent-{pid}"));
        let ttl = self.resolve_ttl(opts.ttl.as_ref())?;

        let allowance = self.limits.can_acquire_lock(&owner).await?;
        if !allowance.allowed {
            return Err(CoreError::with_details(
                ErrorCode::ValidationError,
                allowance
                    .error
                    .unwrap_or_else(|| "agent lock limit reached".into()),
                json!({ "current": allowance.current, "max": allowance.max }),
            ));
        }

        let now = now_ms();
        let expires_at = now + ttl;
        let insert = sqlx::query(
            "INSERT INTO locks (name, owner, pid, acquired_at, expires_at, metadata)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(&owner)
        .bind(pid)
        .bind(now)
        .bind(expires_at)
        .bind(encode_json_opt(opts.metadata.as_ref()))
        .execute(self.db.pool())
        .await;

        if let Err(error) = insert {
            if is_unique_violation(&error) {
                let holder = self.fetch(name).await?;
                let details = holder.map(|h| {
                    json!({
                        "holder": h.owner,
                        "pid": h.pid,
                        "expiresAt": h.expires_at,
                    })
                });
                return Err(CoreError {
                    code: ErrorCode::LockHeld,
                    message: format!("lock '{name}' is already held"),
                    details,
                });
            }
            return Err(error.into());
        }

        self.activity
            .record(EventKind::LockAcquire, NewActivity {
                agent_id: Some(owner.clone()),
                target_id: Some(name.to_owned()),
                ..NewActivity::default()
            })
            .await;
        self.events
            .emit(
                EventKind::LockAcquire,
                json!({ "name": name, "owner": &owner, "expiresAt": expires_at }),
                Some(name),
            )
            .await;

        info!(lock = name, owner = %owner, "lock acquired");
        Ok(LockInfo {
            name: name.to_owned(),
            owner,
            pid: Some(pid),
            acquired_at: now,
            expires_at,
            metadata: opts.metadata,
        })
    }

    /// Releases the lock. Missing locks release nothing but still succeed;
    /// an owner mismatch fails `LOCK_NOT_FOUND` unless forced.
    #[instrument(skip(self))]
    pub async fn release(
        &self,
        name: &str,
        owner: Option<&str>,
        force: bool,
    ) -> CoreResult<LockReleaseOutcome> {
        self.cleanup().await?;

        let Some(current) = self.fetch(name).await? else {
            return Ok(LockReleaseOutcome { released: false });
        };

        if let Some(owner) = owner {
            if owner != current.owner && !force {
                return Err(CoreError::new(
                    ErrorCode::LockNotFound,
                    format!("lock '{name}' is not held by '{owner}'"),
                ));
            }
        }

        sqlx::query("DELETE FROM locks WHERE name = ?")
            .bind(name)
            .execute(self.db.pool())
            .await?;

        self.activity
            .record(EventKind::LockRelease, NewActivity {
                agent_id: Some(current.owner.clone()),
                target_id: Some(name.to_owned()),
                details: force.then(|| "force-released".to_owned()),
                ..NewActivity::default()
            })
            .await;
        self.events
            .emit(
                EventKind::LockRelease,
                json!({ "name": name, "owner": current.owner, "forced": force }),
                Some(name),
            )
            .await;

        Ok(LockReleaseOutcome { released: true })
    }

    /// Pushes the expiry out to `now + min(ttl, MAX_TTL)` for the holder.
    pub async fn extend(
        &self,
        name: &str,
        owner: Option<&str>,
        ttl: Option<&DurationInput>,
    ) -> CoreResult<LockInfo> {
        self.cleanup().await?;

        let Some(current) = self.fetch(name).await? else {
            return Err(CoreError::new(
                ErrorCode::LockNotFound,
                format!("lock '{name}' is not held"),
            ));
        };
        if let Some(owner) = owner {
            if owner != current.owner {
                return Err(CoreError::new(
                    ErrorCode::LockNotFound,
                    format!("lock '{name}' is not held by '{owner}'"),
                ));
            }
        }

        let ttl = self.resolve_ttl(ttl)?;
        let expires_at = now_ms() + ttl;
        sqlx::query("UPDATE locks SET expires_at = ? WHERE name = ?")
            .bind(expires_at)
            .bind(name)
            .execute(self.db.pool())
            .await?;

        self.activity
            .record(EventKind::LockExtend, NewActivity {
                agent_id: Some(current.owner.clone()),
                target_id: Some(name.to_owned()),
                ..NewActivity::default()
            })
            .await;

        Ok(LockInfo {
            expires_at,
            ..current
        })
    }

    pub async fn check(&self, name: &str) -> CoreResult<LockCheck> {
        self.cleanup().await?;
        Ok(match self.fetch(name).await? {
            Some(lock) => LockCheck {
                held: true,
                owner: Some(lock.owner),
                pid: lock.pid,
                acquired_at: Some(lock.acquired_at),
                expires_at: Some(lock.expires_at),
                metadata: lock.metadata,
            },
            None => LockCheck {
                held: false,
                owner: None,
                pid: None,
                acquired_at: None,
                expires_at: None,
                metadata: None,
            },
        })
    }

    /// Live locks, newest acquisition first, optionally per owner.
    pub async fn list(&self, owner: Option<&str>) -> CoreResult<Vec<LockInfo>> {
        self.cleanup().await?;
        let rows = match owner {
            Some(owner) => {
                sqlx::query(
                    "SELECT * FROM locks WHERE owner = ? AND expires_at > ?
                     ORDER BY acquired_at DESC",
                )
                .bind(owner)
                .bind(now_ms())
                .fetch_all(self.db.pool())
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM locks WHERE expires_at > ? ORDER BY acquired_at DESC")
                    .bind(now_ms())
                    .fetch_all(self.db.pool())
                    .await?
            }
        };
        rows.into_iter().map(map_lock).collect()
    }

    /// Deletes every expired row, logging one `lock.expire` per victim.
    pub async fn cleanup(&self) -> CoreResult<i64> {
        let expired = sqlx::query(
            "DELETE FROM locks WHERE expires_at <= ? RETURNING name, owner",
        )
        .bind(now_ms())
        .fetch_all(self.db.pool())
        .await?;

        for row in &expired {
            let name: String = row.try_get("name").map_err(CoreError::from)?;
            let owner: String = row.try_get("owner").map_err(CoreError::from)?;
            debug!(lock = %name, owner = %owner, "expired lock swept");
            self.activity
                .record(EventKind::LockExpire, NewActivity {
                    agent_id: Some(owner),
                    target_id: Some(name),
                    ..NewActivity::default()
                })
                .await;
        }
        Ok(expired.len() as i64)
    }

    fn resolve_ttl(&self, ttl: Option<&DurationInput>) -> CoreResult<i64> {
        let Some(input) = ttl else {
            return Ok(self.default_ttl_ms);
        };
        let Some(value) = parse_duration(input) else {
            return Err(CoreError::new(
                ErrorCode::InvalidTtl,
                "ttl must be a finite number of milliseconds or a duration string",
            ));
        };
        if value <= 0 {
            return Ok(self.default_ttl_ms);
        }
        Ok(value.min(self.max_ttl_ms))
    }

    async fn fetch(&self, name: &str) -> CoreResult<Option<LockInfo>> {
        let row = sqlx::query("SELECT * FROM locks WHERE name = ?")
            .bind(name)
            .fetch_optional(self.db.pool())
            .await?;
        row.map(map_lock).transpose()
    }
}

#[async_trait]
impl LockReleaser for LockRegistry {
    async fn force_release_owned(&self, owner: &str) -> CoreResult<i64> {
        let released = sqlx::query("DELETE FROM locks WHERE owner = ? RETURNING name")
            .bind(owner)
            .fetch_all(self.db.pool())
            .await?;
        for row in &released {
            let name: String = row.try_get("name").map_err(CoreError::from)?;
            self.activity
                .record(EventKind::LockRelease, NewActivity {
                    agent_id: Some(owner.to_owned()),
                    target_id: Some(name),
                    details: Some("released with stale owner".into()),
                    ..NewActivity::default()
                })
                .await;
        }
        Ok(released.len() as i64)
    }
}

fn map_lock(row: sqlx::sqlite::SqliteRow) -> CoreResult<LockInfo> {
    Ok(LockInfo {
        name: row.try_get("name").map_err(CoreError::from)?,
        owner: row.try_get("owner").map_err(CoreError::from)?,
        pid: row.try_get("pid").map_err(CoreError::from)?,
        acquired_at: row.try_get("acquired_at").map_err(CoreError::from)?,
        expires_at: row.try_get("expires_at").map_err(CoreError::from)?,
        metadata: decode_json_opt(row.try_get("metadata").map_err(CoreError::from)?),
    })
}
