//! Service registry: identity-keyed port assignment with TTL expiry.
//!
//! Ports are a single shared namespace owned by this component. Allocation
//! is serialised through the store; the partial unique index on assigned
//! ports resolves any race at insert time, and the caller-supplied system
//! port set is only a best-effort skip list.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use pd_db::{decode_json_opt, encode_json_opt, is_unique_violation, now_ms, Database};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::Row;
use tokio::sync::broadcast;
use tracing::{info, instrument};

use crate::{
    activity::{ActivitySink, NewActivity},
    agents::LimitGate,
    duration::{parse_duration, DurationInput},
    error::{CoreError, CoreResult, ErrorCode},
    events::{EventKind, EventSink},
    identity::{pattern_to_like, Identity},
};

const ALLOCATION_RETRIES: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct ClaimOptions {
    pub port: Option<u16>,
    pub pid: Option<i64>,
    pub agent_id: Option<String>,
    pub health_url: Option<String>,
    pub metadata: Option<Value>,
    pub expires: Option<DurationInput>,
    /// Host-occupied ports reported by the caller; skipped during the scan.
    pub system_ports: HashSet<u16>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimOutcome {
    pub id: String,
    pub port: u16,
    pub existing: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub id: String,
    pub port: u16,
    pub pid: Option<i64>,
    pub status: String,
    pub agent_id: Option<String>,
    pub health_url: Option<String>,
    pub metadata: Option<Value>,
    pub created_at: i64,
    pub last_seen: i64,
    pub expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseOutcome {
    pub released: i64,
    pub released_ports: Vec<u16>,
}

pub struct ServiceRegistry {
    db: Database,
    activity: Arc<dyn ActivitySink>,
    events: Arc<dyn EventSink>,
    limits: Arc<dyn LimitGate>,
    range: (u16, u16),
    reserved: HashSet<u16>,
    watch_tx: broadcast::Sender<String>,
}

impl ServiceRegistry {
    pub fn new(
        db: Database,
        activity: Arc<dyn ActivitySink>,
        events: Arc<dyn EventSink>,
        limits: Arc<dyn LimitGate>,
        range: (u16, u16),
        reserved: HashSet<u16>,
    ) -> Self {
        let (watch_tx, _) = broadcast::channel(256);
        Self {
            db,
            activity,
            events,
            limits,
            range,
            reserved,
            watch_tx,
        }
    }

    /// Claimed-identity notifications; the transport's `wait` re-checks its
    /// snapshot on every received id.
    pub fn watch(&self) -> broadcast::Receiver<String> {
        self.watch_tx.subscribe()
    }

    /// Assigns a port to the identity. Claiming an identity that already
    /// holds an assigned port refreshes `last_seen` and returns the same
    /// port with `existing: true`; the port is never re-drawn.
    #[instrument(skip(self, opts))]
    pub async fn claim(&self, id: &str, opts: ClaimOptions) -> CoreResult<ClaimOutcome> {
        let identity = Identity::parse(id)?;
        let id = identity.canonical.as_str();

        if let Some(existing) = self.fetch(id).await? {
            if existing.status == "assigned" {
                sqlx::query("UPDATE services SET last_seen = ? WHERE id = ?")
                    .bind(now_ms())
                    .bind(id)
                    .execute(self.db.pool())
                    .await?;
                return Ok(ClaimOutcome {
                    id: id.to_owned(),
                    port: existing.port,
                    existing: true,
                });
            }
        }

        if let Some(agent_id) = &opts.agent_id {
            let allowance = self.limits.can_claim_service(agent_id).await?;
            if !allowance.allowed {
                return Err(CoreError::with_details(
                    ErrorCode::ValidationError,
                    allowance
                        .error
                        .unwrap_or_else(|| "agent service limit reached".into()),
                    json!({ "current": allowance.current, "max": allowance.max }),
                ));
            }
        }

        let now = now_ms();
        let expires_at = opts
            .expires
            .as_ref()
            .map(|input| now + parse_duration(input).unwrap_or(0));

        for _ in 0..ALLOCATION_RETRIES {
            let port = self.pick_port(opts.port, &opts.system_ports).await?;
            let result = self
                .upsert_assignment(id, port, &opts, now, expires_at)
                .await;
            match result {
                Ok(()) => {
                    self.activity
                        .record(EventKind::ServiceClaim, NewActivity {
                            agent_id: opts.agent_id.clone(),
                            target_id: Some(id.to_owned()),
                            details: Some(format!("port {port}")),
                            ..NewActivity::default()
                        })
                        .await;
                    self.events
                        .emit(
                            EventKind::ServiceClaim,
                            json!({ "id": id, "port": port }),
                            Some(id),
                        )
                        .await;
                    let _ = self.watch_tx.send(id.to_owned());
                    info!(service = id, port, "service claimed");
                    return Ok(ClaimOutcome {
                        id: id.to_owned(),
                        port,
                        existing: false,
                    });
                }
                Err(ClaimRace::PortTaken) => continue,
                Err(ClaimRace::IdTaken) => {
                    // Another process claimed this identity between our
                    // check and the insert; its port wins.
                    if let Some(existing) = self.fetch(id).await? {
                        return Ok(ClaimOutcome {
                            id: id.to_owned(),
                            port: existing.port,
                            existing: true,
                        });
                    }
                }
                Err(ClaimRace::Store(error)) => return Err(error),
            }
        }

        Err(CoreError::new(
            ErrorCode::PortExhausted,
            "no free port in range after repeated allocation races",
        ))
    }

    /// Releases one identity or, when the input carries a `*`, every
    /// assigned identity the pattern matches. Idempotent.
    #[instrument(skip(self))]
    pub async fn release(&self, id_or_pattern: &str) -> CoreResult<ReleaseOutcome> {
        let victims: Vec<(String, u16)> = if id_or_pattern.contains('*') {
            let like = pattern_to_like(id_or_pattern).ok_or_else(|| {
                CoreError::new(ErrorCode::IdentityInvalid, "invalid release pattern")
            })?;
            sqlx::query("SELECT id, port FROM services WHERE id LIKE ? AND status = 'assigned'")
                .bind(like)
                .fetch_all(self.db.pool())
                .await?
                .into_iter()
                .map(decode_id_port)
                .collect::<CoreResult<_>>()?
        } else {
            sqlx::query("SELECT id, port FROM services WHERE id = ? AND status = 'assigned'")
                .bind(id_or_pattern)
                .fetch_all(self.db.pool())
                .await?
                .into_iter()
                .map(decode_id_port)
                .collect::<CoreResult<_>>()?
        };

        let now = now_ms();
        for (id, port) in &victims {
            sqlx::query("UPDATE services SET status = 'released', last_seen = ? WHERE id = ?")
                .bind(now)
                .bind(id)
                .execute(self.db.pool())
                .await?;
            self.activity
                .record(EventKind::ServiceRelease, NewActivity {
                    target_id: Some(id.clone()),
                    details: Some(format!("port {port}")),
                    ..NewActivity::default()
                })
                .await;
            self.events
                .emit(
                    EventKind::ServiceRelease,
                    json!({ "id": id, "port": port }),
                    Some(id.as_str()),
                )
                .await;
        }

        Ok(ReleaseOutcome {
            released: victims.len() as i64,
            released_ports: victims.into_iter().map(|(_, port)| port).collect(),
        })
    }

    /// Rows matching an id or wildcard pattern; `*` alone matches all.
    pub async fn find(
        &self,
        id_or_pattern: &str,
        status: Option<&str>,
    ) -> CoreResult<Vec<ServiceInfo>> {
        let mut sql = String::from("SELECT * FROM services WHERE id ");
        let pattern;
        if id_or_pattern.contains('*') {
            pattern = pattern_to_like(id_or_pattern).ok_or_else(|| {
                CoreError::new(ErrorCode::IdentityInvalid, "invalid service pattern")
            })?;
            sql.push_str("LIKE ?");
        } else {
            pattern = id_or_pattern.to_owned();
            sql.push_str("= ?");
        }
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY id ASC");

        let mut query = sqlx::query(&sql).bind(pattern);
        if let Some(status) = status {
            query = query.bind(status);
        }
        let rows = query.fetch_all(self.db.pool()).await?;
        rows.into_iter().map(map_service).collect()
    }

    /// One service with its endpoints, or `SERVICE_NOT_FOUND`.
    pub async fn get(&self, id: &str) -> CoreResult<ServiceInfo> {
        let Some(mut service) = self.fetch(id).await? else {
            return Err(CoreError::new(
                ErrorCode::ServiceNotFound,
                format!("service '{id}' is not registered"),
            ));
        };

        let rows =
            sqlx::query("SELECT name, url FROM service_endpoints WHERE service_id = ? ORDER BY name")
                .bind(id)
                .fetch_all(self.db.pool())
                .await?;
        let mut endpoints = BTreeMap::new();
        for row in rows {
            let name: String = row.try_get("name").map_err(CoreError::from)?;
            let url: String = row.try_get("url").map_err(CoreError::from)?;
            endpoints.insert(name, url);
        }
        service.endpoints = Some(endpoints);
        Ok(service)
    }

    /// Upserts a named endpoint URL under an existing service.
    pub async fn set_endpoint(&self, id: &str, name: &str, url: &str) -> CoreResult<()> {
        if name.is_empty() || url.is_empty() {
            return Err(CoreError::validation("endpoint name and url are required"));
        }
        if self.fetch(id).await?.is_none() {
            return Err(CoreError::new(
                ErrorCode::ServiceNotFound,
                format!("service '{id}' is not registered"),
            ));
        }

        sqlx::query(
            "INSERT INTO service_endpoints (service_id, name, url) VALUES (?, ?, ?)
             ON CONFLICT(service_id, name) DO UPDATE SET url = excluded.url",
        )
        .bind(id)
        .bind(name)
        .bind(url)
        .execute(self.db.pool())
        .await?;

        self.activity
            .record(EventKind::ServiceEndpoint, NewActivity {
                target_id: Some(id.to_owned()),
                details: Some(name.to_owned()),
                ..NewActivity::default()
            })
            .await;
        Ok(())
    }

    /// Currently-assigned subset of the requested identities, for `wait`.
    pub async fn snapshot(&self, ids: &[String]) -> CoreResult<BTreeMap<String, u16>> {
        let mut present = BTreeMap::new();
        for id in ids {
            let row = sqlx::query(
                "SELECT port FROM services WHERE id = ? AND status = 'assigned'",
            )
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
            if let Some(row) = row {
                let port: i64 = row.try_get("port").map_err(CoreError::from)?;
                present.insert(id.clone(), port as u16);
            }
        }
        Ok(present)
    }

    /// Sweeps assigned services whose TTL has passed, releasing them.
    pub async fn cleanup(&self) -> CoreResult<i64> {
        let now = now_ms();
        let expired = sqlx::query(
            "SELECT id, port FROM services
             WHERE status = 'assigned' AND expires_at IS NOT NULL AND expires_at < ?",
        )
        .bind(now)
        .fetch_all(self.db.pool())
        .await?;

        let mut cleaned = 0;
        for row in expired {
            let (id, port) = decode_id_port(row)?;
            sqlx::query("UPDATE services SET status = 'released', last_seen = ? WHERE id = ?")
                .bind(now)
                .bind(&id)
                .execute(self.db.pool())
                .await?;
            cleaned += 1;
            self.activity
                .record(EventKind::ServiceExpire, NewActivity {
                    target_id: Some(id.clone()),
                    details: Some(format!("port {port}")),
                    ..NewActivity::default()
                })
                .await;
            self.events
                .emit(
                    EventKind::ServiceExpire,
                    json!({ "id": &id, "port": port }),
                    Some(id.as_str()),
                )
                .await;
        }
        Ok(cleaned)
    }

    async fn fetch(&self, id: &str) -> CoreResult<Option<ServiceInfo>> {
        let row = sqlx::query("SELECT * FROM services WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        row.map(map_service).transpose()
    }

    /// Lowest free port, honouring a viable preference first.
    async fn pick_port(
        &self,
        preferred: Option<u16>,
        system_ports: &HashSet<u16>,
    ) -> CoreResult<u16> {
        let assigned: HashSet<u16> =
            sqlx::query_scalar::<_, i64>("SELECT port FROM services WHERE status = 'assigned'")
                .fetch_all(self.db.pool())
                .await?
                .into_iter()
                .map(|p| p as u16)
                .collect();

        let free = |port: u16| {
            !assigned.contains(&port)
                && !self.reserved.contains(&port)
                && !system_ports.contains(&port)
        };

        if let Some(port) = preferred {
            if free(port) {
                return Ok(port);
            }
        }

        let (lo, hi) = self.range;
        (lo..=hi).find(|&p| free(p)).ok_or_else(|| {
            CoreError::with_details(
                ErrorCode::PortExhausted,
                format!("no free port in range {lo}-{hi}"),
                json!({ "range": [lo, hi] }),
            )
        })
    }

    async fn upsert_assignment(
        &self,
        id: &str,
        port: u16,
        opts: &ClaimOptions,
        now: i64,
        expires_at: Option<i64>,
    ) -> Result<(), ClaimRace> {
        // A released row for this identity is revived in place so the
        // one-row-per-id invariant holds; otherwise insert fresh.
        let revived = sqlx::query(
            "UPDATE services SET port = ?, pid = ?, status = 'assigned', agent_id = ?,
             health_url = ?, metadata = ?, last_seen = ?, expires_at = ?
             WHERE id = ? AND status = 'released'",
        )
        .bind(port as i64)
        .bind(opts.pid)
        .bind(&opts.agent_id)
        .bind(&opts.health_url)
        .bind(encode_json_opt(opts.metadata.as_ref()))
        .bind(now)
        .bind(expires_at)
        .bind(id)
        .execute(self.db.pool())
        .await
        .map_err(ClaimRace::from)?;
        if revived.rows_affected() > 0 {
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO services
             (id, port, pid, status, agent_id, health_url, metadata,
              created_at, last_seen, expires_at)
             VALUES (?, ?, ?, 'assigned', ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(port as i64)
        .bind(opts.pid)
        .bind(&opts.agent_id)
        .bind(&opts.health_url)
        .bind(encode_json_opt(opts.metadata.as_ref()))
        .bind(now)
        .bind(now)
        .bind(expires_at)
        .execute(self.db.pool())
        .await
        .map_err(|error| {
            if is_unique_violation(&error) {
                if let sqlx::Error::Database(db_err) = &error {
                    if db_err.message().contains("services.id") {
                        return ClaimRace::IdTaken;
                    }
                }
                ClaimRace::PortTaken
            } else {
                ClaimRace::Store(error.into())
            }
        })?;
        Ok(())
    }
}

enum ClaimRace {
    PortTaken,
    IdTaken,
    Store(CoreError),
}

impl From<sqlx::Error> for ClaimRace {
    fn from(error: sqlx::Error) -> Self {
        ClaimRace::Store(error.into())
    }
}

fn decode_id_port(row: sqlx::sqlite::SqliteRow) -> CoreResult<(String, u16)> {
    let id: String = row.try_get("id").map_err(CoreError::from)?;
    let port: i64 = row.try_get("port").map_err(CoreError::from)?;
    Ok((id, port as u16))
}

fn map_service(row: sqlx::sqlite::SqliteRow) -> CoreResult<ServiceInfo> {
    let port: i64 = row.try_get("port").map_err(CoreError::from)?;
    Ok(ServiceInfo {
        id: row.try_get("id").map_err(CoreError::from)?,
        port: port as u16,
        pid: row.try_get("pid").map_err(CoreError::from)?,
        status: row.try_get("status").map_err(CoreError::from)?,
        agent_id: row.try_get("agent_id").map_err(CoreError::from)?,
        health_url: row.try_get("health_url").map_err(CoreError::from)?,
        metadata: decode_json_opt(row.try_get("metadata").map_err(CoreError::from)?),
        created_at: row.try_get("created_at").map_err(CoreError::from)?,
        last_seen: row.try_get("last_seen").map_err(CoreError::from)?,
        expires_at: row.try_get("expires_at").map_err(CoreError::from)?,
        endpoints: None,
    })
}
