//! Webhooks: registration with an SSRF guard, event/pattern matching, and a
//! queued HMAC-signed delivery pipeline with retry.
//!
//! Deliveries never run on the caller's path: `trigger` only persists a
//! delivery row and enqueues it; dedicated workers drain the bounded queue
//! and do the outbound HTTP.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use pd_db::{now_ms, Database};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::Sha256;
use sqlx::Row;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use url::{Host, Url};
use uuid::Uuid;

use crate::{
    activity::{ActivitySink, NewActivity},
    error::{CoreError, CoreResult, ErrorCode},
    events::{EventKind, EventSink},
    identity::Identity,
};

type HmacSha256 = Hmac<Sha256>;

const MAX_FILTER_LEN: usize = 100;
const RESPONSE_BODY_LIMIT: usize = 1_000;

pub const HEADER_EVENT: &str = "X-PortDaddy-Event";
pub const HEADER_DELIVERY: &str = "X-PortDaddy-Delivery";
pub const HEADER_TIMESTAMP: &str = "X-PortDaddy-Timestamp";
pub const HEADER_SIGNATURE: &str = "X-PortDaddy-Signature";

/// Tunables for the engine; defaults match production behaviour.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub max_webhooks: i64,
    pub max_attempts: i64,
    pub request_timeout: Duration,
    pub backoff_base_ms: u64,
    pub queue_capacity: usize,
    pub delivery_retention_ms: i64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_webhooks: 100,
            max_attempts: 5,
            request_timeout: Duration::from_secs(10),
            backoff_base_ms: 1_000,
            queue_capacity: 1_000,
            delivery_retention_ms: 86_400_000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WebhookOptions {
    pub events: Vec<String>,
    pub filter_pattern: Option<String>,
    pub secret: Option<String>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct WebhookPatch {
    pub url: Option<String>,
    pub events: Option<Vec<String>>,
    pub filter_pattern: Option<String>,
    pub secret: Option<String>,
    pub active: Option<bool>,
}

/// Registration state. Secrets never leave the store; callers only see
/// whether one is configured.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookInfo {
    pub id: String,
    pub url: String,
    pub events: Vec<String>,
    pub filter_pattern: Option<String>,
    pub has_secret: bool,
    pub active: bool,
    pub success_count: i64,
    pub failure_count: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerOutcome {
    pub triggered: i64,
}

#[derive(Debug, Clone)]
struct DeliveryJob {
    delivery_id: String,
}

pub struct WebhookEngine {
    db: Database,
    activity: Arc<dyn ActivitySink>,
    client: reqwest::Client,
    queue_tx: mpsc::Sender<DeliveryJob>,
    queue_rx: Mutex<Option<mpsc::Receiver<DeliveryJob>>>,
    config: WebhookConfig,
}

impl WebhookEngine {
    pub fn new(db: Database, activity: Arc<dyn ActivitySink>, config: WebhookConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            db,
            activity,
            client,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            config,
        }
    }

    /// Registers a webhook after URL, event, pattern and capacity checks.
    #[instrument(skip(self, opts))]
    pub async fn register(&self, url: &str, opts: WebhookOptions) -> CoreResult<WebhookInfo> {
        validate_target_url(url)?;
        let events = normalize_events(opts.events)?;
        if let Some(pattern) = &opts.filter_pattern {
            validate_filter_pattern(pattern)?;
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM webhooks")
            .fetch_one(self.db.pool())
            .await?;
        if count >= self.config.max_webhooks {
            return Err(CoreError::validation(format!(
                "webhook limit reached ({})",
                self.config.max_webhooks
            )));
        }

        let id = format!("wh-{}", Uuid::new_v4().simple());
        let events_json = serde_json::to_string(&events).map_err(|e| CoreError::internal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO webhooks
             (id, url, events, filter_pattern, secret, active, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(url)
        .bind(events_json)
        .bind(&opts.filter_pattern)
        .bind(&opts.secret)
        .bind(opts.active.unwrap_or(true))
        .bind(now_ms())
        .execute(self.db.pool())
        .await?;

        info!(webhook = %id, url, "webhook registered");
        self.get(&id)
            .await?
            .ok_or_else(|| CoreError::internal("webhook missing after insert"))
    }

    /// Applies a partial update, re-running the same validation as register.
    pub async fn update(&self, id: &str, patch: WebhookPatch) -> CoreResult<WebhookInfo> {
        let Some(current) = self.get(id).await? else {
            return Err(CoreError::validation(format!("webhook '{id}' does not exist")));
        };

        let url = match patch.url {
            Some(url) => {
                validate_target_url(&url)?;
                url
            }
            None => current.url,
        };
        let events = match patch.events {
            Some(events) => normalize_events(events)?,
            None => current.events,
        };
        let filter_pattern = match patch.filter_pattern {
            Some(pattern) => {
                validate_filter_pattern(&pattern)?;
                Some(pattern)
            }
            None => current.filter_pattern,
        };

        let events_json = serde_json::to_string(&events).map_err(|e| CoreError::internal(e.to_string()))?;
        let mut builder: sqlx::QueryBuilder<sqlx::Sqlite> =
            sqlx::QueryBuilder::new("UPDATE webhooks SET url = ");
        builder.push_bind(&url);
        builder.push(", events = ").push_bind(&events_json);
        builder.push(", filter_pattern = ").push_bind(&filter_pattern);
        if let Some(secret) = &patch.secret {
            builder.push(", secret = ").push_bind(secret);
        }
        if let Some(active) = patch.active {
            builder.push(", active = ").push_bind(active);
        }
        builder.push(" WHERE id = ").push_bind(id);
        builder.build().execute(self.db.pool()).await?;

        self.get(id)
            .await?
            .ok_or_else(|| CoreError::internal("webhook missing after update"))
    }

    /// Deletes the webhook and its delivery history. Idempotent.
    pub async fn remove(&self, id: &str) -> CoreResult<bool> {
        let deleted = sqlx::query("DELETE FROM webhooks WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    pub async fn get(&self, id: &str) -> CoreResult<Option<WebhookInfo>> {
        let row = sqlx::query("SELECT * FROM webhooks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        row.map(map_webhook).transpose()
    }

    pub async fn list(&self, active_only: bool) -> CoreResult<Vec<WebhookInfo>> {
        let sql = if active_only {
            "SELECT * FROM webhooks WHERE active = 1 ORDER BY created_at ASC"
        } else {
            "SELECT * FROM webhooks ORDER BY created_at ASC"
        };
        let rows = sqlx::query(sql).fetch_all(self.db.pool()).await?;
        rows.into_iter().map(map_webhook).collect()
    }

    /// Queues one synthetic `webhook.test` delivery to this webhook,
    /// bypassing its event subscriptions.
    pub async fn test(&self, id: &str) -> CoreResult<String> {
        let Some(webhook) = self.get(id).await? else {
            return Err(CoreError::validation(format!("webhook '{id}' does not exist")));
        };

        let payload = json!({
            "event": EventKind::WebhookTest,
            "timestamp": now_ms(),
            "data": { "test": true, "webhookId": &webhook.id },
        });
        let delivery_id = self
            .enqueue_delivery(&webhook.id, EventKind::WebhookTest, &payload)
            .await?
            .ok_or_else(|| CoreError::validation("webhook delivery queue is full"))?;

        self.activity
            .record(EventKind::WebhookTest, NewActivity {
                target_id: Some(webhook.id),
                ..NewActivity::default()
            })
            .await;
        Ok(delivery_id)
    }

    /// Fans an event out to every matching active webhook: the event must be
    /// subscribed (or `*`), and a filter pattern must glob-match the target.
    #[instrument(skip(self, payload))]
    pub async fn trigger(
        &self,
        kind: EventKind,
        payload: Value,
        target_id: Option<&str>,
    ) -> CoreResult<TriggerOutcome> {
        let hooks = self.list(true).await?;
        let envelope = json!({
            "event": kind,
            "timestamp": now_ms(),
            "targetId": target_id,
            "data": payload,
        });

        let mut triggered = 0;
        for hook in hooks {
            if !subscribes_to(&hook.events, kind) {
                continue;
            }
            if !filter_matches(hook.filter_pattern.as_deref(), target_id) {
                continue;
            }
            if self.enqueue_delivery(&hook.id, kind, &envelope).await?.is_some() {
                triggered += 1;
            }
        }
        Ok(TriggerOutcome { triggered })
    }

    /// Deletes finished deliveries older than the retention window.
    pub async fn cleanup(&self) -> CoreResult<i64> {
        let cutoff = now_ms() - self.config.delivery_retention_ms;
        let deleted = sqlx::query(
            "DELETE FROM webhook_deliveries
             WHERE status IN ('succeeded', 'failed') AND created_at < ?",
        )
        .bind(cutoff)
        .execute(self.db.pool())
        .await?
        .rows_affected() as i64;
        Ok(deleted)
    }

    /// Starts the delivery worker draining the queue. Call once at startup;
    /// subsequent calls return `None`.
    pub fn spawn_worker(self: Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.queue_rx.try_lock().ok()?.take()?;
        Some(tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                self.deliver(&job.delivery_id).await;
            }
        }))
    }

    /// Persists and enqueues one delivery; `None` when the bounded queue
    /// rejected it (the row is recorded as failed).
    async fn enqueue_delivery(
        &self,
        webhook_id: &str,
        kind: EventKind,
        payload: &Value,
    ) -> CoreResult<Option<String>> {
        let delivery_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO webhook_deliveries
             (id, webhook_id, event, payload, status, attempts, created_at)
             VALUES (?, ?, ?, ?, 'pending', 0, ?)",
        )
        .bind(&delivery_id)
        .bind(webhook_id)
        .bind(kind.as_str())
        .bind(payload.to_string())
        .bind(now_ms())
        .execute(self.db.pool())
        .await?;

        // The queue is bounded; a full queue rejects the delivery visibly
        // instead of blocking the caller or dropping it on the floor.
        if let Err(error) = self.queue_tx.try_send(DeliveryJob {
            delivery_id: delivery_id.clone(),
        }) {
            warn!(webhook = webhook_id, %error, "delivery queue full; delivery marked failed");
            self.mark_failed(&delivery_id, webhook_id, "delivery queue full")
                .await?;
            return Ok(None);
        }
        Ok(Some(delivery_id))
    }

    async fn deliver(&self, delivery_id: &str) {
        if let Err(error) = self.attempt_delivery(delivery_id).await {
            warn!(delivery = delivery_id, %error, "webhook delivery attempt errored internally");
        }
    }

    async fn attempt_delivery(&self, delivery_id: &str) -> CoreResult<()> {
        let Some(row) = sqlx::query(
            "SELECT d.id, d.webhook_id, d.event, d.payload, d.attempts,
                    w.url, w.secret
             FROM webhook_deliveries d JOIN webhooks w ON w.id = d.webhook_id
             WHERE d.id = ?",
        )
        .bind(delivery_id)
        .fetch_optional(self.db.pool())
        .await?
        else {
            return Ok(());
        };

        let webhook_id: String = row.try_get("webhook_id").map_err(CoreError::from)?;
        let event: String = row.try_get("event").map_err(CoreError::from)?;
        let payload: String = row.try_get("payload").map_err(CoreError::from)?;
        let attempts: i64 = row.try_get("attempts").map_err(CoreError::from)?;
        let url: String = row.try_get("url").map_err(CoreError::from)?;
        let secret: Option<String> = row.try_get("secret").map_err(CoreError::from)?;

        let attempt = attempts + 1;
        let now = now_ms();
        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header(HEADER_EVENT, &event)
            .header(HEADER_DELIVERY, delivery_id)
            .header(HEADER_TIMESTAMP, now.to_string());
        if let Some(secret) = &secret {
            request = request.header(HEADER_SIGNATURE, sign_payload(secret, payload.as_bytes()));
        }

        let outcome = request.body(payload).send().await;
        match outcome {
            Ok(response) => {
                let status = response.status();
                let body: String = response
                    .text()
                    .await
                    .unwrap_or_default()
                    .chars()
                    .take(RESPONSE_BODY_LIMIT)
                    .collect();
                if status.is_success() {
                    sqlx::query(
                        "UPDATE webhook_deliveries
                         SET status = 'succeeded', attempts = ?, last_attempt_at = ?,
                             response_status = ?, response_body = ?, next_attempt_at = NULL
                         WHERE id = ?",
                    )
                    .bind(attempt)
                    .bind(now)
                    .bind(status.as_u16() as i64)
                    .bind(body)
                    .bind(delivery_id)
                    .execute(self.db.pool())
                    .await?;
                    sqlx::query("UPDATE webhooks SET success_count = success_count + 1 WHERE id = ?")
                        .bind(&webhook_id)
                        .execute(self.db.pool())
                        .await?;
                    debug!(delivery = delivery_id, webhook = %webhook_id, "delivery succeeded");
                } else {
                    self.handle_failure(
                        delivery_id,
                        &webhook_id,
                        attempt,
                        Some(status.as_u16() as i64),
                        &body,
                    )
                    .await?;
                }
            }
            Err(error) => {
                self.handle_failure(
                    delivery_id,
                    &webhook_id,
                    attempt,
                    None,
                    &error.to_string(),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Retries with exponential backoff until the attempt budget runs out.
    async fn handle_failure(
        &self,
        delivery_id: &str,
        webhook_id: &str,
        attempt: i64,
        response_status: Option<i64>,
        body: &str,
    ) -> CoreResult<()> {
        let now = now_ms();
        let body: String = body.chars().take(RESPONSE_BODY_LIMIT).collect();

        if attempt >= self.config.max_attempts {
            sqlx::query(
                "UPDATE webhook_deliveries
                 SET status = 'failed', attempts = ?, last_attempt_at = ?,
                     response_status = ?, response_body = ?, next_attempt_at = NULL
                 WHERE id = ?",
            )
            .bind(attempt)
            .bind(now)
            .bind(response_status)
            .bind(body)
            .bind(delivery_id)
            .execute(self.db.pool())
            .await?;
            sqlx::query("UPDATE webhooks SET failure_count = failure_count + 1 WHERE id = ?")
                .bind(webhook_id)
                .execute(self.db.pool())
                .await?;
            warn!(delivery = delivery_id, webhook = webhook_id, attempt, "delivery gave up");
            return Ok(());
        }

        let backoff = self.config.backoff_base_ms * 2u64.pow((attempt - 1).max(0) as u32);
        sqlx::query(
            "UPDATE webhook_deliveries
             SET status = 'retrying', attempts = ?, last_attempt_at = ?,
                 response_status = ?, response_body = ?, next_attempt_at = ?
             WHERE id = ?",
        )
        .bind(attempt)
        .bind(now)
        .bind(response_status)
        .bind(body)
        .bind(now + backoff as i64)
        .bind(delivery_id)
        .execute(self.db.pool())
        .await?;

        let tx = self.queue_tx.clone();
        let delivery_id = delivery_id.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(backoff)).await;
            let _ = tx.send(DeliveryJob { delivery_id }).await;
        });
        Ok(())
    }

    async fn mark_failed(&self, delivery_id: &str, webhook_id: &str, reason: &str) -> CoreResult<()> {
        sqlx::query(
            "UPDATE webhook_deliveries
             SET status = 'failed', last_attempt_at = ?, response_body = ?
             WHERE id = ?",
        )
        .bind(now_ms())
        .bind(reason)
        .bind(delivery_id)
        .execute(self.db.pool())
        .await?;
        sqlx::query("UPDATE webhooks SET failure_count = failure_count + 1 WHERE id = ?")
            .bind(webhook_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EventSink for WebhookEngine {
    async fn emit(&self, kind: EventKind, payload: Value, target_id: Option<&str>) {
        if let Err(error) = self.trigger(kind, payload, target_id).await {
            warn!(event = %kind, %error, "webhook trigger failed");
        }
    }
}

/// `sha256=<hex>` HMAC over the raw request body.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn subscribes_to(events: &[String], kind: EventKind) -> bool {
    events.iter().any(|e| e == "*" || e == kind.as_str())
}

/// No filter matches everything; a filter with no target matches nothing.
fn filter_matches(filter: Option<&str>, target_id: Option<&str>) -> bool {
    let Some(filter) = filter else { return true };
    let Some(target) = target_id else { return false };
    match (Identity::parse(filter), Identity::parse(target)) {
        (Ok(pattern), Ok(id)) => Identity::matches(&pattern, &id),
        _ => false,
    }
}

fn normalize_events(events: Vec<String>) -> CoreResult<Vec<String>> {
    if events.is_empty() {
        return Ok(vec!["*".to_owned()]);
    }
    for event in &events {
        if event != "*" && EventKind::parse(event).is_none() {
            return Err(CoreError::with_details(
                ErrorCode::InvalidEvent,
                format!("unknown event type '{event}'"),
                json!({ "event": event }),
            ));
        }
    }
    Ok(events)
}

fn validate_filter_pattern(pattern: &str) -> CoreResult<()> {
    let valid = pattern.len() <= MAX_FILTER_LEN
        && !pattern.is_empty()
        && pattern
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'*' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(CoreError::validation(
            "filter pattern must be 1-100 characters of [A-Za-z0-9._:*-]",
        ))
    }
}

/// Accepts only http/https URLs whose host cannot point back into the
/// daemon's own network: loopback, RFC1918, link-local, unique-local IPv6
/// and the usual metadata hostnames are all rejected.
fn validate_target_url(raw: &str) -> CoreResult<Url> {
    let url = Url::parse(raw)
        .map_err(|_| CoreError::validation(format!("'{raw}' is not a valid URL")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(CoreError::validation("webhook URL must use http or https"));
    }

    let blocked = match url.host() {
        None => true,
        Some(Host::Domain(domain)) => {
            let domain = domain.to_ascii_lowercase();
            domain == "localhost" || domain == "metadata.google.internal"
        }
        Some(Host::Ipv4(ip)) => is_blocked_v4(ip),
        Some(Host::Ipv6(ip)) => is_blocked_v6(ip),
    };
    if blocked {
        return Err(CoreError::validation(
            "webhook URL host resolves to a private or local address",
        ));
    }
    Ok(url)
}

fn is_blocked_v4(ip: Ipv4Addr) -> bool {
    let [a, b, _, _] = ip.octets();
    a == 127
        || a == 10
        || (a == 172 && (16..=31).contains(&b))
        || (a == 192 && b == 168)
        || (a == 169 && b == 254)
}

fn is_blocked_v6(ip: Ipv6Addr) -> bool {
    // ::1 and the fc00::/7 unique-local range.
    ip == Ipv6Addr::LOCALHOST || (ip.segments()[0] & 0xfe00) == 0xfc00
}

fn map_webhook(row: sqlx::sqlite::SqliteRow) -> CoreResult<WebhookInfo> {
    let events_json: String = row.try_get("events").map_err(CoreError::from)?;
    let secret: Option<String> = row.try_get("secret").map_err(CoreError::from)?;
    Ok(WebhookInfo {
        id: row.try_get("id").map_err(CoreError::from)?,
        url: row.try_get("url").map_err(CoreError::from)?,
        events: serde_json::from_str(&events_json)
            .map_err(|e| CoreError::internal(format!("corrupt events column: {e}")))?,
        filter_pattern: row.try_get("filter_pattern").map_err(CoreError::from)?,
        has_secret: secret.is_some(),
        active: row.try_get::<i64, _>("active").map_err(CoreError::from)? != 0,
        success_count: row.try_get("success_count").map_err(CoreError::from)?,
        failure_count: row.try_get("failure_count").map_err(CoreError::from)?,
        created_at: row.try_get("created_at").map_err(CoreError::from)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::webhook_engine;

    #[tokio::test]
    async fn register_validates_events_and_patterns() {
        let engine = webhook_engine(WebhookConfig::default()).await;

        let hook = engine
            .register("https://example.com/hook", WebhookOptions {
                events: vec!["service.claim".into()],
                ..WebhookOptions::default()
            })
            .await
            .unwrap();
        assert!(hook.id.starts_with("wh-"));
        assert!(!hook.has_secret);

        let err = engine
            .register("https://example.com/hook", WebhookOptions {
                events: vec!["service.reboot".into()],
                ..WebhookOptions::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidEvent);

        let err = engine
            .register("https://example.com/hook", WebhookOptions {
                filter_pattern: Some("bad pattern!".into()),
                ..WebhookOptions::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn ssrf_guard_blocks_private_hosts() {
        let engine = webhook_engine(WebhookConfig::default()).await;
        let blocked = [
            "http://127.0.0.1/hook",
            "http://127.9.9.9/hook",
            "http://10.0.0.1/hook",
            "http://172.16.0.1/hook",
            "http://172.31.255.254/hook",
            "http://192.168.0.1/hook",
            "http://169.254.169.254/hook",
            "http://localhost/hook",
            "http://[::1]/hook",
            "http://[fc00::1]/hook",
            "http://[fdff::1]/hook",
            "http://metadata.google.internal/hook",
            "ftp://example.com/hook",
            "not a url",
        ];
        for url in blocked {
            let err = engine
                .register(url, WebhookOptions::default())
                .await
                .unwrap_err();
            assert_eq!(err.code, ErrorCode::ValidationError, "url {url}");
        }

        // Just outside the 172.16/12 block on either side.
        for url in ["http://172.15.255.254/hook", "http://172.32.0.1/hook"] {
            engine.register(url, WebhookOptions::default()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let engine = webhook_engine(WebhookConfig {
            max_webhooks: 2,
            ..WebhookConfig::default()
        })
        .await;
        engine
            .register("https://example.com/1", WebhookOptions::default())
            .await
            .unwrap();
        engine
            .register("https://example.com/2", WebhookOptions::default())
            .await
            .unwrap();
        let err = engine
            .register("https://example.com/3", WebhookOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn trigger_matches_events_and_filters() {
        let engine = webhook_engine(WebhookConfig::default()).await;

        engine
            .register("https://example.com/all", WebhookOptions {
                events: vec!["*".into()],
                ..WebhookOptions::default()
            })
            .await
            .unwrap();
        engine
            .register("https://example.com/claims", WebhookOptions {
                events: vec!["service.claim".into()],
                filter_pattern: Some("myapp:*".into()),
                ..WebhookOptions::default()
            })
            .await
            .unwrap();
        let inactive = engine
            .register("https://example.com/off", WebhookOptions {
                events: vec!["*".into()],
                active: Some(false),
                ..WebhookOptions::default()
            })
            .await
            .unwrap();
        assert!(!inactive.active);

        // Matching target: wildcard hook + filtered hook.
        let out = engine
            .trigger(
                EventKind::ServiceClaim,
                json!({ "port": 3000 }),
                Some("myapp:api"),
            )
            .await
            .unwrap();
        assert_eq!(out.triggered, 2);

        // Non-matching target: only the wildcard hook.
        let out = engine
            .trigger(EventKind::ServiceClaim, json!({}), Some("other:api"))
            .await
            .unwrap();
        assert_eq!(out.triggered, 1);

        // Unsubscribed event: only the wildcard hook.
        let out = engine
            .trigger(EventKind::LockAcquire, json!({}), Some("myapp:api"))
            .await
            .unwrap();
        assert_eq!(out.triggered, 1);

        // Filtered hook with no target does not match.
        let out = engine
            .trigger(EventKind::ServiceClaim, json!({}), None)
            .await
            .unwrap();
        assert_eq!(out.triggered, 1);
    }

    #[tokio::test]
    async fn update_and_remove() {
        let engine = webhook_engine(WebhookConfig::default()).await;
        let hook = engine
            .register("https://example.com/hook", WebhookOptions::default())
            .await
            .unwrap();

        let updated = engine
            .update(&hook.id, WebhookPatch {
                events: Some(vec!["lock.acquire".into()]),
                secret: Some("s3cret".into()),
                active: Some(false),
                ..WebhookPatch::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.events, vec!["lock.acquire".to_owned()]);
        assert!(updated.has_secret);
        assert!(!updated.active);

        let err = engine
            .update(&hook.id, WebhookPatch {
                url: Some("http://127.0.0.1/hook".into()),
                ..WebhookPatch::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);

        assert!(engine.remove(&hook.id).await.unwrap());
        assert!(!engine.remove(&hook.id).await.unwrap());
    }

    #[test]
    fn signature_is_stable_hex() {
        let sig = sign_payload("secret", b"{\"a\":1}");
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
        assert_eq!(sig, sign_payload("secret", b"{\"a\":1}"));
        assert_ne!(sig, sign_payload("other", b"{\"a\":1}"));
    }

    mod delivery {
        use super::*;
        use axum::{extract::State, http::HeaderMap, routing::post, Router};
        use std::sync::Mutex as StdMutex;

        #[derive(Default)]
        struct Seen {
            headers: Vec<HeaderMap>,
            bodies: Vec<String>,
            failures_remaining: usize,
        }

        async fn receive(
            State(seen): State<Arc<StdMutex<Seen>>>,
            headers: HeaderMap,
            body: String,
        ) -> (axum::http::StatusCode, &'static str) {
            let mut seen = seen.lock().unwrap();
            seen.headers.push(headers);
            seen.bodies.push(body);
            if seen.failures_remaining > 0 {
                seen.failures_remaining -= 1;
                (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "nope")
            } else {
                (axum::http::StatusCode::OK, "ok")
            }
        }

        async fn mock_endpoint(failures: usize) -> (String, Arc<StdMutex<Seen>>) {
            let seen = Arc::new(StdMutex::new(Seen {
                failures_remaining: failures,
                ..Seen::default()
            }));
            let app = Router::new()
                .route("/hook", post(receive))
                .with_state(Arc::clone(&seen));
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            (format!("http://{addr}/hook"), seen)
        }

        /// Inserts a webhook row directly; the SSRF guard rightly refuses
        /// 127.0.0.1, but the delivery pipeline itself must be testable.
        async fn insert_local_webhook(engine: &Arc<WebhookEngine>, url: &str, secret: Option<&str>) -> String {
            let id = format!("wh-{}", Uuid::new_v4().simple());
            sqlx::query(
                "INSERT INTO webhooks (id, url, events, filter_pattern, secret, active, created_at)
                 VALUES (?, ?, '[\"*\"]', NULL, ?, 1, ?)",
            )
            .bind(&id)
            .bind(url)
            .bind(secret)
            .bind(now_ms())
            .execute(engine.db.pool())
            .await
            .unwrap();
            id
        }

        async fn wait_until_bodies(seen: &Arc<StdMutex<Seen>>, count: usize) {
            for _ in 0..500 {
                if seen.lock().unwrap().bodies.len() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("mock endpoint never saw {count} deliveries");
        }

        async fn wait_until_counts(
            engine: &Arc<WebhookEngine>,
            id: &str,
            successes: i64,
            failures: i64,
        ) {
            for _ in 0..500 {
                let hook = engine.get(id).await.unwrap().unwrap();
                if hook.success_count >= successes && hook.failure_count >= failures {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("webhook counters never reached {successes}/{failures}");
        }

        #[tokio::test]
        async fn successful_delivery_signs_and_counts() {
            let engine = webhook_engine(WebhookConfig::default()).await;
            let (url, seen) = mock_endpoint(0).await;
            let id = insert_local_webhook(&engine, &url, Some("s3cret")).await;
            engine.clone().spawn_worker().unwrap();

            let out = engine
                .trigger(
                    EventKind::ServiceClaim,
                    json!({ "port": 3000 }),
                    Some("myapp:api"),
                )
                .await
                .unwrap();
            assert_eq!(out.triggered, 1);

            wait_until_bodies(&seen, 1).await;
            {
                let guard = seen.lock().unwrap();
                let headers = &guard.headers[0];
                assert_eq!(headers.get(HEADER_EVENT).unwrap(), "service.claim");
                assert!(headers.get(HEADER_DELIVERY).is_some());
                assert!(headers.get(HEADER_TIMESTAMP).is_some());
                let signature = headers.get(HEADER_SIGNATURE).unwrap().to_str().unwrap();
                assert_eq!(signature, sign_payload("s3cret", guard.bodies[0].as_bytes()));

                let body: Value = serde_json::from_str(&guard.bodies[0]).unwrap();
                assert_eq!(body["event"], "service.claim");
                assert_eq!(body["data"]["port"], 3000);
                assert_eq!(body["targetId"], "myapp:api");
            }

            wait_until_counts(&engine, &id, 1, 0).await;
        }

        #[tokio::test]
        async fn failed_delivery_retries_until_success() {
            let engine = webhook_engine(WebhookConfig {
                backoff_base_ms: 10,
                ..WebhookConfig::default()
            })
            .await;
            let (url, seen) = mock_endpoint(2).await;
            let id = insert_local_webhook(&engine, &url, None).await;
            engine.clone().spawn_worker().unwrap();

            engine
                .trigger(EventKind::LockAcquire, json!({}), Some("deploy"))
                .await
                .unwrap();

            wait_until_bodies(&seen, 3).await;
            wait_until_counts(&engine, &id, 1, 0).await;
        }

        #[tokio::test]
        async fn exhausted_retries_mark_the_delivery_failed() {
            let engine = webhook_engine(WebhookConfig {
                backoff_base_ms: 5,
                max_attempts: 2,
                ..WebhookConfig::default()
            })
            .await;
            let (url, seen) = mock_endpoint(usize::MAX).await;
            let id = insert_local_webhook(&engine, &url, None).await;
            engine.clone().spawn_worker().unwrap();

            engine
                .trigger(EventKind::LockAcquire, json!({}), Some("deploy"))
                .await
                .unwrap();

            wait_until_bodies(&seen, 2).await;
            wait_until_counts(&engine, &id, 0, 1).await;

            let status: String = sqlx::query_scalar(
                "SELECT status FROM webhook_deliveries WHERE webhook_id = ?",
            )
            .bind(&id)
            .fetch_one(engine.db.pool())
            .await
            .unwrap();
            assert_eq!(status, "failed");
        }
    }
}
