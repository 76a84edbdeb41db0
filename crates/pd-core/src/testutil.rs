//! Shared fixtures for component tests.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use pd_db::Database;
use serde_json::Value;

use crate::{
    activity::{ActivitySink, NewActivity},
    agents::AgentRegistry,
    events::{EventKind, EventSink},
    locks::{AcquireOptions, LockRegistry},
    messaging::Messaging,
    services::ServiceRegistry,
    sessions::Sessions,
    webhooks::{WebhookConfig, WebhookEngine},
};

pub const AGENT_TTL_FOR_TESTS: i64 = 120_000;

struct NoopActivity;

#[async_trait]
impl ActivitySink for NoopActivity {
    async fn record(&self, _kind: EventKind, _entry: NewActivity) {}
}

struct NoopEvents;

#[async_trait]
impl EventSink for NoopEvents {
    async fn emit(&self, _kind: EventKind, _payload: Value, _target_id: Option<&str>) {}
}

pub fn noop_activity() -> Arc<dyn ActivitySink> {
    Arc::new(NoopActivity)
}

pub fn noop_events() -> Arc<dyn EventSink> {
    Arc::new(NoopEvents)
}

pub fn owned(owner: &str) -> AcquireOptions {
    AcquireOptions {
        owner: Some(owner.to_owned()),
        ..AcquireOptions::default()
    }
}

pub async fn lock_registry() -> LockRegistry {
    let db = Database::open_in_memory().await.unwrap();
    let agents = Arc::new(AgentRegistry::new(
        db.clone(),
        noop_activity(),
        noop_events(),
        AGENT_TTL_FOR_TESTS,
    ));
    LockRegistry::new(db, noop_activity(), noop_events(), agents, 300_000, 3_600_000)
}

pub async fn service_registry(range: (u16, u16)) -> ServiceRegistry {
    let db = Database::open_in_memory().await.unwrap();
    let agents = Arc::new(AgentRegistry::new(
        db.clone(),
        noop_activity(),
        noop_events(),
        AGENT_TTL_FOR_TESTS,
    ));
    ServiceRegistry::new(
        db,
        noop_activity(),
        noop_events(),
        agents,
        range,
        HashSet::new(),
    )
}

pub async fn messaging_fixture() -> Messaging {
    let db = Database::open_in_memory().await.unwrap();
    Messaging::new(db, noop_activity(), noop_events())
}

pub async fn sessions_fixture() -> Sessions {
    let db = Database::open_in_memory().await.unwrap();
    Sessions::new(db, noop_activity(), noop_events())
}

pub async fn webhook_engine(config: WebhookConfig) -> Arc<WebhookEngine> {
    let db = Database::open_in_memory().await.unwrap();
    Arc::new(WebhookEngine::new(db, noop_activity(), config))
}
