//! Port Daddy coordination kernel.
//!
//! Everything the daemon and direct-DB CLI clients share lives here: the
//! identity-keyed port allocator, the TTL lock registry, the agent registry,
//! channel messaging, work sessions with file claims, the activity log and
//! the webhook engine. Components reference each other through small
//! capability traits and are wired into a graph by [`Coordinator::new`].

pub mod activity;
pub mod agents;
pub mod duration;
pub mod error;
pub mod events;
pub mod identity;
pub mod locks;
pub mod messaging;
pub mod services;
pub mod sessions;
pub mod webhooks;

#[cfg(test)]
pub(crate) mod testutil;

use std::collections::HashSet;
use std::sync::Arc;

use pd_db::Database;
use serde::Serialize;

use crate::{
    activity::{ActivityCleanup, ActivityLog, ActivitySink},
    agents::{AgentRegistry, LimitGate},
    error::CoreResult,
    events::EventSink,
    locks::LockRegistry,
    messaging::Messaging,
    services::ServiceRegistry,
    sessions::Sessions,
    webhooks::{WebhookConfig, WebhookEngine},
};

/// Tunables for the component graph; defaults are the production values.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub port_range: (u16, u16),
    pub reserved_ports: HashSet<u16>,
    pub agent_ttl_ms: i64,
    pub default_lock_ttl_ms: i64,
    pub max_lock_ttl_ms: i64,
    pub activity_retention_ms: i64,
    pub activity_max_entries: i64,
    pub webhooks: WebhookConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            port_range: (3100, 9999),
            reserved_ports: HashSet::new(),
            agent_ttl_ms: 120_000,
            default_lock_ttl_ms: 300_000,
            max_lock_ttl_ms: 3_600_000,
            activity_retention_ms: 86_400_000,
            activity_max_entries: 10_000,
            webhooks: WebhookConfig::default(),
        }
    }
}

/// What one maintenance pass swept.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub expired_locks: i64,
    pub expired_services: i64,
    pub stale_agents: i64,
    pub released_locks: i64,
    pub expired_messages: i64,
    pub pruned_deliveries: i64,
    pub activity: ActivityCleanup,
}

/// The wired component graph. One instance per process; every component
/// shares the same store handle.
pub struct Coordinator {
    db: Database,
    pub activity: Arc<ActivityLog>,
    pub agents: Arc<AgentRegistry>,
    pub services: Arc<ServiceRegistry>,
    pub locks: Arc<LockRegistry>,
    pub messaging: Arc<Messaging>,
    pub sessions: Arc<Sessions>,
    pub webhooks: Arc<WebhookEngine>,
}

impl Coordinator {
    pub fn new(db: Database, config: CoordinatorConfig) -> Self {
        // The activity log sits at the bottom of the graph; the webhook
        // engine doubles as the event sink for everything above it.
        let activity = Arc::new(ActivityLog::new(
            db.clone(),
            config.activity_retention_ms,
            config.activity_max_entries,
        ));
        let activity_sink: Arc<dyn ActivitySink> = activity.clone();

        let webhooks = Arc::new(WebhookEngine::new(
            db.clone(),
            activity_sink.clone(),
            config.webhooks.clone(),
        ));
        let events: Arc<dyn EventSink> = webhooks.clone();

        let agents = Arc::new(AgentRegistry::new(
            db.clone(),
            activity_sink.clone(),
            events.clone(),
            config.agent_ttl_ms,
        ));
        let limits: Arc<dyn LimitGate> = agents.clone();

        let locks = Arc::new(LockRegistry::new(
            db.clone(),
            activity_sink.clone(),
            events.clone(),
            limits.clone(),
            config.default_lock_ttl_ms,
            config.max_lock_ttl_ms,
        ));
        let services = Arc::new(ServiceRegistry::new(
            db.clone(),
            activity_sink.clone(),
            events.clone(),
            limits,
            config.port_range,
            config.reserved_ports.clone(),
        ));
        let messaging = Arc::new(Messaging::new(
            db.clone(),
            activity_sink.clone(),
            events.clone(),
        ));
        let sessions = Arc::new(Sessions::new(db.clone(), activity_sink, events));

        Self {
            db,
            activity,
            agents,
            services,
            locks,
            messaging,
            sessions,
            webhooks,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// One full sweep of every TTL and retention policy. Called by the
    /// daemon's maintenance interval and by the cleanup endpoint; read-path
    /// sweeps make this a latency optimisation, not a correctness one.
    pub async fn run_maintenance(&self) -> CoreResult<MaintenanceReport> {
        let expired_locks = self.locks.cleanup().await?;
        let expired_services = self.services.cleanup().await?;
        let agent_sweep = self.agents.cleanup(self.locks.as_ref()).await?;
        let expired_messages = self.messaging.cleanup().await?;
        let pruned_deliveries = self.webhooks.cleanup().await?;
        let activity = self.activity.cleanup().await?;

        Ok(MaintenanceReport {
            expired_locks,
            expired_services,
            stale_agents: agent_sweep.cleaned,
            released_locks: agent_sweep.released_locks,
            expired_messages,
            pruned_deliveries,
            activity,
        })
    }
}
