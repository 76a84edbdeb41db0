//! Event taxonomy shared by the activity log and the webhook engine.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every lifecycle event the system records or fans out to webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "service.claim")]
    ServiceClaim,
    #[serde(rename = "service.release")]
    ServiceRelease,
    #[serde(rename = "service.expire")]
    ServiceExpire,
    #[serde(rename = "service.endpoint")]
    ServiceEndpoint,
    #[serde(rename = "lock.acquire")]
    LockAcquire,
    #[serde(rename = "lock.release")]
    LockRelease,
    #[serde(rename = "lock.extend")]
    LockExtend,
    #[serde(rename = "lock.expire")]
    LockExpire,
    #[serde(rename = "agent.register")]
    AgentRegister,
    #[serde(rename = "agent.heartbeat")]
    AgentHeartbeat,
    #[serde(rename = "agent.unregister")]
    AgentUnregister,
    #[serde(rename = "agent.stale")]
    AgentStale,
    #[serde(rename = "message.publish")]
    MessagePublish,
    #[serde(rename = "message.clear")]
    MessageClear,
    #[serde(rename = "session.start")]
    SessionStart,
    #[serde(rename = "session.end")]
    SessionEnd,
    #[serde(rename = "session.note")]
    SessionNote,
    #[serde(rename = "file.claim")]
    FileClaim,
    #[serde(rename = "file.release")]
    FileRelease,
    #[serde(rename = "daemon.start")]
    DaemonStart,
    #[serde(rename = "daemon.stop")]
    DaemonStop,
    #[serde(rename = "webhook.test")]
    WebhookTest,
    #[serde(rename = "cleanup")]
    Cleanup,
}

impl EventKind {
    pub const ALL: &'static [EventKind] = &[
        EventKind::ServiceClaim,
        EventKind::ServiceRelease,
        EventKind::ServiceExpire,
        EventKind::ServiceEndpoint,
        EventKind::LockAcquire,
        EventKind::LockRelease,
        EventKind::LockExtend,
        EventKind::LockExpire,
        EventKind::AgentRegister,
        EventKind::AgentHeartbeat,
        EventKind::AgentUnregister,
        EventKind::AgentStale,
        EventKind::MessagePublish,
        EventKind::MessageClear,
        EventKind::SessionStart,
        EventKind::SessionEnd,
        EventKind::SessionNote,
        EventKind::FileClaim,
        EventKind::FileRelease,
        EventKind::DaemonStart,
        EventKind::DaemonStop,
        EventKind::WebhookTest,
        EventKind::Cleanup,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ServiceClaim => "service.claim",
            EventKind::ServiceRelease => "service.release",
            EventKind::ServiceExpire => "service.expire",
            EventKind::ServiceEndpoint => "service.endpoint",
            EventKind::LockAcquire => "lock.acquire",
            EventKind::LockRelease => "lock.release",
            EventKind::LockExtend => "lock.extend",
            EventKind::LockExpire => "lock.expire",
            EventKind::AgentRegister => "agent.register",
            EventKind::AgentHeartbeat => "agent.heartbeat",
            EventKind::AgentUnregister => "agent.unregister",
            EventKind::AgentStale => "agent.stale",
            EventKind::MessagePublish => "message.publish",
            EventKind::MessageClear => "message.clear",
            EventKind::SessionStart => "session.start",
            EventKind::SessionEnd => "session.end",
            EventKind::SessionNote => "session.note",
            EventKind::FileClaim => "file.claim",
            EventKind::FileRelease => "file.release",
            EventKind::DaemonStart => "daemon.start",
            EventKind::DaemonStop => "daemon.stop",
            EventKind::WebhookTest => "webhook.test",
            EventKind::Cleanup => "cleanup",
        }
    }

    /// Parses a dotted event name; `None` for anything outside the taxonomy.
    pub fn parse(name: &str) -> Option<EventKind> {
        EventKind::ALL.iter().copied().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fan-out capability injected into the components that raise events.
/// The webhook engine implements it; emitting never fails the caller.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, kind: EventKind, payload: Value, target_id: Option<&str>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::parse(kind.as_str()), Some(*kind));
        }
        assert_eq!(EventKind::parse("service.reboot"), None);
    }

    #[test]
    fn serde_uses_dotted_names() {
        let json = serde_json::to_string(&EventKind::ServiceClaim).unwrap();
        assert_eq!(json, "\"service.claim\"");
        let back: EventKind = serde_json::from_str("\"lock.expire\"").unwrap();
        assert_eq!(back, EventKind::LockExpire);
    }
}
