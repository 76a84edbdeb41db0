//! Channel messaging: durable best-effort rows plus in-process fan-out.
//!
//! Message ids are the total order within a channel. Live subscribers hang
//! off per-channel broadcast senders; the special channel `*` receives every
//! message together with its originating channel name. A slow or failed
//! subscriber only ever loses its own events.

use std::collections::HashMap;
use std::sync::Arc;

use futures::Stream;
use parking_lot::RwLock;
use pd_db::{now_ms, Database};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::Row;
use tokio::sync::broadcast;
use tracing::{debug, instrument};

use crate::{
    activity::{ActivitySink, NewActivity},
    duration::{parse_duration, DurationInput},
    error::{CoreError, CoreResult, ErrorCode},
    events::{EventKind, EventSink},
};

pub const WILDCARD_CHANNEL: &str = "*";

const MAX_CHANNELS: usize = 1_000;
const MAX_SUBSCRIBERS_PER_CHANNEL: usize = 100;
const SUBSCRIBER_BUFFER: usize = 64;
const READ_LIMIT_MAX: i64 = 1_000;
const READ_LIMIT_DEFAULT: i64 = 50;

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub sender: Option<String>,
    pub expires: Option<DurationInput>,
}

/// A stored message with its payload decoded back to JSON where possible.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub channel: String,
    pub payload: Value,
    pub sender: Option<String>,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

/// The raw event handed to live subscribers; wildcard consumers see the
/// payload exactly as stored.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub id: i64,
    pub channel: String,
    pub payload: String,
    pub sender: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub channel: String,
    pub count: i64,
    pub last_message: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollOutcome {
    pub message: Option<Message>,
    pub last_id: i64,
}

struct ChannelEntry {
    tx: broadcast::Sender<MessageEvent>,
    subscribers: usize,
}

/// In-process subscriber table. Never persisted; bounded in both dimensions.
#[derive(Default)]
pub struct SubscriberRegistry {
    channels: RwLock<HashMap<String, ChannelEntry>>,
}

impl SubscriberRegistry {
    fn subscribe(self: Arc<Self>, channel: &str) -> CoreResult<Subscription> {
        let mut channels = self.channels.write();
        if let Some(entry) = channels.get_mut(channel) {
            if entry.subscribers >= MAX_SUBSCRIBERS_PER_CHANNEL {
                return Err(CoreError::validation(format!(
                    "channel '{channel}' has reached {MAX_SUBSCRIBERS_PER_CHANNEL} subscribers"
                )));
            }
            entry.subscribers += 1;
            let receiver = entry.tx.subscribe();
            drop(channels);
            return Ok(Subscription {
                receiver,
                _guard: SubscriberGuard {
                    registry: self,
                    channel: channel.to_owned(),
                },
            });
        }

        if channels.len() >= MAX_CHANNELS {
            return Err(CoreError::validation(format!(
                "subscriber table is full ({MAX_CHANNELS} channels)"
            )));
        }
        let (tx, receiver) = broadcast::channel(SUBSCRIBER_BUFFER);
        channels.insert(channel.to_owned(), ChannelEntry { tx, subscribers: 1 });
        drop(channels);
        Ok(Subscription {
            receiver,
            _guard: SubscriberGuard {
                registry: self,
                channel: channel.to_owned(),
            },
        })
    }

    fn fan_out(&self, event: &MessageEvent) {
        let channels = self.channels.read();
        if let Some(entry) = channels.get(&event.channel) {
            let _ = entry.tx.send(event.clone());
        }
        if event.channel != WILDCARD_CHANNEL {
            if let Some(entry) = channels.get(WILDCARD_CHANNEL) {
                let _ = entry.tx.send(event.clone());
            }
        }
    }

    fn unsubscribe(&self, channel: &str) {
        let mut channels = self.channels.write();
        if let Some(entry) = channels.get_mut(channel) {
            entry.subscribers = entry.subscribers.saturating_sub(1);
            if entry.subscribers == 0 {
                channels.remove(channel);
            }
        }
    }

    fn channel_count(&self) -> usize {
        self.channels.read().len()
    }
}

struct SubscriberGuard {
    registry: Arc<SubscriberRegistry>,
    channel: String,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.registry.unsubscribe(&self.channel);
    }
}

/// A live subscription. Dropping it removes the table entry and prunes the
/// channel once the last subscriber leaves.
pub struct Subscription {
    receiver: broadcast::Receiver<MessageEvent>,
    _guard: SubscriberGuard,
}

impl Subscription {
    /// Next event; lagged gaps are skipped, `None` means the fabric closed.
    pub async fn recv(&mut self) -> Option<MessageEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "subscriber lagged; messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Adapts the subscription into a stream; the unsubscribe guard rides
    /// along and fires when the stream is dropped.
    pub fn into_stream(self) -> impl Stream<Item = MessageEvent> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}

pub struct Messaging {
    db: Database,
    activity: Arc<dyn ActivitySink>,
    events: Arc<dyn EventSink>,
    subscribers: Arc<SubscriberRegistry>,
}

impl Messaging {
    pub fn new(db: Database, activity: Arc<dyn ActivitySink>, events: Arc<dyn EventSink>) -> Self {
        Self {
            db,
            activity,
            events,
            subscribers: Arc::new(SubscriberRegistry::default()),
        }
    }

    /// Appends a message and notifies live subscribers. Non-string payloads
    /// are stored as serialised JSON and decoded again on read.
    #[instrument(skip(self, payload, opts))]
    pub async fn publish(
        &self,
        channel: &str,
        payload: Value,
        opts: PublishOptions,
    ) -> CoreResult<i64> {
        if channel.is_empty() {
            return Err(CoreError::validation("channel name must be a non-empty string"));
        }

        let raw = match payload {
            Value::String(text) => text,
            other => other.to_string(),
        };
        let now = now_ms();
        // An `expires` value that fails to parse coerces to zero, making the
        // message immediately expirable. Matches the historical behaviour;
        // see DESIGN.md before changing it.
        let expires_at = opts
            .expires
            .as_ref()
            .map(|input| now + parse_duration(input).unwrap_or(0));

        let result = sqlx::query(
            "INSERT INTO messages (channel, payload, sender, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(channel)
        .bind(&raw)
        .bind(&opts.sender)
        .bind(now)
        .bind(expires_at)
        .execute(self.db.pool())
        .await?;
        let id = result.last_insert_rowid();

        self.subscribers.fan_out(&MessageEvent {
            id,
            channel: channel.to_owned(),
            payload: raw,
            sender: opts.sender.clone(),
            created_at: now,
        });

        self.activity
            .record(EventKind::MessagePublish, NewActivity {
                agent_id: opts.sender,
                target_id: Some(channel.to_owned()),
                ..NewActivity::default()
            })
            .await;
        self.events
            .emit(
                EventKind::MessagePublish,
                json!({ "channel": channel, "id": id }),
                Some(channel),
            )
            .await;
        Ok(id)
    }

    /// Messages with `id > after` in ascending id order. The limit is
    /// clamped to `[1, 1000]`, defaulting to 50.
    pub async fn get_messages(
        &self,
        channel: &str,
        limit: Option<i64>,
        after: Option<i64>,
    ) -> CoreResult<Vec<Message>> {
        let limit = limit.unwrap_or(READ_LIMIT_DEFAULT).clamp(1, READ_LIMIT_MAX);
        let rows = sqlx::query(
            "SELECT * FROM messages
             WHERE channel = ? AND id > ? AND (expires_at IS NULL OR expires_at > ?)
             ORDER BY id ASC LIMIT ?",
        )
        .bind(channel)
        .bind(after.unwrap_or(0))
        .bind(now_ms())
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;
        rows.into_iter().map(map_message).collect()
    }

    /// The single next message past `after_id`, plus the cursor the caller
    /// should feed back.
    pub async fn poll(&self, channel: &str, after_id: i64) -> CoreResult<PollOutcome> {
        let row = sqlx::query(
            "SELECT * FROM messages
             WHERE channel = ? AND id > ? AND (expires_at IS NULL OR expires_at > ?)
             ORDER BY id ASC LIMIT 1",
        )
        .bind(channel)
        .bind(after_id)
        .bind(now_ms())
        .fetch_optional(self.db.pool())
        .await?;

        match row {
            Some(row) => {
                let message = map_message(row)?;
                let last_id = message.id;
                Ok(PollOutcome {
                    message: Some(message),
                    last_id,
                })
            }
            None => Ok(PollOutcome {
                message: None,
                last_id: after_id,
            }),
        }
    }

    /// Registers a live subscriber; `*` subscribes to everything.
    pub fn subscribe(&self, channel: &str) -> CoreResult<Subscription> {
        if channel.is_empty() {
            return Err(CoreError::validation("channel name must be a non-empty string"));
        }
        Arc::clone(&self.subscribers).subscribe(channel)
    }

    /// Deletes every message in the channel.
    pub async fn clear(&self, channel: &str) -> CoreResult<i64> {
        let deleted = sqlx::query("DELETE FROM messages WHERE channel = ?")
            .bind(channel)
            .execute(self.db.pool())
            .await?
            .rows_affected() as i64;

        if deleted > 0 {
            self.activity
                .record(EventKind::MessageClear, NewActivity {
                    target_id: Some(channel.to_owned()),
                    details: Some(format!("{deleted} messages")),
                    ..NewActivity::default()
                })
                .await;
        }
        Ok(deleted)
    }

    /// Channels with live rows, most recently active first.
    pub async fn list_channels(&self) -> CoreResult<Vec<ChannelInfo>> {
        let rows = sqlx::query(
            "SELECT channel, COUNT(*) AS count, MAX(created_at) AS last_message
             FROM messages WHERE expires_at IS NULL OR expires_at > ?
             GROUP BY channel ORDER BY last_message DESC",
        )
        .bind(now_ms())
        .fetch_all(self.db.pool())
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ChannelInfo {
                    channel: row.try_get("channel").map_err(CoreError::from)?,
                    count: row.try_get("count").map_err(CoreError::from)?,
                    last_message: row.try_get("last_message").map_err(CoreError::from)?,
                })
            })
            .collect()
    }

    /// Deletes expired rows.
    pub async fn cleanup(&self) -> CoreResult<i64> {
        let deleted = sqlx::query(
            "DELETE FROM messages WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now_ms())
        .execute(self.db.pool())
        .await?
        .rows_affected() as i64;
        Ok(deleted)
    }

    #[cfg(test)]
    fn live_channels(&self) -> usize {
        self.subscribers.channel_count()
    }
}

/// Payloads that look like JSON decode back to values; everything else
/// round-trips as the original string.
fn decode_payload(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

fn map_message(row: sqlx::sqlite::SqliteRow) -> CoreResult<Message> {
    Ok(Message {
        id: row.try_get("id").map_err(CoreError::from)?,
        channel: row.try_get("channel").map_err(CoreError::from)?,
        payload: decode_payload(row.try_get("payload").map_err(CoreError::from)?),
        sender: row.try_get("sender").map_err(CoreError::from)?,
        created_at: row.try_get("created_at").map_err(CoreError::from)?,
        expires_at: row.try_get("expires_at").map_err(CoreError::from)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::messaging_fixture;

    #[tokio::test]
    async fn publish_read_poll_cycle() {
        let messaging = messaging_fixture().await;

        let first = messaging
            .publish("builds", json!({ "status": "ok" }), PublishOptions::default())
            .await
            .unwrap();

        let messages = messaging.get_messages("builds", None, None).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, json!({ "status": "ok" }));

        let poll = messaging.poll("builds", first).await.unwrap();
        assert!(poll.message.is_none());
        assert_eq!(poll.last_id, first);

        let second = messaging
            .publish("builds", json!("plain text"), PublishOptions::default())
            .await
            .unwrap();
        assert!(second > first);

        let poll = messaging.poll("builds", first).await.unwrap();
        let message = poll.message.unwrap();
        assert_eq!(message.id, second);
        assert_eq!(message.payload, json!("plain text"));
        assert_eq!(poll.last_id, second);
    }

    #[tokio::test]
    async fn ids_are_monotonic_within_a_channel() {
        let messaging = messaging_fixture().await;
        let mut previous = 0;
        for i in 0..10 {
            let id = messaging
                .publish("seq", json!(i), PublishOptions::default())
                .await
                .unwrap();
            assert!(id > previous);
            previous = id;
        }
    }

    #[tokio::test]
    async fn subscribers_receive_messages_and_wildcard_sees_all() {
        let messaging = messaging_fixture().await;
        let mut on_builds = messaging.subscribe("builds").unwrap();
        let mut on_everything = messaging.subscribe(WILDCARD_CHANNEL).unwrap();

        messaging
            .publish("builds", json!({ "n": 1 }), PublishOptions::default())
            .await
            .unwrap();
        messaging
            .publish("deploys", json!({ "n": 2 }), PublishOptions::default())
            .await
            .unwrap();

        let event = on_builds.recv().await.unwrap();
        assert_eq!(event.channel, "builds");

        let event = on_everything.recv().await.unwrap();
        assert_eq!(event.channel, "builds");
        // Wildcard consumers get the raw stored payload.
        assert_eq!(event.payload, "{\"n\":1}");
        let event = on_everything.recv().await.unwrap();
        assert_eq!(event.channel, "deploys");
    }

    #[tokio::test]
    async fn dropping_a_subscription_prunes_the_channel() {
        let messaging = messaging_fixture().await;
        let sub = messaging.subscribe("ephemeral").unwrap();
        assert_eq!(messaging.live_channels(), 1);
        drop(sub);
        assert_eq!(messaging.live_channels(), 0);
    }

    #[tokio::test]
    async fn expired_messages_are_invisible_and_cleaned() {
        let messaging = messaging_fixture().await;
        messaging
            .publish("jobs", json!("stale"), PublishOptions {
                expires: Some(DurationInput::Millis(-1.0)),
                ..PublishOptions::default()
            })
            .await
            .unwrap();
        messaging
            .publish("jobs", json!("fresh"), PublishOptions::default())
            .await
            .unwrap();

        let visible = messaging.get_messages("jobs", None, None).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].payload, json!("fresh"));

        assert_eq!(messaging.cleanup().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unparseable_expiry_makes_a_message_immediately_expirable() {
        let messaging = messaging_fixture().await;
        messaging
            .publish("jobs", json!("doomed"), PublishOptions {
                expires: Some(DurationInput::Text("invalid".into())),
                ..PublishOptions::default()
            })
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let visible = messaging.get_messages("jobs", None, None).await.unwrap();
        assert!(visible.is_empty());
    }

    #[tokio::test]
    async fn clear_and_list_channels() {
        let messaging = messaging_fixture().await;
        messaging
            .publish("a", json!(1), PublishOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        messaging
            .publish("b", json!(2), PublishOptions::default())
            .await
            .unwrap();
        messaging
            .publish("b", json!(3), PublishOptions::default())
            .await
            .unwrap();

        let channels = messaging.list_channels().await.unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].channel, "b");
        assert_eq!(channels[0].count, 2);

        assert_eq!(messaging.clear("b").await.unwrap(), 2);
        let channels = messaging.list_channels().await.unwrap();
        assert_eq!(channels.len(), 1);
    }

    #[tokio::test]
    async fn empty_channel_name_is_rejected() {
        let messaging = messaging_fixture().await;
        let err = messaging
            .publish("", json!(1), PublishOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
        assert!(messaging.subscribe("").is_err());
    }
}
