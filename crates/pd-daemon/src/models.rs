//! Request and query DTOs for the HTTP surface. Responses are built from the
//! core outcome types, which serialize in camelCase already.

use pd_core::duration::DurationInput;
use serde::Deserialize;
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};

fn default_wait_timeout() -> u64 {
    30_000
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimBody {
    pub id: String,
    pub port: Option<u16>,
    pub pid: Option<i64>,
    pub agent_id: Option<String>,
    pub health_url: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<Value>,
    #[schema(value_type = Option<Object>)]
    pub expires: Option<DurationInput>,
    #[serde(default)]
    pub system_ports: Vec<u16>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ReleaseBody {
    pub id: String,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ServicesQuery {
    pub pattern: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct EndpointBody {
    pub url: String,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct WaitQuery {
    #[serde(default = "default_wait_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct WaitBody {
    pub ids: Vec<String>,
    #[serde(default = "default_wait_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LockAcquireBody {
    pub owner: Option<String>,
    pub pid: Option<i64>,
    #[schema(value_type = Option<Object>)]
    pub ttl: Option<DurationInput>,
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct LockReleaseBody {
    pub owner: Option<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct LockExtendBody {
    pub owner: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub ttl: Option<DurationInput>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct LocksQuery {
    pub owner: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentBody {
    pub id: String,
    pub name: Option<String>,
    pub pid: Option<i64>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub max_services: Option<i64>,
    pub max_locks: Option<i64>,
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct HeartbeatBody {
    pub pid: Option<i64>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct AgentsQuery {
    pub active: Option<bool>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct PublishQuery {
    pub expires: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct MessagesQuery {
    pub limit: Option<i64>,
    pub after: Option<i64>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionBody {
    pub purpose: String,
    pub agent_id: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SessionUpdateBody {
    pub status: String,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct NoteBody {
    pub content: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuickNoteBody {
    pub content: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct FilesBody {
    pub files: Vec<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct SessionsQuery {
    pub status: Option<String>,
    pub agent: Option<String>,
    pub notes: Option<bool>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookBody {
    pub url: String,
    #[serde(default)]
    pub events: Vec<String>,
    pub filter_pattern: Option<String>,
    pub secret: Option<String>,
    pub active: Option<bool>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPatchBody {
    pub url: Option<String>,
    pub events: Option<Vec<String>>,
    pub filter_pattern: Option<String>,
    pub secret: Option<String>,
    pub active: Option<bool>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct WebhooksQuery {
    pub active: Option<bool>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ActivityQuery {
    pub limit: Option<i64>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub agent: Option<String>,
    pub target: Option<String>,
    pub since: Option<i64>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct SummaryQuery {
    pub since: Option<i64>,
}
