//! The daemon: axum router over the coordination core.
//!
//! Every handler translates one request into exactly one core operation and
//! wraps the outcome in the `{success, ...}` envelope. Stable error codes
//! map onto HTTP statuses here and nowhere else.

use std::{
    collections::HashSet,
    env,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post, put},
    Json, Router,
};
use futures::StreamExt;
use pd_core::{
    activity::{NewActivity, RecentFilter},
    agents::RegisterOptions,
    duration::DurationInput,
    error::{CoreError, ErrorCode},
    events::EventKind,
    locks::AcquireOptions,
    messaging::PublishOptions,
    services::ClaimOptions,
    sessions::{SessionFilter, StartOptions, STATUS_ABANDONED, STATUS_ACTIVE, STATUS_COMPLETED, STATUS_PAUSED},
    webhooks::{WebhookOptions, WebhookPatch},
    Coordinator, CoordinatorConfig,
};
use pd_db::{now_ms, Database};
use serde_json::{json, Value};
use tokio::net::UnixListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use utoipa::OpenApi;

use crate::models::*;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9876";
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);
const WAIT_TIMEOUT_MAX_MS: u64 = 120_000;

pub async fn run() -> Result<()> {
    let config = DaemonConfig::from_env()?;

    let db = Database::open(config.db_path.as_deref())
        .await
        .context("failed to open coordination store")?;

    let core = Arc::new(Coordinator::new(db, CoordinatorConfig {
        port_range: config.port_range,
        reserved_ports: config.reserved_ports.clone(),
        ..CoordinatorConfig::default()
    }));
    core.webhooks.clone().spawn_worker();
    spawn_maintenance(core.clone());

    core.activity
        .log(EventKind::DaemonStart, NewActivity::default())
        .await
        .ok();

    let state = Arc::new(AppState {
        core: core.clone(),
        started_at: now_ms(),
    });
    let app = build_router(state).layer(TraceLayer::new_for_http());

    if let Some(path) = config.socket_path.clone() {
        tokio::spawn(serve_unix(app.clone(), path));
    }

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;
    info!(addr = %config.listen_addr, "port-daddyd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server exited")?;

    core.activity
        .log(EventKind::DaemonStop, NewActivity::default())
        .await
        .ok();
    core.db().close().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to install ctrl-c handler");
    }
    info!("shutdown signal received");
}

fn spawn_maintenance(core: Arc<Coordinator>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match core.run_maintenance().await {
                Ok(report) => {
                    let swept = report.expired_locks
                        + report.expired_services
                        + report.stale_agents
                        + report.expired_messages;
                    if swept > 0 {
                        debug!(?report, "maintenance sweep removed rows");
                        core.activity
                            .log(EventKind::Cleanup, NewActivity {
                                details: Some(format!(
                                    "locks={} services={} agents={} messages={}",
                                    report.expired_locks,
                                    report.expired_services,
                                    report.stale_agents,
                                    report.expired_messages
                                )),
                                ..NewActivity::default()
                            })
                            .await
                            .ok();
                    }
                }
                Err(error) => warn!(%error, "maintenance sweep failed"),
            }
        }
    });
}

/// Serves the same router on a Unix domain socket.
async fn serve_unix(app: Router, path: PathBuf) {
    let _ = tokio::fs::remove_file(&path).await;
    let listener = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(error) => {
            warn!(path = %path.display(), %error, "failed to bind unix socket");
            return;
        }
    };
    info!(path = %path.display(), "port-daddyd listening on unix socket");

    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!(%error, "unix socket accept failed");
                continue;
            }
        };
        let service = hyper_util::service::TowerToHyperService::new(app.clone());
        tokio::spawn(async move {
            let io = hyper_util::rt::TokioIo::new(stream);
            if let Err(error) = hyper_util::server::conn::auto::Builder::new(
                hyper_util::rt::TokioExecutor::new(),
            )
            .serve_connection_with_upgrades(io, service)
            .await
            {
                debug!(%error, "unix connection ended with error");
            }
        });
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/claim", post(claim))
        .route("/release", delete(release))
        .route("/services", get(list_services))
        .route("/services/:id", get(get_service))
        .route("/services/:id/endpoints/:name", put(set_endpoint))
        .route("/wait/:id", get(wait_one))
        .route("/wait", post(wait_many))
        .route(
            "/locks/:name",
            post(acquire_lock)
                .delete(release_lock)
                .get(check_lock)
                .put(extend_lock),
        )
        .route("/locks", get(list_locks))
        .route("/agents", post(register_agent).get(list_agents))
        .route("/agents/:id/heartbeat", post(agent_heartbeat))
        .route("/agents/:id", delete(unregister_agent).get(get_agent))
        .route(
            "/msg/:channel",
            post(publish_message).get(get_messages).delete(clear_channel),
        )
        .route("/channels", get(list_channels))
        .route("/subscribe/:channel", get(subscribe_channel))
        .route("/sessions", post(start_session).get(list_sessions))
        .route(
            "/sessions/:id",
            get(get_session).put(update_session).delete(remove_session),
        )
        .route("/sessions/:id/notes", post(add_session_note))
        .route(
            "/sessions/:id/files",
            post(claim_session_files).delete(release_session_files),
        )
        .route("/files/conflicts", post(file_conflicts))
        .route("/notes", post(quick_note))
        .route("/webhooks", post(register_webhook).get(list_webhooks))
        .route(
            "/webhooks/:id",
            delete(remove_webhook).put(update_webhook),
        )
        .route("/webhooks/:id/test", post(test_webhook))
        .route("/activity", get(recent_activity))
        .route("/activity/summary", get(activity_summary))
        .route("/activity/stats", get(activity_stats))
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/ports/cleanup", post(ports_cleanup))
        .with_state(state)
}

struct AppState {
    core: Arc<Coordinator>,
    started_at: i64,
}

#[derive(Debug, Clone)]
struct DaemonConfig {
    listen_addr: SocketAddr,
    socket_path: Option<PathBuf>,
    db_path: Option<PathBuf>,
    port_range: (u16, u16),
    reserved_ports: HashSet<u16>,
}

impl DaemonConfig {
    fn from_env() -> Result<Self> {
        let listen_addr = env::var("PORT_DADDY_ADDR")
            .unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string())
            .parse()
            .context("invalid PORT_DADDY_ADDR")?;

        let socket_path = env::var("PORT_DADDY_SOCKET")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        let port_range = match env::var("PORT_DADDY_PORT_RANGE") {
            Ok(value) => parse_port_range(&value).context("invalid PORT_DADDY_PORT_RANGE")?,
            Err(_) => (3100, 9999),
        };

        let reserved_ports = env::var("PORT_DADDY_RESERVED_PORTS")
            .map(|value| {
                value
                    .split(',')
                    .filter_map(|item| item.trim().parse::<u16>().ok())
                    .collect::<HashSet<_>>()
            })
            .unwrap_or_default();

        Ok(Self {
            listen_addr,
            socket_path,
            db_path: None,
            port_range,
            reserved_ports,
        })
    }
}

fn parse_port_range(value: &str) -> Result<(u16, u16)> {
    let (lo, hi) = value
        .split_once('-')
        .context("expected <lo>-<hi>")?;
    let lo: u16 = lo.trim().parse().context("invalid low port")?;
    let hi: u16 = hi.trim().parse().context("invalid high port")?;
    anyhow::ensure!(lo <= hi, "low port must not exceed high port");
    Ok((lo, hi))
}

// ---- error translation ------------------------------------------------------

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: ErrorCode,
    message: String,
    details: Option<Value>,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: ErrorCode::InternalError,
            message: message.into(),
            details: None,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: ErrorCode::ValidationError,
            message: message.into(),
            details: None,
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        let status = match error.code {
            ErrorCode::IdentityInvalid
            | ErrorCode::ValidationError
            | ErrorCode::InvalidTtl
            | ErrorCode::InvalidEvent
            | ErrorCode::AgentIdInvalid => StatusCode::BAD_REQUEST,
            ErrorCode::LockHeld | ErrorCode::FileConflict => StatusCode::CONFLICT,
            ErrorCode::PortExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::ServiceNotFound
            | ErrorCode::LockNotFound
            | ErrorCode::SessionNotFound => StatusCode::NOT_FOUND,
            ErrorCode::Timeout => StatusCode::REQUEST_TIMEOUT,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: error.code,
            message: error.message,
            details: error.details,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Extras (conflicting holder, limit counts) flatten into the body so
        // callers can back off without a second request.
        let mut body = match self.details {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        body.insert("success".into(), json!(false));
        body.insert("error".into(), json!(self.message));
        body.insert("code".into(), json!(self.code.as_str()));
        (self.status, Json(Value::Object(body))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

/// Wraps a serialisable outcome in the `{success: true, ...}` envelope.
fn ok<T: serde::Serialize>(value: &T) -> ApiResult {
    let value = serde_json::to_value(value).map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(envelope(value))
}

fn envelope(mut value: Value) -> Json<Value> {
    if let Value::Object(map) = &mut value {
        map.insert("success".into(), json!(true));
    }
    Json(value)
}

/// Caller identity from the `X-Agent-Id` / `X-Pid` request headers.
fn caller(headers: &HeaderMap) -> (Option<String>, Option<i64>) {
    let agent_id = headers
        .get("x-agent-id")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_owned);
    let pid = headers
        .get("x-pid")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok());
    (agent_id, pid)
}

fn duration_param(raw: &str) -> DurationInput {
    match raw.parse::<f64>() {
        Ok(ms) => DurationInput::Millis(ms),
        Err(_) => DurationInput::Text(raw.to_owned()),
    }
}

// ---- services ---------------------------------------------------------------

#[utoipa::path(post, path = "/claim", request_body = ClaimBody,
    responses((status = 200, description = "Port assigned or refreshed")))]
async fn claim(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ClaimBody>,
) -> ApiResult {
    let (header_agent, header_pid) = caller(&headers);
    let outcome = state
        .core
        .services
        .claim(&body.id, ClaimOptions {
            port: body.port,
            pid: body.pid.or(header_pid),
            agent_id: body.agent_id.or(header_agent),
            health_url: body.health_url,
            metadata: body.metadata,
            expires: body.expires,
            system_ports: body.system_ports.into_iter().collect(),
        })
        .await?;
    ok(&outcome)
}

#[utoipa::path(delete, path = "/release", request_body = ReleaseBody,
    responses((status = 200, description = "Matching services released")))]
async fn release(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReleaseBody>,
) -> ApiResult {
    let outcome = state.core.services.release(&body.id).await?;
    ok(&outcome)
}

#[utoipa::path(get, path = "/services", params(ServicesQuery),
    responses((status = 200, description = "Matching services")))]
async fn list_services(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ServicesQuery>,
) -> ApiResult {
    let pattern = query.pattern.as_deref().unwrap_or("*");
    let services = state
        .core
        .services
        .find(pattern, query.status.as_deref())
        .await?;
    Ok(envelope(json!({ "services": services, "count": services.len() })))
}

#[utoipa::path(get, path = "/services/{id}",
    responses((status = 200, description = "Service detail"), (status = 404, description = "Unknown service")))]
async fn get_service(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let service = state.core.services.get(&id).await?;
    ok(&service)
}

#[utoipa::path(put, path = "/services/{id}/endpoints/{name}", request_body = EndpointBody,
    responses((status = 200, description = "Endpoint recorded")))]
async fn set_endpoint(
    State(state): State<Arc<AppState>>,
    Path((id, name)): Path<(String, String)>,
    Json(body): Json<EndpointBody>,
) -> ApiResult {
    state.core.services.set_endpoint(&id, &name, &body.url).await?;
    Ok(envelope(json!({ "id": id, "endpoint": name })))
}

#[utoipa::path(get, path = "/wait/{id}", params(WaitQuery),
    responses((status = 200, description = "Service appeared"), (status = 408, description = "Timed out")))]
async fn wait_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Response {
    wait_for_services(&state.core, vec![id], query.timeout).await
}

#[utoipa::path(post, path = "/wait", request_body = WaitBody,
    responses((status = 200, description = "All services appeared"), (status = 408, description = "Timed out")))]
async fn wait_many(State(state): State<Arc<AppState>>, Json(body): Json<WaitBody>) -> Response {
    wait_for_services(&state.core, body.ids, body.timeout).await
}

/// Event-driven wait: re-checks the snapshot on every claim notification
/// until everything is present or the deadline passes. Dropping the request
/// drops the watch subscription, so cancelled waiters never linger.
async fn wait_for_services(core: &Coordinator, ids: Vec<String>, timeout_ms: u64) -> Response {
    let timeout_ms = timeout_ms.clamp(1, WAIT_TIMEOUT_MAX_MS);
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut watch = core.services.watch();

    loop {
        let found = match core.services.snapshot(&ids).await {
            Ok(found) => found,
            Err(error) => return ApiError::from(error).into_response(),
        };
        if found.len() == ids.len() {
            return envelope(json!({
                "services": found,
                "resolved": found.len(),
                "requested": ids.len(),
                "timedOut": false,
            }))
            .into_response();
        }

        match tokio::time::timeout_at(deadline, watch.recv()).await {
            // Any claim notification triggers a re-check of the snapshot.
            Ok(Ok(_)) => continue,
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) | Err(_) => {
                return (
                    StatusCode::REQUEST_TIMEOUT,
                    Json(json!({
                        "success": false,
                        "error": "timed out waiting for services",
                        "code": ErrorCode::Timeout.as_str(),
                        "services": found,
                        "resolved": found.len(),
                        "requested": ids.len(),
                        "timedOut": true,
                    })),
                )
                    .into_response();
            }
        }
    }
}

// ---- locks ------------------------------------------------------------------

#[utoipa::path(post, path = "/locks/{name}", request_body = LockAcquireBody,
    responses((status = 200, description = "Lock acquired"), (status = 409, description = "Lock held")))]
async fn acquire_lock(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Option<Json<LockAcquireBody>>,
) -> ApiResult {
    let Json(body) = body.unwrap_or_default();
    let (header_agent, header_pid) = caller(&headers);
    let lock = state
        .core
        .locks
        .acquire(&name, AcquireOptions {
            owner: body.owner.or(header_agent),
            pid: body.pid.or(header_pid),
            ttl: body.ttl,
            metadata: body.metadata,
        })
        .await?;
    ok(&lock)
}

#[utoipa::path(delete, path = "/locks/{name}", request_body = LockReleaseBody,
    responses((status = 200, description = "Lock released or already free")))]
async fn release_lock(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Option<Json<LockReleaseBody>>,
) -> ApiResult {
    let Json(body) = body.unwrap_or_default();
    let (header_agent, _) = caller(&headers);
    let owner = body.owner.or(header_agent);
    let outcome = state
        .core
        .locks
        .release(&name, owner.as_deref(), body.force)
        .await?;
    ok(&outcome)
}

#[utoipa::path(get, path = "/locks/{name}",
    responses((status = 200, description = "Lock state")))]
async fn check_lock(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResult {
    let check = state.core.locks.check(&name).await?;
    ok(&check)
}

#[utoipa::path(put, path = "/locks/{name}", request_body = LockExtendBody,
    responses((status = 200, description = "Lock extended"), (status = 404, description = "Not the holder")))]
async fn extend_lock(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Option<Json<LockExtendBody>>,
) -> ApiResult {
    let Json(body) = body.unwrap_or_default();
    let (header_agent, _) = caller(&headers);
    let owner = body.owner.or(header_agent);
    let lock = state
        .core
        .locks
        .extend(&name, owner.as_deref(), body.ttl.as_ref())
        .await?;
    ok(&lock)
}

#[utoipa::path(get, path = "/locks", params(LocksQuery),
    responses((status = 200, description = "Live locks")))]
async fn list_locks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LocksQuery>,
) -> ApiResult {
    let locks = state.core.locks.list(query.owner.as_deref()).await?;
    Ok(envelope(json!({ "locks": locks, "count": locks.len() })))
}

// ---- agents -----------------------------------------------------------------

#[utoipa::path(post, path = "/agents", request_body = AgentBody,
    responses((status = 200, description = "Agent registered")))]
async fn register_agent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AgentBody>,
) -> ApiResult {
    let (_, header_pid) = caller(&headers);
    let agent = state
        .core
        .agents
        .register(&body.id, RegisterOptions {
            name: body.name,
            pid: body.pid.or(header_pid),
            kind: body.kind,
            max_services: body.max_services,
            max_locks: body.max_locks,
            metadata: body.metadata,
        })
        .await?;
    ok(&agent)
}

#[utoipa::path(post, path = "/agents/{id}/heartbeat", request_body = HeartbeatBody,
    responses((status = 200, description = "Heartbeat recorded")))]
async fn agent_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<HeartbeatBody>>,
) -> ApiResult {
    let Json(body) = body.unwrap_or_default();
    let (_, header_pid) = caller(&headers);
    let agent = state
        .core
        .agents
        .heartbeat(&id, body.pid.or(header_pid))
        .await?;
    ok(&agent)
}

#[utoipa::path(delete, path = "/agents/{id}",
    responses((status = 200, description = "Agent removed (or was already gone)")))]
async fn unregister_agent(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let unregistered = state.core.agents.unregister(&id).await?;
    Ok(envelope(json!({ "unregistered": unregistered })))
}

#[utoipa::path(get, path = "/agents/{id}",
    responses((status = 200, description = "Agent detail"), (status = 404, description = "Unknown agent")))]
async fn get_agent(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    match state.core.agents.get(&id).await? {
        Some(agent) => ok(&agent),
        None => Err(ApiError::not_found(format!("agent '{id}' is not registered"))),
    }
}

#[utoipa::path(get, path = "/agents", params(AgentsQuery),
    responses((status = 200, description = "Known agents")))]
async fn list_agents(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AgentsQuery>,
) -> ApiResult {
    let agents = state.core.agents.list(query.active.unwrap_or(false)).await?;
    Ok(envelope(json!({ "agents": agents, "count": agents.len() })))
}

// ---- messaging --------------------------------------------------------------

#[utoipa::path(post, path = "/msg/{channel}", params(PublishQuery),
    responses((status = 200, description = "Message stored")))]
async fn publish_message(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    Query(query): Query<PublishQuery>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> ApiResult {
    let (sender, _) = caller(&headers);
    let id = state
        .core
        .messaging
        .publish(&channel, payload, PublishOptions {
            sender,
            expires: query.expires.as_deref().map(duration_param),
        })
        .await?;
    Ok(envelope(json!({ "id": id, "channel": channel })))
}

#[utoipa::path(get, path = "/msg/{channel}", params(MessagesQuery),
    responses((status = 200, description = "Messages in id order")))]
async fn get_messages(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult {
    let messages = state
        .core
        .messaging
        .get_messages(&channel, query.limit, query.after)
        .await?;
    let last_id = messages.last().map(|m| m.id);
    Ok(envelope(json!({
        "channel": channel,
        "messages": messages,
        "count": messages.len(),
        "lastId": last_id,
    })))
}

#[utoipa::path(delete, path = "/msg/{channel}",
    responses((status = 200, description = "Channel cleared")))]
async fn clear_channel(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
) -> ApiResult {
    let cleared = state.core.messaging.clear(&channel).await?;
    Ok(envelope(json!({ "channel": channel, "cleared": cleared })))
}

#[utoipa::path(get, path = "/channels",
    responses((status = 200, description = "Channels by recency")))]
async fn list_channels(State(state): State<Arc<AppState>>) -> ApiResult {
    let channels = state.core.messaging.list_channels().await?;
    Ok(envelope(json!({ "channels": channels, "count": channels.len() })))
}

#[utoipa::path(get, path = "/subscribe/{channel}",
    responses((status = 200, description = "SSE stream of channel messages")))]
async fn subscribe_channel(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
) -> Response {
    let subscription = match state.core.messaging.subscribe(&channel) {
        Ok(subscription) => subscription,
        Err(error) => return ApiError::from(error).into_response(),
    };
    let stream = subscription.into_stream().map(|message| {
        let data = json!({
            "id": message.id,
            "channel": message.channel,
            "payload": message.payload,
            "sender": message.sender,
            "timestamp": message.created_at,
        });
        Ok::<_, std::convert::Infallible>(Event::default().event("message").data(data.to_string()))
    });
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

// ---- sessions ---------------------------------------------------------------

#[utoipa::path(post, path = "/sessions", request_body = SessionBody,
    responses((status = 200, description = "Session started, conflicts reported")))]
async fn start_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SessionBody>,
) -> ApiResult {
    let (header_agent, _) = caller(&headers);
    let outcome = state
        .core
        .sessions
        .start(&body.purpose, StartOptions {
            agent_id: body.agent_id.or(header_agent),
            metadata: body.metadata,
            files: body.files,
        })
        .await?;
    ok(&outcome)
}

#[utoipa::path(get, path = "/sessions", params(SessionsQuery),
    responses((status = 200, description = "Sessions by recency")))]
async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionsQuery>,
) -> ApiResult {
    let sessions = state
        .core
        .sessions
        .list(SessionFilter {
            status: Some(query.status.unwrap_or_else(|| STATUS_ACTIVE.to_owned())),
            agent_id: query.agent,
            include_notes: query.notes.unwrap_or(false),
            limit: query.limit,
        })
        .await?;
    Ok(envelope(json!({ "sessions": sessions, "count": sessions.len() })))
}

#[utoipa::path(get, path = "/sessions/{id}",
    responses((status = 200, description = "Session with notes and files")))]
async fn get_session(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let detail = state.core.sessions.get(&id).await?;
    ok(&detail)
}

#[utoipa::path(put, path = "/sessions/{id}", request_body = SessionUpdateBody,
    responses((status = 200, description = "Status changed")))]
async fn update_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SessionUpdateBody>,
) -> ApiResult {
    match body.status.as_str() {
        STATUS_COMPLETED | STATUS_ABANDONED => {
            let outcome = state
                .core
                .sessions
                .end(&id, &body.status, body.note.as_deref())
                .await?;
            ok(&outcome)
        }
        STATUS_ACTIVE | STATUS_PAUSED => {
            let session = state.core.sessions.set_status(&id, &body.status).await?;
            ok(&session)
        }
        other => Err(CoreError::validation(format!("unknown session status '{other}'")).into()),
    }
}

#[utoipa::path(delete, path = "/sessions/{id}",
    responses((status = 200, description = "Session removed with its children")))]
async fn remove_session(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let removed = state.core.sessions.remove(&id).await?;
    Ok(envelope(json!({ "removed": removed })))
}

#[utoipa::path(post, path = "/sessions/{id}/notes", request_body = NoteBody,
    responses((status = 200, description = "Note appended")))]
async fn add_session_note(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<NoteBody>,
) -> ApiResult {
    let note = state
        .core
        .sessions
        .add_note(&id, &body.content, body.kind.as_deref())
        .await?;
    ok(&note)
}

#[utoipa::path(post, path = "/sessions/{id}/files", request_body = FilesBody,
    responses((status = 200, description = "Files claimed, conflicts reported")))]
async fn claim_session_files(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<FilesBody>,
) -> ApiResult {
    let outcome = state.core.sessions.claim_files(&id, &body.files).await?;
    ok(&outcome)
}

#[utoipa::path(delete, path = "/sessions/{id}/files", request_body = FilesBody,
    responses((status = 200, description = "Own claims released")))]
async fn release_session_files(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<FilesBody>,
) -> ApiResult {
    let released = state.core.sessions.release_files(&id, &body.files).await?;
    Ok(envelope(json!({ "released": released })))
}

#[utoipa::path(post, path = "/files/conflicts", request_body = FilesBody,
    responses((status = 200, description = "Active claims on the given paths")))]
async fn file_conflicts(
    State(state): State<Arc<AppState>>,
    Json(body): Json<FilesBody>,
) -> ApiResult {
    let conflicts = state.core.sessions.get_file_conflicts(&body.files).await?;
    Ok(envelope(json!({ "conflicts": conflicts, "count": conflicts.len() })))
}

#[utoipa::path(post, path = "/notes", request_body = QuickNoteBody,
    responses((status = 200, description = "Note appended to the caller's session")))]
async fn quick_note(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<QuickNoteBody>,
) -> ApiResult {
    let (header_agent, _) = caller(&headers);
    let agent_id = body.agent_id.or(header_agent);
    let outcome = state
        .core
        .sessions
        .quick_note(&body.content, agent_id.as_deref(), body.kind.as_deref())
        .await?;
    ok(&outcome)
}

// ---- webhooks ---------------------------------------------------------------

#[utoipa::path(post, path = "/webhooks", request_body = WebhookBody,
    responses((status = 200, description = "Webhook registered"), (status = 400, description = "Rejected URL or events")))]
async fn register_webhook(
    State(state): State<Arc<AppState>>,
    Json(body): Json<WebhookBody>,
) -> ApiResult {
    let webhook = state
        .core
        .webhooks
        .register(&body.url, WebhookOptions {
            events: body.events,
            filter_pattern: body.filter_pattern,
            secret: body.secret,
            active: body.active,
        })
        .await?;
    ok(&webhook)
}

#[utoipa::path(get, path = "/webhooks", params(WebhooksQuery),
    responses((status = 200, description = "Registered webhooks")))]
async fn list_webhooks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WebhooksQuery>,
) -> ApiResult {
    let webhooks = state
        .core
        .webhooks
        .list(query.active.unwrap_or(false))
        .await?;
    Ok(envelope(json!({ "webhooks": webhooks, "count": webhooks.len() })))
}

#[utoipa::path(put, path = "/webhooks/{id}", request_body = WebhookPatchBody,
    responses((status = 200, description = "Webhook updated")))]
async fn update_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<WebhookPatchBody>,
) -> ApiResult {
    let webhook = state
        .core
        .webhooks
        .update(&id, WebhookPatch {
            url: body.url,
            events: body.events,
            filter_pattern: body.filter_pattern,
            secret: body.secret,
            active: body.active,
        })
        .await?;
    ok(&webhook)
}

#[utoipa::path(delete, path = "/webhooks/{id}",
    responses((status = 200, description = "Webhook removed (or was already gone)")))]
async fn remove_webhook(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let removed = state.core.webhooks.remove(&id).await?;
    Ok(envelope(json!({ "removed": removed })))
}

#[utoipa::path(post, path = "/webhooks/{id}/test",
    responses((status = 200, description = "Synthetic delivery queued")))]
async fn test_webhook(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let delivery_id = state.core.webhooks.test(&id).await?;
    Ok(envelope(json!({ "deliveryId": delivery_id })))
}

// ---- activity & meta --------------------------------------------------------

#[utoipa::path(get, path = "/activity", params(ActivityQuery),
    responses((status = 200, description = "Recent activity records")))]
async fn recent_activity(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ActivityQuery>,
) -> ApiResult {
    let activities = match query.since {
        Some(since) => {
            state
                .core
                .activity
                .get_by_time_range(since, now_ms(), query.limit)
                .await?
        }
        None => {
            state
                .core
                .activity
                .get_recent(RecentFilter {
                    kind: query.kind,
                    agent_id: query.agent,
                    target_pattern: query.target,
                    limit: query.limit,
                })
                .await?
        }
    };
    Ok(envelope(json!({ "activities": activities, "count": activities.len() })))
}

#[utoipa::path(get, path = "/activity/summary", params(SummaryQuery),
    responses((status = 200, description = "Per-type counts")))]
async fn activity_summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SummaryQuery>,
) -> ApiResult {
    let summary = state.core.activity.get_summary(query.since).await?;
    ok(&summary)
}

#[utoipa::path(get, path = "/activity/stats",
    responses((status = 200, description = "Log size and retention")))]
async fn activity_stats(State(state): State<Arc<AppState>>) -> ApiResult {
    let stats = state.core.activity.get_stats().await?;
    ok(&stats)
}

#[utoipa::path(get, path = "/health",
    responses((status = 200, description = "Daemon is healthy")))]
async fn health(State(state): State<Arc<AppState>>) -> ApiResult {
    Ok(envelope(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeMs": now_ms() - state.started_at,
        "db": if state.core.db().is_in_memory() { "memory" } else { "file" },
    })))
}

#[utoipa::path(get, path = "/version",
    responses((status = 200, description = "Daemon version")))]
async fn version() -> Json<Value> {
    envelope(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

#[utoipa::path(post, path = "/ports/cleanup",
    responses((status = 200, description = "Full maintenance sweep")))]
async fn ports_cleanup(State(state): State<Arc<AppState>>) -> ApiResult {
    let report = state.core.run_maintenance().await?;
    ok(&report)
}

pub mod docs {
    use super::*;

    #[derive(OpenApi)]
    #[openapi(
        info(title = "Port Daddy Daemon API", version = "0.1.0"),
        paths(
            claim,
            release,
            list_services,
            get_service,
            set_endpoint,
            wait_one,
            wait_many,
            acquire_lock,
            release_lock,
            check_lock,
            extend_lock,
            list_locks,
            register_agent,
            agent_heartbeat,
            unregister_agent,
            get_agent,
            list_agents,
            publish_message,
            get_messages,
            clear_channel,
            list_channels,
            subscribe_channel,
            start_session,
            list_sessions,
            get_session,
            update_session,
            remove_session,
            add_session_note,
            claim_session_files,
            release_session_files,
            file_conflicts,
            quick_note,
            register_webhook,
            list_webhooks,
            update_webhook,
            remove_webhook,
            test_webhook,
            recent_activity,
            activity_summary,
            activity_stats,
            health,
            version,
            ports_cleanup
        ),
        components(schemas(
            ClaimBody,
            ReleaseBody,
            EndpointBody,
            WaitBody,
            LockAcquireBody,
            LockReleaseBody,
            LockExtendBody,
            AgentBody,
            HeartbeatBody,
            SessionBody,
            SessionUpdateBody,
            NoteBody,
            QuickNoteBody,
            FilesBody,
            WebhookBody,
            WebhookPatchBody
        ))
    )]
    pub struct ApiDoc;
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::Service;

    async fn setup_test_app() -> (Arc<AppState>, Router) {
        let db = Database::open_in_memory().await.expect("db");
        let core = Arc::new(Coordinator::new(db, CoordinatorConfig {
            port_range: (3100, 3199),
            ..CoordinatorConfig::default()
        }));
        let state = Arc::new(AppState {
            core,
            started_at: now_ms(),
        });
        let router = build_router(state.clone());
        (state, router)
    }

    async fn send(router: &mut Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router.call(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    #[tokio::test]
    async fn claim_release_claim_round_trip() {
        let (_state, mut router) = setup_test_app().await;

        let (status, body) = send(
            &mut router,
            "POST",
            "/claim",
            Some(json!({ "id": "myapp:api" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        let port = body["port"].as_u64().unwrap();
        assert!((3100..=3199).contains(&(port as u16 as u64)));
        assert_eq!(body["existing"], false);

        let (_, body) = send(
            &mut router,
            "POST",
            "/claim",
            Some(json!({ "id": "myapp:api" })),
        )
        .await;
        assert_eq!(body["existing"], true);
        assert_eq!(body["port"].as_u64().unwrap(), port);

        let (status, body) = send(
            &mut router,
            "DELETE",
            "/release",
            Some(json!({ "id": "myapp:api" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["released"], 1);

        let (_, body) = send(
            &mut router,
            "DELETE",
            "/release",
            Some(json!({ "id": "myapp:api" })),
        )
        .await;
        assert_eq!(body["released"], 0);
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn invalid_identity_maps_to_400() {
        let (_state, mut router) = setup_test_app().await;
        let (status, body) = send(
            &mut router,
            "POST",
            "/claim",
            Some(json!({ "id": "not a valid id" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "IDENTITY_INVALID");
    }

    #[tokio::test]
    async fn lock_conflict_maps_to_409_with_holder() {
        let (_state, mut router) = setup_test_app().await;

        let (status, _) = send(
            &mut router,
            "POST",
            "/locks/deploy",
            Some(json!({ "owner": "a" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &mut router,
            "POST",
            "/locks/deploy",
            Some(json!({ "owner": "b" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "LOCK_HELD");
        assert_eq!(body["holder"], "a");

        let (status, body) = send(
            &mut router,
            "DELETE",
            "/locks/deploy",
            Some(json!({ "owner": "b" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "LOCK_NOT_FOUND");

        let (status, body) = send(
            &mut router,
            "DELETE",
            "/locks/deploy",
            Some(json!({ "owner": "a" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["released"], true);
    }

    #[tokio::test]
    async fn wait_times_out_with_408_and_progress() {
        let (_state, mut router) = setup_test_app().await;
        send(&mut router, "POST", "/claim", Some(json!({ "id": "here" }))).await;

        let (status, body) = send(
            &mut router,
            "POST",
            "/wait",
            Some(json!({ "ids": ["here", "missing"], "timeout": 50 })),
        )
        .await;
        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(body["timedOut"], true);
        assert_eq!(body["code"], "TIMEOUT");
        assert_eq!(body["resolved"], 1);
        assert_eq!(body["requested"], 2);
    }

    #[tokio::test]
    async fn wait_resolves_immediately_when_present() {
        let (_state, mut router) = setup_test_app().await;
        let (_, claimed) = send(&mut router, "POST", "/claim", Some(json!({ "id": "svc" }))).await;

        let (status, body) = send(&mut router, "GET", "/wait/svc?timeout=1000", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["timedOut"], false);
        assert_eq!(body["services"]["svc"], claimed["port"]);
    }

    #[tokio::test]
    async fn messaging_round_trip_over_http() {
        let (_state, mut router) = setup_test_app().await;

        let (status, body) = send(
            &mut router,
            "POST",
            "/msg/builds",
            Some(json!({ "status": "ok" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let first_id = body["id"].as_i64().unwrap();

        let (_, body) = send(&mut router, "GET", "/msg/builds", None).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["messages"][0]["payload"]["status"], "ok");
        assert_eq!(body["lastId"], first_id);

        let (_, body) = send(&mut router, "GET", "/channels", None).await;
        assert_eq!(body["channels"][0]["channel"], "builds");

        let (_, body) = send(&mut router, "DELETE", "/msg/builds", None).await;
        assert_eq!(body["cleared"], 1);
    }

    #[tokio::test]
    async fn agent_lifecycle_over_http() {
        let (_state, mut router) = setup_test_app().await;

        let (status, body) = send(
            &mut router,
            "POST",
            "/agents",
            Some(json!({ "id": "a1", "maxLocks": 3 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["maxLocks"], 3);
        assert_eq!(body["isActive"], true);

        let (status, _) = send(&mut router, "POST", "/agents/a1/heartbeat", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&mut router, "GET", "/agents/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);

        let (_, body) = send(&mut router, "DELETE", "/agents/a1", None).await;
        assert_eq!(body["unregistered"], true);
        let (_, body) = send(&mut router, "DELETE", "/agents/a1", None).await;
        assert_eq!(body["unregistered"], false);
    }

    #[tokio::test]
    async fn session_flow_over_http() {
        let (_state, mut router) = setup_test_app().await;

        let (_, first) = send(
            &mut router,
            "POST",
            "/sessions",
            Some(json!({ "purpose": "work", "files": ["a.ts"] })),
        )
        .await;
        let first_id = first["session"]["id"].as_str().unwrap().to_owned();

        let (_, second) = send(
            &mut router,
            "POST",
            "/sessions",
            Some(json!({ "purpose": "other", "files": ["a.ts", "b.ts"] })),
        )
        .await;
        assert_eq!(second["conflicts"].as_array().unwrap().len(), 1);
        assert_eq!(second["conflicts"][0]["sessionId"], first_id.as_str());

        let (_, conflicts) = send(
            &mut router,
            "POST",
            "/files/conflicts",
            Some(json!({ "files": ["a.ts"] })),
        )
        .await;
        assert_eq!(conflicts["count"], 2);

        let (status, ended) = send(
            &mut router,
            "PUT",
            &format!("/sessions/{first_id}"),
            Some(json!({ "status": "completed", "note": "done" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ended["releasedFiles"][0], "a.ts");

        let (_, conflicts) = send(
            &mut router,
            "POST",
            "/files/conflicts",
            Some(json!({ "files": ["a.ts"] })),
        )
        .await;
        assert_eq!(conflicts["count"], 1);

        let (_, detail) = send(&mut router, "GET", &format!("/sessions/{first_id}"), None).await;
        assert_eq!(detail["status"], "completed");
        assert_eq!(detail["notes"].as_array().unwrap().len(), 1);

        let (status, body) = send(&mut router, "GET", "/sessions/session-00000000", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn webhook_registration_rejects_private_hosts() {
        let (_state, mut router) = setup_test_app().await;

        let (status, body) = send(
            &mut router,
            "POST",
            "/webhooks",
            Some(json!({ "url": "http://169.254.169.254/hook" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");

        let (status, body) = send(
            &mut router,
            "POST",
            "/webhooks",
            Some(json!({
                "url": "https://example.com/hook",
                "events": ["service.claim"],
                "secret": "s3cret",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hasSecret"], true);
        assert!(body.get("secret").is_none());
        let id = body["id"].as_str().unwrap().to_owned();

        let (status, body) = send(
            &mut router,
            "POST",
            "/webhooks",
            Some(json!({ "url": "https://example.com/hook", "events": ["nope"] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_EVENT");

        let (_, body) = send(&mut router, "DELETE", &format!("/webhooks/{id}"), None).await;
        assert_eq!(body["removed"], true);
    }

    #[tokio::test]
    async fn activity_reflects_operations() {
        let (_state, mut router) = setup_test_app().await;
        send(&mut router, "POST", "/claim", Some(json!({ "id": "a" }))).await;
        send(&mut router, "POST", "/locks/l1", Some(json!({ "owner": "x" }))).await;

        let (_, body) = send(&mut router, "GET", "/activity?type=service.claim", None).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["activities"][0]["type"], "service.claim");

        let (_, summary) = send(&mut router, "GET", "/activity/summary", None).await;
        assert!(summary["total"].as_i64().unwrap() >= 2);

        let (_, stats) = send(&mut router, "GET", "/activity/stats", None).await;
        assert!(stats["totalEntries"].as_i64().unwrap() >= 2);
        assert_eq!(stats["maxEntries"], 10_000);
    }

    #[tokio::test]
    async fn caller_headers_feed_accounting() {
        let (state, mut router) = setup_test_app().await;

        let request = Request::builder()
            .method("POST")
            .uri("/claim")
            .header("content-type", "application/json")
            .header("X-Agent-Id", "builder")
            .header("X-Pid", "4242")
            .body(Body::from(
                serde_json::to_vec(&json!({ "id": "myapp:api" })).unwrap(),
            ))
            .unwrap();
        let response = router.call(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let service = state.core.services.get("myapp:api").await.unwrap();
        assert_eq!(service.agent_id.as_deref(), Some("builder"));
        assert_eq!(service.pid, Some(4242));
    }

    #[tokio::test]
    async fn health_and_version() {
        let (_state, mut router) = setup_test_app().await;

        let (status, body) = send(&mut router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["db"], "memory");

        let (status, body) = send(&mut router, "GET", "/version", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn ports_cleanup_reports_sweeps() {
        let (_state, mut router) = setup_test_app().await;
        send(
            &mut router,
            "POST",
            "/claim",
            Some(json!({ "id": "gone", "expires": -1 })),
        )
        .await;

        let (status, body) = send(&mut router, "POST", "/ports/cleanup", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["expiredServices"], 1);
    }

    #[test]
    fn port_range_parsing() {
        assert_eq!(parse_port_range("3100-9999").unwrap(), (3100, 9999));
        assert_eq!(parse_port_range(" 4000 - 4100 ").unwrap(), (4000, 4100));
        assert!(parse_port_range("9999-3100").is_err());
        assert!(parse_port_range("nope").is_err());
    }
}
