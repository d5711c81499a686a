use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use mesh_core::error::RouteError;
use mesh_core::manager::MeshManager;
use mesh_core::routes::{Endpoint, NewRule, RulePatch};
use mesh_proto::classify::MESSAGE_MASK_ALL;
use mesh_proto::node::NodeId;
use mesh_proto::DEFAULT_TTL;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<MeshManager>,
}

pub fn build_router(manager: Arc<MeshManager>) -> Router {
    let state = AppState { manager };
    Router::new()
        .route("/status", get(get_status))
        .route("/devices", get(list_devices))
        .route("/peers", get(list_peers))
        .route("/routing/rules", get(list_rules).post(create_rule))
        .route(
            "/routing/rules/:id",
            axum::routing::put(update_rule).delete(delete_rule),
        )
        .route("/routing/table", get(routing_table))
        .with_state(state)
}

async fn get_status(State(state): State<AppState>) -> Json<Value> {
    let m = &state.manager;
    let (active, pending) = m.routes().rule_count();
    Json(json!({
        "nodeId": m.node_id(),
        "name": m.node_name(),
        "uptimeSeconds": m.uptime().as_secs(),
        "devices": m.registry().list_all().len(),
        "rules": { "active": active, "pending": pending },
        "peers": m.pool().statistics(),
        "engine": m.engine().stats(),
    }))
}

async fn list_devices(State(state): State<AppState>) -> Json<Value> {
    let devices = state.manager.registry().list_all();
    Json(json!({ "devices": devices }))
}

async fn list_peers(State(state): State<AppState>) -> Json<Value> {
    let peers = state.manager.peers_snapshot().await;
    Json(json!({ "peers": peers }))
}

async fn list_rules(State(state): State<AppState>) -> Json<Value> {
    let rules = state.manager.routes().snapshot();
    Json(json!({ "rules": rules }))
}

async fn routing_table(State(state): State<AppState>) -> Json<Value> {
    let entries: Vec<Value> = state
        .manager
        .table()
        .snapshot()
        .into_iter()
        .map(|((node_id, device_id), target)| {
            json!({
                "nodeId": node_id,
                "deviceId": device_id,
                "name": target.name,
                "direction": target.direction,
                "isLocal": target.is_local,
            })
        })
        .collect();
    Json(json!({ "entries": entries }))
}

/// Source or destination reference. `"local"` is shorthand for the nil
/// node id, matching what the routing file stores.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NodeRef {
    Id(NodeId),
    Alias(String),
}

impl NodeRef {
    fn resolve(&self) -> Result<NodeId, ApiError> {
        match self {
            NodeRef::Id(id) => Ok(*id),
            NodeRef::Alias(alias) if alias == "local" => Ok(NodeId::nil()),
            NodeRef::Alias(other) => Err(ApiError::bad_request(format!(
                "unknown node reference {other:?}; use a UUID or \"local\""
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndpointSpec {
    node_id: NodeRef,
    device_id: u16,
}

impl EndpointSpec {
    fn resolve(&self) -> Result<Endpoint, ApiError> {
        Ok(Endpoint::new(self.node_id.resolve()?, self.device_id))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuleSpec {
    source: EndpointSpec,
    destination: EndpointSpec,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default = "default_priority")]
    priority: i32,
    #[serde(default)]
    channel_filter: Option<u8>,
    #[serde(default = "default_mask")]
    message_type_mask: u8,
    #[serde(default = "default_ttl")]
    ttl: u8,
}

fn default_enabled() -> bool { true }
fn default_priority() -> i32 { 100 }
fn default_mask() -> u8 { MESSAGE_MASK_ALL }
fn default_ttl() -> u8 { DEFAULT_TTL }

async fn create_rule(
    State(state): State<AppState>,
    Json(spec): Json<RuleSpec>,
) -> Result<Json<Value>, ApiError> {
    let new_rule = NewRule {
        source: spec.source.resolve()?,
        destination: spec.destination.resolve()?,
        enabled: spec.enabled,
        priority: spec.priority,
        channel_filter: spec.channel_filter,
        message_type_mask: spec.message_type_mask,
        ttl: spec.ttl,
    };
    let rule_id = state.manager.routes().add(new_rule)?;
    Ok(Json(json!({ "ruleId": rule_id })))
}

async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<RulePatch>,
) -> Result<StatusCode, ApiError> {
    state.manager.routes().update(id, patch)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.manager.routes().remove(id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }
}

impl From<RouteError> for ApiError {
    fn from(e: RouteError) -> Self {
        let status = match &e {
            RouteError::DuplicateRule => StatusCode::CONFLICT,
            RouteError::UnknownRule(_) => StatusCode::NOT_FOUND,
            RouteError::Persist(_) | RouteError::Malformed(_) | RouteError::UnsupportedVersion(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}
