use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;

use pob_bridge::{Bridge, BridgeError, ErrorKind, JsonMap};

use crate::config::ServerConfig;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn unavailable() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "Lua bridge is not running".to_string(),
        }
    }

    pub fn unprocessable(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: msg.into(),
        }
    }

    pub fn bad_gateway(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: msg.into(),
        }
    }
}

impl From<BridgeError> for AppError {
    fn from(err: BridgeError) -> Self {
        let status = match err.kind() {
            ErrorKind::Protocol => StatusCode::BAD_REQUEST,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Configuration | ErrorKind::Startup | ErrorKind::Transport => {
                StatusCode::BAD_GATEWAY
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, AppError>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub bridge_running: bool,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

const SUCCESS: SuccessResponse = SuccessResponse { success: true };

fn default_build_name() -> String {
    "Imported Build".to_string()
}

#[derive(Debug, Deserialize)]
pub struct LoadBuildXmlRequest {
    pub xml: String,
    #[serde(default = "default_build_name")]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
    pub max_results: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AddItemRequest {
    pub item_raw: String,
    pub slot: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EquipItemRequest {
    pub slot: String,
}

#[derive(Debug, Deserialize)]
pub struct AddSkillRequest {
    pub skill_text: String,
}

#[derive(Debug, Deserialize)]
pub struct SetMainSkillRequest {
    pub index: i64,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    #[serde(default)]
    pub keys: String,
}

#[derive(Debug, Deserialize)]
pub struct SetConfigRequest {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Deserialize)]
pub struct SetCustomModsRequest {
    pub mods: String,
}

#[derive(Debug, Deserialize)]
pub struct SubPathQuery {
    #[serde(default)]
    pub sub_path: String,
}

#[derive(Debug, Deserialize)]
pub struct FilePathRequest {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct NamedInFolderRequest {
    pub name: String,
    #[serde(default)]
    pub sub_path: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameBuildFileRequest {
    pub old_path: String,
    pub new_name: String,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .route("/health", get(health))
        // Build
        .route("/build/new", post(new_build))
        .route("/build/load/xml", post(load_build_xml))
        .route("/build/info", get(get_build_info))
        .route("/build/export/xml", get(export_build_xml))
        // Tree
        .route("/tree/nodes", get(list_alloc_nodes))
        .route("/tree/node/{node_id}", get(get_node_info))
        .route("/tree/node/{node_id}/alloc", post(alloc_node))
        .route("/tree/node/{node_id}/dealloc", post(dealloc_node))
        .route("/tree/search", get(search_nodes))
        // Items
        .route("/items", get(list_items))
        .route("/items/slots", get(list_slots))
        .route("/items/add", post(add_item))
        .route("/items/{item_id}/equip", post(equip_item))
        .route("/items/slot/{slot}/unequip", post(unequip_slot))
        .route("/items/{item_id}", delete(delete_item))
        // Skills
        .route("/skills", get(list_skills))
        .route("/skills/add", post(add_skill))
        .route("/skills/main", post(set_main_skill))
        .route("/skills/{index}", delete(remove_skill))
        // Calc
        .route("/calc", get(get_calc))
        .route("/calc/full", get(get_calc_full))
        .route("/calc/stats", get(get_calc_stats))
        // Config
        .route("/config", post(set_config))
        .route("/config/custom-mods", post(set_custom_mods))
        // Files
        .route("/builds", get(list_builds))
        .route("/builds/path", get(get_builds_path))
        .route("/build/load/file", post(load_build_file))
        .route("/build/save", post(save_build))
        .route("/build/save-as", post(save_build_as))
        .route("/builds/file", delete(delete_build_file))
        .route("/builds/folder", post(create_folder))
        .route("/builds/rename", post(rename_build_file))
        .layer(CorsLayer::permissive())
        .with_state(bridge)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Start the bridge, serve until Ctrl-C, then shut the bridge down.
pub async fn run_serve(config: ServerConfig) -> Result<()> {
    let bridge = Arc::new(Bridge::new(config.bridge.clone()));
    let result = serve(Arc::clone(&bridge), &config.host, config.port).await;
    let report = bridge.shutdown().await;
    tracing::debug!(?report, "bridge shutdown report");
    result
}

async fn serve(bridge: Arc<Bridge>, host: &str, port: u16) -> Result<()> {
    bridge
        .start(None)
        .await
        .context("failed to start the Lua bridge")?;
    tracing::info!(pid = bridge.pid(), "Lua bridge started");

    let app = build_router(bridge);
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind {host}:{port}"))?;
    let addr: SocketAddr = listener.local_addr()?;
    tracing::info!("pob-server listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("pob-server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Forward one command, refusing with 503 when the child is not running.
async fn bridge_call(bridge: &Bridge, command: &str, params: Value) -> Result<JsonMap, AppError> {
    if !bridge.is_running() {
        return Err(AppError::unavailable());
    }
    let params = match params {
        Value::Object(map) => Some(map),
        _ => None,
    };
    Ok(bridge.call(command, params).await?)
}

async fn bridge_unit(bridge: &Bridge, command: &str, params: Value) -> ApiResult<SuccessResponse> {
    bridge_call(bridge, command, params).await?;
    Ok(Json(SUCCESS))
}

fn field_or(result: &JsonMap, key: &str, default: Value) -> Value {
    result.get(key).cloned().unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(bridge): State<Arc<Bridge>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        bridge_running: bridge.is_running(),
    })
}

async fn new_build(State(bridge): State<Arc<Bridge>>) -> ApiResult<SuccessResponse> {
    bridge_unit(&bridge, "new_build", Value::Null).await
}

async fn load_build_xml(
    State(bridge): State<Arc<Bridge>>,
    Json(req): Json<LoadBuildXmlRequest>,
) -> ApiResult<SuccessResponse> {
    bridge_unit(
        &bridge,
        "load_build_xml",
        json!({ "xml": req.xml, "name": req.name }),
    )
    .await
}

async fn get_build_info(State(bridge): State<Arc<Bridge>>) -> ApiResult<JsonMap> {
    Ok(Json(bridge_call(&bridge, "get_build_info", Value::Null).await?))
}

async fn export_build_xml(State(bridge): State<Arc<Bridge>>) -> ApiResult<Value> {
    let result = bridge_call(&bridge, "get_build_xml", Value::Null).await?;
    match result.get("xml") {
        Some(Value::String(xml)) => Ok(Json(json!({ "xml": xml }))),
        _ => Err(AppError::bad_gateway("bridge result has no 'xml' string")),
    }
}

async fn list_alloc_nodes(State(bridge): State<Arc<Bridge>>) -> ApiResult<JsonMap> {
    Ok(Json(bridge_call(&bridge, "list_alloc_nodes", Value::Null).await?))
}

async fn get_node_info(
    State(bridge): State<Arc<Bridge>>,
    Path(node_id): Path<i64>,
) -> ApiResult<JsonMap> {
    Ok(Json(
        bridge_call(&bridge, "get_node_info", json!({ "node_id": node_id })).await?,
    ))
}

async fn alloc_node(
    State(bridge): State<Arc<Bridge>>,
    Path(node_id): Path<i64>,
) -> ApiResult<SuccessResponse> {
    bridge_unit(&bridge, "alloc_node", json!({ "node_id": node_id })).await
}

async fn dealloc_node(
    State(bridge): State<Arc<Bridge>>,
    Path(node_id): Path<i64>,
) -> ApiResult<SuccessResponse> {
    bridge_unit(&bridge, "dealloc_node", json!({ "node_id": node_id })).await
}

async fn search_nodes(
    State(bridge): State<Arc<Bridge>>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Value> {
    let q = query.q.unwrap_or_default();
    if q.is_empty() {
        return Err(AppError::unprocessable("query parameter 'q' must not be empty"));
    }
    let max_results = query.max_results.unwrap_or(50);
    if !(1..=500).contains(&max_results) {
        return Err(AppError::unprocessable(
            "query parameter 'max_results' must be between 1 and 500",
        ));
    }

    let result = bridge_call(
        &bridge,
        "search_nodes",
        json!({ "query": q, "max_results": max_results }),
    )
    .await?;
    Ok(Json(json!({
        "nodes": field_or(&result, "nodes", json!([])),
        "count": field_or(&result, "count", json!(0)),
    })))
}

async fn list_items(State(bridge): State<Arc<Bridge>>) -> ApiResult<JsonMap> {
    Ok(Json(bridge_call(&bridge, "list_items", Value::Null).await?))
}

async fn list_slots(State(bridge): State<Arc<Bridge>>) -> ApiResult<JsonMap> {
    Ok(Json(bridge_call(&bridge, "list_slots", Value::Null).await?))
}

async fn add_item(
    State(bridge): State<Arc<Bridge>>,
    Json(req): Json<AddItemRequest>,
) -> ApiResult<JsonMap> {
    let mut params = json!({ "item_raw": req.item_raw });
    if let Some(slot) = req.slot.filter(|s| !s.is_empty()) {
        params["slot"] = Value::String(slot);
    }
    Ok(Json(bridge_call(&bridge, "add_item", params).await?))
}

async fn equip_item(
    State(bridge): State<Arc<Bridge>>,
    Path(item_id): Path<i64>,
    Json(req): Json<EquipItemRequest>,
) -> ApiResult<SuccessResponse> {
    bridge_unit(
        &bridge,
        "equip_item",
        json!({ "item_id": item_id, "slot": req.slot }),
    )
    .await
}

async fn unequip_slot(
    State(bridge): State<Arc<Bridge>>,
    Path(slot): Path<String>,
) -> ApiResult<SuccessResponse> {
    bridge_unit(&bridge, "unequip_slot", json!({ "slot": slot })).await
}

async fn delete_item(
    State(bridge): State<Arc<Bridge>>,
    Path(item_id): Path<i64>,
) -> ApiResult<SuccessResponse> {
    bridge_unit(&bridge, "delete_item", json!({ "item_id": item_id })).await
}

async fn list_skills(State(bridge): State<Arc<Bridge>>) -> ApiResult<JsonMap> {
    Ok(Json(bridge_call(&bridge, "list_skills", Value::Null).await?))
}

async fn add_skill(
    State(bridge): State<Arc<Bridge>>,
    Json(req): Json<AddSkillRequest>,
) -> ApiResult<JsonMap> {
    Ok(Json(
        bridge_call(&bridge, "add_skill", json!({ "skill_text": req.skill_text })).await?,
    ))
}

async fn remove_skill(
    State(bridge): State<Arc<Bridge>>,
    Path(index): Path<i64>,
) -> ApiResult<SuccessResponse> {
    bridge_unit(&bridge, "remove_skill", json!({ "index": index })).await
}

async fn set_main_skill(
    State(bridge): State<Arc<Bridge>>,
    Json(req): Json<SetMainSkillRequest>,
) -> ApiResult<SuccessResponse> {
    if req.index < 1 {
        return Err(AppError::unprocessable("'index' must be at least 1"));
    }
    bridge_unit(&bridge, "set_main_skill", json!({ "index": req.index })).await
}

async fn get_calc(State(bridge): State<Arc<Bridge>>) -> ApiResult<JsonMap> {
    Ok(Json(bridge_call(&bridge, "get_output", Value::Null).await?))
}

async fn get_calc_full(State(bridge): State<Arc<Bridge>>) -> ApiResult<JsonMap> {
    Ok(Json(bridge_call(&bridge, "get_full_output", Value::Null).await?))
}

async fn get_calc_stats(
    State(bridge): State<Arc<Bridge>>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<JsonMap> {
    let keys: Vec<&str> = query
        .keys
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .collect();
    let params = if keys.is_empty() {
        Value::Null
    } else {
        json!({ "stats": keys })
    };
    Ok(Json(bridge_call(&bridge, "get_output", params).await?))
}

async fn set_config(
    State(bridge): State<Arc<Bridge>>,
    Json(req): Json<SetConfigRequest>,
) -> ApiResult<SuccessResponse> {
    bridge_unit(
        &bridge,
        "set_config",
        json!({ "key": req.key, "value": req.value }),
    )
    .await
}

async fn set_custom_mods(
    State(bridge): State<Arc<Bridge>>,
    Json(req): Json<SetCustomModsRequest>,
) -> ApiResult<SuccessResponse> {
    bridge_unit(&bridge, "set_custom_mods", json!({ "mods": req.mods })).await
}

async fn list_builds(
    State(bridge): State<Arc<Bridge>>,
    Query(query): Query<SubPathQuery>,
) -> ApiResult<Value> {
    let result = bridge_call(&bridge, "list_builds", json!({ "sub_path": query.sub_path })).await?;
    Ok(Json(json!({
        "builds": field_or(&result, "builds", json!([])),
        "folders": field_or(&result, "folders", json!([])),
    })))
}

async fn get_builds_path(State(bridge): State<Arc<Bridge>>) -> ApiResult<JsonMap> {
    Ok(Json(bridge_call(&bridge, "get_builds_path", Value::Null).await?))
}

async fn load_build_file(
    State(bridge): State<Arc<Bridge>>,
    Json(req): Json<FilePathRequest>,
) -> ApiResult<SuccessResponse> {
    bridge_unit(&bridge, "load_build_file", json!({ "path": req.path })).await
}

async fn save_build(State(bridge): State<Arc<Bridge>>) -> ApiResult<SuccessResponse> {
    bridge_unit(&bridge, "save_build", Value::Null).await
}

async fn save_build_as(
    State(bridge): State<Arc<Bridge>>,
    Json(req): Json<NamedInFolderRequest>,
) -> ApiResult<JsonMap> {
    Ok(Json(
        bridge_call(
            &bridge,
            "save_build_as",
            json!({ "name": req.name, "sub_path": req.sub_path }),
        )
        .await?,
    ))
}

async fn delete_build_file(
    State(bridge): State<Arc<Bridge>>,
    Json(req): Json<FilePathRequest>,
) -> ApiResult<SuccessResponse> {
    bridge_unit(&bridge, "delete_build_file", json!({ "path": req.path })).await
}

async fn create_folder(
    State(bridge): State<Arc<Bridge>>,
    Json(req): Json<NamedInFolderRequest>,
) -> ApiResult<JsonMap> {
    Ok(Json(
        bridge_call(
            &bridge,
            "create_folder",
            json!({ "name": req.name, "sub_path": req.sub_path }),
        )
        .await?,
    ))
}

async fn rename_build_file(
    State(bridge): State<Arc<Bridge>>,
    Json(req): Json<RenameBuildFileRequest>,
) -> ApiResult<JsonMap> {
    Ok(Json(
        bridge_call(
            &bridge,
            "rename_build_file",
            json!({ "old_path": req.old_path, "new_name": req.new_name }),
        )
        .await?,
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
