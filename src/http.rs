//! HTTP/JSON control surface
//!
//! Every response uses the success envelope `{"success": true, "data" |
//! "message": …}` or the failure envelope `{"success": false, "error": …}`
//! with status 200/201/400/404/500/503 — except `GET /api/health`, which
//! returns its bare document. Validation never mutates state; not-found
//! never mutates state.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::{
    validate_scene_channels, validate_steps, AutostartConfig, AutostartKind, FallbackConfig,
    FallbackSlot, ProgrammableScene, Sequence, Step,
};
use crate::engine::Engine;
use crate::playback::{self, Mode, PlayOrigin};
use crate::universe::{validate_channel, validate_value, ChannelMap};
use crate::{mqtt, recovery};

// ============================================================================
// Envelope
// ============================================================================

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "success": false, "error": self.message })),
        )
            .into_response()
    }
}

impl From<crate::config::ConfigError> for ApiError {
    fn from(e: crate::config::ConfigError) -> Self {
        match e {
            crate::config::ConfigError::Validation(msg) => ApiError::bad_request(msg),
            other => ApiError::internal(other.to_string()),
        }
    }
}

type ApiResult = Result<(StatusCode, Json<Value>), ApiError>;

fn ok_data(data: impl serde::Serialize) -> ApiResult {
    Ok((
        StatusCode::OK,
        Json(json!({ "success": true, "data": data })),
    ))
}

fn ok_message(message: impl Into<String>) -> ApiResult {
    Ok((
        StatusCode::OK,
        Json(json!({ "success": true, "message": message.into() })),
    ))
}

fn created_message(message: impl Into<String>) -> ApiResult {
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "message": message.into() })),
    ))
}

// ============================================================================
// Health & config
// ============================================================================

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "cueflow",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn get_config(State(engine): State<Arc<Engine>>) -> ApiResult {
    let config = engine.config.snapshot();
    let passthrough = engine.settings.read(|s| s.frontend_mqtt_passthrough);
    let mut doc = serde_json::to_value(&config).map_err(|e| ApiError::internal(e.to_string()))?;
    if let Some(obj) = doc.as_object_mut() {
        obj.insert("frontend_mqtt_passthrough".into(), json!(passthrough));
    }
    ok_data(doc)
}

// ============================================================================
// Scenes
// ============================================================================

#[derive(Deserialize)]
struct CreateSceneReq {
    name: String,
    channels: Vec<Option<i64>>,
}

#[derive(Deserialize)]
struct UpdateSceneReq {
    channels: Vec<Option<i64>>,
}

#[derive(Deserialize, Default)]
struct PlaySceneReq {
    #[serde(default)]
    transition_time: Option<f64>,
}

async fn list_scenes(State(engine): State<Arc<Engine>>) -> ApiResult {
    let scenes: Vec<Value> = engine.config.read(|c| {
        c.scenes
            .iter()
            .map(|(name, channels)| {
                let active = channels.iter().filter(|s| matches!(s, Some(v) if *v > 0)).count();
                json!({
                    "id": name,
                    "name": name,
                    "channels": channels,
                    "description": format!("Scene with {active} active channels"),
                })
            })
            .collect()
    });
    ok_data(scenes)
}

async fn create_scene(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<CreateSceneReq>,
) -> ApiResult {
    let channels = validate_scene_channels(&req.channels)?;
    engine.config.update(|c| {
        c.scenes.insert(req.name.clone(), channels);
    })?;
    mqtt::refresh_subscriptions(&engine).await;
    created_message(format!("Scene '{}' created successfully", req.name))
}

async fn update_scene(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateSceneReq>,
) -> ApiResult {
    let channels = validate_scene_channels(&req.channels)?;
    if !engine.config.read(|c| c.scenes.contains_key(&id)) {
        return Err(ApiError::not_found(format!("Scene '{id}' not found")));
    }
    engine.config.update(|c| {
        c.scenes.insert(id.clone(), channels);
    })?;
    mqtt::refresh_subscriptions(&engine).await;
    ok_message(format!("Scene '{id}' updated successfully"))
}

async fn delete_scene(State(engine): State<Arc<Engine>>, Path(id): Path<String>) -> ApiResult {
    if !engine.config.read(|c| c.scenes.contains_key(&id)) {
        return Err(ApiError::not_found(format!("Scene '{id}' not found")));
    }
    engine.config.update(|c| {
        c.scenes.remove(&id);
    })?;
    mqtt::refresh_subscriptions(&engine).await;
    ok_message(format!("Scene '{id}' deleted successfully"))
}

async fn play_scene(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    body: Option<Json<PlaySceneReq>>,
) -> ApiResult {
    let transition = body
        .and_then(|Json(req)| req.transition_time)
        .unwrap_or_else(|| engine.settings.read(|s| s.scenes.default_transition_time));
    playback::play_scene(&engine, &id, PlayOrigin::Operator)
        .map_err(|e| ApiError::not_found(e.to_string()))?;
    // Transition time is echoed only; fades are not implemented.
    ok_message(format!(
        "Scene '{id}' triggered (transition {transition}s)"
    ))
}

// ============================================================================
// Sequences
// ============================================================================

#[derive(Deserialize)]
struct CreateSequenceReq {
    name: String,
    steps: Vec<Step>,
    #[serde(default)]
    description: String,
    #[serde(default, rename = "loop")]
    looped: bool,
}

#[derive(Deserialize)]
struct UpdateSequenceReq {
    steps: Vec<Step>,
    #[serde(default)]
    description: String,
    #[serde(default, rename = "loop")]
    looped: bool,
}

async fn list_sequences(State(engine): State<Arc<Engine>>) -> ApiResult {
    let sequences: Vec<Value> = engine.config.read(|c| {
        c.sequences
            .iter()
            .map(|(name, seq)| {
                let description = if seq.description.is_empty() {
                    format!("Sequence with {} steps", seq.steps.len())
                } else {
                    seq.description.clone()
                };
                json!({
                    "id": name,
                    "name": name,
                    "steps": seq.steps,
                    "description": description,
                    "loop": seq.looped,
                })
            })
            .collect()
    });
    ok_data(sequences)
}

async fn create_sequence(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<CreateSequenceReq>,
) -> ApiResult {
    validate_steps(&req.steps)?;
    engine.config.update(|c| {
        c.sequences.insert(
            req.name.clone(),
            Sequence {
                steps: req.steps.clone(),
                looped: req.looped,
                description: req.description.clone(),
            },
        );
    })?;
    mqtt::refresh_subscriptions(&engine).await;
    created_message(format!("Sequence '{}' created successfully", req.name))
}

async fn update_sequence(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateSequenceReq>,
) -> ApiResult {
    validate_steps(&req.steps)?;
    if !engine.config.read(|c| c.sequences.contains_key(&id)) {
        return Err(ApiError::not_found(format!("Sequence '{id}' not found")));
    }
    engine.config.update(|c| {
        c.sequences.insert(
            id.clone(),
            Sequence {
                steps: req.steps.clone(),
                looped: req.looped,
                description: req.description.clone(),
            },
        );
    })?;
    mqtt::refresh_subscriptions(&engine).await;
    ok_message(format!("Sequence '{id}' updated successfully"))
}

async fn delete_sequence(State(engine): State<Arc<Engine>>, Path(id): Path<String>) -> ApiResult {
    if !engine.config.read(|c| c.sequences.contains_key(&id)) {
        return Err(ApiError::not_found(format!("Sequence '{id}' not found")));
    }
    engine.config.update(|c| {
        c.sequences.remove(&id);
    })?;
    mqtt::refresh_subscriptions(&engine).await;
    ok_message(format!("Sequence '{id}' deleted successfully"))
}

async fn play_sequence(State(engine): State<Arc<Engine>>, Path(id): Path<String>) -> ApiResult {
    playback::play_sequence(&engine, &id).map_err(|e| ApiError::not_found(e.to_string()))?;
    ok_message(format!("Sequence '{id}' triggered"))
}

// ============================================================================
// Programmable scenes
// ============================================================================

#[derive(Deserialize)]
struct CreateProgrammableReq {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    duration: Option<u64>,
    #[serde(default, rename = "loop")]
    looped: bool,
    #[serde(default)]
    expressions: std::collections::BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct UpdateProgrammableReq {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    duration: Option<u64>,
    #[serde(default, rename = "loop")]
    looped: Option<bool>,
    #[serde(default)]
    expressions: Option<std::collections::BTreeMap<String, String>>,
}

async fn list_programmable(State(engine): State<Arc<Engine>>) -> ApiResult {
    let scenes: Vec<Value> = engine.config.read(|c| {
        c.programmable_scenes
            .iter()
            .map(|(id, scene)| {
                json!({
                    "id": id,
                    "name": if scene.name.is_empty() { id.clone() } else { scene.name.clone() },
                    "description": scene.description,
                    "duration": scene.duration,
                    "loop": scene.looped,
                    "expressions": scene.expressions,
                })
            })
            .collect()
    });
    ok_data(scenes)
}

async fn create_programmable(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<CreateProgrammableReq>,
) -> ApiResult {
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("Missing required field: name"));
    }
    let id = req.name.trim().to_lowercase().replace(' ', "_");
    if engine
        .config
        .read(|c| c.programmable_scenes.contains_key(&id))
    {
        return Err(ApiError::bad_request(format!(
            "Programmable scene '{id}' already exists"
        )));
    }
    let scene = ProgrammableScene {
        name: req.name.clone(),
        description: req.description,
        duration: req.duration.unwrap_or(10_000),
        looped: req.looped,
        expressions: req.expressions,
    };
    engine.config.update(|c| {
        c.programmable_scenes.insert(id.clone(), scene.clone());
    })?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": format!("Programmable scene '{id}' created successfully"),
            "data": scene,
        })),
    ))
}

async fn update_programmable(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateProgrammableReq>,
) -> ApiResult {
    if !engine
        .config
        .read(|c| c.programmable_scenes.contains_key(&id))
    {
        return Err(ApiError::not_found(format!(
            "Programmable scene '{id}' not found"
        )));
    }
    let mut updated = None;
    engine.config.update(|c| {
        if let Some(scene) = c.programmable_scenes.get_mut(&id) {
            if let Some(name) = &req.name {
                scene.name = name.clone();
            }
            if let Some(description) = &req.description {
                scene.description = description.clone();
            }
            if let Some(duration) = req.duration {
                scene.duration = duration;
            }
            if let Some(looped) = req.looped {
                scene.looped = looped;
            }
            if let Some(expressions) = &req.expressions {
                scene.expressions = expressions.clone();
            }
            updated = Some(scene.clone());
        }
    })?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": format!("Programmable scene '{id}' updated successfully"),
            "data": updated,
        })),
    ))
}

async fn delete_programmable(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> ApiResult {
    if !engine
        .config
        .read(|c| c.programmable_scenes.contains_key(&id))
    {
        return Err(ApiError::not_found(format!(
            "Programmable scene '{id}' not found"
        )));
    }
    // Stop it first if it is the active playback.
    if matches!(engine.playback.mode(), Mode::Programmable { id: ref active, .. } if *active == id)
    {
        engine.playback.stop();
    }
    engine.config.update(|c| {
        c.programmable_scenes.remove(&id);
    })?;
    ok_message(format!("Programmable scene '{id}' deleted successfully"))
}

async fn play_programmable(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> ApiResult {
    playback::play_programmable(&engine, &id).map_err(|e| ApiError::not_found(e.to_string()))?;
    ok_message(format!("Programmable scene '{id}' started"))
}

// ============================================================================
// DMX
// ============================================================================

#[derive(Deserialize)]
struct SetChannelReq {
    value: i64,
}

#[derive(Deserialize)]
struct SetAllReq {
    channels: Vec<i64>,
}

async fn set_channel(
    State(engine): State<Arc<Engine>>,
    Path(channel): Path<i64>,
    Json(req): Json<SetChannelReq>,
) -> ApiResult {
    let channel =
        validate_channel(channel).map_err(|_| ApiError::bad_request("Channel must be 1-512"))?;
    let value =
        validate_value(req.value).map_err(|_| ApiError::bad_request("Value must be 0-255"))?;
    engine.apply_channels([(channel, value)].into_iter().collect(), true);
    engine.record_channel_update(channel, value);
    ok_message(format!("Channel {channel} set to {value}"))
}

async fn set_all_channels(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<SetAllReq>,
) -> ApiResult {
    let mut map = ChannelMap::new();
    for (i, &value) in req.channels.iter().enumerate().take(crate::UNIVERSE_SIZE) {
        if let Ok(v) = validate_value(value) {
            map.insert((i + 1) as u16, v);
        }
    }
    let applied = map.len();
    if let Some((&channel, &value)) = map.iter().filter(|(_, &v)| v > 0).last() {
        engine.record_channel_update(channel, value);
    }
    engine.apply_channels(map, true);
    ok_message(format!("Set {applied} channels"))
}

async fn blackout(State(engine): State<Arc<Engine>>) -> ApiResult {
    engine
        .blackout(None)
        .map_err(|e| ApiError::internal(e.to_string()))?;
    ok_message("Blackout activated - all channels set to 0")
}

async fn channel_update(State(engine): State<Arc<Engine>>) -> ApiResult {
    let update = engine.take_channel_update();
    Ok((
        StatusCode::OK,
        Json(json!({ "success": true, "update": update })),
    ))
}

// ============================================================================
// Playback
// ============================================================================

async fn playback_status(State(engine): State<Arc<Engine>>) -> ApiResult {
    ok_data(engine.playback.status())
}

async fn playback_pause(State(engine): State<Arc<Engine>>) -> ApiResult {
    if engine.playback.pause() {
        ok_message("Playback paused")
    } else {
        Err(ApiError::not_found(
            "No active playback to pause or already paused",
        ))
    }
}

async fn playback_resume(State(engine): State<Arc<Engine>>) -> ApiResult {
    if engine.playback.resume() {
        ok_message("Playback resumed")
    } else {
        Err(ApiError::not_found("No paused playback to resume"))
    }
}

async fn playback_stop(State(engine): State<Arc<Engine>>) -> ApiResult {
    if engine.playback.stop() {
        ok_message("Playback stopped")
    } else {
        Err(ApiError::not_found("No playback is currently active"))
    }
}

// ============================================================================
// Autostart & fallback
// ============================================================================

#[derive(Deserialize)]
struct SetAutostartReq {
    #[serde(rename = "type")]
    kind: AutostartKind,
    id: String,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

async fn get_autostart(State(engine): State<Arc<Engine>>) -> ApiResult {
    let autostart = engine.config.read(|c| c.autostart.clone());
    let current = if autostart.enabled {
        autostart.id.clone()
    } else {
        None
    };
    ok_data(json!({ "current": current, "config": autostart }))
}

async fn set_autostart(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<SetAutostartReq>,
) -> ApiResult {
    let config = if req.enabled {
        AutostartConfig {
            enabled: true,
            kind: Some(req.kind),
            id: Some(req.id.clone()),
        }
    } else {
        AutostartConfig::default()
    };
    engine.config.update(|c| c.autostart = config)?;
    if req.enabled {
        recovery::run_autostart(&engine);
    }
    ok_message(format!(
        "Autostart {} for {:?} '{}'",
        if req.enabled { "enabled" } else { "disabled" },
        req.kind,
        req.id
    ))
}

async fn delete_autostart(State(engine): State<Arc<Engine>>) -> ApiResult {
    engine
        .config
        .update(|c| c.autostart = AutostartConfig::default())?;
    ok_message("Autostart disabled")
}

#[derive(Deserialize)]
struct SetFallbackReq {
    #[serde(default)]
    scene_fallback: Option<FallbackSlotReq>,
    #[serde(default)]
    sequence_fallback: Option<FallbackSlotReq>,
}

#[derive(Deserialize)]
struct FallbackSlotReq {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    scene_id: Option<String>,
    #[serde(default)]
    delay: Option<f64>,
}

impl FallbackSlotReq {
    fn into_slot(self) -> Result<FallbackSlot, ApiError> {
        if let Some(delay) = self.delay {
            if !(delay >= 0.0) {
                return Err(ApiError::bad_request("Fallback delay must be >= 0"));
            }
        }
        Ok(FallbackSlot {
            enabled: self.enabled,
            scene_id: self.scene_id,
            delay: self.delay,
        })
    }
}

async fn get_fallback(State(engine): State<Arc<Engine>>) -> ApiResult {
    let fallback = engine.config.read(|c| c.fallback.clone());
    ok_data(json!({ "config": fallback }))
}

async fn set_fallback(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<SetFallbackReq>,
) -> ApiResult {
    if req.scene_fallback.is_none() && req.sequence_fallback.is_none() {
        return Err(ApiError::bad_request(
            "Missing scene_fallback or sequence_fallback",
        ));
    }
    let scene_slot = req.scene_fallback.map(|s| s.into_slot()).transpose()?;
    let sequence_slot = req.sequence_fallback.map(|s| s.into_slot()).transpose()?;
    let mut messages = Vec::new();
    engine.config.update(|c| {
        if let Some(slot) = scene_slot {
            messages.push(format!(
                "Scene fallback {}",
                if slot.enabled { "enabled" } else { "disabled" }
            ));
            c.fallback.scene_fallback = slot;
        }
        if let Some(slot) = sequence_slot {
            messages.push(format!(
                "Sequence fallback {}",
                if slot.enabled { "enabled" } else { "disabled" }
            ));
            c.fallback.sequence_fallback = slot;
        }
    })?;
    ok_message(messages.join("; "))
}

async fn delete_fallback(State(engine): State<Arc<Engine>>) -> ApiResult {
    engine.recovery.cancel_pending();
    engine
        .config
        .update(|c| c.fallback = FallbackConfig::default())?;
    ok_message("Fallback disabled")
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Deserialize)]
struct FallbackDelayReq {
    delay: f64,
}

#[derive(Deserialize)]
struct RetransmissionReq {
    #[serde(default)]
    enabled: bool,
    #[serde(default = "default_retransmit_interval")]
    interval: f64,
}

fn default_retransmit_interval() -> f64 {
    5.0
}

#[derive(Deserialize)]
struct FollowersReq {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    mappings: std::collections::BTreeMap<u16, Vec<u16>>,
}

async fn set_fallback_delay(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<FallbackDelayReq>,
) -> ApiResult {
    if !(0.1..=60.0).contains(&req.delay) {
        return Err(ApiError::bad_request(
            "Delay must be between 0.1 and 60.0 seconds",
        ));
    }
    engine.settings.update(|s| s.fallback_delay = req.delay)?;
    ok_message(format!("Fallback delay set to {}s", req.delay))
}

async fn get_retransmission(State(engine): State<Arc<Engine>>) -> ApiResult {
    ok_data(engine.settings.read(|s| s.dmx_retransmission.clone()))
}

async fn set_retransmission(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<RetransmissionReq>,
) -> ApiResult {
    if !(0.1..=60.0).contains(&req.interval) {
        return Err(ApiError::bad_request(
            "Interval must be between 0.1 and 60 seconds",
        ));
    }
    engine.settings.update(|s| {
        s.dmx_retransmission.enabled = req.enabled;
        s.dmx_retransmission.interval = req.interval;
    })?;
    engine.retransmit_notify.notify_waiters();
    ok_data(engine.settings.read(|s| s.dmx_retransmission.clone()))
}

async fn get_followers(State(engine): State<Arc<Engine>>) -> ApiResult {
    ok_data(engine.settings.read(|s| s.dmx_followers.clone()))
}

async fn set_followers(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<FollowersReq>,
) -> ApiResult {
    for (source, followers) in &req.mappings {
        validate_channel(*source as i64)
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        for follower in followers {
            validate_channel(*follower as i64)
                .map_err(|e| ApiError::bad_request(e.to_string()))?;
        }
    }
    // Non-empty mappings imply the feature is wanted.
    let enabled = req.enabled || req.mappings.values().any(|f| !f.is_empty());
    engine.settings.update(|s| {
        s.dmx_followers.enabled = enabled;
        s.dmx_followers.mappings = req.mappings.clone();
    })?;
    ok_data(engine.settings.read(|s| s.dmx_followers.clone()))
}

// ============================================================================
// Bus passthrough
// ============================================================================

#[derive(Deserialize)]
struct PublishReq {
    topic: String,
    payload: Value,
}

async fn mqtt_publish(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<PublishReq>,
) -> ApiResult {
    if req.topic.is_empty() {
        return Err(ApiError::bad_request("Missing topic or payload"));
    }
    let payload = match &req.payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    engine
        .bus
        .publish(&req.topic, &payload)
        .await
        .map_err(|e| ApiError::unavailable(e.to_string()))?;
    Ok((StatusCode::OK, Json(json!({ "success": true }))))
}

// ============================================================================
// Router & server
// ============================================================================

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/config", get(get_config))
        .route("/api/scenes", get(list_scenes).post(create_scene))
        .route(
            "/api/scenes/:id",
            axum::routing::put(update_scene).delete(delete_scene),
        )
        .route("/api/scenes/:id/play", post(play_scene))
        .route("/api/sequences", get(list_sequences).post(create_sequence))
        .route(
            "/api/sequences/:id",
            axum::routing::put(update_sequence).delete(delete_sequence),
        )
        .route("/api/sequences/:id/play", post(play_sequence))
        .route(
            "/api/programmable",
            get(list_programmable).post(create_programmable),
        )
        .route(
            "/api/programmable/:id",
            axum::routing::put(update_programmable).delete(delete_programmable),
        )
        .route("/api/programmable/:id/play", post(play_programmable))
        .route("/api/dmx/channel/:channel", post(set_channel))
        .route("/api/dmx/all", post(set_all_channels))
        .route("/api/dmx/blackout", post(blackout))
        .route("/api/dmx/channel-update", get(channel_update))
        .route("/api/playback/status", get(playback_status))
        .route("/api/playback/pause", post(playback_pause))
        .route("/api/playback/resume", post(playback_resume))
        .route("/api/playback/stop", post(playback_stop))
        .route(
            "/api/autostart",
            get(get_autostart).post(set_autostart).delete(delete_autostart),
        )
        .route(
            "/api/fallback",
            get(get_fallback).post(set_fallback).delete(delete_fallback),
        )
        .route("/api/settings/fallback-delay", post(set_fallback_delay))
        .route(
            "/api/settings/dmx-retransmission",
            get(get_retransmission).post(set_retransmission),
        )
        .route(
            "/api/settings/dmx-followers",
            get(get_followers).post(set_followers),
        )
        .route("/api/mqtt/publish", post(mqtt_publish))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

/// Bind and serve until the engine's shutdown token fires.
pub async fn serve(engine: Arc<Engine>, host: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP API listening on http://{addr}");
    let shutdown = engine.shutdown.clone();
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
