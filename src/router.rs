//! Bus command normalization
//!
//! Every bus message funnels through [`dispatch`], which parses the topic,
//! validates numeric payloads at the boundary, and invokes the matching
//! controller call. Invalid parses are rejected without touching any state.
//!
//! Topics:
//! - `dmx/set/channel/<n>` — integer payload; set one channel and send.
//! - `dmx/scene/<name>` — optional float payload is the transition time,
//!   accepted and echoed in the log but not interpolated.
//! - `dmx/sender/<action>[/<name>]` — `status | list | blackout | remove`.
//! - `dmx/config/<action>` — `show | show-full | show-raw | reload | save`.
//! - any topic equal to a configured sequence name plays that sequence.

use std::sync::Arc;

use tracing::{info, warn};

use crate::engine::Engine;
use crate::playback::{self, PlayOrigin};
use crate::universe::{validate_channel, validate_value};

/// Handle one bus message.
pub async fn dispatch(engine: &Arc<Engine>, topic: &str, payload: &str) {
    if let Some(rest) = topic.strip_prefix("dmx/set/channel/") {
        handle_channel_set(engine, rest, payload);
    } else if let Some(name) = topic.strip_prefix("dmx/scene/") {
        handle_scene(engine, name, payload);
    } else if let Some(rest) = topic.strip_prefix("dmx/sender/") {
        handle_sender(engine, rest);
    } else if let Some(action) = topic.strip_prefix("dmx/config/") {
        handle_config(engine, action);
    } else if engine
        .config
        .read(|c| c.sequences.contains_key(topic))
    {
        info!(sequence = topic, "bus trigger topic matched");
        if let Err(e) = playback::play_sequence(engine, topic) {
            warn!(error = %e, "bus sequence trigger failed");
        }
    }
}

fn handle_channel_set(engine: &Arc<Engine>, channel_str: &str, payload: &str) {
    let channel = match channel_str.parse::<i64>().ok().and_then(|n| validate_channel(n).ok()) {
        Some(ch) => ch,
        None => {
            warn!(topic_channel = channel_str, "rejecting channel set: bad channel");
            return;
        }
    };
    let value = match payload.trim().parse::<i64>().ok().and_then(|v| validate_value(v).ok()) {
        Some(v) => v,
        None => {
            warn!(channel, payload, "rejecting channel set: bad value");
            return;
        }
    };
    engine.apply_channels([(channel, value)].into_iter().collect(), true);
    engine.record_channel_update(channel, value);
    info!(channel, value, "channel set from bus");
}

fn handle_scene(engine: &Arc<Engine>, name: &str, payload: &str) {
    let default_transition = engine
        .settings
        .read(|s| s.scenes.default_transition_time);
    let transition = if payload.trim().is_empty() {
        default_transition
    } else {
        match payload.trim().parse::<f64>() {
            Ok(t) => t,
            Err(_) => {
                warn!(scene = name, payload, "rejecting scene trigger: bad transition time");
                return;
            }
        }
    };
    // Transition time is accepted and echoed only; fades are not implemented.
    info!(scene = name, transition, "scene trigger from bus");
    if let Err(e) = playback::play_scene(engine, name, PlayOrigin::Operator) {
        warn!(error = %e, "bus scene trigger failed");
    }
}

fn handle_sender(engine: &Arc<Engine>, rest: &str) {
    let (action, name) = match rest.split_once('/') {
        Some((action, name)) => (action, Some(name)),
        None => (rest, None),
    };
    match action {
        "status" => {
            let status = engine.sinks.status();
            info!(?status, "sink status");
        }
        "list" => {
            let names = engine.sinks.names();
            info!(?names, "active sinks");
        }
        "blackout" => {
            if let Err(e) = engine.blackout(name) {
                warn!(error = %e, "bus blackout failed");
            } else {
                info!(sink = name.unwrap_or("all"), "blackout from bus");
            }
        }
        "remove" => match name {
            Some(name) => {
                if let Err(e) = engine.sinks.remove(name) {
                    warn!(error = %e, "bus sink remove failed");
                }
            }
            None => warn!("sender remove needs a sink name"),
        },
        other => warn!(action = other, "unknown sender action"),
    }
}

fn handle_config(engine: &Arc<Engine>, action: &str) {
    match action {
        "show" => {
            let settings = engine.settings.snapshot();
            let (host, port) = settings.mqtt.host_and_port();
            info!(
                mqtt = format!("{host}:{port}"),
                sinks = settings.dmx.default_configs.len(),
                log_level = %settings.logging.level,
                "current configuration"
            );
        }
        "show-full" => {
            let settings = engine.settings.snapshot();
            match serde_json::to_string_pretty(&settings) {
                Ok(text) => info!("full configuration:\n{text}"),
                Err(e) => warn!(error = %e, "could not render configuration"),
            }
        }
        "show-raw" => {
            let settings = engine.settings.snapshot();
            match serde_json::to_string(&settings) {
                Ok(text) => info!(raw = %text, "raw configuration"),
                Err(e) => warn!(error = %e, "could not render configuration"),
            }
        }
        "reload" => {
            engine.settings.reload();
            info!("settings reloaded from disk");
        }
        "save" => {
            if let Err(e) = engine.settings.save() {
                warn!(error = %e, "settings save failed");
            } else {
                info!("settings saved");
            }
        }
        other => warn!(action = other, "unknown config action"),
    }
}

// ============================================================================
// Tests
// ============================================================================
