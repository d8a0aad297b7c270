//! Autostart and post-completion fallback supervision
//!
//! Autostart fires once at engine start when enabled; failures are logged
//! and never retried. Fallback is two independent reactions:
//!
//! - *scene fallback* — armed after a scene applies; sleeps its delay then
//!   plays the configured scene. A scene played *as* the fallback carries
//!   [`PlayOrigin::Fallback`] and does not re-arm, which breaks the
//!   otherwise-infinite fallback → scene → fallback cycle.
//! - *sequence fallback* — armed when a non-looping sequence (or a
//!   programmable scene) completes naturally.
//!
//! At most one timer is armed at a time and any new playback request
//! cancels it, so a recovery never stomps on an operator's cue.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AutostartKind;
use crate::engine::Engine;
use crate::playback::{self, PlayOrigin};

pub struct RecoverySupervisor {
    pending: Mutex<Option<CancellationToken>>,
}

impl RecoverySupervisor {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(None),
        }
    }

    /// Cancel an armed fallback timer, if any.
    pub fn cancel_pending(&self) {
        if let Some(token) = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            debug!("cancelling armed fallback timer");
            token.cancel();
        }
    }

    /// Whether a fallback timer is currently armed.
    pub fn is_armed(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Replace the armed timer with a fresh token.
    fn arm(&self) -> CancellationToken {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = pending.take() {
            old.cancel();
        }
        let token = CancellationToken::new();
        *pending = Some(token.clone());
        token
    }
}

impl Default for RecoverySupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Arm the scene fallback after a scene applied.
pub fn arm_scene_fallback(engine: &Arc<Engine>) {
    let slot = engine.config.read(|c| c.fallback.scene_fallback.clone());
    if !slot.enabled {
        return;
    }
    let Some(scene_id) = slot.scene_id else {
        warn!("scene fallback enabled but no scene_id configured");
        return;
    };
    let delay = slot
        .delay
        .unwrap_or_else(|| engine.settings.read(|s| s.fallback_delay));
    schedule(engine, scene_id, delay, "scene fallback");
}

/// Arm the sequence fallback after a non-looping sequence (or programmable
/// scene) completed naturally.
pub fn arm_sequence_fallback(engine: &Arc<Engine>) {
    let slot = engine.config.read(|c| c.fallback.sequence_fallback.clone());
    if !slot.enabled {
        return;
    }
    let scene_id = slot.scene_id.unwrap_or_else(|| "blackout".to_string());
    let delay = slot
        .delay
        .unwrap_or_else(|| engine.settings.read(|s| s.fallback_delay));
    schedule(engine, scene_id, delay, "sequence fallback");
}

fn schedule(engine: &Arc<Engine>, scene_id: String, delay: f64, what: &'static str) {
    let token = engine.recovery.arm();
    info!(scene = %scene_id, delay, "{what} armed");
    let engine = Arc::clone(engine);
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("{what} timer cancelled");
            }
            _ = tokio::time::sleep(Duration::from_secs_f64(delay.max(0.0))) => {
                info!(scene = %scene_id, "firing {what}");
                if let Err(e) = playback::play_scene(&engine, &scene_id, PlayOrigin::Fallback) {
                    warn!(scene = %scene_id, error = %e, "{what} scene missing");
                }
            }
        }
    });
}

/// Run the configured autostart once. Failures are logged; there is no
/// retry.
pub fn run_autostart(engine: &Arc<Engine>) {
    let autostart = engine.config.read(|c| c.autostart.clone());
    if !autostart.enabled {
        return;
    }
    let (Some(kind), Some(id)) = (autostart.kind, autostart.id) else {
        warn!("autostart enabled but incomplete (needs type and id)");
        return;
    };
    info!(?kind, id = %id, "running autostart");
    let result = match kind {
        AutostartKind::Scene => playback::play_scene(engine, &id, PlayOrigin::Autostart),
        AutostartKind::Sequence => playback::play_sequence(engine, &id),
    };
    if let Err(e) = result {
        warn!(error = %e, "autostart failed");
    }
}

// ============================================================================
// Tests
// ============================================================================
