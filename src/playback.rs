//! Single-slot playback controller
//!
//! Exactly one playback mode is active at any instant. Starting any mode
//! pre-empts the current one by cancelling its worker token; workers check
//! the token before every pacing sleep and between sleep slices of at most
//! 100 ms, so pre-emption and `stop` settle within one slice.
//!
//! Mode semantics:
//! - **Scene** applies its channel map once and stays recorded in the slot
//!   (no worker) until pre-empted or stopped. Applying fires the scene
//!   fallback unless the scene was itself played as a fallback.
//! - **Sequence** iterates steps on a worker; scene-ref steps go through
//!   [`apply_scene_frame_only`], which neither touches the slot nor fires
//!   scene fallback. A non-looping sequence fires the sequence fallback on
//!   natural completion.
//! - **Programmable** evaluates per-channel expressions at up to 100 Hz and
//!   commits only when some channel actually changed. Natural completion
//!   fires the generic (sequence-slot) fallback.
//!
//! Pause freezes effective time: the pause span accumulates in the slot and
//! every pacing computation subtracts it. Stop clears the slot without
//! firing any fallback and deliberately leaves the last frame on the wire.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DurationValue, Scene, Sequence, Step};
use crate::engine::Engine;
use crate::expr::Expr;
use crate::universe::{parse_channel_key, validate_value, ChannelMap};
use crate::UNIVERSE_SIZE;

/// Worker sleep slice; also the pre-emption latency bound.
const SLICE: Duration = Duration::from_millis(100);
/// Programmable frame interval (100 Hz cap).
const FRAME_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("scene `{0}` not found")]
    SceneNotFound(String),
    #[error("sequence `{0}` not found")]
    SequenceNotFound(String),
    #[error("programmable scene `{0}` not found")]
    ProgrammableNotFound(String),
}

/// Who asked for the playback. Fallback-originated scenes must not re-arm
/// the scene fallback, or a non-terminal fallback scene would loop forever.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayOrigin {
    Operator,
    Autostart,
    Fallback,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Mode {
    Idle,
    Scene {
        name: String,
    },
    Sequence {
        name: String,
        total_steps: usize,
        looped: bool,
    },
    Programmable {
        id: String,
        name: String,
        duration_s: f64,
        looped: bool,
    },
}

/// Progress of the step a sequence worker is currently dwelling on.
#[derive(Clone, Debug, Serialize)]
pub struct StepStatus {
    pub scene_name: String,
    pub duration: f64,
    pub progress: f64,
}

struct Slot {
    mode: Mode,
    /// Bumped on every activation and stop; a worker may only finish or
    /// report progress while its generation is still current.
    generation: u64,
    cancel: CancellationToken,
    started_at: Option<Instant>,
    paused: bool,
    pause_anchor: Option<Instant>,
    accumulated_pause: Duration,
    current_step: usize,
    step: Option<StepStatus>,
}

impl Slot {
    fn reset_timing(&mut self) {
        self.started_at = Some(Instant::now());
        self.paused = false;
        self.pause_anchor = None;
        self.accumulated_pause = Duration::ZERO;
        self.current_step = 0;
        self.step = None;
    }

    fn total_pause(&self) -> Duration {
        let live = self
            .pause_anchor
            .map(|a| a.elapsed())
            .unwrap_or(Duration::ZERO);
        self.accumulated_pause + live
    }
}

pub struct PlaybackController {
    slot: Mutex<Slot>,
}

impl PlaybackController {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                mode: Mode::Idle,
                generation: 0,
                cancel: CancellationToken::new(),
                started_at: None,
                paused: false,
                pause_anchor: None,
                accumulated_pause: Duration::ZERO,
                current_step: 0,
                step: None,
            }),
        }
    }

    /// Cancel whatever is active and install `mode`. Returns the fresh
    /// worker token and the slot generation guarding it.
    fn activate(&self, mode: Mode) -> (CancellationToken, u64) {
        let mut slot = self.lock();
        slot.cancel.cancel();
        slot.cancel = CancellationToken::new();
        slot.generation += 1;
        slot.mode = mode;
        slot.reset_timing();
        (slot.cancel.clone(), slot.generation)
    }

    /// Clear the slot. Returns true when something was active. Fires no
    /// fallback and leaves the last frame in place.
    pub fn stop(&self) -> bool {
        let mut slot = self.lock();
        if slot.mode == Mode::Idle {
            return false;
        }
        slot.cancel.cancel();
        slot.generation += 1;
        slot.mode = Mode::Idle;
        slot.started_at = None;
        slot.paused = false;
        slot.pause_anchor = None;
        slot.accumulated_pause = Duration::ZERO;
        slot.current_step = 0;
        slot.step = None;
        info!("playback stopped");
        true
    }

    /// Freeze effective time. No-op when idle or already paused.
    pub fn pause(&self) -> bool {
        let mut slot = self.lock();
        if slot.mode == Mode::Idle || slot.paused {
            return false;
        }
        slot.paused = true;
        slot.pause_anchor = Some(Instant::now());
        info!("playback paused");
        true
    }

    /// Unfreeze; the paused span lands in `accumulated_pause`. No-op when
    /// not paused.
    pub fn resume(&self) -> bool {
        let mut slot = self.lock();
        if slot.mode == Mode::Idle || !slot.paused {
            return false;
        }
        if let Some(anchor) = slot.pause_anchor.take() {
            slot.accumulated_pause += anchor.elapsed();
        }
        slot.paused = false;
        info!("playback resumed");
        true
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn is_active(&self) -> bool {
        self.lock().mode != Mode::Idle
    }

    pub fn mode(&self) -> Mode {
        self.lock().mode.clone()
    }

    fn total_pause(&self) -> Duration {
        self.lock().total_pause()
    }

    fn begin_step(&self, generation: u64, index: usize, name: &str, duration: f64) {
        let mut slot = self.lock();
        if slot.generation != generation {
            return;
        }
        slot.current_step = index;
        slot.step = Some(StepStatus {
            scene_name: name.to_string(),
            duration,
            progress: 0.0,
        });
    }

    fn set_step_progress(&self, generation: u64, progress: f64) {
        let mut slot = self.lock();
        if slot.generation != generation {
            return;
        }
        if let Some(step) = &mut slot.step {
            step.progress = progress;
        }
    }

    /// Natural completion. Only the worker whose generation is still
    /// current may clear the slot; a pre-empted worker's completion is a
    /// no-op. Returns whether the slot was cleared.
    fn finish(&self, generation: u64) -> bool {
        let mut slot = self.lock();
        if slot.generation != generation {
            return false;
        }
        slot.generation += 1;
        slot.mode = Mode::Idle;
        slot.started_at = None;
        slot.paused = false;
        slot.pause_anchor = None;
        slot.accumulated_pause = Duration::ZERO;
        slot.current_step = 0;
        slot.step = None;
        true
    }

    /// Elapsed effective time of the active mode (pause subtracted).
    pub fn elapsed(&self) -> f64 {
        let slot = self.lock();
        match slot.started_at {
            Some(start) => start
                .elapsed()
                .saturating_sub(slot.total_pause())
                .as_secs_f64(),
            None => 0.0,
        }
    }

    /// Snapshot for `GET /api/playback/status`.
    pub fn status(&self) -> PlaybackStatus {
        let slot = self.lock();
        let elapsed = match slot.started_at {
            Some(start) => start
                .elapsed()
                .saturating_sub(slot.total_pause())
                .as_secs_f64(),
            None => 0.0,
        };
        let mut status = PlaybackStatus {
            is_playing: slot.mode != Mode::Idle,
            current_scene: None,
            current_sequence: None,
            current_programmable_scene: None,
            current_step: 0,
            total_steps: 0,
            step_progress: 0.0,
            elapsed_time: elapsed,
            total_duration: 0.0,
            playback_paused: slot.paused,
            step_data: slot.step.clone(),
            scene_duration: None,
            scene_loop: None,
        };
        match &slot.mode {
            Mode::Idle => {
                status.elapsed_time = 0.0;
                status.playback_paused = false;
                status.step_data = None;
            }
            Mode::Scene { name } => {
                status.current_scene = Some(name.clone());
            }
            Mode::Sequence {
                name, total_steps, ..
            } => {
                status.current_sequence = Some(name.clone());
                status.current_step = slot.current_step + 1;
                status.total_steps = *total_steps;
                if let Some(step) = &slot.step {
                    status.step_progress = step.progress;
                    status.total_duration = step.duration;
                }
            }
            Mode::Programmable {
                id,
                name,
                duration_s,
                looped,
            } => {
                status.current_programmable_scene = Some(id.clone());
                status.current_scene = Some(name.clone());
                status.scene_duration = Some(*duration_s);
                status.total_duration = *duration_s;
                status.scene_loop = Some(*looped);
                if *duration_s > 0.0 {
                    let loop_time = if *looped {
                        elapsed % *duration_s
                    } else {
                        elapsed
                    };
                    status.step_progress = (loop_time / *duration_s).min(1.0);
                }
            }
        }
        status
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PlaybackController {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PlaybackStatus {
    pub is_playing: bool,
    pub current_scene: Option<String>,
    pub current_sequence: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_programmable_scene: Option<String>,
    pub current_step: usize,
    pub total_steps: usize,
    pub step_progress: f64,
    pub elapsed_time: f64,
    pub total_duration: f64,
    pub playback_paused: bool,
    pub step_data: Option<StepStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_loop: Option<bool>,
}

// ============================================================================
// Scene
// ============================================================================

/// Turn scene slots into a channel map, skipping nulls and anything past
/// channel 512.
fn scene_channel_map(scene: &Scene) -> ChannelMap {
    scene
        .iter()
        .enumerate()
        .take(UNIVERSE_SIZE)
        .filter_map(|(i, slot)| slot.map(|v| ((i + 1) as u16, v)))
        .collect()
}

/// Play a named scene: pre-empt whatever runs, commit the scene's channels,
/// broadcast, and arm the scene fallback (unless this *is* the fallback).
pub fn play_scene(
    engine: &Arc<Engine>,
    name: &str,
    origin: PlayOrigin,
) -> Result<(), PlaybackError> {
    let scene = engine
        .config
        .read(|c| c.scenes.get(name).cloned())
        .ok_or_else(|| PlaybackError::SceneNotFound(name.to_string()))?;

    engine.recovery.cancel_pending();
    engine.playback.activate(Mode::Scene {
        name: name.to_string(),
    });

    let auto_send = engine.settings.read(|s| s.scenes.auto_send);
    engine.apply_channels(scene_channel_map(&scene), auto_send);
    info!(scene = name, ?origin, "scene applied");

    if origin != PlayOrigin::Fallback {
        crate::recovery::arm_scene_fallback(engine);
    }
    Ok(())
}

/// Commit a scene's channels without touching the playback slot and without
/// firing any fallback. This is the path sequence steps use; a step must
/// not clobber its own sequence's state.
pub fn apply_scene_frame_only(engine: &Engine, name: &str) -> Result<(), PlaybackError> {
    let scene = engine
        .config
        .read(|c| c.scenes.get(name).cloned())
        .ok_or_else(|| PlaybackError::SceneNotFound(name.to_string()))?;
    let auto_send = engine.settings.read(|s| s.scenes.auto_send);
    engine.apply_channels(scene_channel_map(&scene), auto_send);
    Ok(())
}

// ============================================================================
// Sequence
// ============================================================================

/// Seconds for a step. Integers are milliseconds only on scene-ref steps
/// and only when >= 1000; everything else is seconds.
fn normalize_duration(step: &Step, default_duration: f64) -> f64 {
    let duration = match step.duration {
        None => default_duration,
        Some(DurationValue::Float(f)) => f,
        Some(DurationValue::Int(n)) => {
            if step.scene_ref().is_some() && n >= 1000 {
                n as f64 / 1000.0
            } else {
                n as f64
            }
        }
    };
    duration.max(0.0)
}

/// Parse a direct step's dmx map, dropping invalid entries with a log.
fn parse_dmx_map(dmx: &std::collections::BTreeMap<String, i64>) -> ChannelMap {
    let mut map = ChannelMap::new();
    for (key, value) in dmx {
        let channel = match parse_channel_key(key) {
            Ok(ch) => ch,
            Err(e) => {
                warn!(key = %key, error = %e, "dropping step entry");
                continue;
            }
        };
        let value = match validate_value(*value) {
            Ok(v) => v,
            Err(e) => {
                warn!(channel, error = %e, "dropping step entry");
                continue;
            }
        };
        map.insert(channel, value);
    }
    map
}

/// Play a named sequence from the config document.
pub fn play_sequence(engine: &Arc<Engine>, name: &str) -> Result<(), PlaybackError> {
    let sequence = engine
        .config
        .read(|c| c.sequences.get(name).cloned())
        .ok_or_else(|| PlaybackError::SequenceNotFound(name.to_string()))?;
    start_sequence(engine, name, sequence);
    Ok(())
}

/// Install a sequence into the slot and spawn its worker.
pub fn start_sequence(engine: &Arc<Engine>, name: &str, sequence: Sequence) {
    engine.recovery.cancel_pending();
    let (cancel, generation) = engine.playback.activate(Mode::Sequence {
        name: name.to_string(),
        total_steps: sequence.steps.len(),
        looped: sequence.looped,
    });
    info!(
        sequence = name,
        steps = sequence.steps.len(),
        looped = sequence.looped,
        "sequence started"
    );
    let engine = Arc::clone(engine);
    tokio::spawn(async move {
        sequence_worker(engine, sequence, cancel, generation).await;
    });
}

async fn sequence_worker(
    engine: Arc<Engine>,
    sequence: Sequence,
    cancel: CancellationToken,
    generation: u64,
) {
    let (default_duration, auto_play) = engine
        .settings
        .read(|s| (s.sequences.default_duration, s.sequences.auto_play));

    loop {
        for (index, step) in sequence.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return;
            }
            let duration = normalize_duration(step, default_duration);
            let label = step.scene_ref().unwrap_or("DMX");
            engine
                .playback
                .begin_step(generation, index, label, duration);
            debug!(step = index + 1, total = sequence.steps.len(), duration, "playing step");

            if let Some(scene) = step.scene_ref() {
                if let Err(e) = apply_scene_frame_only(&engine, scene) {
                    warn!(scene, error = %e, "sequence step scene missing");
                }
            } else if let Some(dmx) = &step.dmx {
                let map = parse_dmx_map(dmx);
                engine.apply_channels(map, auto_play);
            }

            if !pace_step(&engine, &cancel, generation, duration).await {
                return;
            }
        }
        if !sequence.looped {
            break;
        }
        debug!("sequence loop completed, restarting");
    }

    if engine.playback.finish(generation) {
        info!("sequence finished");
        crate::recovery::arm_sequence_fallback(&engine);
    }
}

/// Dwell on a step for `duration_s` effective seconds, slicing sleeps at
/// 100 ms, honouring pause, and updating progress. Returns false when the
/// worker was cancelled mid-dwell.
async fn pace_step(
    engine: &Arc<Engine>,
    cancel: &CancellationToken,
    generation: u64,
    duration_s: f64,
) -> bool {
    let anchor = Instant::now();
    let pause_base = engine.playback.total_pause();
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let pause_delta = engine.playback.total_pause().saturating_sub(pause_base);
        let effective = anchor.elapsed().saturating_sub(pause_delta).as_secs_f64();
        let progress = if duration_s <= 0.0 {
            1.0
        } else {
            (effective / duration_s).min(1.0)
        };
        engine.playback.set_step_progress(generation, progress);
        if effective >= duration_s {
            return true;
        }

        let chunk = if engine.playback.is_paused() {
            SLICE
        } else {
            let remaining = Duration::from_secs_f64((duration_s - effective).max(0.001));
            SLICE.min(remaining)
        };
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(chunk) => {}
        }
    }
}

// ============================================================================
// Programmable
// ============================================================================

/// Play a programmable scene: compile its expressions once, then evaluate
/// at up to 100 Hz on a worker.
pub fn play_programmable(engine: &Arc<Engine>, id: &str) -> Result<(), PlaybackError> {
    let scene = engine
        .config
        .read(|c| c.programmable_scenes.get(id).cloned())
        .ok_or_else(|| PlaybackError::ProgrammableNotFound(id.to_string()))?;

    let duration_s = scene.duration as f64 / 1000.0;
    let mut compiled: Vec<(u16, Expr)> = Vec::with_capacity(scene.expressions.len());
    for (key, source) in &scene.expressions {
        let channel = match parse_channel_key(key) {
            Ok(ch) => ch,
            Err(e) => {
                warn!(key = %key, error = %e, "dropping expression for invalid channel");
                continue;
            }
        };
        let expr = match Expr::compile(source) {
            Ok(expr) => expr,
            Err(e) => {
                warn!(channel, source = %source, error = %e, "expression failed to compile, channel pinned to 0");
                Expr::constant(0.0)
            }
        };
        compiled.push((channel, expr));
    }

    engine.recovery.cancel_pending();
    let display_name = if scene.name.is_empty() {
        id.to_string()
    } else {
        scene.name.clone()
    };
    let (cancel, generation) = engine.playback.activate(Mode::Programmable {
        id: id.to_string(),
        name: display_name,
        duration_s,
        looped: scene.looped,
    });
    info!(
        scene = id,
        duration_s,
        looped = scene.looped,
        channels = compiled.len(),
        "programmable scene started"
    );

    let engine = Arc::clone(engine);
    let looped = scene.looped;
    tokio::spawn(async move {
        programmable_worker(engine, compiled, duration_s, looped, cancel, generation).await;
    });
    Ok(())
}

async fn programmable_worker(
    engine: Arc<Engine>,
    compiled: Vec<(u16, Expr)>,
    duration_s: f64,
    looped: bool,
    cancel: CancellationToken,
    generation: u64,
) {
    let start = Instant::now();
    let pause_base = engine.playback.total_pause();
    let mut last_sent: Option<ChannelMap> = None;

    loop {
        if cancel.is_cancelled() {
            return;
        }
        if engine.playback.is_paused() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(SLICE) => {}
            }
            continue;
        }

        let pause_delta = engine.playback.total_pause().saturating_sub(pause_base);
        let effective = start.elapsed().saturating_sub(pause_delta).as_secs_f64();
        if !looped && effective >= duration_s {
            break;
        }
        let t = if looped && duration_s > 0.0 {
            effective % duration_s
        } else {
            effective
        };

        let mut map = ChannelMap::new();
        for (channel, expr) in &compiled {
            let value = match expr.eval(t, *channel) {
                Ok(v) => v.dmx_value(*channel),
                Err(e) => {
                    debug!(channel = *channel, error = %e, "expression evaluation failed");
                    0
                }
            };
            map.insert(*channel, value);
        }

        if !map.is_empty() && last_sent.as_ref() != Some(&map) {
            engine.apply_channels(map.clone(), true);
            last_sent = Some(map);
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(FRAME_INTERVAL) => {}
        }
    }

    if engine.playback.finish(generation) {
        info!("programmable scene finished");
        crate::recovery::arm_sequence_fallback(&engine);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::test_engine;

    #[test]
    fn scene_channel_map_skips_nulls() {
        let scene = vec![Some(255), Some(128), None, Some(0)];
        let map = scene_channel_map(&scene);
        assert_eq!(
            map,
            [(1u16, 255u8), (2, 128), (4, 0)].into_iter().collect()
        );
    }

    #[test]
    fn duration_normalization_rules() {
        let scene_step = |d| Step {
            scene_name: Some("s".into()),
            scene_id: None,
            dmx: None,
            duration: d,
        };
        let direct_step = |d| Step {
            scene_name: None,
            scene_id: None,
            dmx: Some(Default::default()),
            duration: d,
        };

        // ints >= 1000 are milliseconds, but only on scene-ref steps
        assert_eq!(
            normalize_duration(&scene_step(Some(DurationValue::Int(1500))), 1.0),
            1.5
        );
        assert_eq!(
            normalize_duration(&scene_step(Some(DurationValue::Int(2))), 1.0),
            2.0
        );
        assert_eq!(
            normalize_duration(&direct_step(Some(DurationValue::Int(1500))), 1.0),
            1500.0
        );
        // floats are always seconds; missing falls back to the default
        assert_eq!(
            normalize_duration(&direct_step(Some(DurationValue::Float(0.2))), 1.0),
            0.2
        );
        assert_eq!(normalize_duration(&direct_step(None), 1.0), 1.0);
        // negatives clamp to zero
        assert_eq!(
            normalize_duration(&direct_step(Some(DurationValue::Float(-3.0))), 1.0),
            0.0
        );
    }

    #[tokio::test]
    async fn scene_apply_respects_nulls_and_prior_state() {
        let (engine, _dir) = test_engine();
        engine
            .config
            .update(|c| {
                let mut warm: Scene = vec![Some(255), Some(128), None, Some(0)];
                warm.resize(8, None);
                c.scenes.insert("warm".into(), warm);
            })
            .unwrap();

        // Pre-set channel 3 so the null slot provably leaves it alone.
        engine.universe.set_one(3, 99).unwrap();
        play_scene(&engine, "warm", PlayOrigin::Operator).unwrap();

        let snap = engine.universe.snapshot();
        assert_eq!(&snap[..4], &[255, 128, 99, 0]);
        assert!(matches!(engine.playback.mode(), Mode::Scene { .. }));
    }

    #[tokio::test]
    async fn double_play_scene_is_idempotent() {
        let (engine, _dir) = test_engine();
        engine
            .config
            .update(|c| {
                c.scenes.insert("s".into(), vec![Some(10), None, Some(30)]);
            })
            .unwrap();

        play_scene(&engine, "s", PlayOrigin::Operator).unwrap();
        let first = engine.universe.snapshot();
        play_scene(&engine, "s", PlayOrigin::Operator).unwrap();
        assert_eq!(first, engine.universe.snapshot());
    }

    #[tokio::test]
    async fn unknown_names_are_errors() {
        let (engine, _dir) = test_engine();
        assert!(matches!(
            play_scene(&engine, "ghost", PlayOrigin::Operator),
            Err(PlaybackError::SceneNotFound(_))
        ));
        assert!(matches!(
            play_sequence(&engine, "ghost"),
            Err(PlaybackError::SequenceNotFound(_))
        ));
        assert!(matches!(
            play_programmable(&engine, "ghost"),
            Err(PlaybackError::ProgrammableNotFound(_))
        ));
        assert!(!engine.playback.is_active());
    }

    #[tokio::test]
    async fn stop_goes_idle_within_a_slice() {
        let (engine, _dir) = test_engine();
        engine
            .config
            .update(|c| {
                c.sequences.insert(
                    "long".into(),
                    Sequence {
                        steps: vec![Step {
                            scene_name: None,
                            scene_id: None,
                            dmx: Some([("1".to_string(), 255i64)].into_iter().collect()),
                            duration: Some(DurationValue::Float(10.0)),
                        }],
                        looped: true,
                        description: String::new(),
                    },
                );
            })
            .unwrap();

        play_sequence(&engine, "long").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.playback.is_active());

        assert!(engine.playback.stop());
        assert!(!engine.playback.is_active());
        // The worker itself exits within one 100 ms slice.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!engine.playback.is_active());
        assert!(!engine.playback.stop()); // second stop is a no-op
    }

    #[tokio::test]
    async fn flash_sequence_produces_rising_edges() {
        let (engine, _dir) = test_engine();
        let state = engine.sinks.test_state("default_test").unwrap();
        engine
            .config
            .update(|c| {
                c.sequences.insert(
                    "flash".into(),
                    Sequence {
                        steps: vec![
                            Step {
                                scene_name: None,
                                scene_id: None,
                                dmx: Some([("1".to_string(), 255i64)].into_iter().collect()),
                                duration: Some(DurationValue::Float(0.2)),
                            },
                            Step {
                                scene_name: None,
                                scene_id: None,
                                dmx: Some([("1".to_string(), 0i64)].into_iter().collect()),
                                duration: Some(DurationValue::Float(0.2)),
                            },
                        ],
                        looped: true,
                        description: String::new(),
                    },
                );
            })
            .unwrap();

        play_sequence(&engine, "flash").unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        engine.playback.stop();

        let history = state.channel_history(1);
        let rising = history
            .windows(2)
            .filter(|w| w[0] == 0 && w[1] == 255)
            .count()
            + usize::from(history.first() == Some(&255));
        assert!(rising >= 2, "expected >= 2 rising edges, got {rising} ({history:?})");
    }

    #[tokio::test]
    async fn sequence_preempted_by_scene_within_a_slice() {
        let (engine, _dir) = test_engine();
        engine
            .config
            .update(|c| {
                c.scenes.insert("b".into(), vec![Some(7)]);
                c.sequences.insert(
                    "a".into(),
                    Sequence {
                        steps: vec![Step {
                            scene_name: None,
                            scene_id: None,
                            dmx: Some([("2".to_string(), 200i64)].into_iter().collect()),
                            duration: Some(DurationValue::Float(10.0)),
                        }],
                        looped: true,
                        description: String::new(),
                    },
                );
            })
            .unwrap();

        play_sequence(&engine, "a").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        play_scene(&engine, "b", PlayOrigin::Operator).unwrap();

        assert_eq!(
            engine.playback.mode(),
            Mode::Scene { name: "b".into() }
        );
        assert_eq!(engine.universe.snapshot()[0], 7);

        // The old worker must not reassert its state after its slice ends.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            engine.playback.mode(),
            Mode::Scene { name: "b".into() }
        );
    }

    #[tokio::test]
    async fn pause_resume_accounting() {
        let (engine, _dir) = test_engine();
        engine
            .config
            .update(|c| {
                c.sequences.insert(
                    "hold".into(),
                    Sequence {
                        steps: vec![Step {
                            scene_name: None,
                            scene_id: None,
                            dmx: Some([("1".to_string(), 1i64)].into_iter().collect()),
                            duration: Some(DurationValue::Float(30.0)),
                        }],
                        looped: false,
                        description: String::new(),
                    },
                );
            })
            .unwrap();

        play_sequence(&engine, "hold").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(engine.playback.pause());
        assert!(!engine.playback.pause()); // already paused
        let at_pause = engine.playback.elapsed();
        tokio::time::sleep(Duration::from_millis(300)).await;
        // Effective time does not advance while paused.
        assert!((engine.playback.elapsed() - at_pause).abs() < 0.05);

        assert!(engine.playback.resume());
        assert!(!engine.playback.resume()); // not paused any more
        tokio::time::sleep(Duration::from_millis(100)).await;
        let after = engine.playback.elapsed();
        assert!(after >= at_pause + 0.08, "resume must let time advance");
        assert!(after < at_pause + 0.45, "paused span must be subtracted");

        engine.playback.stop();
    }

    #[tokio::test]
    async fn pause_gap_lands_in_accumulated_pause() {
        let ctl = PlaybackController::new();
        ctl.activate(Mode::Scene { name: "x".into() });

        assert!(ctl.pause());
        let before = ctl.lock().accumulated_pause;
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(ctl.resume());
        let after = ctl.lock().accumulated_pause;

        let gap = (after - before).as_secs_f64();
        assert!(
            (gap - 0.12).abs() < 0.025,
            "accumulated pause should match the wall-clock gap, got {gap}"
        );
    }

    #[tokio::test]
    async fn programmable_pulse_matches_waveform() {
        let (engine, _dir) = test_engine();
        engine
            .config
            .update(|c| {
                c.programmable_scenes.insert(
                    "pulse".into(),
                    crate::config::ProgrammableScene {
                        name: "Pulse".into(),
                        description: String::new(),
                        duration: 1000,
                        looped: true,
                        expressions: [("1".to_string(), "round(127+127*sin(2*pi*t))".to_string())]
                            .into_iter()
                            .collect(),
                    },
                );
            })
            .unwrap();

        play_programmable(&engine, "pulse").unwrap();

        // Sample around the quarter periods; the 100 Hz loop plus scheduling
        // jitter means generous tolerances.
        let mut samples = Vec::new();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(250)).await;
            samples.push(engine.universe.snapshot()[0] as i32);
        }
        engine.playback.stop();

        // t=0.25 → ~254, t=0.5 → ~127, t=0.75 → ~0, t=1.0 → ~127.
        assert!((samples[0] - 254).abs() <= 30, "got {samples:?}");
        assert!((samples[1] - 127).abs() <= 40, "got {samples:?}");
        assert!(samples[2] <= 30, "got {samples:?}");
        assert!((samples[3] - 127).abs() <= 40, "got {samples:?}");
    }

    #[tokio::test]
    async fn programmable_nonloop_completes_and_goes_idle() {
        let (engine, _dir) = test_engine();
        engine
            .config
            .update(|c| {
                c.programmable_scenes.insert(
                    "blip".into(),
                    crate::config::ProgrammableScene {
                        name: String::new(),
                        description: String::new(),
                        duration: 100,
                        looped: false,
                        expressions: [("1".to_string(), "255".to_string())]
                            .into_iter()
                            .collect(),
                    },
                );
            })
            .unwrap();

        play_programmable(&engine, "blip").unwrap();
        assert!(engine.playback.is_active());
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!engine.playback.is_active());
        assert_eq!(engine.universe.snapshot()[0], 255);
    }

    #[tokio::test]
    async fn paused_programmable_effective_time_frozen() {
        let (engine, _dir) = test_engine();
        engine
            .config
            .update(|c| {
                c.programmable_scenes.insert(
                    "ramp".into(),
                    crate::config::ProgrammableScene {
                        name: String::new(),
                        description: String::new(),
                        duration: 10_000,
                        looped: false,
                        expressions: [("1".to_string(), "clamp(100*t, 0, 255)".to_string())]
                            .into_iter()
                            .collect(),
                    },
                );
            })
            .unwrap();

        play_programmable(&engine, "ramp").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        engine.playback.pause();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let frozen = engine.universe.snapshot()[0];
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(engine.universe.snapshot()[0], frozen);
        engine.playback.stop();
    }

    #[tokio::test]
    async fn sequence_scene_step_does_not_clobber_slot() {
        let (engine, _dir) = test_engine();
        engine
            .config
            .update(|c| {
                c.scenes.insert("glow".into(), vec![Some(42)]);
                c.sequences.insert(
                    "show".into(),
                    Sequence {
                        steps: vec![Step {
                            scene_name: Some("glow".into()),
                            scene_id: None,
                            dmx: None,
                            duration: Some(DurationValue::Float(5.0)),
                        }],
                        looped: false,
                        description: String::new(),
                    },
                );
            })
            .unwrap();

        play_sequence(&engine, "show").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            matches!(engine.playback.mode(), Mode::Sequence { ref name, .. } if name == "show")
        );
        assert_eq!(engine.universe.snapshot()[0], 42);
        engine.playback.stop();
    }
}
