//! Shared engine assembly and the commit path
//!
//! The engine owns every piece of shared state: the universe buffer, the
//! sink set, both persisted documents, the playback slot, the recovery
//! supervisor, the bus handle, and the shutdown token. Commits flow through
//! [`Engine::apply_channels`]: follower resolution → universe write →
//! broadcast. Lock order is playback slot → sink set → universe, and no
//! lock is held across a sleep or a network send.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ConfigStore, SettingsStore};
use crate::follower;
use crate::mqtt::BusHandle;
use crate::playback::PlaybackController;
use crate::recovery::RecoverySupervisor;
use crate::sink::{SinkError, SinkKind, SinkSet};
use crate::universe::{ChannelMap, Universe};

/// Drain-once record of the most recent externally-driven channel write,
/// polled by the frontend via `GET /api/dmx/channel-update`.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct ChannelUpdate {
    pub channel: u16,
    pub value: u8,
}

pub struct Engine {
    pub universe: Universe,
    pub sinks: SinkSet,
    pub settings: SettingsStore,
    pub config: ConfigStore,
    pub playback: PlaybackController,
    pub recovery: RecoverySupervisor,
    pub bus: BusHandle,
    pub last_channel_update: Mutex<Option<ChannelUpdate>>,
    /// Engine-wide shutdown; cancels the retransmitter and the bus loop.
    pub shutdown: CancellationToken,
    /// Kicks the retransmitter awake when its settings change.
    pub retransmit_notify: Notify,
}

impl Engine {
    /// Assemble the engine and start the configured sinks. If the final set
    /// is empty a `default_test` sink is installed so the frame is always
    /// observable.
    pub fn new(settings: SettingsStore, config: ConfigStore) -> Arc<Self> {
        let engine = Arc::new(Self {
            universe: Universe::new(),
            sinks: SinkSet::new(),
            settings,
            config,
            playback: PlaybackController::new(),
            recovery: RecoverySupervisor::new(),
            bus: BusHandle::new(),
            last_channel_update: Mutex::new(None),
            shutdown: CancellationToken::new(),
            retransmit_notify: Notify::new(),
        });
        engine.install_sinks();
        engine
    }

    fn install_sinks(&self) {
        let dmx = self.settings.read(|s| s.dmx.clone());
        for desc in &dmx.default_configs {
            let mut desc = desc.clone();
            match desc.kind {
                SinkKind::Artnet if desc.port.is_none() => {
                    desc.port = Some(dmx.artnet.default_port)
                }
                SinkKind::E131 if desc.fps.is_none() => desc.fps = Some(dmx.e131.default_fps),
                _ => {}
            }
            if let Err(e) = self.sinks.add(&desc, dmx.e131.multicast) {
                warn!(name = %desc.name, error = %e, "skipping sink config");
            }
        }
        if self.sinks.is_empty() {
            info!("no sinks configured, adding default test sink");
            self.sinks.add_test("default_test", 1);
        }
    }

    /// The single commit path: resolve followers, write the universe, and
    /// (when `send` is set) broadcast the resulting frame.
    pub fn apply_channels(&self, map: ChannelMap, send: bool) {
        let followers = self.settings.read(|s| s.dmx_followers.clone());
        let resolved = follower::resolve(&followers, map);
        self.universe.set_many(&resolved);
        if send {
            self.send_frame();
        }
    }

    /// Broadcast the current frame through every sink.
    pub fn send_frame(&self) {
        let frame = self.universe.snapshot();
        self.sinks.send_all(&frame);
    }

    /// Zero the universe and emit the zero frame through one sink or all.
    pub fn blackout(&self, sink: Option<&str>) -> Result<(), SinkError> {
        self.universe.blackout();
        self.sinks.blackout(sink)
    }

    pub fn record_channel_update(&self, channel: u16, value: u8) {
        *self
            .last_channel_update
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(ChannelUpdate { channel, value });
    }

    /// Take (and clear) the drain-once channel update.
    pub fn take_channel_update(&self) -> Option<ChannelUpdate> {
        self.last_channel_update
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Orderly shutdown: cancel playback and armed fallbacks, stop the
    /// retransmitter and the bus loop via the shutdown token, then stop the
    /// sinks.
    pub fn orderly_shutdown(&self) {
        info!("shutting down engine");
        self.playback.stop();
        self.recovery.cancel_pending();
        self.shutdown.cancel();
        self.sinks.stop_all();
        info!("shutdown complete");
    }
}

// ============================================================================
// Test assembly
// ============================================================================


#[cfg(test)]
mod tests {
    use super::testutil::test_engine;

    #[test]
    fn empty_sink_config_installs_default_test() {
        let (engine, _dir) = test_engine();
        assert_eq!(engine.sinks.names(), vec!["default_test".to_string()]);
    }

    #[test]
    fn followers_apply_on_the_commit_path() {
        let (engine, _dir) = test_engine();
        engine
            .settings
            .update(|s| {
                s.dmx_followers.enabled = true;
                s.dmx_followers.mappings.insert(1, vec![2, 3]);
            })
            .unwrap();

        engine.apply_channels([(1u16, 200u8)].into_iter().collect(), true);

        let snap = engine.universe.snapshot();
        assert_eq!(&snap[..4], &[200, 200, 200, 0]);
        let state = engine.sinks.test_state("default_test").unwrap();
        assert_eq!(state.last_frame().unwrap()[2], 200);
    }

    #[test]
    fn blackout_zeroes_and_emits() {
        let (engine, _dir) = test_engine();
        engine.apply_channels([(1u16, 9u8)].into_iter().collect(), true);
        engine.blackout(None).unwrap();
        assert!(engine.universe.snapshot().iter().all(|&v| v == 0));
        let state = engine.sinks.test_state("default_test").unwrap();
        assert!(state.last_frame().unwrap().iter().all(|&v| v == 0));
    }

    #[test]
    fn channel_update_drains_once() {
        let (engine, _dir) = test_engine();
        assert!(engine.take_channel_update().is_none());
        engine.record_channel_update(5, 130);
        let update = engine.take_channel_update().unwrap();
        assert_eq!((update.channel, update.value), (5, 130));
        assert!(engine.take_channel_update().is_none());
    }
}
