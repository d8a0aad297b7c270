//! Periodic re-emission of the last universe frame
//!
//! Art-Net receivers blank on timeout and sACN receivers declare a stream
//! terminated when packets stop, so idle holds and long programmable pauses
//! must keep traffic flowing. One long-lived worker re-reads the live
//! settings every tick: while enabled it broadcasts the current frame once
//! per interval (clamped to 0.1..=60 s); while disabled it sends nothing.
//! Settings edits kick the worker awake so a toggle takes effect
//! immediately rather than after a stale sleep.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::engine::Engine;

/// Spawn the retransmitter worker. It runs until engine shutdown.
pub fn spawn(engine: Arc<Engine>) {
    tokio::spawn(async move {
        loop {
            let settings = engine.settings.read(|s| s.dmx_retransmission.clone());
            if settings.enabled {
                debug!(interval = settings.interval, "retransmitting current frame");
                engine.send_frame();
            }
            let interval = Duration::from_secs_f64(settings.clamped_interval());
            tokio::select! {
                _ = engine.shutdown.cancelled() => break,
                _ = engine.retransmit_notify.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("retransmitter stopped");
    });
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::test_engine;

    #[tokio::test]
    async fn sends_at_least_once_per_interval_while_enabled() {
        let (engine, _dir) = test_engine();
        let state = engine.sinks.test_state("default_test").unwrap();
        engine
            .settings
            .update(|s| {
                s.dmx_retransmission.enabled = true;
                s.dmx_retransmission.interval = 0.1;
            })
            .unwrap();

        spawn(Arc::clone(&engine));
        tokio::time::sleep(Duration::from_millis(450)).await;
        engine.shutdown.cancel();

        // 0.1 s interval over ~0.45 s: expect several sends; >= 3 leaves
        // slack for scheduling jitter.
        assert!(state.send_count() >= 3, "got {}", state.send_count());
    }

    #[tokio::test]
    async fn never_sends_while_disabled() {
        let (engine, _dir) = test_engine();
        let state = engine.sinks.test_state("default_test").unwrap();
        engine
            .settings
            .update(|s| {
                s.dmx_retransmission.enabled = false;
                s.dmx_retransmission.interval = 0.1;
            })
            .unwrap();

        spawn(Arc::clone(&engine));
        tokio::time::sleep(Duration::from_millis(350)).await;
        engine.shutdown.cancel();

        assert_eq!(state.send_count(), 0);
    }

    #[tokio::test]
    async fn toggle_takes_effect_via_notify() {
        let (engine, _dir) = test_engine();
        let state = engine.sinks.test_state("default_test").unwrap();
        engine
            .settings
            .update(|s| {
                s.dmx_retransmission.enabled = false;
                s.dmx_retransmission.interval = 30.0;
            })
            .unwrap();

        spawn(Arc::clone(&engine));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(state.send_count(), 0);

        engine
            .settings
            .update(|s| s.dmx_retransmission.enabled = true)
            .unwrap();
        engine.retransmit_notify.notify_waiters();

        tokio::time::sleep(Duration::from_millis(150)).await;
        engine.shutdown.cancel();
        assert!(state.send_count() >= 1);
    }

    #[tokio::test]
    async fn retransmits_whatever_the_frame_currently_is() {
        let (engine, _dir) = test_engine();
        let state = engine.sinks.test_state("default_test").unwrap();
        engine.universe.set_one(1, 123).unwrap();
        engine
            .settings
            .update(|s| {
                s.dmx_retransmission.enabled = true;
                s.dmx_retransmission.interval = 0.1;
            })
            .unwrap();

        spawn(Arc::clone(&engine));
        tokio::time::sleep(Duration::from_millis(250)).await;
        engine.shutdown.cancel();

        assert_eq!(state.last_frame().unwrap()[0], 123);
    }
}
