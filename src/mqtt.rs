//! MQTT transport: the bus worker and the publish handle
//!
//! One worker owns the rumqttc event loop. On connect it subscribes the
//! standard command topics plus one trigger topic per configured sequence;
//! config edits re-diff the subscription set. Incoming publishes go to the
//! router. Connection errors are retried at most 3 times with a 5 s
//! backoff, after which the bus is disabled and the engine keeps running
//! HTTP-only.
//!
//! The [`BusHandle`] lives on the engine so HTTP handlers can publish
//! (`POST /api/mqtt/publish`) and report 503 while disconnected.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::router;

const MAX_RECONNECT_ATTEMPTS: u32 = 3;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Topics every engine instance listens on regardless of configuration.
pub const STANDARD_TOPICS: [&str; 4] = [
    "dmx/set/channel/#",
    "dmx/scene/#",
    "dmx/sender/#",
    "dmx/config/#",
];

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("MQTT not connected")]
    NotConnected,
    #[error("MQTT client error: {0}")]
    Client(String),
}

/// Shared bus surface: publish + connection state + subscription tracking.
pub struct BusHandle {
    client: Mutex<Option<AsyncClient>>,
    connected: AtomicBool,
    subscriptions: Mutex<BTreeSet<String>>,
}

impl BusHandle {
    pub fn new() -> Self {
        Self {
            client: Mutex::new(None),
            connected: AtomicBool::new(false),
            subscriptions: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn client(&self) -> Option<AsyncClient> {
        self.client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Publish a payload for the frontend passthrough surface.
    pub async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        let client = self.client().ok_or(BusError::NotConnected)?;
        client
            .publish(topic, QoS::AtMostOnce, false, payload.as_bytes())
            .await
            .map_err(|e| BusError::Client(e.to_string()))
    }
}

impl Default for BusHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Diff the wanted topic set (standard + sequence triggers) against what is
/// currently subscribed, and issue the subscribe/unsubscribe calls.
pub async fn refresh_subscriptions(engine: &Engine) {
    let Some(client) = engine.bus.client() else {
        debug!("bus not connected, skipping subscription refresh");
        return;
    };
    if !engine.bus.is_connected() {
        debug!("bus not connected, skipping subscription refresh");
        return;
    }

    let mut wanted: BTreeSet<String> =
        STANDARD_TOPICS.iter().map(|t| t.to_string()).collect();
    engine.config.read(|c| {
        for name in c.sequences.keys() {
            wanted.insert(name.clone());
        }
    });

    let current = engine
        .bus
        .subscriptions
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();

    for topic in current.difference(&wanted) {
        debug!(topic = %topic, "unsubscribing");
        if let Err(e) = client.unsubscribe(topic.clone()).await {
            warn!(topic = %topic, error = %e, "unsubscribe failed");
        }
    }
    for topic in wanted.difference(&current) {
        debug!(topic = %topic, "subscribing");
        if let Err(e) = client.subscribe(topic.clone(), QoS::AtMostOnce).await {
            warn!(topic = %topic, error = %e, "subscribe failed");
        }
    }

    let count = wanted.len();
    *engine
        .bus
        .subscriptions
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = wanted;
    info!(subscriptions = count, "bus subscriptions refreshed");
}

/// Run the bus worker until shutdown or until the reconnect budget is
/// exhausted.
pub async fn run(engine: Arc<Engine>) {
    let mqtt = engine.settings.read(|s| s.mqtt.clone());
    let (host, port) = mqtt.host_and_port();

    let mut options = MqttOptions::new(mqtt.client_id.clone(), host.clone(), port);
    options.set_keep_alive(Duration::from_secs(mqtt.keepalive.max(5)));
    options.set_clean_session(mqtt.clean_session);
    if !mqtt.username.is_empty() {
        options.set_credentials(mqtt.username.clone(), mqtt.password.clone());
    }

    info!(host = %host, port, client_id = %mqtt.client_id, "connecting to MQTT broker");
    let (client, mut event_loop) = AsyncClient::new(options, 64);
    *engine
        .bus
        .client
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = Some(client);

    let mut failures: u32 = 0;
    loop {
        tokio::select! {
            _ = engine.shutdown.cancelled() => {
                info!("bus worker stopping");
                if let Some(client) = engine.bus.client() {
                    let _ = client.disconnect().await;
                }
                break;
            }
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("connected to MQTT broker");
                    failures = 0;
                    engine.bus.connected.store(true, Ordering::Relaxed);
                    // Re-subscribe from scratch on every (re)connect.
                    engine
                        .bus
                        .subscriptions
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .clear();
                    refresh_subscriptions(&engine).await;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let payload = String::from_utf8_lossy(&publish.payload).to_string();
                    debug!(topic = %publish.topic, payload = %payload, "bus message");
                    router::dispatch(&engine, &publish.topic, &payload).await;
                }
                Ok(_) => {}
                Err(e) => {
                    engine.bus.connected.store(false, Ordering::Relaxed);
                    failures += 1;
                    if failures > MAX_RECONNECT_ATTEMPTS {
                        warn!(error = %e, "MQTT reconnect budget exhausted, disabling bus");
                        *engine
                            .bus
                            .client
                            .lock()
                            .unwrap_or_else(|e| e.into_inner()) = None;
                        break;
                    }
                    warn!(
                        error = %e,
                        attempt = failures,
                        max = MAX_RECONNECT_ATTEMPTS,
                        "MQTT connection error, retrying in 5 s"
                    );
                    tokio::select! {
                        _ = engine.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                    }
                }
            }
        }
    }
    engine.bus.connected.store(false, Ordering::Relaxed);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::test_engine;

    #[tokio::test]
    async fn publish_without_connection_is_rejected() {
        let (engine, _dir) = test_engine();
        assert!(matches!(
            engine.bus.publish("dmx/scene/warm", "").await,
            Err(BusError::NotConnected)
        ));
        assert!(!engine.bus.is_connected());
    }

    #[test]
    fn standard_topics_cover_the_command_surface() {
        assert!(STANDARD_TOPICS.contains(&"dmx/set/channel/#"));
        assert!(STANDARD_TOPICS.contains(&"dmx/scene/#"));
        assert!(STANDARD_TOPICS.contains(&"dmx/sender/#"));
        assert!(STANDARD_TOPICS.contains(&"dmx/config/#"));
    }
}
