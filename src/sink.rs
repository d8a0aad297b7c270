//! Protocol emitters and the named sink collection
//!
//! A sink serializes a complete universe frame onto the wire. The set is a
//! named collection with lifecycle management; a failing sink is logged and
//! skipped, never propagated to the playback path. If a protocol sink fails
//! to start, a test sink is installed under `test_<name>` so the frame stays
//! observable.
//!
//! Kinds:
//! - `artnet` — ArtDmx over UDP, immediate send on every commit. Idle
//!   refresh is supplied by the retransmitter.
//! - `e131` — sACN over UDP, multicast (`239.255.<hi>.<lo>`) or unicast.
//!   Sends are buffered into a latest-frame slot and drained by an internal
//!   pacing worker bounded at the descriptor's fps.
//! - `test` — in-memory; records frame history and non-zero channels.

use std::collections::{BTreeMap, VecDeque};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::protocol::{
    art_dmx_packet, e131_data_packet, e131_multicast_addr, ARTNET_PORT, E131_DEFAULT_PRIORITY,
    E131_PORT,
};
use crate::{Frame, UNIVERSE_SIZE};

/// Wire protocol spoken by a sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Artnet,
    E131,
    Test,
}

/// One configured output (`settings.json` → `dmx.default_configs[]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SinkDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SinkKind,
    #[serde(default = "default_universe")]
    pub universe: u16,
    #[serde(default = "default_target")]
    pub target: String,
    /// Art-Net destination port (default 6454).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// E1.31 frame cadence cap in Hz (default 40).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
}

fn default_universe() -> u16 {
    1
}

fn default_target() -> String {
    "255.255.255.255".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink `{0}` already exists")]
    Duplicate(String),
    #[error("sink `{0}` not found")]
    NotFound(String),
    #[error("failed to start sink: {0}")]
    Start(String),
    #[error("send failed: {0}")]
    Send(#[from] std::io::Error),
}

/// A started emitter. `send` must not block beyond a UDP datagram write.
pub trait Sink: Send {
    fn kind(&self) -> SinkKind;
    fn universe(&self) -> u16;
    fn active(&self) -> bool {
        true
    }
    fn send(&mut self, frame: &Frame) -> Result<(), SinkError>;
    fn stop(&mut self);
}

// ============================================================================
// Art-Net
// ============================================================================

/// Immediate-mode ArtDmx emitter.
pub struct ArtNetSink {
    socket: UdpSocket,
    dest: SocketAddr,
    universe: u16,
    sequence: u8,
}

impl ArtNetSink {
    pub fn start(target: &str, port: u16, universe: u16) -> Result<Self, SinkError> {
        let dest = resolve_target(target, port)?;
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(|e| SinkError::Start(e.to_string()))?;
        socket
            .set_broadcast(true)
            .map_err(|e| SinkError::Start(e.to_string()))?;
        info!(%dest, universe, "Art-Net sink started");
        Ok(Self {
            socket,
            dest,
            universe,
            sequence: 0,
        })
    }
}

impl Sink for ArtNetSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Artnet
    }

    fn universe(&self) -> u16 {
        self.universe
    }

    fn send(&mut self, frame: &Frame) -> Result<(), SinkError> {
        // Sequence cycles 1..=255; 0 would tell receivers sequencing is off.
        self.sequence = if self.sequence >= 255 { 1 } else { self.sequence + 1 };
        let pkt = art_dmx_packet(self.universe, self.sequence, frame);
        self.socket.send_to(&pkt, self.dest)?;
        Ok(())
    }

    fn stop(&mut self) {
        debug!(universe = self.universe, "Art-Net sink stopped");
    }
}

// ============================================================================
// E1.31 (sACN)
// ============================================================================

struct E131Shared {
    socket: UdpSocket,
    dest: SocketAddr,
    universe: u16,
    cid: [u8; 16],
    interval: Duration,
    pending: Mutex<Option<Frame>>,
    sequence: AtomicU8,
    running: AtomicBool,
}

/// Paced sACN emitter. `send` stores the latest frame; an internal worker
/// drains it at the configured fps so wire cadence stays bounded no matter
/// how fast the playback loop commits.
pub struct E131Sink {
    shared: Arc<E131Shared>,
    worker: Option<thread::JoinHandle<()>>,
    universe: u16,
}

impl E131Sink {
    pub fn start(
        target: &str,
        universe: u16,
        fps: u32,
        multicast: bool,
    ) -> Result<Self, SinkError> {
        let dest = if multicast {
            SocketAddr::from((e131_multicast_addr(universe), E131_PORT))
        } else {
            resolve_target(target, E131_PORT)?
        };
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(|e| SinkError::Start(e.to_string()))?;
        socket
            .set_broadcast(true)
            .map_err(|e| SinkError::Start(e.to_string()))?;

        let shared = Arc::new(E131Shared {
            socket,
            dest,
            universe,
            cid: rand::random(),
            interval: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
            pending: Mutex::new(None),
            sequence: AtomicU8::new(0),
            running: AtomicBool::new(true),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("e131-{universe}"))
            .spawn(move || pacing_loop(worker_shared))
            .map_err(|e| SinkError::Start(e.to_string()))?;

        info!(%dest, universe, fps, multicast, "E1.31 sink started");
        Ok(Self {
            shared,
            worker: Some(worker),
            universe,
        })
    }
}

fn pacing_loop(shared: Arc<E131Shared>) {
    while shared.running.load(Ordering::Relaxed) {
        let frame = shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(frame) = frame {
            let seq = shared.sequence.fetch_add(1, Ordering::Relaxed);
            let pkt = e131_data_packet(
                &shared.cid,
                "cueflow",
                shared.universe,
                seq,
                E131_DEFAULT_PRIORITY,
                &frame,
            );
            if let Err(e) = shared.socket.send_to(&pkt, shared.dest) {
                debug!(universe = shared.universe, error = %e, "E1.31 send failed");
            }
        }
        thread::sleep(shared.interval);
    }
}

impl Sink for E131Sink {
    fn kind(&self) -> SinkKind {
        SinkKind::E131
    }

    fn universe(&self) -> u16 {
        self.universe
    }

    fn active(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    fn send(&mut self, frame: &Frame) -> Result<(), SinkError> {
        *self
            .shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(*frame);
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        debug!(universe = self.universe, "E1.31 sink stopped");
    }
}

impl Drop for E131Sink {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
    }
}

// ============================================================================
// Test sink
// ============================================================================

const TEST_HISTORY_CAP: usize = 4096;

/// Observable state shared between a [`TestSink`] and its inspectors.
pub struct TestSinkState {
    frames: Mutex<VecDeque<Frame>>,
    sends: AtomicU64,
}

impl TestSinkState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(VecDeque::new()),
            sends: AtomicU64::new(0),
        })
    }

    fn record(&self, frame: &Frame) {
        self.sends.fetch_add(1, Ordering::Relaxed);
        let mut frames = self.frames.lock().unwrap_or_else(|e| e.into_inner());
        if frames.len() >= TEST_HISTORY_CAP {
            frames.pop_front();
        }
        frames.push_back(*frame);
    }

    /// Total number of frames this sink has been asked to emit.
    pub fn send_count(&self) -> u64 {
        self.sends.load(Ordering::Relaxed)
    }

    /// The most recent frame, if any.
    pub fn last_frame(&self) -> Option<Frame> {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .back()
            .copied()
    }

    /// The recorded values of one channel across the frame history.
    pub fn channel_history(&self, channel: u16) -> Vec<u8> {
        assert!((1..=UNIVERSE_SIZE as u16).contains(&channel));
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|f| f[(channel - 1) as usize])
            .collect()
    }

    /// Non-zero channels of the most recent frame.
    pub fn active_channels(&self) -> BTreeMap<u16, u8> {
        self.last_frame()
            .map(|f| {
                f.iter()
                    .enumerate()
                    .filter(|(_, &v)| v > 0)
                    .map(|(i, &v)| ((i + 1) as u16, v))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// In-memory sink used as the start-failure fallback and by the tests.
pub struct TestSink {
    universe: u16,
    state: Arc<TestSinkState>,
}

impl TestSink {
    pub fn new(universe: u16) -> Self {
        Self {
            universe,
            state: TestSinkState::new(),
        }
    }

    pub fn state(&self) -> Arc<TestSinkState> {
        Arc::clone(&self.state)
    }
}

impl Sink for TestSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Test
    }

    fn universe(&self) -> u16 {
        self.universe
    }

    fn send(&mut self, frame: &Frame) -> Result<(), SinkError> {
        self.state.record(frame);
        Ok(())
    }

    fn stop(&mut self) {
        debug!(universe = self.universe, "test sink stopped");
    }
}

// ============================================================================
// Sink set
// ============================================================================

/// Status of one registered sink, as reported over the bus.
#[derive(Clone, Debug, Serialize)]
pub struct SinkStatus {
    pub active: bool,
    pub universe: u16,
    #[serde(rename = "type")]
    pub kind: SinkKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_channels: Option<BTreeMap<u16, u8>>,
}

struct Entry {
    sink: Box<dyn Sink>,
    test_state: Option<Arc<TestSinkState>>,
}

/// Named collection of started sinks.
pub struct SinkSet {
    inner: Mutex<BTreeMap<String, Entry>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    /// Start and register the described sink. On a protocol start failure a
    /// test sink is installed under `test_<name>` so the frame stays
    /// observable; only a duplicate name is an error.
    pub fn add(&self, desc: &SinkDescriptor, e131_multicast: bool) -> Result<(), SinkError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.contains_key(&desc.name) {
            return Err(SinkError::Duplicate(desc.name.clone()));
        }

        let started: Result<Box<dyn Sink>, SinkError> = match desc.kind {
            SinkKind::Artnet => ArtNetSink::start(
                &desc.target,
                desc.port.unwrap_or(ARTNET_PORT),
                desc.universe,
            )
            .map(|s| Box::new(s) as Box<dyn Sink>),
            SinkKind::E131 => E131Sink::start(
                &desc.target,
                desc.universe,
                desc.fps.unwrap_or(40),
                e131_multicast,
            )
            .map(|s| Box::new(s) as Box<dyn Sink>),
            SinkKind::Test => Ok(Box::new(TestSink::new(desc.universe))),
        };

        match started {
            Ok(sink) => {
                let test_state = None;
                inner.insert(desc.name.clone(), Entry { sink, test_state });
                info!(name = %desc.name, kind = ?desc.kind, "sink registered");
                Ok(())
            }
            Err(e) => {
                warn!(name = %desc.name, error = %e, "sink failed to start, installing test fallback");
                let fallback = format!("test_{}", desc.name);
                if !inner.contains_key(&fallback) {
                    let sink = TestSink::new(desc.universe);
                    let test_state = Some(sink.state());
                    inner.insert(
                        fallback,
                        Entry {
                            sink: Box::new(sink),
                            test_state,
                        },
                    );
                }
                Ok(())
            }
        }
    }

    /// Register a test sink under `name` and hand back its observable state.
    pub fn add_test(&self, name: &str, universe: u16) -> Arc<TestSinkState> {
        let sink = TestSink::new(universe);
        let state = sink.state();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.insert(
            name.to_string(),
            Entry {
                sink: Box::new(sink),
                test_state: Some(Arc::clone(&state)),
            },
        );
        info!(name, universe, "test sink registered");
        state
    }

    /// Stop and deregister one sink.
    pub fn remove(&self, name: &str) -> Result<(), SinkError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut entry = inner
            .remove(name)
            .ok_or_else(|| SinkError::NotFound(name.to_string()))?;
        entry.sink.stop();
        info!(name, "sink removed");
        Ok(())
    }

    /// Broadcast a frame through every sink. Failures are logged and the
    /// remaining sinks still receive the frame.
    pub fn send_all(&self, frame: &Frame) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for (name, entry) in inner.iter_mut() {
            if let Err(e) = entry.sink.send(frame) {
                warn!(name = %name, error = %e, "sink send failed, skipping");
            }
        }
    }

    /// Send a frame through one named sink.
    pub fn send_one(&self, name: &str, frame: &Frame) -> Result<(), SinkError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner
            .get_mut(name)
            .ok_or_else(|| SinkError::NotFound(name.to_string()))?;
        entry.sink.send(frame)
    }

    /// Emit an all-zero frame through one sink, or through all of them.
    pub fn blackout(&self, name: Option<&str>) -> Result<(), SinkError> {
        let zero = [0u8; UNIVERSE_SIZE];
        match name {
            Some(name) => self.send_one(name, &zero),
            None => {
                self.send_all(&zero);
                Ok(())
            }
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Status of every registered sink; test sinks include their non-zero
    /// channels for observability.
    pub fn status(&self) -> BTreeMap<String, SinkStatus> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    SinkStatus {
                        active: entry.sink.active(),
                        universe: entry.sink.universe(),
                        kind: entry.sink.kind(),
                        active_channels: entry.test_state.as_ref().map(|s| s.active_channels()),
                    },
                )
            })
            .collect()
    }

    /// The observable state of a registered test sink, if `name` is one.
    pub fn test_state(&self, name: &str) -> Option<Arc<TestSinkState>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .and_then(|e| e.test_state.as_ref().map(Arc::clone))
    }

    /// Stop every sink and clear the set.
    pub fn stop_all(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for (name, entry) in inner.iter_mut() {
            debug!(name = %name, "stopping sink");
            entry.sink.stop();
        }
        inner.clear();
    }
}

impl Default for SinkSet {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_target(target: &str, port: u16) -> Result<SocketAddr, SinkError> {
    if target.is_empty() {
        return Err(SinkError::Start("empty target".to_string()));
    }
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(SocketAddr::from((ip, port)));
    }
    (target, port)
        .to_socket_addrs()
        .map_err(|e| SinkError::Start(format!("resolve {target}: {e}")))?
        .next()
        .ok_or_else(|| SinkError::Start(format!("no address for {target}")))
}

// ============================================================================
// Tests
// ============================================================================
