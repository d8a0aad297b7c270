//! Crate root: public surface, core aliases, and engine-wide invariants
//!
//! This module is the single canonical entry-point for downstream users of
//! the library (the `cueflowd` binary and the tests). It centralizes the
//! universe constants, the channel-map alias, and the re-exports of the
//! submodules that implement the playback engine.
//!
//! ## Invariants (engine-wide)
//!
//! - **Universe.** The output universe is always a complete 512-octet frame.
//!   There is no "unset" channel; channels are numbered 1..=512 externally
//!   and 0..=511 internally. All mutation goes through [`universe::Universe`]
//!   which clamps and validates; out-of-range writes are dropped with a log.
//!
//! - **Single playback slot.** At most one playback mode (scene, sequence,
//!   programmable) is active at any instant. Starting a new mode pre-empts
//!   the active one; its worker observes a cancellation token between sleep
//!   slices of at most 100 ms and exits within one slice.
//!
//! - **Commit discipline.** Every channel commit flows follower resolution →
//!   universe buffer → sink broadcast. Locks are never held across a sleep
//!   or a network send: senders snapshot the frame under the universe lock
//!   and emit outside it.
//!
//! - **Failure isolation.** A failing sink is logged and skipped, never
//!   propagated. A failing expression yields 0 for its channel. A failing
//!   bus connection degrades the engine to HTTP-only after a bounded
//!   reconnect budget.

#![forbid(unsafe_code)]

/// Authoritative 512-byte universe buffer and channel-map parsing.
pub mod universe;
/// Art-Net and E1.31 wire framing (pure packet builders).
pub mod protocol;
/// Protocol emitters and the named sink collection.
pub mod sink;
/// Channel-follower mirroring.
pub mod follower;
/// Sandboxed expression evaluator for programmable scenes.
pub mod expr;
/// Single-slot playback controller (scene / sequence / programmable).
pub mod playback;
/// Autostart-at-boot and post-completion fallback supervision.
pub mod recovery;
/// Periodic re-emission of the last frame.
pub mod retransmit;
/// Command normalization from the message bus.
pub mod router;
/// Persisted settings/config documents and validation.
pub mod config;
/// Shared engine assembly and the commit path.
pub mod engine;
/// MQTT transport worker and publish handle.
pub mod mqtt;
/// HTTP/JSON control surface.
pub mod http;

// ============================================================================
// Canonical aliases and root-level re-exports
// ============================================================================

/// Number of channels in one DMX universe.
pub const UNIVERSE_SIZE: usize = 512;

/// One complete output frame: a value for every channel.
pub type Frame = [u8; UNIVERSE_SIZE];

pub use crate::engine::Engine;
pub use crate::universe::{ChannelMap, Universe, UniverseError};
