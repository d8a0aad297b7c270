//! Authoritative universe buffer (512 octets) and boundary parsing
//!
//! The buffer is the only holder of output state. Mutation goes through the
//! validated entry points below; everything else (sinks, status endpoints,
//! the retransmitter) works on copies taken with [`Universe::snapshot`].
//!
//! Validation rules:
//! - channel numbers are 1..=512 (external numbering); 0 and 513 are rejected
//! - values are 0..=255; boundary callers validate wider integer types with
//!   [`validate_value`] before they reach the typed map
//! - invalid entries in a bulk write are dropped with a log, the rest of the
//!   write proceeds

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::warn;

use crate::{Frame, UNIVERSE_SIZE};

/// Typed channel→value map used on every commit path.
///
/// Keys are external channel numbers (1..=512). String keys from JSON or bus
/// topics are converted at the boundary with [`parse_channel_key`]; malformed
/// keys never enter a `ChannelMap`.
pub type ChannelMap = BTreeMap<u16, u8>;

/// Errors surfaced by the validated entry points.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UniverseError {
    /// Channel number outside 1..=512.
    #[error("channel {0} out of range (1-512)")]
    ChannelOutOfRange(i64),
    /// Value outside 0..=255.
    #[error("value {0} out of range (0-255)")]
    ValueOutOfRange(i64),
    /// A channel key that is not a positive integer.
    #[error("malformed channel key `{0}`")]
    MalformedKey(String),
}

/// Parse an external channel key (`"1"`..`"512"`) from a string boundary.
pub fn parse_channel_key(key: &str) -> Result<u16, UniverseError> {
    let n: i64 = key
        .trim()
        .parse()
        .map_err(|_| UniverseError::MalformedKey(key.to_string()))?;
    validate_channel(n)
}

/// Validate an external channel number.
pub fn validate_channel(channel: i64) -> Result<u16, UniverseError> {
    if (1..=UNIVERSE_SIZE as i64).contains(&channel) {
        Ok(channel as u16)
    } else {
        Err(UniverseError::ChannelOutOfRange(channel))
    }
}

/// Validate a channel value from a wider integer boundary.
pub fn validate_value(value: i64) -> Result<u8, UniverseError> {
    if (0..=255).contains(&value) {
        Ok(value as u8)
    } else {
        Err(UniverseError::ValueOutOfRange(value))
    }
}

/// The authoritative frame. All operations serialize on one mutex.
pub struct Universe {
    frame: Mutex<Frame>,
}

impl Universe {
    /// A fresh universe with every channel at 0.
    pub fn new() -> Self {
        Self {
            frame: Mutex::new([0u8; UNIVERSE_SIZE]),
        }
    }

    /// Set one channel. The channel must already be validated (1..=512).
    pub fn set_one(&self, channel: u16, value: u8) -> Result<(), UniverseError> {
        let ch = validate_channel(channel as i64)?;
        let mut frame = self.frame.lock().unwrap_or_else(|e| e.into_inner());
        frame[(ch - 1) as usize] = value;
        Ok(())
    }

    /// Set many channels in one atomic write. Invalid channels are dropped
    /// with a log; valid entries in the same map still land.
    pub fn set_many(&self, map: &ChannelMap) {
        let mut frame = self.frame.lock().unwrap_or_else(|e| e.into_inner());
        for (&channel, &value) in map {
            if channel == 0 || channel as usize > UNIVERSE_SIZE {
                warn!(channel, "dropping write to out-of-range channel");
                continue;
            }
            frame[(channel - 1) as usize] = value;
        }
    }

    /// A copy of the current frame. Never a shared reference.
    pub fn snapshot(&self) -> Frame {
        *self.frame.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Rewrite all 512 octets to zero. Does not emit.
    pub fn blackout(&self) {
        let mut frame = self.frame.lock().unwrap_or_else(|e| e.into_inner());
        *frame = [0u8; UNIVERSE_SIZE];
    }
}

impl Default for Universe {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_all_zero_and_always_512_octets() {
        let u = Universe::new();
        let snap = u.snapshot();
        assert_eq!(snap.len(), UNIVERSE_SIZE);
        assert!(snap.iter().all(|&v| v == 0));
    }

    #[test]
    fn set_one_survives_unrelated_mutations() {
        let u = Universe::new();
        u.set_one(5, 130).unwrap();
        let mut map = ChannelMap::new();
        map.insert(1, 255);
        map.insert(6, 10);
        u.set_many(&map);
        u.set_one(512, 1).unwrap();
        assert_eq!(u.snapshot()[4], 130);
    }

    #[test]
    fn channel_bounds_rejected() {
        let u = Universe::new();
        assert_eq!(
            u.set_one(0, 1),
            Err(UniverseError::ChannelOutOfRange(0))
        );
        assert_eq!(
            u.set_one(513, 1),
            Err(UniverseError::ChannelOutOfRange(513))
        );
        assert_eq!(validate_value(-1), Err(UniverseError::ValueOutOfRange(-1)));
        assert_eq!(validate_value(256), Err(UniverseError::ValueOutOfRange(256)));
    }

    #[test]
    fn set_many_drops_invalid_keeps_valid() {
        let u = Universe::new();
        let mut map = ChannelMap::new();
        map.insert(0, 9); // dropped
        map.insert(3, 42);
        u.set_many(&map);
        let snap = u.snapshot();
        assert_eq!(snap[2], 42);
        assert!(snap.iter().enumerate().all(|(i, &v)| i == 2 || v == 0));
    }

    #[test]
    fn snapshot_is_a_copy() {
        let u = Universe::new();
        let mut snap = u.snapshot();
        snap[0] = 99;
        assert_eq!(u.snapshot()[0], 0);
    }

    #[test]
    fn blackout_is_idempotent() {
        let u = Universe::new();
        u.set_one(7, 200).unwrap();
        u.blackout();
        let first = u.snapshot();
        u.blackout();
        assert_eq!(first, u.snapshot());
        assert!(first.iter().all(|&v| v == 0));
    }

    #[test]
    fn channel_key_parsing() {
        assert_eq!(parse_channel_key("1").unwrap(), 1);
        assert_eq!(parse_channel_key(" 512 ").unwrap(), 512);
        assert!(parse_channel_key("0").is_err());
        assert!(parse_channel_key("513").is_err());
        assert!(parse_channel_key("7.5").is_err());
        assert!(parse_channel_key("abc").is_err());
        assert!(parse_channel_key("").is_err());
    }
}
