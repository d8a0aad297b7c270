//! Channel-follower mirroring
//!
//! A follower channel mirrors its source channel's value on every commit.
//! Resolution happens once, before the universe buffer is touched, and is
//! deliberately non-transitive: a follower that is itself a source does not
//! chain. When the feature is disabled the resolver is the identity.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::universe::ChannelMap;

/// Persisted follower settings (`settings.json` → `dmx_followers`).
///
/// Mapping keys are source channels; values list the followers that mirror
/// them. JSON object keys arrive as strings and deserialize into `u16`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FollowerSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mappings: BTreeMap<u16, Vec<u16>>,
}

/// Expand `input` with mirrored followers.
///
/// The output always contains every entry of `input`; follower entries are
/// written after the input is copied, so when two sources list the same
/// follower the later (higher-numbered) source wins.
pub fn resolve(settings: &FollowerSettings, input: ChannelMap) -> ChannelMap {
    if !settings.enabled || settings.mappings.is_empty() {
        return input;
    }
    let mut out = input.clone();
    for (source, followers) in &settings.mappings {
        if let Some(&value) = input.get(source) {
            for &follower in followers {
                out.insert(follower, value);
            }
        }
    }
    out
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(mappings: &[(u16, &[u16])]) -> FollowerSettings {
        FollowerSettings {
            enabled: true,
            mappings: mappings
                .iter()
                .map(|(src, f)| (*src, f.to_vec()))
                .collect(),
        }
    }

    fn map(entries: &[(u16, u8)]) -> ChannelMap {
        entries.iter().copied().collect()
    }

    #[test]
    fn disabled_is_identity() {
        let s = FollowerSettings {
            enabled: false,
            mappings: [(1u16, vec![2u16])].into_iter().collect(),
        };
        let input = map(&[(1, 200)]);
        assert_eq!(resolve(&s, input.clone()), input);
    }

    #[test]
    fn followers_mirror_source_in_same_commit() {
        let s = settings(&[(1, &[2, 3])]);
        let out = resolve(&s, map(&[(1, 200), (4, 10)]));
        assert_eq!(out, map(&[(1, 200), (2, 200), (3, 200), (4, 10)]));
    }

    #[test]
    fn output_never_shrinks_input() {
        let s = settings(&[(9, &[10])]);
        let input = map(&[(1, 1), (2, 2)]);
        let out = resolve(&s, input.clone());
        for (ch, v) in input {
            assert_eq!(out.get(&ch), Some(&v));
        }
    }

    #[test]
    fn not_transitive() {
        // 1 → 2 and 2 → 3: writing channel 1 must not ripple into 3.
        let s = settings(&[(1, &[2]), (2, &[3])]);
        let out = resolve(&s, map(&[(1, 77)]));
        assert_eq!(out, map(&[(1, 77), (2, 77)]));
    }

    #[test]
    fn duplicate_follower_last_source_wins() {
        let s = settings(&[(1, &[5]), (2, &[5])]);
        let out = resolve(&s, map(&[(1, 10), (2, 20)]));
        assert_eq!(out.get(&5), Some(&20));
    }

    #[test]
    fn absent_source_contributes_nothing() {
        let s = settings(&[(1, &[2])]);
        let out = resolve(&s, map(&[(4, 4)]));
        assert_eq!(out, map(&[(4, 4)]));
    }
}
