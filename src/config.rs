//! Persisted configuration: `settings.json` and `config.json`
//!
//! Two documents live under the configurable directory:
//! - `settings.json` — transport and behavior settings (mqtt, dmx outputs,
//!   logging, scene/sequence defaults, web server, fallback delay,
//!   retransmission, followers, frontend passthrough, programmable-scene
//!   defaults).
//! - `config.json` — the show content: scenes, sequences, programmable
//!   scenes, autostart, fallback.
//!
//! Both sit behind copy-on-read stores: readers get snapshots, writers
//! mutate under the lock and persist with a write-then-rename so a crashed
//! save never truncates the previous document. A missing `settings.json`
//! (or one that fails to parse) falls back to defaults with a warning; a
//! malformed `config.json` is a hard error because silently dropping show
//! content is worse than refusing to boot.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::follower::FollowerSettings;
use crate::sink::{SinkDescriptor, SinkKind};
use crate::universe::{parse_channel_key, validate_value};
use crate::UNIVERSE_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Validation(String),
}

// ============================================================================
// settings.json
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub mqtt: MqttSettings,
    pub dmx: DmxSettings,
    pub logging: LoggingSettings,
    pub scenes: SceneSettings,
    pub sequences: SequenceSettings,
    pub web_server: WebServerSettings,
    pub fallback_delay: f64,
    pub dmx_retransmission: RetransmissionSettings,
    pub dmx_followers: FollowerSettings,
    pub frontend_mqtt_passthrough: bool,
    pub programmable_scenes: ProgrammableSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mqtt: MqttSettings::default(),
            dmx: DmxSettings::default(),
            logging: LoggingSettings::default(),
            scenes: SceneSettings::default(),
            sequences: SequenceSettings::default(),
            web_server: WebServerSettings::default(),
            fallback_delay: 1.0,
            dmx_retransmission: RetransmissionSettings::default(),
            dmx_followers: FollowerSettings::default(),
            frontend_mqtt_passthrough: false,
            programmable_scenes: ProgrammableSettings::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub url: String,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub keepalive: u64,
    pub clean_session: bool,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            url: "mqtt://127.0.0.1".to_string(),
            username: String::new(),
            password: String::new(),
            client_id: "cueflow".to_string(),
            keepalive: 60,
            clean_session: true,
        }
    }
}

impl MqttSettings {
    /// Split `mqtt://host[:port]` into host and port (default 1883).
    pub fn host_and_port(&self) -> (String, u16) {
        let stripped = self.url.trim_start_matches("mqtt://");
        match stripped.split_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse().unwrap_or(1883),
            ),
            None => (stripped.to_string(), 1883),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DmxSettings {
    pub default_configs: Vec<SinkDescriptor>,
    pub artnet: ArtnetDefaults,
    pub e131: E131Defaults,
}

impl Default for DmxSettings {
    fn default() -> Self {
        Self {
            default_configs: vec![SinkDescriptor {
                name: "main".to_string(),
                kind: SinkKind::E131,
                universe: 1,
                target: "255.255.255.255".to_string(),
                port: None,
                fps: Some(40),
            }],
            artnet: ArtnetDefaults::default(),
            e131: E131Defaults::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtnetDefaults {
    pub default_port: u16,
    pub refresh_rate: f64,
}

impl Default for ArtnetDefaults {
    fn default() -> Self {
        Self {
            default_port: 6454,
            refresh_rate: 0.1,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct E131Defaults {
    pub default_fps: u32,
    pub multicast: bool,
}

impl Default for E131Defaults {
    fn default() -> Self {
        Self {
            default_fps: 40,
            multicast: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneSettings {
    pub default_transition_time: f64,
    pub auto_send: bool,
}

impl Default for SceneSettings {
    fn default() -> Self {
        Self {
            default_transition_time: 0.0,
            auto_send: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceSettings {
    pub default_duration: f64,
    pub auto_play: bool,
}

impl Default for SequenceSettings {
    fn default() -> Self {
        Self {
            default_duration: 1.0,
            auto_play: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WebServerSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for WebServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 5001,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetransmissionSettings {
    pub enabled: bool,
    pub interval: f64,
}

impl Default for RetransmissionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: 5.0,
        }
    }
}

impl RetransmissionSettings {
    /// The interval actually used by the retransmitter.
    pub fn clamped_interval(&self) -> f64 {
        self.interval.clamp(0.1, 60.0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgrammableSettings {
    pub enabled: bool,
    pub default_duration: f64,
    pub default_fps: u32,
}

impl Default for ProgrammableSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_duration: 10.0,
            default_fps: 30,
        }
    }
}

// ============================================================================
// config.json
// ============================================================================

/// A static scene: ordered channel slots, `None` = leave that channel alone.
pub type Scene = Vec<Option<u8>>;

/// A sequence step duration as it appears on disk. The int/float distinction
/// matters: an integer on a scene-ref step is treated as milliseconds when
/// it is 1000 or larger.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DurationValue {
    Int(i64),
    Float(f64),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dmx: Option<BTreeMap<String, i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<DurationValue>,
}

impl Step {
    /// The scene this step references, if it is a scene-ref step.
    pub fn scene_ref(&self) -> Option<&str> {
        self.scene_name
            .as_deref()
            .or(self.scene_id.as_deref())
    }
}

/// A sequence. Accepts both the modern `{steps, loop, description}` object
/// and the legacy bare step array (which means `loop: false`).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "SequenceRepr")]
pub struct Sequence {
    pub steps: Vec<Step>,
    #[serde(rename = "loop")]
    pub looped: bool,
    pub description: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SequenceRepr {
    Legacy(Vec<Step>),
    Full {
        #[serde(default)]
        steps: Vec<Step>,
        #[serde(default, rename = "loop")]
        looped: bool,
        #[serde(default)]
        description: String,
    },
}

impl From<SequenceRepr> for Sequence {
    fn from(repr: SequenceRepr) -> Self {
        match repr {
            SequenceRepr::Legacy(steps) => Sequence {
                steps,
                looped: false,
                description: String::new(),
            },
            SequenceRepr::Full {
                steps,
                looped,
                description,
            } => Sequence {
                steps,
                looped,
                description,
            },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgrammableScene {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Duration in milliseconds.
    #[serde(default = "default_prog_duration")]
    pub duration: u64,
    #[serde(default, rename = "loop")]
    pub looped: bool,
    #[serde(default)]
    pub expressions: BTreeMap<String, String>,
}

fn default_prog_duration() -> u64 {
    10_000
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutostartKind {
    Scene,
    Sequence,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutostartConfig {
    pub enabled: bool,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<AutostartKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackSlot {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<f64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub scene_fallback: FallbackSlot,
    pub sequence_fallback: FallbackSlot,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigDoc {
    pub scenes: BTreeMap<String, Scene>,
    pub sequences: BTreeMap<String, Sequence>,
    pub programmable_scenes: BTreeMap<String, ProgrammableScene>,
    pub autostart: AutostartConfig,
    pub fallback: FallbackConfig,
}

// ============================================================================
// Validation (boundary rules: channels 1..=512, values null|0..=255,
// durations >= 0)
// ============================================================================

/// Validate a scene channel array coming off the wire.
pub fn validate_scene_channels(channels: &[Option<i64>]) -> Result<Scene, ConfigError> {
    if channels.len() > UNIVERSE_SIZE {
        return Err(ConfigError::Validation(format!(
            "scene has {} slots, maximum is {UNIVERSE_SIZE}",
            channels.len()
        )));
    }
    let mut out = Vec::with_capacity(channels.len());
    for (i, slot) in channels.iter().enumerate() {
        match slot {
            None => out.push(None),
            Some(v) => {
                let v = validate_value(*v).map_err(|_| {
                    ConfigError::Validation(format!(
                        "channel {} value must be null or 0-255, got {v}",
                        i + 1
                    ))
                })?;
                out.push(Some(v));
            }
        }
    }
    Ok(out)
}

/// Validate sequence steps coming off the wire.
pub fn validate_steps(steps: &[Step]) -> Result<(), ConfigError> {
    for (i, step) in steps.iter().enumerate() {
        if let Some(duration) = step.duration {
            let secs = match duration {
                DurationValue::Int(n) => n as f64,
                DurationValue::Float(f) => f,
            };
            if !(secs >= 0.0) {
                return Err(ConfigError::Validation(format!(
                    "step {} duration must be >= 0",
                    i + 1
                )));
            }
        }
        if let Some(dmx) = &step.dmx {
            for (key, value) in dmx {
                parse_channel_key(key).map_err(|e| {
                    ConfigError::Validation(format!("step {}: {e}", i + 1))
                })?;
                validate_value(*value).map_err(|e| {
                    ConfigError::Validation(format!("step {}: {e}", i + 1))
                })?;
            }
        }
    }
    Ok(())
}

// ============================================================================
// Stores
// ============================================================================

fn save_document<T: Serialize>(path: &Path, doc: &T) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(doc)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// `settings.json` behind a copy-on-read lock. Load failures fall back to
/// defaults so the engine always boots.
pub struct SettingsStore {
    path: PathBuf,
    doc: RwLock<Settings>,
}

impl SettingsStore {
    pub fn load(dir: &Path) -> Self {
        let path = dir.join("settings.json");
        let doc = Self::read_file(&path);
        Self {
            path,
            doc: RwLock::new(doc),
        }
    }

    fn read_file(path: &Path) -> Settings {
        match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(settings) => {
                    info!(path = %path.display(), "loaded settings");
                    settings
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "settings unreadable, using defaults");
                    Settings::default()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "no settings file, using defaults");
                Settings::default()
            }
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&Settings) -> R) -> R {
        f(&self.doc.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn snapshot(&self) -> Settings {
        self.doc.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Mutate and persist.
    pub fn update(&self, f: impl FnOnce(&mut Settings)) -> Result<(), ConfigError> {
        let snapshot = {
            let mut doc = self.doc.write().unwrap_or_else(|e| e.into_inner());
            f(&mut doc);
            doc.clone()
        };
        save_document(&self.path, &snapshot)
    }

    /// Re-read the document from disk, discarding in-memory edits.
    pub fn reload(&self) {
        let fresh = Self::read_file(&self.path);
        *self.doc.write().unwrap_or_else(|e| e.into_inner()) = fresh;
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        save_document(&self.path, &self.snapshot())
    }
}

/// `config.json` behind a copy-on-read lock. A malformed document is a hard
/// error; a missing one starts empty.
pub struct ConfigStore {
    path: PathBuf,
    doc: RwLock<ConfigDoc>,
}

impl ConfigStore {
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join("config.json");
        let doc = match fs::read(&path) {
            Ok(bytes) => {
                let doc = serde_json::from_slice(&bytes)?;
                info!(path = %path.display(), "loaded config");
                doc
            }
            Err(_) => {
                info!(path = %path.display(), "no config file, starting empty");
                ConfigDoc::default()
            }
        };
        Ok(Self {
            path,
            doc: RwLock::new(doc),
        })
    }

    pub fn read<R>(&self, f: impl FnOnce(&ConfigDoc) -> R) -> R {
        f(&self.doc.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn snapshot(&self) -> ConfigDoc {
        self.doc.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Mutate and persist.
    pub fn update(&self, f: impl FnOnce(&mut ConfigDoc)) -> Result<(), ConfigError> {
        let snapshot = {
            let mut doc = self.doc.write().unwrap_or_else(|e| e.into_inner());
            f(&mut doc);
            doc.clone()
        };
        save_document(&self.path, &snapshot)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.fallback_delay, 1.0);
        assert_eq!(s.mqtt.keepalive, 60);
        assert!(s.mqtt.clean_session);
        assert_eq!(s.dmx.artnet.default_port, 6454);
        assert_eq!(s.dmx.e131.default_fps, 40);
        assert!(s.dmx.e131.multicast);
        assert_eq!(s.sequences.default_duration, 1.0);
        assert!(s.sequences.auto_play);
        assert!(s.scenes.auto_send);
        assert_eq!(s.web_server.port, 5001);
        assert!(!s.dmx_retransmission.enabled);
        assert_eq!(s.dmx_retransmission.interval, 5.0);
        assert!(!s.dmx_followers.enabled);
    }

    #[test]
    fn mqtt_url_parsing() {
        let mut m = MqttSettings::default();
        m.url = "mqtt://broker.local".into();
        assert_eq!(m.host_and_port(), ("broker.local".into(), 1883));
        m.url = "mqtt://10.0.0.2:2883".into();
        assert_eq!(m.host_and_port(), ("10.0.0.2".into(), 2883));
    }

    #[test]
    fn retransmit_interval_clamps() {
        let r = RetransmissionSettings {
            enabled: true,
            interval: 0.01,
        };
        assert_eq!(r.clamped_interval(), 0.1);
        let r = RetransmissionSettings {
            enabled: true,
            interval: 500.0,
        };
        assert_eq!(r.clamped_interval(), 60.0);
    }

    #[test]
    fn legacy_sequence_form_is_a_non_looping_sequence() {
        let json = r#"[{"dmx": {"1": 255}, "duration": 0.2}, {"dmx": {"1": 0}, "duration": 0.2}]"#;
        let seq: Sequence = serde_json::from_str(json).unwrap();
        assert_eq!(seq.steps.len(), 2);
        assert!(!seq.looped);

        let json = r#"{"steps": [{"scene_name": "warm", "duration": 2}], "loop": true, "description": "d"}"#;
        let seq: Sequence = serde_json::from_str(json).unwrap();
        assert!(seq.looped);
        assert_eq!(seq.steps[0].scene_ref(), Some("warm"));
        assert_eq!(seq.steps[0].duration, Some(DurationValue::Int(2)));
    }

    #[test]
    fn duration_value_keeps_int_float_distinction() {
        let d: DurationValue = serde_json::from_str("1500").unwrap();
        assert_eq!(d, DurationValue::Int(1500));
        let d: DurationValue = serde_json::from_str("1.5").unwrap();
        assert_eq!(d, DurationValue::Float(1.5));
    }

    #[test]
    fn scene_validation() {
        assert_eq!(
            validate_scene_channels(&[Some(255), None, Some(0)]).unwrap(),
            vec![Some(255), None, Some(0)]
        );
        assert!(validate_scene_channels(&[Some(256)]).is_err());
        assert!(validate_scene_channels(&[Some(-1)]).is_err());
        assert!(validate_scene_channels(&vec![None; 513]).is_err());
    }

    #[test]
    fn step_validation() {
        let good = Step {
            scene_name: None,
            scene_id: None,
            dmx: Some([("1".to_string(), 255i64)].into_iter().collect()),
            duration: Some(DurationValue::Float(0.0)),
        };
        assert!(validate_steps(&[good.clone()]).is_ok());

        let mut negative = good.clone();
        negative.duration = Some(DurationValue::Float(-1.0));
        assert!(validate_steps(&[negative]).is_err());

        let mut bad_channel = good.clone();
        bad_channel.dmx = Some([("513".to_string(), 1i64)].into_iter().collect());
        assert!(validate_steps(&[bad_channel]).is_err());

        let mut bad_value = good;
        bad_value.dmx = Some([("1".to_string(), 300i64)].into_iter().collect());
        assert!(validate_steps(&[bad_value]).is_err());
    }

    #[test]
    fn stores_round_trip() {
        let dir = tempfile::tempdir().unwrap();

        let settings = SettingsStore::load(dir.path());
        settings
            .update(|s| s.fallback_delay = 2.5)
            .unwrap();
        let reloaded = SettingsStore::load(dir.path());
        assert_eq!(reloaded.read(|s| s.fallback_delay), 2.5);

        let config = ConfigStore::load(dir.path()).unwrap();
        config
            .update(|c| {
                c.scenes
                    .insert("warm".into(), vec![Some(255), Some(128), None]);
            })
            .unwrap();
        let reloaded = ConfigStore::load(dir.path()).unwrap();
        assert_eq!(
            reloaded.read(|c| c.scenes["warm"].clone()),
            vec![Some(255), Some(128), None]
        );
    }

    #[test]
    fn reload_discards_memory_edits() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SettingsStore::load(dir.path());
        settings.update(|s| s.fallback_delay = 3.0).unwrap();

        // In-memory edit without save, then reload from disk.
        {
            let mut doc = settings.doc.write().unwrap();
            doc.fallback_delay = 9.0;
        }
        settings.reload();
        assert_eq!(settings.read(|s| s.fallback_delay), 3.0);
    }
}
