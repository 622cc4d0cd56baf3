//! Frame sources.
//!
//! Every producer implements [`FrameSource`]:
//! - Synthetic test pattern (built in)
//! - Network video over RTSP/HTTP (built in; real decoding behind `rtsp-gstreamer`)
//! - Camera, screen region, video file, audio visualisation (external
//!   implementations, inserted into the registry already initialized)
//!
//! `capture()` never blocks on an upstream device or connection: a source with
//! nothing new to deliver returns `None`. That is what lets slow or stalled
//! sources sit behind a steady polling loop.
//!
//! Configuration is a JSON object per source. Unknown keys and out-of-range
//! values are rejected, never coerced.

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::frame::Frame;

mod registry;
pub mod rtsp;
mod stream;
pub mod synthetic;

#[cfg(feature = "rtsp-gstreamer")]
mod gstreamer;

pub use registry::SourceRegistry;
pub use rtsp::{ConnectionSnapshot, ConnectionState, RtspConfig, RtspSource, RtspTransport};
pub use stream::{DefaultConnector, StreamConnector, StreamTarget, VideoStream};
pub use synthetic::{SyntheticConfig, SyntheticSource};

/// Per-source configuration blob.
pub type SourceParams = serde_json::Map<String, serde_json::Value>;

pub const MIN_FPS: f64 = 1.0;
pub const MAX_FPS: f64 = 120.0;

/// Closed set of producer kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Synthetic,
    Camera,
    Screen,
    NetworkVideo,
    VideoFile,
    AudioVisualization,
}

impl SourceKind {
    pub const ALL: [SourceKind; 6] = [
        SourceKind::Synthetic,
        SourceKind::Camera,
        SourceKind::Screen,
        SourceKind::NetworkVideo,
        SourceKind::VideoFile,
        SourceKind::AudioVisualization,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Synthetic => "synthetic",
            SourceKind::Camera => "camera",
            SourceKind::Screen => "screen",
            SourceKind::NetworkVideo => "network-video",
            SourceKind::VideoFile => "video-file",
            SourceKind::AudioVisualization => "audio-visualization",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownSourceKind(s.to_string()))
    }
}

/// What to create: kind, registry id (empty = generated) and parameters.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct SourceDescriptor {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub params: SourceParams,
}

impl SourceDescriptor {
    pub fn new(kind: SourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            params: SourceParams::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Int,
    Float,
    Bool,
    String,
    Size,
    Choice,
}

/// One tunable parameter a source accepts, for UIs and `--describe` output.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConfigDescriptor {
    pub name: &'static str,
    pub value_type: ValueType,
    pub description: &'static str,
    pub default: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<(f64, f64)>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    pub choices: &'static [&'static str],
}

/// Snapshot of a source's state and counters.
#[derive(Clone, Debug, Serialize)]
pub struct SourceInfo {
    pub id: String,
    pub kind: SourceKind,
    pub running: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub configured_fps: f64,
    pub actual_fps: f64,
    pub frames_delivered: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionSnapshot>,
}

/// Capability interface every frame producer implements.
pub trait FrameSource: Send {
    fn kind(&self) -> SourceKind;

    /// Registry id.
    fn id(&self) -> &str;

    /// Apply configuration and perform one-time setup (open the device or
    /// connection). On error the source stays unusable until initialized again.
    fn initialize(&mut self, params: &SourceParams) -> Result<()>;

    /// Next frame, or `None` when nothing is ready. Must return promptly.
    fn capture(&mut self) -> Option<Frame>;

    fn info(&self) -> SourceInfo;

    fn available_configs(&self) -> Vec<ConfigDescriptor>;

    /// Apply a subset of the configuration, live where possible.
    fn set_config(&mut self, patch: &SourceParams) -> Result<()>;

    /// Release resources and stop background work. Safe to call repeatedly.
    fn release(&mut self);

    /// Resume delivery (source became active).
    fn start(&mut self);

    /// Pause delivery (another source became active). Not a release.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// Overlay `patch` on the serialized form of `current` and deserialize the
/// result. The target type decides which keys exist and what values parse.
pub(crate) fn merge_params<T>(current: &T, patch: &SourceParams) -> Result<T, ConfigError>
where
    T: Serialize + DeserializeOwned,
{
    let mut value =
        serde_json::to_value(current).map_err(|e| ConfigError::InvalidParams(e.to_string()))?;
    if let serde_json::Value::Object(map) = &mut value {
        for (key, entry) in patch {
            map.insert(key.clone(), entry.clone());
        }
    }
    serde_json::from_value(value).map_err(|e| ConfigError::InvalidParams(e.to_string()))
}

pub(crate) fn validate_fps(fps: f64) -> Result<(), ConfigError> {
    if !(MIN_FPS..=MAX_FPS).contains(&fps) {
        return Err(ConfigError::field(
            "fps",
            format!("must be between {} and {}, got {}", MIN_FPS, MAX_FPS, fps),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn source_kind_parses_kebab_case() {
        assert_eq!(
            "network-video".parse::<SourceKind>(),
            Ok(SourceKind::NetworkVideo)
        );
        assert_eq!(
            "rtsp".parse::<SourceKind>(),
            Err(ConfigError::UnknownSourceKind("rtsp".into()))
        );
        for kind in SourceKind::ALL {
            assert_eq!(kind.as_str().parse::<SourceKind>(), Ok(kind));
        }
    }

    #[test]
    fn descriptor_deserializes_from_config_entry() -> Result<()> {
        let descriptor: SourceDescriptor = serde_json::from_value(json!({
            "type": "synthetic",
            "id": "bars",
            "params": { "width": 120 }
        }))?;
        assert_eq!(descriptor.kind, SourceKind::Synthetic);
        assert_eq!(descriptor.id, "bars");
        assert_eq!(descriptor.params.get("width"), Some(&json!(120)));
        Ok(())
    }

    #[test]
    fn merge_rejects_unknown_keys() {
        let current = SyntheticConfig::default();
        let mut patch = SourceParams::new();
        patch.insert("colour".into(), json!("red"));
        assert!(matches!(
            merge_params(&current, &patch),
            Err(ConfigError::InvalidParams(_))
        ));
    }

    #[test]
    fn fps_bounds_are_inclusive() {
        assert!(validate_fps(1.0).is_ok());
        assert!(validate_fps(120.0).is_ok());
        assert!(validate_fps(0.5).is_err());
        assert!(validate_fps(f64::NAN).is_err());
    }
}
