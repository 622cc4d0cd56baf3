use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::ingest::{validate_fps, SourceDescriptor, SourceKind};
use crate::transport::{ColorEncoding, Resolution, StreamConfig, TransportProfile};

const DEFAULT_TARGET: &str = "192.168.30.161:8888";
const DEFAULT_PROFILE: &str = "hd-full";
const DEFAULT_FPS: f64 = 30.0;
const DEFAULT_SOURCE_ID: &str = "test_pattern";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamerConfigFile {
    target: Option<String>,
    profile: Option<String>,
    transport: Option<TransportOverrides>,
    fps: Option<f64>,
    sources: Option<Vec<SourceEntry>>,
    active_source: Option<String>,
}

/// Explicit transport fields; each one overrides the selected profile.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TransportOverrides {
    pub resolution: Option<Resolution>,
    pub color: Option<ColorEncoding>,
    pub rows_per_packet: Option<u32>,
    pub inter_packet_delay_ms: Option<f64>,
    pub max_datagram_bytes: Option<usize>,
}

impl TransportOverrides {
    fn apply(&self, mut profile: TransportProfile) -> Result<TransportProfile, ConfigError> {
        if let Some(resolution) = self.resolution {
            profile.resolution = resolution;
        }
        if let Some(color) = self.color {
            profile.color = color;
        }
        if let Some(rows) = self.rows_per_packet {
            profile.rows_per_packet = rows;
        }
        if let Some(ms) = self.inter_packet_delay_ms {
            if !ms.is_finite() || ms < 0.0 {
                return Err(ConfigError::field(
                    "inter_packet_delay_ms",
                    format!("must be a non-negative number, got {}", ms),
                ));
            }
            profile.inter_packet_delay = Duration::from_micros((ms * 1000.0).round() as u64);
        }
        if let Some(limit) = self.max_datagram_bytes {
            profile.max_datagram_bytes = limit;
        }
        Ok(profile)
    }
}

/// One configured source. Disabled entries are kept but never created.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SourceEntry {
    #[serde(flatten)]
    pub descriptor: SourceDescriptor,
    #[serde(default = "enabled")]
    pub enable: bool,
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// Receiver address, `host:port`.
    pub target: String,
    pub profile: String,
    pub overrides: TransportOverrides,
    /// Resolved from `profile` and `overrides` by `validate`.
    pub transport: TransportProfile,
    pub fps: f64,
    pub sources: Vec<SourceEntry>,
    pub active_source: Option<String>,
}

impl StreamerConfig {
    /// Load from the file named by `FRAMECAST_CONFIG` (if set), then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FRAMECAST_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: StreamerConfigFile) -> Self {
        let sources = file.sources.unwrap_or_else(|| {
            vec![SourceEntry {
                descriptor: SourceDescriptor::new(SourceKind::Synthetic, DEFAULT_SOURCE_ID),
                enable: true,
            }]
        });
        Self {
            target: file.target.unwrap_or_else(|| DEFAULT_TARGET.to_string()),
            profile: file.profile.unwrap_or_else(|| DEFAULT_PROFILE.to_string()),
            overrides: file.transport.unwrap_or_default(),
            transport: TransportProfile::default(),
            fps: file.fps.unwrap_or(DEFAULT_FPS),
            sources,
            active_source: file.active_source,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(target) = std::env::var("FRAMECAST_TARGET") {
            if !target.trim().is_empty() {
                self.target = target.trim().to_string();
            }
        }
        if let Ok(profile) = std::env::var("FRAMECAST_PROFILE") {
            if !profile.trim().is_empty() {
                self.profile = profile.trim().to_string();
            }
        }
        if let Ok(source) = std::env::var("FRAMECAST_ACTIVE_SOURCE") {
            if !source.trim().is_empty() {
                self.active_source = Some(source.trim().to_string());
            }
        }
        if let Ok(fps) = std::env::var("FRAMECAST_FPS") {
            self.fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("FRAMECAST_FPS must be a number of frames per second"))?;
        }
        Ok(())
    }

    /// Check every setting and resolve the transport profile. Call again after
    /// changing fields by hand.
    pub fn validate(&mut self) -> Result<()> {
        validate_fps(self.fps)?;
        let profile = TransportProfile::named(&self.profile)?;
        self.transport = self.overrides.apply(profile)?;
        self.transport.validate()?;
        self.resolve_target()?;

        let mut seen = std::collections::HashSet::new();
        for entry in &self.sources {
            let id = &entry.descriptor.id;
            if !id.is_empty() && !seen.insert(id.as_str()) {
                return Err(ConfigError::DuplicateSourceId(id.clone()).into());
            }
        }
        if let Some(active) = &self.active_source {
            let found = self
                .enabled_sources()
                .any(|entry| &entry.descriptor.id == active);
            if !found {
                return Err(ConfigError::UnknownSourceId(active.clone()).into());
            }
        }
        Ok(())
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceEntry> {
        self.sources.iter().filter(|entry| entry.enable)
    }

    pub fn resolve_target(&self) -> Result<SocketAddr> {
        self.target
            .to_socket_addrs()
            .with_context(|| format!("resolve target {}", self.target))?
            .next()
            .ok_or_else(|| anyhow!("target {} resolved to no addresses", self.target))
    }

    pub fn stream_config(&self) -> Result<StreamConfig> {
        let target = self.resolve_target()?;
        Ok(StreamConfig::new(target, self.transport)?)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps)
    }
}

fn read_config_file(path: &Path) -> Result<StreamerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
