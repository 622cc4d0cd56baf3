//! Synthetic test-pattern source.
//!
//! Produces seven vertical colour bars, optionally scrolling one column per
//! frame. Useful for checking a receiver's colour decoding and row ordering
//! without any capture hardware.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Instant;

use super::{
    merge_params, validate_fps, ConfigDescriptor, FrameSource, SourceInfo, SourceKind,
    SourceParams, ValueType,
};
use crate::error::ConfigError;
use crate::frame::Frame;

const BARS: [[u8; 3]; 7] = [
    [255, 0, 0],
    [255, 165, 0],
    [255, 255, 0],
    [0, 255, 0],
    [0, 255, 255],
    [0, 0, 255],
    [128, 0, 128],
];

const MAX_SIDE: u32 = 4096;

/// Configuration for a synthetic source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    /// Target frame rate, reported through `info()`.
    pub fps: f64,
    /// Scroll the bars one column per frame.
    pub animate: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 240,
            height: 240,
            fps: 30.0,
            animate: false,
        }
    }
}

impl SyntheticConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [("width", self.width), ("height", self.height)] {
            if value == 0 || value > MAX_SIDE {
                return Err(ConfigError::field(
                    field,
                    format!("must be between 1 and {}, got {}", MAX_SIDE, value),
                ));
            }
        }
        validate_fps(self.fps)
    }
}

pub struct SyntheticSource {
    id: String,
    config: SyntheticConfig,
    initialized: bool,
    running: bool,
    frame_count: u64,
    started_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            config: SyntheticConfig::default(),
            initialized: false,
            running: false,
            frame_count: 0,
            started_at: None,
        }
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    fn render(&self) -> Frame {
        let width = self.config.width;
        let segment = (width / BARS.len() as u32).max(1);
        let shift = if self.config.animate {
            (self.frame_count % u64::from(width)) as u32
        } else {
            0
        };
        Frame::from_fn(width, self.config.height, |x, _| {
            let column = (x + shift) % width;
            let bar = (column / segment).min(BARS.len() as u32 - 1);
            BARS[bar as usize]
        })
    }
}

impl FrameSource for SyntheticSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Synthetic
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn initialize(&mut self, params: &SourceParams) -> Result<()> {
        let config = merge_params(&self.config, params)?;
        config.validate()?;
        self.config = config;
        self.initialized = true;
        self.frame_count = 0;
        self.started_at = Some(Instant::now());
        log::info!(
            "SyntheticSource {}: {}x{} test pattern ready",
            self.id,
            self.config.width,
            self.config.height
        );
        Ok(())
    }

    fn capture(&mut self) -> Option<Frame> {
        if !self.initialized || !self.running {
            return None;
        }
        let frame = self.render();
        self.frame_count += 1;
        Some(frame)
    }

    fn info(&self) -> SourceInfo {
        let actual_fps = match self.started_at {
            Some(started) if self.frame_count > 0 => {
                let elapsed = started.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    self.frame_count as f64 / elapsed
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        SourceInfo {
            id: self.id.clone(),
            kind: SourceKind::Synthetic,
            running: self.running,
            width: Some(self.config.width),
            height: Some(self.config.height),
            configured_fps: self.config.fps,
            actual_fps,
            frames_delivered: self.frame_count,
            connection: None,
        }
    }

    fn available_configs(&self) -> Vec<ConfigDescriptor> {
        vec![
            ConfigDescriptor {
                name: "width",
                value_type: ValueType::Int,
                description: "Pattern width in pixels",
                default: json!(240),
                range: Some((1.0, MAX_SIDE as f64)),
                choices: &[],
            },
            ConfigDescriptor {
                name: "height",
                value_type: ValueType::Int,
                description: "Pattern height in pixels",
                default: json!(240),
                range: Some((1.0, MAX_SIDE as f64)),
                choices: &[],
            },
            ConfigDescriptor {
                name: "fps",
                value_type: ValueType::Float,
                description: "Target frame rate",
                default: json!(30.0),
                range: Some((super::MIN_FPS, super::MAX_FPS)),
                choices: &[],
            },
            ConfigDescriptor {
                name: "animate",
                value_type: ValueType::Bool,
                description: "Scroll the bars one column per frame",
                default: json!(false),
                range: None,
                choices: &[],
            },
        ]
    }

    fn set_config(&mut self, patch: &SourceParams) -> Result<()> {
        let config = merge_params(&self.config, patch)?;
        config.validate()?;
        self.config = config;
        Ok(())
    }

    fn release(&mut self) {
        self.initialized = false;
        self.started_at = None;
    }

    fn start(&mut self) {
        self.running = true;
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn is_running(&self) -> bool {
        self.running
    }
}
