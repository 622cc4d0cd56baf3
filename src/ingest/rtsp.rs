//! Network video source.
//!
//! `RtspSource` wraps an unreliable upstream connection (RTSP or HTTP camera,
//! or `stub://` for tests) and decouples its timing from the consumer:
//!
//! - A background thread reads frames into a bounded ring buffer. When the
//!   buffer is full the oldest frame is evicted, so the thread never blocks.
//! - `capture()` only pops the buffer. It never touches the network.
//! - Read failures run the reconnect procedure: drop the connection, wait
//!   `reconnect_delay`, reopen, read one frame. `reconnect_attempts`
//!   consecutive failures end in `Failed`, after which nothing is attempted
//!   until `initialize()` is called again.
//!
//! With `use_buffer = false` there is no thread and `capture()` reads
//! directly. Each call makes at most one reconnect attempt and returns `None`
//! if it fails; the attempt count carries over to the next call.
//!
//! Re-arming: a successful reconnect (reopen plus one frame read) resets the
//! attempt counter to zero, however many attempts it took. `Failed` is only
//! left through `initialize()`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use url::Url;

use super::stream::{DefaultConnector, StreamConnector, StreamTarget, VideoStream};
use super::{
    merge_params, validate_fps, ConfigDescriptor, FrameSource, SourceInfo, SourceKind,
    SourceParams, ValueType,
};
use crate::error::ConfigError;
use crate::frame::{Frame, SharedRingBuffer, MAX_BUFFER_FRAMES};

/// How long `release()` waits for the ingestion thread before abandoning it.
pub const RELEASE_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Back-off when the loop has nothing to do (paused, or a read returned nothing).
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Granularity at which sleeps notice the stop flag.
const STOP_POLL: Duration = Duration::from_millis(20);

/// Reconnect attempts a single direct-mode `capture()` may make. Further
/// attempts wait for the next poll, so the caller is never held for longer
/// than one delay plus one open.
const DIRECT_ATTEMPTS_PER_CAPTURE: u32 = 1;

const MAX_RECONNECT_DELAY_SECS: f64 = 300.0;
const MAX_TIMEOUT_SECS: f64 = 600.0;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtspTransport {
    Tcp,
    Udp,
}

/// Configuration for a network video source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RtspConfig {
    /// Stream URL (e.g. "rtsp://192.168.1.100:554/stream").
    pub url: String,
    /// Target frame rate, reported through `info()`.
    pub fps: f64,
    /// Ring buffer capacity in frames.
    pub buffer_size: usize,
    /// Consecutive failed reconnects before giving up. `None` retries forever.
    pub reconnect_attempts: Option<u32>,
    /// Seconds to wait before each reconnect.
    pub reconnect_delay: f64,
    /// Connection timeout in seconds.
    pub timeout: f64,
    /// Read on a background thread into the ring buffer.
    pub use_buffer: bool,
    /// Resize every frame to `[width, height]` before buffering.
    pub decode_resolution: Option<(u32, u32)>,
    pub transport: RtspTransport,
    /// Frames to read after entering `Streaming` before reporting actual fps.
    pub stabilization_frames: u64,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            fps: 30.0,
            buffer_size: 100,
            reconnect_attempts: Some(5),
            reconnect_delay: 2.0,
            timeout: 10.0,
            use_buffer: true,
            decode_resolution: None,
            transport: RtspTransport::Tcp,
            stabilization_frames: 30,
        }
    }
}

impl RtspConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::field("url", "is required"));
        }
        let url = Url::parse(&self.url).map_err(|e| ConfigError::field("url", e.to_string()))?;
        if !super::stream::SUPPORTED_SCHEMES.contains(&url.scheme()) {
            return Err(ConfigError::field(
                "url",
                format!(
                    "unsupported scheme '{}'; expected rtsp(s), http(s) or stub",
                    url.scheme()
                ),
            ));
        }
        validate_fps(self.fps)?;
        if self.buffer_size == 0 || self.buffer_size > MAX_BUFFER_FRAMES {
            return Err(ConfigError::field(
                "buffer_size",
                format!(
                    "must be between 1 and {}, got {}",
                    MAX_BUFFER_FRAMES, self.buffer_size
                ),
            ));
        }
        if !(0.0..=MAX_RECONNECT_DELAY_SECS).contains(&self.reconnect_delay) {
            return Err(ConfigError::field(
                "reconnect_delay",
                format!(
                    "must be between 0 and {} seconds, got {}",
                    MAX_RECONNECT_DELAY_SECS, self.reconnect_delay
                ),
            ));
        }
        if !(self.timeout > 0.0 && self.timeout <= MAX_TIMEOUT_SECS) {
            return Err(ConfigError::field(
                "timeout",
                format!(
                    "must be greater than 0 and at most {} seconds, got {}",
                    MAX_TIMEOUT_SECS, self.timeout
                ),
            ));
        }
        if let Some((width, height)) = self.decode_resolution {
            if width == 0 || height == 0 {
                return Err(ConfigError::field(
                    "decode_resolution",
                    format!("dimensions must be non-zero, got {}x{}", width, height),
                ));
            }
        }
        if self.stabilization_frames == 0 {
            return Err(ConfigError::field(
                "stabilization_frames",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    fn target(&self) -> StreamTarget {
        StreamTarget {
            url: self.url.clone(),
            transport: self.transport,
            timeout: Duration::from_secs_f64(self.timeout),
        }
    }

    fn live(&self) -> LiveSettings {
        LiveSettings {
            reconnect_attempts: self.reconnect_attempts,
            reconnect_delay: Duration::from_secs_f64(self.reconnect_delay),
            decode_resolution: self.decode_resolution,
            stabilization_frames: self.stabilization_frames,
        }
    }

    fn capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.buffer_size).unwrap_or(NonZeroUsize::MIN)
    }
}

/// Settings the ingestion thread re-reads on every use, so `set_config` can
/// change them without reconnecting.
#[derive(Clone, Copy, Debug)]
struct LiveSettings {
    reconnect_attempts: Option<u32>,
    reconnect_delay: Duration,
    decode_resolution: Option<(u32, u32)>,
    stabilization_frames: u64,
}

// ----------------------------------------------------------------------------
// Connection state
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Published view of the connection, written only by whoever owns the
/// `Ingestor` (the background thread in buffered mode).
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub target: String,
    pub reconnect_count: u32,
    pub reconnect_limit: Option<u32>,
    pub last_error: Option<String>,
    /// Frames read since the connection last entered `Streaming`.
    pub frames_read: u64,
    pub actual_fps: f64,
    pub stream_fps: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub buffered: usize,
}

impl ConnectionSnapshot {
    fn disconnected(target: &str, limit: Option<u32>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            target: target.to_string(),
            reconnect_count: 0,
            reconnect_limit: limit,
            last_error: None,
            frames_read: 0,
            actual_fps: 0.0,
            stream_fps: None,
            width: None,
            height: None,
            buffered: 0,
        }
    }
}

/// State shared between the source handle and its ingestion thread.
struct Shared {
    stop: AtomicBool,
    paused: AtomicBool,
    settings: Mutex<LiveSettings>,
    status: Mutex<ConnectionSnapshot>,
}

impl Shared {
    fn new(config: &RtspConfig, paused: bool) -> Self {
        Self {
            stop: AtomicBool::new(false),
            paused: AtomicBool::new(paused),
            settings: Mutex::new(config.live()),
            status: Mutex::new(ConnectionSnapshot::disconnected(
                &config.url,
                config.reconnect_attempts,
            )),
        }
    }

    fn settings(&self) -> LiveSettings {
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> MutexGuard<'_, ConnectionSnapshot> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Ingestor: connection owner and reconnect state machine
// ----------------------------------------------------------------------------

struct Ingestor {
    source_id: String,
    connector: Arc<dyn StreamConnector>,
    target: StreamTarget,
    stream: Option<Box<dyn VideoStream>>,
    state: ConnectionState,
    reconnect_count: u32,
    last_error: Option<String>,
    frames_read: u64,
    streaming_since: Option<Instant>,
    actual_fps: f64,
    last_dimensions: Option<(u32, u32)>,
    shared: Arc<Shared>,
}

impl Ingestor {
    fn new(
        source_id: String,
        connector: Arc<dyn StreamConnector>,
        target: StreamTarget,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            source_id,
            connector,
            target,
            stream: None,
            state: ConnectionState::Disconnected,
            reconnect_count: 0,
            last_error: None,
            frames_read: 0,
            streaming_since: None,
            actual_fps: 0.0,
            last_dimensions: None,
            shared,
        }
    }

    /// Disconnected → Connecting → Streaming, returning the first frame.
    fn connect(&mut self) -> Result<Frame> {
        self.set_state(ConnectionState::Connecting);
        log::info!(
            "RtspSource {}: connecting to {}",
            self.source_id,
            self.target.url
        );
        match self.open_and_read() {
            Ok((stream, frame)) => {
                self.stream = Some(stream);
                self.enter_streaming();
                Ok(self.accept(frame))
            }
            Err(err) => {
                self.last_error = Some(format!("{:#}", err));
                self.set_state(ConnectionState::Failed);
                Err(err)
            }
        }
    }

    /// Read the next frame, running the reconnect procedure on failure.
    /// `None` means no frame this time; check `state` for `Failed`.
    ///
    /// `attempt_budget` caps the reconnect attempts made by this call. A
    /// pipeline left in `Reconnecting` resumes the procedure on the next call.
    fn read_next(&mut self, attempt_budget: Option<u32>) -> Option<Frame> {
        if self.state == ConnectionState::Failed {
            return None;
        }
        if let Some(stream) = self.stream.as_mut() {
            match stream.read_frame() {
                Ok(frame) => return Some(self.accept(frame)),
                Err(err) => {
                    log::warn!(
                        "RtspSource {}: read failed, reconnecting: {:#}",
                        self.source_id,
                        err
                    );
                    self.last_error = Some(format!("{:#}", err));
                }
            }
        }
        self.reconnect(attempt_budget).map(|frame| self.accept(frame))
    }

    /// Reconnect procedure. Returns the first frame of the new connection, or
    /// `None` once attempts are exhausted (state `Failed`), the budget for this
    /// call is spent (state stays `Reconnecting`) or stop was requested.
    fn reconnect(&mut self, attempt_budget: Option<u32>) -> Option<Frame> {
        self.set_state(ConnectionState::Reconnecting);
        let mut attempts_made = 0;
        loop {
            if self.shared.stop_requested() {
                return None;
            }
            let settings = self.shared.settings();
            if let Some(limit) = settings.reconnect_attempts {
                if self.reconnect_count >= limit {
                    log::error!(
                        "RtspSource {}: giving up on {} after {} reconnect attempts",
                        self.source_id,
                        self.target.url,
                        limit
                    );
                    self.stream = None;
                    self.set_state(ConnectionState::Failed);
                    return None;
                }
            }
            if attempt_budget.is_some_and(|budget| attempts_made >= budget) {
                return None;
            }
            attempts_made += 1;
            self.reconnect_count += 1;
            log::info!(
                "RtspSource {}: reconnect attempt {}/{}",
                self.source_id,
                self.reconnect_count,
                settings
                    .reconnect_attempts
                    .map_or_else(|| "unlimited".to_string(), |n| n.to_string())
            );
            self.stream = None;
            self.publish();
            if !self.sleep_unless_stopped(settings.reconnect_delay) {
                return None;
            }
            match self.open_and_read() {
                Ok((stream, frame)) => {
                    log::info!(
                        "RtspSource {}: reconnected after {} attempt(s)",
                        self.source_id,
                        self.reconnect_count
                    );
                    self.stream = Some(stream);
                    self.reconnect_count = 0;
                    self.enter_streaming();
                    return Some(frame);
                }
                Err(err) => {
                    log::warn!(
                        "RtspSource {}: reconnect attempt {} failed: {:#}",
                        self.source_id,
                        self.reconnect_count,
                        err
                    );
                    self.last_error = Some(format!("{:#}", err));
                    self.publish();
                }
            }
        }
    }

    fn open_and_read(&self) -> Result<(Box<dyn VideoStream>, Frame)> {
        let mut stream = self
            .connector
            .open(&self.target)
            .with_context(|| format!("open {}", self.target.url))?;
        let frame = stream
            .read_frame()
            .context("connection opened but no frame could be read")?;
        Ok((stream, frame))
    }

    fn enter_streaming(&mut self) {
        self.frames_read = 0;
        self.actual_fps = 0.0;
        self.streaming_since = Some(Instant::now());
        self.set_state(ConnectionState::Streaming);
    }

    /// Post-process a frame that was read successfully and update counters.
    fn accept(&mut self, frame: Frame) -> Frame {
        let settings = self.shared.settings();
        let frame = match settings.decode_resolution {
            Some((width, height)) => frame.into_resized(width, height),
            None => frame,
        };
        self.frames_read += 1;
        self.last_dimensions = Some(frame.dimensions());
        if self.frames_read >= settings.stabilization_frames {
            if let Some(since) = self.streaming_since {
                let elapsed = since.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    self.actual_fps = self.frames_read as f64 / elapsed;
                }
            }
        }
        self.publish();
        frame
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        let limit = self.shared.settings().reconnect_attempts;
        let stream_fps = self.stream.as_ref().and_then(|s| s.stream_fps());
        let mut status = self.shared.status();
        status.state = self.state;
        status.target = self.target.url.clone();
        status.reconnect_count = self.reconnect_count;
        status.reconnect_limit = limit;
        status.last_error = self.last_error.clone();
        status.frames_read = self.frames_read;
        status.actual_fps = self.actual_fps;
        if stream_fps.is_some() {
            status.stream_fps = stream_fps;
        }
        if let Some((width, height)) = self.last_dimensions {
            status.width = Some(width);
            status.height = Some(height);
        }
    }

    /// Sleep for `duration`, waking early on stop. Returns false when stopped.
    fn sleep_unless_stopped(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.shared.stop_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(STOP_POLL));
        }
    }

    /// Background acquisition loop. Returns the ingestor so its connection is
    /// dropped on the owning side after join.
    fn run(mut self, buffer: SharedRingBuffer<Frame>) -> Self {
        log::debug!("RtspSource {}: ingestion thread started", self.source_id);
        while !self.shared.stop_requested() {
            if self.shared.paused.load(Ordering::SeqCst) {
                std::thread::sleep(IDLE_POLL);
                continue;
            }
            match self.read_next(None) {
                Some(frame) => {
                    // A read that was in flight when the source was stopped
                    // must not land after stop() cleared the buffer.
                    let paused = &self.shared.paused;
                    if buffer.push_if(frame, || !paused.load(Ordering::SeqCst)) {
                        self.shared.status().buffered = buffer.len();
                    }
                }
                None if self.state == ConnectionState::Failed => break,
                None => std::thread::sleep(IDLE_POLL),
            }
        }
        log::debug!(
            "RtspSource {}: ingestion thread exiting ({})",
            self.source_id,
            self.state
        );
        self
    }
}

// ----------------------------------------------------------------------------
// RtspSource
// ----------------------------------------------------------------------------

enum Pipeline {
    Idle,
    Buffered(JoinHandle<Ingestor>),
    Direct(Box<Ingestor>),
}

/// Network video source with background ingestion and bounded reconnects.
pub struct RtspSource {
    id: String,
    config: RtspConfig,
    connector: Arc<dyn StreamConnector>,
    shared: Arc<Shared>,
    buffer: SharedRingBuffer<Frame>,
    pipeline: Pipeline,
    running: bool,
    last_frame: Option<Frame>,
    frames_delivered: u64,
}

impl RtspSource {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_connector(id, Arc::new(DefaultConnector))
    }

    pub fn with_connector(id: impl Into<String>, connector: Arc<dyn StreamConnector>) -> Self {
        let config = RtspConfig::default();
        Self {
            id: id.into(),
            shared: Arc::new(Shared::new(&config, true)),
            buffer: SharedRingBuffer::new(config.capacity()),
            config,
            connector,
            pipeline: Pipeline::Idle,
            running: false,
            last_frame: None,
            frames_delivered: 0,
        }
    }

    pub fn config(&self) -> &RtspConfig {
        &self.config
    }

    pub fn connection(&self) -> ConnectionSnapshot {
        let mut snapshot = self.shared.status().clone();
        snapshot.buffered = self.buffer.len();
        snapshot
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status().state
    }

    /// Stop the ingestion thread and wait for it, at most `RELEASE_JOIN_TIMEOUT`.
    fn shutdown_pipeline(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        match std::mem::replace(&mut self.pipeline, Pipeline::Idle) {
            Pipeline::Idle => {}
            Pipeline::Direct(ingestor) => drop(ingestor),
            Pipeline::Buffered(handle) => {
                let deadline = Instant::now() + RELEASE_JOIN_TIMEOUT;
                while !handle.is_finished() && Instant::now() < deadline {
                    std::thread::sleep(IDLE_POLL);
                }
                if handle.is_finished() {
                    if handle.join().is_err() {
                        log::error!("RtspSource {}: ingestion thread panicked", self.id);
                    }
                } else {
                    log::error!(
                        "RtspSource {}: ingestion thread did not stop within {:?}; abandoning it",
                        self.id,
                        RELEASE_JOIN_TIMEOUT
                    );
                    // The abandoned thread keeps its handles to the old status
                    // and buffer; nothing it does later is visible here.
                    self.shared = Arc::new(Shared::new(&self.config, !self.running));
                    self.shared.stop.store(true, Ordering::SeqCst);
                    self.buffer = SharedRingBuffer::new(self.config.capacity());
                }
            }
        }
    }

    fn deliver(&mut self, frame: Frame) -> Frame {
        self.frames_delivered += 1;
        self.last_frame = Some(frame.clone());
        frame
    }
}

impl FrameSource for RtspSource {
    fn kind(&self) -> SourceKind {
        SourceKind::NetworkVideo
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn initialize(&mut self, params: &SourceParams) -> Result<()> {
        let config = merge_params(&self.config, params)?;
        config.validate()?;
        self.release();
        self.config = config;

        self.shared = Arc::new(Shared::new(&self.config, !self.running));
        self.buffer = SharedRingBuffer::new(self.config.capacity());
        self.frames_delivered = 0;

        let mut ingestor = Ingestor::new(
            self.id.clone(),
            Arc::clone(&self.connector),
            self.config.target(),
            Arc::clone(&self.shared),
        );
        let first = ingestor
            .connect()
            .with_context(|| format!("RtspSource {}: initialize", self.id))?;
        self.buffer.push(first);

        if self.config.use_buffer {
            let buffer = self.buffer.clone();
            let handle = std::thread::Builder::new()
                .name(format!("ingest-{}", self.id))
                .spawn(move || ingestor.run(buffer))
                .context("spawn ingestion thread")?;
            self.pipeline = Pipeline::Buffered(handle);
            log::info!("RtspSource {}: ingestion thread started", self.id);
        } else {
            self.pipeline = Pipeline::Direct(Box::new(ingestor));
        }
        log::info!("RtspSource {}: initialized {}", self.id, self.config.url);
        Ok(())
    }

    fn capture(&mut self) -> Option<Frame> {
        if !self.running {
            return None;
        }
        if let Pipeline::Direct(ingestor) = &mut self.pipeline {
            // A frame buffered during initialize goes out first.
            let frame = match self.buffer.pop() {
                Some(frame) => Some(frame),
                None => ingestor.read_next(Some(DIRECT_ATTEMPTS_PER_CAPTURE)),
            };
            return frame.map(|frame| self.deliver(frame));
        }
        if matches!(self.pipeline, Pipeline::Idle) || self.state() == ConnectionState::Failed {
            return None;
        }
        match self.buffer.pop() {
            Some(frame) => Some(self.deliver(frame)),
            None => self.last_frame.clone(),
        }
    }

    fn info(&self) -> SourceInfo {
        let connection = self.connection();
        SourceInfo {
            id: self.id.clone(),
            kind: SourceKind::NetworkVideo,
            running: self.running,
            width: connection.width,
            height: connection.height,
            configured_fps: self.config.fps,
            actual_fps: connection.actual_fps,
            frames_delivered: self.frames_delivered,
            connection: Some(connection),
        }
    }

    fn available_configs(&self) -> Vec<ConfigDescriptor> {
        vec![
            ConfigDescriptor {
                name: "url",
                value_type: ValueType::String,
                description: "Stream URL (rtsp, rtsps, http, https or stub)",
                default: json!(""),
                range: None,
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
                name: "buffer_size",
                value_type: ValueType::Int,
                description: "Frame buffer capacity",
                default: json!(100),
                range: Some((1.0, MAX_BUFFER_FRAMES as f64)),
                choices: &[],
            },
            ConfigDescriptor {
                name: "reconnect_attempts",
                value_type: ValueType::Int,
                description: "Consecutive reconnect attempts before failing (null = forever)",
                default: json!(5),
                range: Some((0.0, u32::MAX as f64)),
                choices: &[],
            },
            ConfigDescriptor {
                name: "reconnect_delay",
                value_type: ValueType::Float,
                description: "Delay before each reconnect attempt (seconds)",
                default: json!(2.0),
                range: Some((0.0, MAX_RECONNECT_DELAY_SECS)),
                choices: &[],
            },
            ConfigDescriptor {
                name: "timeout",
                value_type: ValueType::Float,
                description: "Connection timeout (seconds)",
                default: json!(10.0),
                range: Some((0.0, MAX_TIMEOUT_SECS)),
                choices: &[],
            },
            ConfigDescriptor {
                name: "use_buffer",
                value_type: ValueType::Bool,
                description: "Read on a background thread into the frame buffer",
                default: json!(true),
                range: None,
                choices: &[],
            },
            ConfigDescriptor {
                name: "decode_resolution",
                value_type: ValueType::Size,
                description: "Resize frames to [width, height]; null keeps the stream size",
                default: serde_json::Value::Null,
                range: None,
                choices: &[],
            },
            ConfigDescriptor {
                name: "transport",
                value_type: ValueType::Choice,
                description: "RTSP lower transport",
                default: json!("tcp"),
                range: None,
                choices: &["tcp", "udp"],
            },
            ConfigDescriptor {
                name: "stabilization_frames",
                value_type: ValueType::Int,
                description: "Frames to read before reporting actual fps",
                default: json!(30),
                range: Some((1.0, 1000.0)),
                choices: &[],
            },
        ]
    }

    fn set_config(&mut self, patch: &SourceParams) -> Result<()> {
        let config = merge_params(&self.config, patch)?;
        config.validate()?;

        *self
            .shared
            .settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = config.live();
        if config.buffer_size != self.config.buffer_size {
            self.buffer.set_capacity(config.capacity());
        }
        let deferred: Vec<&str> = [
            ("url", config.url != self.config.url),
            ("timeout", config.timeout != self.config.timeout),
            ("transport", config.transport != self.config.transport),
            ("use_buffer", config.use_buffer != self.config.use_buffer),
        ]
        .into_iter()
        .filter_map(|(name, changed)| changed.then_some(name))
        .collect();
        if !deferred.is_empty() {
            log::info!(
                "RtspSource {}: {} take effect at the next initialize",
                self.id,
                deferred.join(", ")
            );
        }
        for key in patch.keys() {
            log::info!("RtspSource {}: config updated: {}", self.id, key);
        }
        self.config = config;
        Ok(())
    }

    fn release(&mut self) {
        self.shutdown_pipeline();
        self.buffer.clear();
        self.last_frame = None;
        *self.shared.status() =
            ConnectionSnapshot::disconnected(&self.config.url, self.config.reconnect_attempts);
        log::debug!("RtspSource {}: released", self.id);
    }

    fn start(&mut self) {
        self.running = true;
        self.shared.paused.store(false, Ordering::SeqCst);
    }

    fn stop(&mut self) {
        self.running = false;
        self.shared.paused.store(true, Ordering::SeqCst);
        self.buffer.clear();
        self.last_frame = None;
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        self.shutdown_pipeline();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    /// What each `open` call does, in order. Once the script runs out every
    /// open fails.
    #[derive(Clone, Copy, Debug)]
    enum Script {
        /// Open succeeds; the stream yields this many frames, then errors.
        Frames(usize),
        /// Open itself fails.
        Refuse,
    }

    struct ScriptedConnector {
        script: Mutex<VecDeque<Script>>,
        opens: AtomicUsize,
        reads: Arc<AtomicUsize>,
        read_time: Duration,
    }

    impl ScriptedConnector {
        fn new(script: &[Script]) -> Arc<Self> {
            Self::with_read_time(script, Duration::from_millis(1))
        }

        fn with_read_time(script: &[Script], read_time: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
                opens: AtomicUsize::new(0),
                reads: Arc::new(AtomicUsize::new(0)),
                read_time,
            })
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        /// Completed successful reads across every stream opened so far.
        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    impl StreamConnector for ScriptedConnector {
        fn open(&self, _target: &StreamTarget) -> Result<Box<dyn VideoStream>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().unwrap().pop_front() {
                Some(Script::Frames(remaining)) => Ok(Box::new(ScriptedStream {
                    remaining,
                    reads: Arc::clone(&self.reads),
                    read_time: self.read_time,
                })),
                Some(Script::Refuse) | None => Err(anyhow!("connection refused")),
            }
        }
    }

    struct ScriptedStream {
        remaining: usize,
        reads: Arc<AtomicUsize>,
        read_time: Duration,
    }

    impl VideoStream for ScriptedStream {
        fn read_frame(&mut self) -> Result<Frame> {
            if self.remaining == 0 {
                return Err(anyhow!("stream ended"));
            }
            self.remaining -= 1;
            std::thread::sleep(self.read_time);
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(Frame::filled(64, 48, [1, 2, 3]))
        }
    }

    /// Opens once. The stream's first read succeeds; every later read blocks
    /// until the test sends on the gate.
    struct GatedConnector {
        gate: Mutex<Option<mpsc::Receiver<()>>>,
    }

    impl StreamConnector for GatedConnector {
        fn open(&self, _target: &StreamTarget) -> Result<Box<dyn VideoStream>> {
            let gate = self
                .gate
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| anyhow!("connection refused"))?;
            Ok(Box::new(GatedStream { first: true, gate }))
        }
    }

    struct GatedStream {
        first: bool,
        gate: mpsc::Receiver<()>,
    }

    impl VideoStream for GatedStream {
        fn read_frame(&mut self) -> Result<Frame> {
            if !std::mem::take(&mut self.first) {
                self.gate.recv().map_err(|_| anyhow!("gate closed"))?;
            }
            Ok(Frame::filled(8, 8, [9, 9, 9]))
        }
    }

    fn params(extra: serde_json::Value) -> SourceParams {
        let mut params = SourceParams::new();
        params.insert("url".into(), json!("rtsp://camera.test/stream"));
        params.insert("reconnect_delay".into(), json!(0.0));
        if let serde_json::Value::Object(map) = extra {
            params.extend(map);
        }
        params
    }

    fn wait_for_state(source: &RtspSource, state: ConnectionState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if source.state() == state {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn exhausted_reconnects_end_in_failed_without_further_opens() -> Result<()> {
        let connector = ScriptedConnector::new(&[Script::Frames(3)]);
        let mut source = RtspSource::with_connector("cam", connector.clone());
        source.initialize(&params(json!({ "reconnect_attempts": 3 })))?;
        source.start();

        assert!(wait_for_state(&source, ConnectionState::Failed));
        // Initial open plus exactly three reconnect attempts.
        assert_eq!(connector.opens(), 4);
        assert_eq!(source.connection().reconnect_count, 3);
        assert!(source.connection().last_error.is_some());

        assert!(source.capture().is_none());
        std::thread::sleep(Duration::from_millis(50));
        assert!(source.capture().is_none());
        assert_eq!(connector.opens(), 4);

        source.release();
        assert_eq!(source.state(), ConnectionState::Disconnected);
        Ok(())
    }

    #[test]
    fn successful_reconnect_resets_the_counter() -> Result<()> {
        let connector = ScriptedConnector::new(&[
            Script::Frames(2),
            Script::Refuse,
            Script::Refuse,
            Script::Frames(1_000_000),
        ]);
        let mut source = RtspSource::with_connector("cam", connector.clone());
        source.initialize(&params(json!({ "reconnect_attempts": 3 })))?;
        source.start();

        let deadline = Instant::now() + Duration::from_secs(5);
        while connector.opens() < 4 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(wait_for_state(&source, ConnectionState::Streaming));
        assert_eq!(source.connection().reconnect_count, 0);
        assert!(source.capture().is_some());
        source.release();
        Ok(())
    }

    #[test]
    fn initialize_fails_when_first_read_fails() {
        let connector = ScriptedConnector::new(&[Script::Frames(0)]);
        let mut source = RtspSource::with_connector("cam", connector.clone());
        let err = source.initialize(&params(json!({}))).unwrap_err();
        assert!(format!("{:#}", err).contains("no frame could be read"));
        assert_eq!(source.state(), ConnectionState::Failed);
        source.start();
        assert!(source.capture().is_none());
    }

    #[test]
    fn initialize_can_be_repeated_after_failure() -> Result<()> {
        let connector = ScriptedConnector::new(&[Script::Refuse, Script::Frames(1_000_000)]);
        let mut source = RtspSource::with_connector("cam", connector.clone());
        assert!(source.initialize(&params(json!({}))).is_err());
        source.initialize(&params(json!({})))?;
        source.start();
        assert_eq!(source.state(), ConnectionState::Streaming);
        assert!(source.capture().is_some());
        source.release();
        Ok(())
    }

    #[test]
    fn capture_repeats_last_frame_when_buffer_is_empty() -> Result<()> {
        let connector = ScriptedConnector::new(&[Script::Frames(1_000_000)]);
        let mut source = RtspSource::with_connector("cam", connector);
        source.initialize(&params(json!({})))?;
        source.start();
        let first = source.capture().expect("first frame was buffered at connect");
        source.stop();
        assert!(source.capture().is_none());
        source.start();
        source.buffer.clear();
        source.last_frame = Some(first.clone());
        // Whether or not the thread has pushed again, a frame comes back.
        assert!(source.capture().is_some());
        source.release();
        Ok(())
    }

    #[test]
    fn decode_resolution_resizes_buffered_frames() -> Result<()> {
        let connector = ScriptedConnector::new(&[Script::Frames(1_000_000)]);
        let mut source = RtspSource::with_connector("cam", connector);
        source.initialize(&params(json!({ "decode_resolution": [32, 32] })))?;
        source.start();
        let frame = source.capture().expect("frame");
        assert_eq!(frame.dimensions(), (32, 32));
        source.release();
        Ok(())
    }

    #[test]
    fn direct_mode_reads_on_capture() -> Result<()> {
        let connector = ScriptedConnector::new(&[Script::Frames(3)]);
        let mut source = RtspSource::with_connector("cam", connector.clone());
        source.initialize(&params(json!({ "use_buffer": false, "reconnect_attempts": 1 })))?;
        source.start();
        // One frame from connect, then two direct reads.
        assert!(source.capture().is_some());
        assert!(source.capture().is_some());
        assert!(source.capture().is_some());
        // Stream exhausted, one refused reconnect, then Failed.
        assert!(source.capture().is_none());
        assert_eq!(source.state(), ConnectionState::Failed);
        assert_eq!(connector.opens(), 2);
        assert!(source.capture().is_none());
        assert_eq!(connector.opens(), 2);
        Ok(())
    }

    #[test]
    fn direct_mode_with_unlimited_retries_returns_on_every_capture() -> Result<()> {
        let connector = ScriptedConnector::new(&[Script::Frames(1)]);
        let mut source = RtspSource::with_connector("cam", connector.clone());
        source.initialize(&params(json!({ "use_buffer": false, "reconnect_attempts": null })))?;
        source.start();
        assert!(source.capture().is_some());
        assert_eq!(connector.opens(), 1);

        // Upstream is gone for good. Each poll makes one attempt and returns.
        let started = Instant::now();
        for attempt in 1..=5 {
            assert!(source.capture().is_none());
            assert_eq!(connector.opens(), 1 + attempt);
            assert_eq!(source.state(), ConnectionState::Reconnecting);
            assert_eq!(source.connection().reconnect_count, attempt as u32);
        }
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(source.connection().last_error.is_some());
        Ok(())
    }

    #[test]
    fn direct_mode_carries_attempts_across_captures() -> Result<()> {
        let connector = ScriptedConnector::new(&[
            Script::Frames(1),
            Script::Refuse,
            Script::Frames(1_000_000),
        ]);
        let mut source = RtspSource::with_connector("cam", connector.clone());
        source.initialize(&params(json!({ "use_buffer": false, "reconnect_attempts": 2 })))?;
        source.start();
        assert!(source.capture().is_some());
        // First attempt refused, second one reconnects on the next poll.
        assert!(source.capture().is_none());
        assert_eq!(source.connection().reconnect_count, 1);
        assert!(source.capture().is_some());
        assert_eq!(source.state(), ConnectionState::Streaming);
        assert_eq!(source.connection().reconnect_count, 0);
        assert_eq!(connector.opens(), 3);
        Ok(())
    }

    #[test]
    fn stopped_source_neither_reads_nor_replays_stale_frames() -> Result<()> {
        let connector = ScriptedConnector::with_read_time(
            &[Script::Frames(1_000_000)],
            Duration::from_millis(100),
        );
        let mut source = RtspSource::with_connector("cam", connector.clone());
        source.initialize(&params(json!({})))?;
        source.start();
        assert!(source.capture().is_some());

        // Stop while the ingestion thread is in the middle of a read.
        std::thread::sleep(Duration::from_millis(150));
        source.stop();
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(source.buffer.len(), 0);
        let reads_while_stopped = connector.reads();
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(connector.reads(), reads_while_stopped);
        assert!(source.capture().is_none());

        // Resuming starts from an empty buffer, then fresh frames arrive.
        source.start();
        assert!(source.capture().is_none());
        let deadline = Instant::now() + Duration::from_secs(2);
        let frame = loop {
            if let Some(frame) = source.capture() {
                break frame;
            }
            assert!(Instant::now() < deadline, "no frame after resume");
            std::thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(frame.dimensions(), (64, 48));
        assert!(connector.reads() > reads_while_stopped);
        assert_eq!(source.info().frames_delivered, 2);
        source.release();
        Ok(())
    }

    #[test]
    fn abandoned_thread_cannot_overwrite_released_state() -> Result<()> {
        let (open_gate, gate) = mpsc::channel();
        let connector = Arc::new(GatedConnector {
            gate: Mutex::new(Some(gate)),
        });
        let mut source = RtspSource::with_connector("cam", connector);
        source.initialize(&params(json!({})))?;
        source.start();
        assert!(source.capture().is_some());
        // Let the ingestion thread block on its next read.
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        source.release();
        assert!(started.elapsed() >= RELEASE_JOIN_TIMEOUT);
        assert_eq!(source.state(), ConnectionState::Disconnected);

        // The leaked thread now completes its read and publishes.
        open_gate.send(()).ok();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(source.state(), ConnectionState::Disconnected);
        assert_eq!(source.connection().buffered, 0);
        assert!(source.capture().is_none());
        Ok(())
    }

    #[test]
    fn set_config_rejects_bad_values_and_unknown_keys() -> Result<()> {
        let mut source = RtspSource::with_connector("cam", ScriptedConnector::new(&[]));
        let patch = params(json!({ "buffer_size": 0 }));
        let err = source.set_config(&patch).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::InvalidField { field, .. }) if field == "buffer_size"
        ));

        let mut patch = SourceParams::new();
        patch.insert("bitrate".into(), json!(2_500_000));
        assert!(source.set_config(&patch).is_err());
        Ok(())
    }

    #[test]
    fn set_config_resizes_live_buffer() -> Result<()> {
        let connector = ScriptedConnector::new(&[Script::Frames(1_000_000)]);
        let mut source = RtspSource::with_connector("cam", connector);
        source.initialize(&params(json!({})))?;
        let mut patch = SourceParams::new();
        patch.insert("buffer_size".into(), json!(2));
        source.set_config(&patch)?;
        std::thread::sleep(Duration::from_millis(20));
        assert!(source.buffer.len() <= 2);
        assert_eq!(source.config().buffer_size, 2);
        source.release();
        Ok(())
    }

    #[test]
    fn unbounded_retries_are_configurable() -> Result<()> {
        let mut source = RtspSource::with_connector("cam", ScriptedConnector::new(&[]));
        let mut patch = params(json!({ "reconnect_attempts": null }));
        patch.remove("reconnect_delay");
        source.set_config(&patch)?;
        assert_eq!(source.config().reconnect_attempts, None);
        Ok(())
    }

    #[test]
    fn release_is_idempotent() -> Result<()> {
        let connector = ScriptedConnector::new(&[Script::Frames(1_000_000)]);
        let mut source = RtspSource::with_connector("cam", connector);
        source.initialize(&params(json!({})))?;
        source.release();
        source.release();
        assert_eq!(source.state(), ConnectionState::Disconnected);
        assert!(source.capture().is_none());
        Ok(())
    }

    #[test]
    fn rejects_unsupported_scheme() {
        let mut source = RtspSource::with_connector("cam", ScriptedConnector::new(&[]));
        let mut bad = SourceParams::new();
        bad.insert("url".into(), json!("ftp://camera/stream"));
        let err = source.initialize(&bad).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::InvalidField { field, .. }) if field == "url"
        ));
    }
}
