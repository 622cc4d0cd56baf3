//! Upstream video connections.
//!
//! A [`StreamConnector`] opens a [`VideoStream`] for a target URL. The
//! ingestion pipeline only ever talks to these two traits, so the reconnect
//! state machine can be driven by scripted connectors in tests.
//!
//! `stub://name?width=W&height=H&fps=F&fail_after=N` opens an in-process
//! generator that paces itself like a camera and, with `fail_after`, drops the
//! connection after N frames.

use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use url::Url;

use super::rtsp::RtspTransport;
use crate::frame::Frame;

/// Where and how to connect.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamTarget {
    pub url: String,
    pub transport: RtspTransport,
    pub timeout: Duration,
}

/// An open upstream connection. Dropping it releases the connection.
pub trait VideoStream: Send {
    /// Read one decoded frame. Blocks for at most about one frame interval or
    /// the connection's own timeout.
    fn read_frame(&mut self) -> Result<Frame>;

    /// Frame rate advertised by the upstream, when known.
    fn stream_fps(&self) -> Option<f64> {
        None
    }
}

/// Opens upstream connections. Shared between a source and its ingestion thread.
pub trait StreamConnector: Send + Sync {
    fn open(&self, target: &StreamTarget) -> Result<Box<dyn VideoStream>>;
}

/// Connector chosen by URL scheme.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultConnector;

impl StreamConnector for DefaultConnector {
    fn open(&self, target: &StreamTarget) -> Result<Box<dyn VideoStream>> {
        let url = Url::parse(&target.url).context("parse stream url")?;
        match url.scheme() {
            "stub" => Ok(Box::new(StubStream::from_url(&url)?)),
            "rtsp" | "rtsps" | "http" | "https" => {
                #[cfg(feature = "rtsp-gstreamer")]
                {
                    Ok(Box::new(super::gstreamer::GstreamerStream::open(target)?))
                }
                #[cfg(not(feature = "rtsp-gstreamer"))]
                {
                    Err(anyhow!(
                        "{} streams require the rtsp-gstreamer feature",
                        url.scheme()
                    ))
                }
            }
            other => Err(anyhow!(
                "unsupported stream scheme '{}'; expected rtsp(s), http(s) or stub",
                other
            )),
        }
    }
}

/// Schemes [`DefaultConnector`] knows how to open.
pub(crate) const SUPPORTED_SCHEMES: [&str; 5] = ["rtsp", "rtsps", "http", "https", "stub"];

// ----------------------------------------------------------------------------
// Synthetic upstream (stub://)
// ----------------------------------------------------------------------------

pub(crate) struct StubStream {
    name: String,
    width: u32,
    height: u32,
    interval: Duration,
    fps: f64,
    fail_after: Option<u64>,
    frame_count: u64,
}

impl StubStream {
    fn from_url(url: &Url) -> Result<Self> {
        let mut stream = Self {
            name: url.host_str().unwrap_or("stub").to_string(),
            width: 320,
            height: 240,
            interval: Duration::ZERO,
            fps: 25.0,
            fail_after: None,
            frame_count: 0,
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "width" => stream.width = parse_query(&key, &value)?,
                "height" => stream.height = parse_query(&key, &value)?,
                "fps" => stream.fps = parse_query(&key, &value)?,
                "fail_after" => stream.fail_after = Some(parse_query(&key, &value)?),
                other => return Err(anyhow!("unknown stub stream option '{}'", other)),
            }
        }
        if stream.width == 0 || stream.height == 0 {
            return Err(anyhow!("stub stream dimensions must be non-zero"));
        }
        if stream.fps > 0.0 {
            stream.interval = Duration::from_secs_f64(1.0 / stream.fps);
        }
        log::info!(
            "RtspSource: connected to stub://{} ({}x{} @ {} fps)",
            stream.name,
            stream.width,
            stream.height,
            stream.fps
        );
        Ok(stream)
    }
}

impl VideoStream for StubStream {
    fn read_frame(&mut self) -> Result<Frame> {
        if let Some(limit) = self.fail_after {
            if self.frame_count >= limit {
                return Err(anyhow!("stub://{} dropped the connection", self.name));
            }
        }
        if !self.interval.is_zero() {
            std::thread::sleep(self.interval);
        }
        self.frame_count += 1;
        let phase = self.frame_count;
        Ok(Frame::from_fn(self.width, self.height, |x, y| {
            let v = (u64::from(x) + u64::from(y) + phase) % 256;
            [v as u8, (255 - v) as u8, (phase % 256) as u8]
        }))
    }

    fn stream_fps(&self) -> Option<f64> {
        Some(self.fps)
    }
}

fn parse_query<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("invalid stub stream option {}={}", key, value))
}
