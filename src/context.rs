//! The capture → encode → send loop, as an explicitly constructed object.
//!
//! A [`StreamContext`] owns the source registry, the frame sender and the frame
//! governor. Nothing is global, so tests can run several pipelines side by side.

use anyhow::{anyhow, Context, Result};
use std::time::{Duration, Instant};

use crate::config::StreamerConfig;
use crate::ingest::SourceRegistry;
use crate::transport::{DatagramSink, FrameSender, SendReport, SendTotals, UdpSink};

/// Paces loop iterations to a target rate.
///
/// Deadlines that have already passed are dropped rather than caught up, so a
/// slow iteration never causes a burst.
#[derive(Debug, Clone)]
pub struct FrameGovernor {
    interval: Duration,
    next: Option<Instant>,
}

impl FrameGovernor {
    pub fn new(fps: f64) -> Self {
        Self {
            interval: interval_for(fps),
            next: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_fps(&mut self, fps: f64) {
        self.interval = interval_for(fps);
        self.next = None;
    }

    /// Block until the next deadline. The first call returns immediately.
    pub fn wait(&mut self) {
        let now = Instant::now();
        match self.next {
            Some(deadline) if deadline > now => {
                std::thread::sleep(deadline - now);
                self.next = Some(deadline + self.interval);
            }
            _ => self.next = Some(now + self.interval),
        }
    }
}

fn interval_for(fps: f64) -> Duration {
    if fps.is_finite() && fps > 0.0 {
        Duration::from_secs_f64(1.0 / fps)
    } else {
        Duration::ZERO
    }
}

/// Loop counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleStats {
    pub cycles: u64,
    pub frames_sent: u64,
    /// Cycles where the active source had nothing to deliver.
    pub empty_polls: u64,
}

pub struct StreamContext<S: DatagramSink = UdpSink> {
    registry: SourceRegistry,
    sender: FrameSender<S>,
    governor: FrameGovernor,
    stats: CycleStats,
}

impl StreamContext<UdpSink> {
    /// Create the configured sources and a UDP sender for the configured target.
    pub fn from_config(cfg: &StreamerConfig) -> Result<Self> {
        let sender = FrameSender::udp(cfg.stream_config()?)?;
        Self::build(cfg, SourceRegistry::new(), sender)
    }
}

impl<S: DatagramSink> StreamContext<S> {
    pub fn new(registry: SourceRegistry, sender: FrameSender<S>, fps: f64) -> Self {
        Self {
            registry,
            sender,
            governor: FrameGovernor::new(fps),
            stats: CycleStats::default(),
        }
    }

    /// Populate `registry` from `cfg` and wrap it with `sender`.
    ///
    /// A source that fails to initialize is logged and skipped. Failing to
    /// activate the configured `active_source`, or ending up with no source
    /// at all, is an error.
    pub fn build(
        cfg: &StreamerConfig,
        mut registry: SourceRegistry,
        sender: FrameSender<S>,
    ) -> Result<Self> {
        for entry in cfg.enabled_sources() {
            if let Err(err) = registry.create_source(&entry.descriptor) {
                log::warn!("skipping source: {:#}", err);
            }
        }
        if registry.is_empty() {
            return Err(anyhow!("no source could be created"));
        }
        if let Some(active) = &cfg.active_source {
            registry
                .switch_source(active)
                .with_context(|| format!("activate source '{}'", active))?;
        }
        log::info!(
            "streaming source {} at {} fps",
            registry.active_id().unwrap_or("-"),
            cfg.fps
        );
        Ok(Self::new(registry, sender, cfg.fps))
    }

    /// Wait for the next frame slot, then run one cycle.
    pub fn tick(&mut self) -> Option<SendReport> {
        self.governor.wait();
        self.run_cycle()
    }

    /// Capture from the active source and send the frame, if there is one.
    pub fn run_cycle(&mut self) -> Option<SendReport> {
        self.stats.cycles += 1;
        let Some(frame) = self.registry.capture_frame(None) else {
            self.stats.empty_polls += 1;
            return None;
        };
        let report = self.sender.send_frame(&frame);
        self.stats.frames_sent += 1;
        Some(report)
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut SourceRegistry {
        &mut self.registry
    }

    pub fn sender(&self) -> &FrameSender<S> {
        &self.sender
    }

    pub fn governor_mut(&mut self) -> &mut FrameGovernor {
        &mut self.governor
    }

    pub fn stats(&self) -> CycleStats {
        self.stats
    }

    pub fn send_totals(&self) -> SendTotals {
        self.sender.totals()
    }

    /// Release every source. The context can be dropped afterwards.
    pub fn shutdown(&mut self) {
        log::info!(
            "shutting down after {} frames ({} packets, {} failed)",
            self.stats.frames_sent,
            self.sender.totals().packets,
            self.sender.totals().failed
        );
        self.registry.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{PacketHeader, StreamConfig, TransportProfile};
    use serde_json::json;
    use std::net::SocketAddr;

    fn sender() -> FrameSender<Vec<Vec<u8>>> {
        let profile = TransportProfile {
            inter_packet_delay: Duration::ZERO,
            ..TransportProfile::named("ld-low").unwrap()
        };
        let config = StreamConfig::new(SocketAddr::from(([127, 0, 0, 1], 9)), profile).unwrap();
        FrameSender::with_sink(config, Vec::new())
    }

    fn config(value: serde_json::Value) -> StreamerConfig {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("framecast.json");
        std::fs::write(&path, value.to_string()).unwrap();
        StreamerConfig::load_from(Some(&path)).unwrap()
    }

    #[test]
    fn governor_first_wait_is_immediate_and_paces_after() {
        let mut governor = FrameGovernor::new(50.0);
        let started = Instant::now();
        governor.wait();
        assert!(started.elapsed() < Duration::from_millis(15));
        governor.wait();
        governor.wait();
        assert!(started.elapsed() >= Duration::from_millis(39));
    }

    #[test]
    fn governor_drops_missed_deadlines() {
        let mut governor = FrameGovernor::new(100.0);
        governor.wait();
        std::thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        governor.wait();
        assert!(started.elapsed() < Duration::from_millis(5));
    }

    #[test]
    fn cycle_sends_active_source_frames() -> Result<()> {
        let cfg = config(json!({
            "sources": [
                { "type": "synthetic", "id": "bars" },
                { "type": "synthetic", "id": "small", "params": { "width": 64, "height": 64 } }
            ],
            "active_source": "small"
        }));
        let mut context = StreamContext::build(&cfg, SourceRegistry::new(), sender())?;
        assert_eq!(context.registry().active_id(), Some("small"));

        let report = context.run_cycle().expect("frame sent");
        assert_eq!(report.packets, 30);
        assert_eq!(report.frame_id, 0);
        let sent = &context.sender().sink()[0];
        assert_eq!(PacketHeader::decode(sent)?.start_row, 0);

        context.registry_mut().switch_source("bars")?;
        assert_eq!(context.run_cycle().map(|r| r.frame_id), Some(1));
        assert_eq!(context.stats().frames_sent, 2);
        context.shutdown();
        Ok(())
    }

    #[test]
    fn failing_sources_are_skipped() -> Result<()> {
        let cfg = config(json!({
            "sources": [
                { "type": "screen", "id": "desktop" },
                { "type": "synthetic", "id": "bars" }
            ]
        }));
        let context = StreamContext::build(&cfg, SourceRegistry::new(), sender())?;
        assert_eq!(context.registry().len(), 1);
        assert_eq!(context.registry().active_id(), Some("bars"));
        Ok(())
    }

    #[test]
    fn unusable_active_source_is_an_error() {
        let cfg = config(json!({
            "sources": [
                { "type": "screen", "id": "desktop" },
                { "type": "synthetic", "id": "bars" }
            ],
            "active_source": "desktop"
        }));
        assert!(StreamContext::build(&cfg, SourceRegistry::new(), sender()).is_err());

        let none = config(json!({ "sources": [{ "type": "video-file", "id": "clip" }] }));
        assert!(StreamContext::build(&none, SourceRegistry::new(), sender()).is_err());
    }
}
