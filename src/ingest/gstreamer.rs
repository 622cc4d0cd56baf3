//! GStreamer-backed upstream for rtsp(s):// and http(s):// URLs.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use std::time::Duration;

use super::rtsp::RtspTransport;
use super::stream::{StreamTarget, VideoStream};
use crate::frame::{Frame, CHANNELS};

/// Once frames are flowing, a read that waits longer than this is a stall.
const STALL_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) struct GstreamerStream {
    url: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    connect_timeout: Duration,
    frames: u64,
    fps: Option<f64>,
}

impl GstreamerStream {
    pub(crate) fn open(target: &StreamTarget) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let description = pipeline_description(target);
        let pipeline = gstreamer::parse::launch(&description)
            .context("build stream pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("stream pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set stream pipeline to Playing")?;
        log::info!("RtspSource: pipeline playing for {}", target.url);

        Ok(Self {
            url: target.url.clone(),
            pipeline,
            appsink,
            connect_timeout: target.timeout,
            frames: 0,
            fps: None,
        })
    }

    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => return Err(anyhow!("{} reached end of stream", self.url)),
                _ => {}
            }
        }
        Ok(())
    }
}

impl VideoStream for GstreamerStream {
    fn read_frame(&mut self) -> Result<Frame> {
        self.check_bus()?;

        // The first frame may take the whole connection timeout (RTSP setup,
        // waiting for a keyframe); later ones must keep up.
        let timeout = if self.frames == 0 {
            self.connect_timeout
        } else {
            STALL_TIMEOUT
        };
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(timeout_ms))
            .ok_or_else(|| anyhow!("no frame from {} within {:?}", self.url, timeout))?;

        let (pixels, width, height, fps) = sample_to_pixels(&sample)?;
        if fps.is_some() {
            self.fps = fps;
        }
        self.frames += 1;
        Frame::new(pixels, width, height)
    }

    fn stream_fps(&self) -> Option<f64> {
        self.fps
    }
}

impl Drop for GstreamerStream {
    fn drop(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("RtspSource: failed to stop pipeline for {}: {}", self.url, err);
        }
    }
}

fn pipeline_description(target: &StreamTarget) -> String {
    let source = if target.url.starts_with("rtsp") {
        let protocols = match target.transport {
            RtspTransport::Tcp => "tcp",
            RtspTransport::Udp => "udp",
        };
        format!(
            "rtspsrc location=\"{}\" latency=0 protocols={} timeout={}",
            target.url,
            protocols,
            target.timeout.as_micros()
        )
    } else {
        format!(
            "souphttpsrc location=\"{}\" is-live=true timeout={}",
            target.url,
            target.timeout.as_secs().max(1)
        )
    };
    format!(
        "{} ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
         appsink name=appsink sync=false max-buffers=1 drop=true",
        source
    )
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32, Option<f64>)> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let fps = {
        let fraction = info.fps();
        (fraction.numer() > 0 && fraction.denom() > 0)
            .then(|| f64::from(fraction.numer()) / f64::from(fraction.denom()))
    };
    let row_bytes = width as usize * CHANNELS;
    let stride = usize::try_from(info.stride()[0]).context("negative row stride")?;

    let map = buffer.map_readable().context("map sample buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data.get(..len).context("sample buffer is short")?;
        return Ok((pixels.to_vec(), width, height, fps));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("sample buffer row is out of bounds")?,
        );
    }
    Ok((pixels, width, height, fps))
}
