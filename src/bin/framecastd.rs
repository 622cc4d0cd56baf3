//! framecastd - stream frames to a UDP display receiver
//!
//! This daemon:
//! 1. Loads the stream configuration (file, env, flags)
//! 2. Creates the configured sources and activates one
//! 3. Captures, encodes and sends one frame per tick at the configured rate
//! 4. Releases every source on Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use framecast::{StreamContext, StreamerConfig, TransportProfile};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream frames to a UDP display receiver")]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "FRAMECAST_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Receiver address (host:port). Overrides the configuration file.
    #[arg(long, value_name = "HOST:PORT")]
    target: Option<String>,

    /// Transport preset (see --list-profiles).
    #[arg(long, value_name = "NAME")]
    profile: Option<String>,

    /// Source id to activate at startup.
    #[arg(long, value_name = "ID")]
    source: Option<String>,

    /// Print the transport presets and exit.
    #[arg(long)]
    list_profiles: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.list_profiles {
        for (name, profile) in TransportProfile::PRESETS {
            println!(
                "{:<8} {} {} rows/packet={} delay={:?} packet={}B",
                name,
                profile.resolution,
                profile.color,
                profile.rows_per_packet,
                profile.inter_packet_delay,
                profile.packet_bytes()
            );
        }
        return Ok(());
    }

    let mut cfg = StreamerConfig::load_from(args.config.as_deref())?;
    if args.target.is_some() || args.profile.is_some() || args.source.is_some() {
        if let Some(target) = args.target {
            cfg.target = target;
        }
        if let Some(profile) = args.profile {
            cfg.profile = profile;
        }
        if let Some(source) = args.source {
            cfg.active_source = Some(source);
        }
        cfg.validate()?;
    }

    let mut context = StreamContext::from_config(&cfg)?;

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        handler_flag.store(false, Ordering::SeqCst);
    })
    .expect("error setting Ctrl-C handler");

    log::info!(
        "framecastd running. target={} profile={} fps={}",
        cfg.target,
        cfg.profile,
        cfg.fps
    );

    let mut last_health_log = Instant::now();
    while running.load(Ordering::SeqCst) {
        context.tick();

        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            let totals = context.send_totals();
            let stats = context.stats();
            match context.registry().active_info() {
                Some(info) => log::info!(
                    "source={} state={} fps={:.1} frames_sent={} empty_polls={} packets={} failed={}",
                    info.id,
                    info.connection
                        .as_ref()
                        .map_or_else(|| "local".to_string(), |c| c.state.to_string()),
                    info.actual_fps,
                    stats.frames_sent,
                    stats.empty_polls,
                    totals.packets,
                    totals.failed
                ),
                None => log::warn!("no active source"),
            }
            last_health_log = Instant::now();
        }
    }

    log::info!("shutdown signal received, releasing sources...");
    context.shutdown();
    Ok(())
}
