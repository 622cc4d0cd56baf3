use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;

use super::header::{ColorEncoding, Resolution, RowCount, HEADER_LEN, MAX_ROWS_PER_PACKET};
use crate::error::ConfigError;

/// Largest payload a single IPv4 UDP datagram can carry. Every valid row
/// count fits under it, so by default only the 4-bit row field limits packets.
pub const DEFAULT_MAX_DATAGRAM_BYTES: usize = 65_507;

/// Largest UDP payload that fits one Ethernet frame without fragmentation.
/// Opt in through `max_datagram_bytes` for receivers that drop fragments.
pub const ETHERNET_MAX_DATAGRAM_BYTES: usize = 1472;

/// Unvalidated transport settings, as read from configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TransportProfile {
    pub resolution: Resolution,
    pub color: ColorEncoding,
    pub rows_per_packet: u32,
    pub inter_packet_delay: Duration,
    pub max_datagram_bytes: usize,
}

impl TransportProfile {
    const fn preset(
        resolution: Resolution,
        color: ColorEncoding,
        rows_per_packet: u32,
        delay_us: u64,
    ) -> Self {
        Self {
            resolution,
            color,
            rows_per_packet,
            inter_packet_delay: Duration::from_micros(delay_us),
            max_datagram_bytes: DEFAULT_MAX_DATAGRAM_BYTES,
        }
    }

    /// Combinations the receiver firmware is known to keep up with.
    pub const PRESETS: [(&'static str, TransportProfile); 6] = [
        ("hd-full", Self::preset(Resolution::R240, ColorEncoding::Rgb565, 3, 500)),
        ("hd-low", Self::preset(Resolution::R240, ColorEncoding::Rgb332, 6, 500)),
        ("md-full", Self::preset(Resolution::R180, ColorEncoding::Rgb565, 4, 500)),
        ("md-low", Self::preset(Resolution::R180, ColorEncoding::Rgb332, 6, 750)),
        ("ld-full", Self::preset(Resolution::R120, ColorEncoding::Rgb565, 4, 750)),
        ("ld-low", Self::preset(Resolution::R120, ColorEncoding::Rgb332, 4, 750)),
    ];

    pub fn named(name: &str) -> Result<Self, ConfigError> {
        Self::PRESETS
            .iter()
            .find(|(preset, _)| *preset == name)
            .map(|(_, profile)| *profile)
            .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))
    }

    pub fn preset_names() -> impl Iterator<Item = &'static str> {
        Self::PRESETS.iter().map(|(name, _)| *name)
    }

    /// Wire size of a full packet.
    pub fn packet_bytes(&self) -> usize {
        let rows = self.rows_per_packet as usize;
        HEADER_LEN + rows * self.resolution.side() as usize * self.color.bytes_per_pixel()
    }

    pub fn validate(&self) -> Result<RowCount, ConfigError> {
        let rows = RowCount::new(self.rows_per_packet).map_err(|_| ConfigError::RowsPerPacket {
            value: self.rows_per_packet,
            max: MAX_ROWS_PER_PACKET,
        })?;
        let size = self.packet_bytes();
        if size > self.max_datagram_bytes {
            return Err(ConfigError::DatagramTooLarge {
                size,
                limit: self.max_datagram_bytes,
            });
        }
        if self.inter_packet_delay > Duration::from_secs(1) {
            return Err(ConfigError::field(
                "inter_packet_delay_ms",
                format!(
                    "must be at most 1000 ms, got {} ms",
                    self.inter_packet_delay.as_secs_f64() * 1000.0
                ),
            ));
        }
        Ok(rows)
    }
}

impl Default for TransportProfile {
    fn default() -> Self {
        Self::PRESETS[0].1
    }
}

/// Validated transport configuration. Only constructible through [`StreamConfig::new`],
/// so an encoder never sees an invalid combination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    target: SocketAddr,
    resolution: Resolution,
    color: ColorEncoding,
    rows_per_packet: RowCount,
    inter_packet_delay: Duration,
}

impl StreamConfig {
    pub fn new(target: SocketAddr, profile: TransportProfile) -> Result<Self, ConfigError> {
        let rows_per_packet = profile.validate()?;
        Ok(Self {
            target,
            resolution: profile.resolution,
            color: profile.color,
            rows_per_packet,
            inter_packet_delay: profile.inter_packet_delay,
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn color(&self) -> ColorEncoding {
        self.color
    }

    pub fn rows_per_packet(&self) -> RowCount {
        self.rows_per_packet
    }

    pub fn inter_packet_delay(&self) -> Duration {
        self.inter_packet_delay
    }

    /// Packets needed for one frame.
    pub fn packets_per_frame(&self) -> usize {
        let side = self.resolution.side() as usize;
        let rows = usize::from(self.rows_per_packet.get());
        side.div_ceil(rows)
    }
}
