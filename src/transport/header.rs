//! 5-byte packet header.
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 2 | frame id, u16 big-endian |
//! | 2 | 2 | start row, u16 big-endian |
//! | 4 | 1 | flags: bits 7-6 resolution, bits 5-4 colour, bits 3-0 row count |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ConfigError, WireError};

pub const HEADER_LEN: usize = 5;

/// Largest row count the 4-bit field can carry.
pub const MAX_ROWS_PER_PACKET: u8 = 15;

/// Square frame side the receiver decodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Resolution {
    R240,
    R180,
    R120,
}

impl Resolution {
    pub const ALL: [Resolution; 3] = [Resolution::R240, Resolution::R180, Resolution::R120];

    pub fn side(self) -> u32 {
        match self {
            Resolution::R240 => 240,
            Resolution::R180 => 180,
            Resolution::R120 => 120,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Resolution::R240 => 0,
            Resolution::R180 => 1,
            Resolution::R120 => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, WireError> {
        match code {
            0 => Ok(Resolution::R240),
            1 => Ok(Resolution::R180),
            2 => Ok(Resolution::R120),
            other => Err(WireError::ResolutionCode(other)),
        }
    }
}

impl TryFrom<u32> for Resolution {
    type Error = ConfigError;

    fn try_from(side: u32) -> Result<Self, Self::Error> {
        Resolution::ALL
            .into_iter()
            .find(|r| r.side() == side)
            .ok_or(ConfigError::Resolution(side))
    }
}

impl From<Resolution> for u32 {
    fn from(resolution: Resolution) -> Self {
        resolution.side()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.side(), self.side())
    }
}

/// Wire pixel encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorEncoding {
    /// 16 bits per pixel, 5-6-5, big-endian.
    Rgb565,
    /// 8 bits per pixel, 3-3-2.
    Rgb332,
}

impl ColorEncoding {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ColorEncoding::Rgb565 => 2,
            ColorEncoding::Rgb332 => 1,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ColorEncoding::Rgb565 => 0,
            ColorEncoding::Rgb332 => 1,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, WireError> {
        match code {
            0 => Ok(ColorEncoding::Rgb565),
            1 => Ok(ColorEncoding::Rgb332),
            other => Err(WireError::ColorCode(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ColorEncoding::Rgb565 => "rgb565",
            ColorEncoding::Rgb332 => "rgb332",
        }
    }
}

impl fmt::Display for ColorEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColorEncoding {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rgb565" => Ok(ColorEncoding::Rgb565),
            "rgb332" => Ok(ColorEncoding::Rgb332),
            other => Err(ConfigError::ColorMode(other.to_string())),
        }
    }
}

/// Rows carried by one packet, 1..=15.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowCount(u8);

impl RowCount {
    pub fn new(rows: u32) -> Result<Self, WireError> {
        match u8::try_from(rows) {
            Ok(rows) if (1..=MAX_ROWS_PER_PACKET).contains(&rows) => Ok(Self(rows)),
            _ => Err(WireError::RowCount(rows)),
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// This count, or fewer when only `remaining` rows are left.
    pub(crate) fn min_with(self, remaining: u32) -> Self {
        let clipped = u32::from(self.0).min(remaining).max(1);
        Self(clipped as u8)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub frame_id: u16,
    pub start_row: u16,
    pub resolution: Resolution,
    pub color: ColorEncoding,
    pub rows: RowCount,
}

impl PacketHeader {
    pub fn flags(&self) -> u8 {
        (self.resolution.code() << 6) | (self.color.code() << 4) | self.rows.get()
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let id = self.frame_id.to_be_bytes();
        let row = self.start_row.to_be_bytes();
        [id[0], id[1], row[0], row[1], self.flags()]
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let header: &[u8; HEADER_LEN] = bytes
            .get(..HEADER_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or(WireError::Truncated(bytes.len()))?;
        let flags = header[4];
        Ok(Self {
            frame_id: u16::from_be_bytes([header[0], header[1]]),
            start_row: u16::from_be_bytes([header[2], header[3]]),
            resolution: Resolution::from_code(flags >> 6)?,
            color: ColorEncoding::from_code((flags >> 4) & 0b11)?,
            rows: RowCount::new(u32::from(flags & 0x0f))?,
        })
    }
}
