//! framecast
//!
//! Acquires frames from interchangeable sources and streams them to a small
//! remote display over UDP, using a fixed 5-byte packet header that matches
//! the receiver's decoder (square resolution class, packed colour, rows per
//! packet).
//!
//! # Module Structure
//!
//! - `frame`: owned RGB frames and the bounded ring buffer used by ingestion
//! - `ingest`: the source contract, built-in sources and the source registry
//! - `transport`: packet header, colour packing, frame encoder and paced sender
//! - `config`: daemon configuration file, env overrides and transport presets
//! - `context`: the explicitly constructed capture → encode → send loop
//!
//! The protocol is best-effort: nothing is retransmitted, and a lost datagram
//! only means the receiver keeps the previous contents of those rows.

pub mod config;
pub mod context;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod transport;

pub use config::{SourceEntry, StreamerConfig, TransportOverrides};
pub use context::{CycleStats, FrameGovernor, StreamContext};
pub use error::{ConfigError, WireError};
pub use frame::{Frame, FrameBuffer, RingBuffer, SharedRingBuffer};
pub use ingest::{
    ConfigDescriptor, ConnectionSnapshot, ConnectionState, DefaultConnector, FrameSource,
    RtspConfig, RtspSource, RtspTransport, SourceDescriptor, SourceInfo, SourceKind, SourceParams,
    SourceRegistry, StreamConnector, StreamTarget, SyntheticConfig, SyntheticSource, ValueType,
    VideoStream,
};
pub use transport::{
    ColorEncoding, DatagramSink, FrameEncoder, FrameSender, PacketHeader, Resolution, RowCount,
    SendReport, SendTotals, StreamConfig, TransportProfile, UdpSink,
};
