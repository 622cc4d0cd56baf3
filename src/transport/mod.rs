//! Frame transport to the display receiver.
//!
//! A frame is resized to the configured square resolution, packed to the wire
//! colour encoding and split into row groups. Each group goes out as one UDP
//! datagram: a 5-byte [`PacketHeader`] followed by the packed rows. Packets
//! are paced by a fixed inter-packet delay. Nothing is acknowledged or
//! retransmitted; a lost datagram leaves those rows unpainted for that frame.

mod color;
mod config;
mod encoder;
mod header;

pub use color::{encode_pixels, pack_rgb332, pack_rgb565};
pub use config::{
    StreamConfig, TransportProfile, DEFAULT_MAX_DATAGRAM_BYTES, ETHERNET_MAX_DATAGRAM_BYTES,
};
pub use encoder::{DatagramSink, FrameEncoder, FrameSender, SendReport, SendTotals, UdpSink};
pub use header::{
    ColorEncoding, PacketHeader, Resolution, RowCount, HEADER_LEN, MAX_ROWS_PER_PACKET,
};
