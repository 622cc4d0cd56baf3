use anyhow::{Context, Result};
use serde::Serialize;
use std::borrow::Cow;
use std::io;
use std::net::{SocketAddr, UdpSocket};

use super::color::encode_pixels;
use super::config::StreamConfig;
use super::header::{PacketHeader, HEADER_LEN};
use crate::frame::Frame;

/// Turns frames into datagrams. Owns the frame id counter.
#[derive(Clone, Debug)]
pub struct FrameEncoder {
    config: StreamConfig,
    frame_id: u16,
}

impl FrameEncoder {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            frame_id: 0,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Id the next encoded frame will carry.
    pub fn next_frame_id(&self) -> u16 {
        self.frame_id
    }

    /// Encode one frame into its packet sequence, in row order, and advance
    /// the frame id (wrapping at 65536).
    pub fn encode(&mut self, frame: &Frame) -> Vec<Vec<u8>> {
        let side = self.config.resolution().side();
        let frame: Cow<'_, Frame> = if frame.dimensions() == (side, side) {
            Cow::Borrowed(frame)
        } else {
            Cow::Owned(frame.resized(side, side))
        };

        let color = self.config.color();
        let rows_per_packet = self.config.rows_per_packet();
        let payload_capacity =
            usize::from(rows_per_packet.get()) * side as usize * color.bytes_per_pixel();
        let mut packets = Vec::with_capacity(self.config.packets_per_frame());

        let mut start_row = 0u32;
        while start_row < side {
            let rows = rows_per_packet.min_with(side - start_row);
            let header = PacketHeader {
                frame_id: self.frame_id,
                start_row: start_row as u16,
                resolution: self.config.resolution(),
                color,
                rows,
            };
            let mut packet = Vec::with_capacity(HEADER_LEN + payload_capacity);
            packet.extend_from_slice(&header.to_bytes());
            encode_pixels(
                frame.rows(start_row, u32::from(rows.get())),
                color,
                &mut packet,
            );
            packets.push(packet);
            start_row += u32::from(rows.get());
        }

        self.frame_id = self.frame_id.wrapping_add(1);
        packets
    }
}

/// Where datagrams go. A failed send is a lost packet, never retried.
pub trait DatagramSink {
    fn send_datagram(&mut self, datagram: &[u8]) -> io::Result<()>;
}

/// Connected UDP socket.
pub struct UdpSink {
    socket: UdpSocket,
}

impl UdpSink {
    pub fn connect(target: SocketAddr) -> Result<Self> {
        let bind: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).context("bind UDP socket")?;
        socket
            .connect(target)
            .with_context(|| format!("connect UDP socket to {}", target))?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("UDP socket local address")
    }
}

impl DatagramSink for UdpSink {
    fn send_datagram(&mut self, datagram: &[u8]) -> io::Result<()> {
        let sent = self.socket.send(datagram)?;
        if sent != datagram.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("sent {} of {} bytes", sent, datagram.len()),
            ));
        }
        Ok(())
    }
}

/// In-memory sink; collects datagrams in order.
impl DatagramSink for Vec<Vec<u8>> {
    fn send_datagram(&mut self, datagram: &[u8]) -> io::Result<()> {
        self.push(datagram.to_vec());
        Ok(())
    }
}

/// Outcome of sending one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SendReport {
    pub frame_id: u16,
    pub packets: usize,
    pub bytes: usize,
    /// Datagrams the sink refused. They are not resent.
    pub failed: usize,
}

/// Cumulative counters across frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SendTotals {
    pub frames: u64,
    pub packets: u64,
    pub bytes: u64,
    pub failed: u64,
}

/// Encoder plus paced transmission.
pub struct FrameSender<S: DatagramSink = UdpSink> {
    encoder: FrameEncoder,
    sink: S,
    totals: SendTotals,
}

impl FrameSender<UdpSink> {
    pub fn udp(config: StreamConfig) -> Result<Self> {
        let sink = UdpSink::connect(config.target())?;
        log::info!(
            "sending {} {} frames to {} ({} rows/packet, {:?} between packets)",
            config.resolution(),
            config.color(),
            config.target(),
            config.rows_per_packet().get(),
            config.inter_packet_delay()
        );
        Ok(Self::with_sink(config, sink))
    }
}

impl<S: DatagramSink> FrameSender<S> {
    pub fn with_sink(config: StreamConfig, sink: S) -> Self {
        Self {
            encoder: FrameEncoder::new(config),
            sink,
            totals: SendTotals::default(),
        }
    }

    /// Encode and transmit one frame, sleeping the inter-packet delay after
    /// every datagram. Send failures are counted, not retried.
    pub fn send_frame(&mut self, frame: &Frame) -> SendReport {
        let frame_id = self.encoder.next_frame_id();
        let packets = self.encoder.encode(frame);
        let delay = self.encoder.config().inter_packet_delay();

        let mut report = SendReport {
            frame_id,
            ..SendReport::default()
        };
        for packet in &packets {
            match self.sink.send_datagram(packet) {
                Ok(()) => {
                    report.packets += 1;
                    report.bytes += packet.len();
                }
                Err(err) => {
                    report.failed += 1;
                    log::debug!("frame {}: datagram dropped: {}", frame_id, err);
                }
            }
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }
        if report.failed > 0 {
            log::debug!(
                "frame {}: {} of {} datagrams failed",
                frame_id,
                report.failed,
                packets.len()
            );
        }

        self.totals.frames += 1;
        self.totals.packets += report.packets as u64;
        self.totals.bytes += report.bytes as u64;
        self.totals.failed += report.failed as u64;
        report
    }

    pub fn totals(&self) -> SendTotals {
        self.totals
    }

    pub fn config(&self) -> &StreamConfig {
        self.encoder.config()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}
