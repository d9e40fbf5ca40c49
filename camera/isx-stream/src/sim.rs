//! A stand-in for the acquisition hub.
//!
//! Builds frames in the hub's wire layout, splits them into RFC 4175 RTP
//! packets and sends them over UDP. Used for testing and for bench work
//! without hardware.

use std::net::{SocketAddr, UdpSocket};

use byteorder::{ByteOrder, LittleEndian};
use tracing::{error, warn};

use crate::geometry::{FRAME_COUNTER_WORDS, PGROUP_BYTES, RECORD_FLAG_VALUE, StreamGeometry};
use crate::rtp::{LineSegment, RtpHeaderFields, write_raw_video_payload, write_rtp_header};
use crate::{Error, Result};

/// Dynamic RTP payload type used for the raw video stream.
pub const PAYLOAD_TYPE: u8 = 96;
/// RTP clock rate for video.
pub const RTP_CLOCK_HZ: u32 = 90_000;
/// Payload size that keeps packets within a 1500 byte Ethernet MTU.
pub const DEFAULT_MAX_PAYLOAD: usize = 1400;

const EXT_SEQ_LEN: usize = 2;
const LINE_HEADER_LEN: usize = 6;

/// Image and metadata of one frame to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticFrame {
    pub seq_id: u32,
    pub isxd_record: bool,
    /// `image_width * image_height` samples, row major.
    pub image: Vec<u16>,
}

impl SyntheticFrame {
    pub fn from_fn<F>(geometry: &StreamGeometry, seq_id: u32, isxd_record: bool, f: F) -> Self
    where
        F: Fn(u32, u32) -> u16,
    {
        let mut image = Vec::with_capacity(geometry.image_len());
        for y in 0..geometry.image_height {
            for x in 0..geometry.image_width {
                image.push(f(x, y));
            }
        }
        Self {
            seq_id,
            isxd_record,
            image,
        }
    }

    /// Lay out the frame as the hub sends it.
    pub fn to_wire_bytes(&self, geometry: &StreamGeometry) -> Result<Vec<u8>> {
        if self.image.len() != geometry.image_len() {
            return Err(Error::FrameSizeMismatch {
                expected: geometry.image_len(),
                actual: self.image.len(),
            });
        }
        let w = geometry.view16_width() as usize;
        let mut view = vec![0u16; w * geometry.view16_height() as usize];

        let image_start = geometry.header_offset as usize * w;
        view[image_start..image_start + self.image.len()].copy_from_slice(&self.image);

        let meta_start = geometry.meta_row as usize * w;
        for i in 0..FRAME_COUNTER_WORDS {
            let byte = (self.seq_id >> (8 * i)) & 0xFF;
            view[meta_start + (geometry.frame_counter_col + i) as usize] = (byte << 4) as u16;
        }
        view[meta_start + geometry.record_flag_col as usize] = if self.isxd_record {
            RECORD_FLAG_VALUE
        } else {
            0
        };

        let mut data = vec![0u8; view.len() * 2];
        LittleEndian::write_u16_into(&view, &mut data);
        Ok(data)
    }
}

/// Splits frames into RTP packets.
pub struct Packetizer {
    width: usize,
    height: usize,
    stride: usize,
    max_payload: usize,
    ssrc: u32,
    seq: u32,
}

impl Packetizer {
    pub fn new(geometry: &StreamGeometry, max_payload: usize) -> Self {
        let min_payload = EXT_SEQ_LEN + LINE_HEADER_LEN + PGROUP_BYTES as usize;
        Self {
            width: geometry.rtp_width as usize,
            height: geometry.rtp_height as usize,
            stride: geometry.rtp_stride(),
            max_payload: max_payload.max(min_payload),
            ssrc: 0x1D45_0001,
            seq: 0,
        }
    }

    /// Split one frame of wire bytes into packets. The last packet carries
    /// the marker bit.
    pub fn packetize(&mut self, data: &[u8], rtp_timestamp: u32) -> Vec<Vec<u8>> {
        let pgroup = PGROUP_BYTES as usize;
        let mut packets = Vec::new();
        let mut line = 0;
        let mut offset = 0;

        while line < self.height {
            let mut budget = self.max_payload - EXT_SEQ_LEN;
            let mut segments = Vec::new();
            while line < self.height && budget >= LINE_HEADER_LEN + pgroup {
                budget -= LINE_HEADER_LEN;
                let n_px = (self.width - offset).min(budget / pgroup);
                let len = n_px * pgroup;
                let start = line * self.stride + offset * pgroup;
                segments.push(LineSegment {
                    line: line as u16,
                    offset: offset as u16,
                    data: &data[start..start + len],
                });
                budget -= len;
                offset += n_px;
                if offset == self.width {
                    line += 1;
                    offset = 0;
                }
            }

            let mut buf = Vec::with_capacity(12 + self.max_payload);
            write_rtp_header(
                &mut buf,
                &RtpHeaderFields {
                    marker: line >= self.height,
                    payload_type: PAYLOAD_TYPE,
                    sequence_number: self.seq as u16,
                    timestamp: rtp_timestamp,
                    ssrc: self.ssrc,
                },
            );
            write_raw_video_payload(&mut buf, (self.seq >> 16) as u16, &segments);
            packets.push(buf);
            self.seq = self.seq.wrapping_add(1);
        }
        packets
    }
}

/// Sends synthetic frames to a UDP destination.
pub struct StreamSimulator {
    socket: UdpSocket,
    dest: SocketAddr,
    geometry: StreamGeometry,
    packetizer: Packetizer,
    fps: f64,
    n_sent: u64,
}

impl StreamSimulator {
    pub fn new(dest: SocketAddr, downsample_factor: u32, fps: f64) -> Result<Self> {
        let geometry = StreamGeometry::new(downsample_factor)?;
        let bind_addr: SocketAddr = if dest.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr)?;
        Ok(Self {
            socket,
            dest,
            geometry,
            packetizer: Packetizer::new(&geometry, DEFAULT_MAX_PAYLOAD),
            fps,
            n_sent: 0,
        })
    }

    pub fn geometry(&self) -> &StreamGeometry {
        &self.geometry
    }

    /// Send one frame. Packets the OS refuses to queue are dropped with a
    /// warning, as the hub would.
    pub fn send_frame(&mut self, frame: &SyntheticFrame) -> Result<()> {
        let data = frame.to_wire_bytes(&self.geometry)?;
        let ticks = (self.n_sent as f64 * RTP_CLOCK_HZ as f64 / self.fps) as u64;
        let rtp_timestamp = ticks as u32;
        for packet in self.packetizer.packetize(&data, rtp_timestamp) {
            match self.socket.send_to(&packet, self.dest) {
                Ok(sz) => {
                    if sz != packet.len() {
                        return Err(Error::IncompleteSend);
                    }
                }
                Err(err) => match err.kind() {
                    std::io::ErrorKind::WouldBlock => {
                        warn!("WouldBlock: dropping packet");
                    }
                    std::io::ErrorKind::ConnectionRefused => {
                        warn!("ConnectionRefused: dropping packet");
                    }
                    _ => {
                        error!("error sending packet: {:?}", err);
                        return Err(err.into());
                    }
                },
            }
        }
        self.n_sent += 1;
        Ok(())
    }

    /// Number of frames sent so far.
    pub fn n_sent(&self) -> u64 {
        self.n_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packets_respect_payload_limit() {
        let g = StreamGeometry::new(4).unwrap();
        let data = vec![0u8; g.frame_size_bytes()];
        let mut packetizer = Packetizer::new(&g, 1000);
        let packets = packetizer.packetize(&data, 0);
        for pkt in &packets {
            assert!(pkt.len() <= 12 + 1000);
        }
        let n_markers = packets.iter().filter(|p| p[1] & 0x80 != 0).count();
        assert_eq!(n_markers, 1);
        assert!(packets.last().unwrap()[1] & 0x80 != 0);
    }

    #[test]
    fn sequence_numbers_continue_across_frames() {
        let g = StreamGeometry::new(8).unwrap();
        let data = vec![0u8; g.frame_size_bytes()];
        let mut packetizer = Packetizer::new(&g, DEFAULT_MAX_PAYLOAD);
        let a = packetizer.packetize(&data, 0);
        let b = packetizer.packetize(&data, 3000);
        let seq = |p: &Vec<u8>| u16::from_be_bytes([p[2], p[3]]);
        assert_eq!(seq(&b[0]), seq(a.last().unwrap()).wrapping_add(1));
    }

    #[test]
    fn wrong_image_size() {
        let g = StreamGeometry::new(8).unwrap();
        let frame = SyntheticFrame {
            seq_id: 1,
            isxd_record: false,
            image: vec![0; 3],
        };
        assert!(matches!(
            frame.to_wire_bytes(&g),
            Err(Error::FrameSizeMismatch { actual: 3, .. })
        ));
    }
}
