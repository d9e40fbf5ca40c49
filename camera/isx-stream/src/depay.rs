//! Reassembly of frames from RFC 4175 packets.

use tracing::{debug, trace};

use crate::geometry::{PGROUP_BYTES, StreamGeometry};
use crate::rtp::{RtpError, RtpPacket, parse_raw_video_payload};

/// A frame as it came off the wire, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFrame {
    pub rtp_timestamp: u32,
    /// RGBA/8 bytes, [StreamGeometry::frame_size_bytes] long.
    pub data: Vec<u8>,
    /// Every byte arrived and no packet was lost.
    pub complete: bool,
}

struct InProgress {
    rtp_timestamp: u32,
    data: Vec<u8>,
    bytes_covered: usize,
    damaged: bool,
}

/// Collects packets into frames.
///
/// A frame ends with the RTP marker bit. A packet with a new timestamp
/// finishes the previous frame as incomplete.
pub struct Depayloader {
    stride: usize,
    width: usize,
    height: usize,
    frame_size: usize,
    last_seq: Option<u16>,
    current: Option<InProgress>,
}

impl Depayloader {
    pub fn new(geometry: &StreamGeometry) -> Self {
        Self {
            stride: geometry.rtp_stride(),
            width: geometry.rtp_width as usize,
            height: geometry.rtp_height as usize,
            frame_size: geometry.frame_size_bytes(),
            last_seq: None,
            current: None,
        }
    }

    /// Feed one packet.
    ///
    /// Returns the frames finished by this packet: at most one frame cut short
    /// by a timestamp change, followed by at most one frame ended by the
    /// marker bit. On error the frame in progress is marked damaged.
    pub fn push(&mut self, packet: &RtpPacket) -> (Vec<AssembledFrame>, Result<(), RtpError>) {
        let mut finished = Vec::new();

        if let Some(last) = self.last_seq {
            let expected = last.wrapping_add(1);
            if packet.sequence_number != expected {
                debug!(
                    "RTP sequence gap: expected {}, got {}",
                    expected, packet.sequence_number
                );
                if let Some(cur) = self.current.as_mut() {
                    cur.damaged = true;
                }
            }
        }
        self.last_seq = Some(packet.sequence_number);

        let timestamp_changed = self
            .current
            .as_ref()
            .is_some_and(|cur| cur.rtp_timestamp != packet.timestamp);
        if timestamp_changed {
            debug!("new timestamp {} before end of frame", packet.timestamp);
            if let Some(frame) = self.finish() {
                finished.push(frame);
            }
        }

        let frame_size = self.frame_size;
        let cur = self.current.get_or_insert_with(|| InProgress {
            rtp_timestamp: packet.timestamp,
            data: vec![0; frame_size],
            bytes_covered: 0,
            damaged: false,
        });

        let result = write_segments(cur, packet.payload, self.stride, self.width, self.height);
        if result.is_err() {
            cur.damaged = true;
        }

        if packet.marker {
            if let Some(frame) = self.finish() {
                finished.push(frame);
            }
        }
        (finished, result)
    }

    /// Abandon the frame in progress, e.g. after a socket error.
    pub fn reset(&mut self) {
        self.current = None;
        self.last_seq = None;
    }

    fn finish(&mut self) -> Option<AssembledFrame> {
        let cur = self.current.take()?;
        let complete = !cur.damaged && cur.bytes_covered >= self.frame_size;
        trace!(
            "frame {} finished: {}/{} bytes, damaged: {}",
            cur.rtp_timestamp, cur.bytes_covered, self.frame_size, cur.damaged
        );
        Some(AssembledFrame {
            rtp_timestamp: cur.rtp_timestamp,
            data: cur.data,
            complete,
        })
    }
}

fn write_segments(
    cur: &mut InProgress,
    payload: &[u8],
    stride: usize,
    width: usize,
    height: usize,
) -> Result<(), RtpError> {
    let (_ext_seq, segments) = parse_raw_video_payload(payload)?;
    let pgroup = PGROUP_BYTES as usize;
    for seg in segments {
        let length = seg.data.len();
        if length % pgroup != 0 {
            return Err(RtpError::PartialPixelGroup(length as u16));
        }
        let line = seg.line as usize;
        let offset = seg.offset as usize;
        if line >= height || offset + length / pgroup > width {
            return Err(RtpError::SegmentOutOfBounds {
                line: seg.line,
                offset: seg.offset,
                length: length as u16,
            });
        }
        let start = line * stride + offset * pgroup;
        cur.data[start..start + length].copy_from_slice(seg.data);
        cur.bytes_covered += length;
    }
    Ok(())
}
