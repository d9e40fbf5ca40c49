//! RTP (RFC 3550) packets carrying uncompressed video (RFC 4175).

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

const RTP_VERSION: u8 = 2;
const RTP_FIXED_HEADER_LEN: usize = 12;
const LINE_HEADER_LEN: usize = 6;
const EXT_SEQ_LEN: usize = 2;
const CONTINUATION_BIT: u16 = 0x8000;
const FIELD_BIT: u16 = 0x8000;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RtpError {
    #[error("packet too short for RTP header ({0} bytes)")]
    TruncatedHeader(usize),
    #[error("unsupported RTP version {0}")]
    BadVersion(u8),
    #[error("invalid RTP padding length {0}")]
    BadPadding(usize),
    #[error("RFC 4175 payload truncated")]
    TruncatedPayload,
    #[error("interlaced video is not supported")]
    Interlaced,
    #[error("line segment (line {line}, offset {offset}, {length} bytes) outside the frame")]
    SegmentOutOfBounds { line: u16, offset: u16, length: u16 },
    #[error("line segment length {0} is not a whole number of pixel groups")]
    PartialPixelGroup(u16),
}

/// A parsed RTP packet borrowing its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpPacket<'a> {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: &'a [u8],
}

impl<'a> RtpPacket<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, RtpError> {
        if buf.len() < RTP_FIXED_HEADER_LEN {
            return Err(RtpError::TruncatedHeader(buf.len()));
        }
        let version = buf[0] >> 6;
        if version != RTP_VERSION {
            return Err(RtpError::BadVersion(version));
        }
        let has_padding = buf[0] & 0x20 != 0;
        let has_extension = buf[0] & 0x10 != 0;
        let csrc_count = (buf[0] & 0x0F) as usize;
        let marker = buf[1] & 0x80 != 0;
        let payload_type = buf[1] & 0x7F;
        let sequence_number = BigEndian::read_u16(&buf[2..4]);
        let timestamp = BigEndian::read_u32(&buf[4..8]);
        let ssrc = BigEndian::read_u32(&buf[8..12]);

        let mut start = RTP_FIXED_HEADER_LEN + 4 * csrc_count;
        if buf.len() < start {
            return Err(RtpError::TruncatedHeader(buf.len()));
        }
        if has_extension {
            if buf.len() < start + 4 {
                return Err(RtpError::TruncatedHeader(buf.len()));
            }
            let ext_words = BigEndian::read_u16(&buf[start + 2..start + 4]) as usize;
            start += 4 + 4 * ext_words;
            if buf.len() < start {
                return Err(RtpError::TruncatedHeader(buf.len()));
            }
        }

        let mut end = buf.len();
        if has_padding {
            let n_pad = buf[buf.len() - 1] as usize;
            if n_pad == 0 || start + n_pad > end {
                return Err(RtpError::BadPadding(n_pad));
            }
            end -= n_pad;
        }

        Ok(Self {
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            payload: &buf[start..end],
        })
    }
}

/// One line segment of an RFC 4175 payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSegment<'a> {
    /// Line number within the frame.
    pub line: u16,
    /// Offset of the first pixel within the line, in pixels.
    pub offset: u16,
    pub data: &'a [u8],
}

/// Parse an RFC 4175 payload into its extended sequence number and line
/// segments.
pub fn parse_raw_video_payload(payload: &[u8]) -> Result<(u16, Vec<LineSegment<'_>>), RtpError> {
    if payload.len() < EXT_SEQ_LEN {
        return Err(RtpError::TruncatedPayload);
    }
    let ext_seq = BigEndian::read_u16(&payload[..EXT_SEQ_LEN]);

    let mut headers = Vec::new();
    let mut pos = EXT_SEQ_LEN;
    loop {
        if payload.len() < pos + LINE_HEADER_LEN {
            return Err(RtpError::TruncatedPayload);
        }
        let h = &payload[pos..pos + LINE_HEADER_LEN];
        let length = BigEndian::read_u16(&h[0..2]);
        let field_line = BigEndian::read_u16(&h[2..4]);
        let cont_offset = BigEndian::read_u16(&h[4..6]);
        if field_line & FIELD_BIT != 0 {
            return Err(RtpError::Interlaced);
        }
        headers.push((length, field_line & !FIELD_BIT, cont_offset & !CONTINUATION_BIT));
        pos += LINE_HEADER_LEN;
        if cont_offset & CONTINUATION_BIT == 0 {
            break;
        }
    }

    let mut segments = Vec::with_capacity(headers.len());
    for (length, line, offset) in headers {
        let end = pos + length as usize;
        if payload.len() < end {
            return Err(RtpError::TruncatedPayload);
        }
        segments.push(LineSegment {
            line,
            offset,
            data: &payload[pos..end],
        });
        pos = end;
    }
    Ok((ext_seq, segments))
}

/// Fields of the RTP header written by [write_rtp_header].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeaderFields {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

/// Append a 12-byte RTP header without CSRCs or extension.
pub fn write_rtp_header(buf: &mut Vec<u8>, fields: &RtpHeaderFields) {
    buf.push(RTP_VERSION << 6);
    buf.push(((fields.marker as u8) << 7) | (fields.payload_type & 0x7F));
    // Writing into a Vec cannot fail.
    let _ = buf.write_u16::<BigEndian>(fields.sequence_number);
    let _ = buf.write_u32::<BigEndian>(fields.timestamp);
    let _ = buf.write_u32::<BigEndian>(fields.ssrc);
}

/// Append an RFC 4175 payload (extended sequence number, line headers,
/// segment data).
pub fn write_raw_video_payload(buf: &mut Vec<u8>, ext_seq: u16, segments: &[LineSegment]) {
    let _ = buf.write_u16::<BigEndian>(ext_seq);
    for (i, seg) in segments.iter().enumerate() {
        let cont = if i + 1 < segments.len() {
            CONTINUATION_BIT
        } else {
            0
        };
        let _ = buf.write_u16::<BigEndian>(seg.data.len() as u16);
        let _ = buf.write_u16::<BigEndian>(seg.line & !FIELD_BIT);
        let _ = buf.write_u16::<BigEndian>(cont | (seg.offset & !CONTINUATION_BIT));
    }
    for seg in segments {
        buf.extend_from_slice(seg.data);
    }
}
