use byteorder::{ByteOrder, LittleEndian};

use isx_raw::Mono16Image;
use isx_stream_types::FrameStats;

use crate::geometry::{FRAME_COUNTER_WORDS, RECORD_FLAG_VALUE, StreamGeometry};
use crate::{Error, Result};

/// Metadata embedded by the acquisition system in the header rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Frame counter of the acquisition system.
    pub seq_id: u32,
    /// The acquisition software was recording this frame.
    pub isxd_record: bool,
}

impl FrameMetadata {
    /// Decode the metadata from the bytes of a frame as received.
    pub fn decode(geometry: &StreamGeometry, data: &[u8]) -> Result<Self> {
        check_len(geometry, data)?;
        let row_start = geometry.meta_row as usize * geometry.view16_width() as usize;
        let word = |col: u32| {
            let idx = (row_start + col as usize) * 2;
            LittleEndian::read_u16(&data[idx..idx + 2])
        };

        // Each counter word carries one byte in its upper 12 bits.
        let mut seq_id = 0u32;
        for i in 0..FRAME_COUNTER_WORDS {
            let w = word(geometry.frame_counter_col + i) as u32;
            seq_id |= (w >> 4) << (8 * i);
        }
        let isxd_record = word(geometry.record_flag_col) == RECORD_FLAG_VALUE;
        Ok(Self {
            seq_id,
            isxd_record,
        })
    }
}

/// A decoded image: `width * height` 16-bit samples, row major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsxFrame {
    width: u32,
    height: u32,
    data: Vec<u16>,
}

impl IsxFrame {
    /// Extract the image rows from the bytes of a frame as received.
    pub fn decode(geometry: &StreamGeometry, data: &[u8]) -> Result<Self> {
        check_len(geometry, data)?;
        let row_bytes = geometry.view16_width() as usize * 2;
        let start = geometry.header_offset as usize * row_bytes;
        let end = geometry.footer_offset as usize * row_bytes;
        let mut samples = vec![0u16; geometry.image_len()];
        LittleEndian::read_u16_into(&data[start..end], &mut samples);
        Ok(Self {
            width: geometry.image_width,
            height: geometry.image_height,
            data: samples,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// All samples, row major.
    pub fn data(&self) -> &[u16] {
        &self.data
    }

    pub fn row(&self, y: u32) -> Option<&[u16]> {
        if y >= self.height {
            return None;
        }
        let w = self.width as usize;
        let start = y as usize * w;
        Some(&self.data[start..start + w])
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width {
            return None;
        }
        self.row(y).map(|row| row[x as usize])
    }

    pub fn into_vec(self) -> Vec<u16> {
        self.data
    }
}

impl Mono16Image for IsxFrame {
    fn width(&self) -> u32 {
        self.width
    }
    fn height(&self) -> u32 {
        self.height
    }
    fn samples(&self) -> &[u16] {
        &self.data
    }
}

/// Timing information acquired on the host computer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTimingInfo {
    /// Count of frames assembled by the receiver since the stream started.
    ///
    /// Frames dropped on the host still advance this count.
    pub fno: u64,
    /// When the last packet of the frame arrived.
    pub datetime: chrono::DateTime<chrono::Utc>,
}

/// A frame handed out by [crate::IsxStream::get_frame].
#[derive(Debug, Clone)]
pub struct IsxFrameWithInfo {
    pub image: IsxFrame,
    pub stats: FrameStats,
    pub host_timing: HostTimingInfo,
    pub rtp_timestamp: u32,
    /// False if packets were lost and the missing parts are zero.
    pub complete: bool,
}

fn check_len(geometry: &StreamGeometry, data: &[u8]) -> Result<()> {
    let expected = geometry.frame_size_bytes();
    if data.len() != expected {
        return Err(Error::FrameSizeMismatch {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}
