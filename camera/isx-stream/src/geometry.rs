//! Frame layout of the real-time stream.
//!
//! The acquisition hub sends each frame as an RGBA/8 image in which every
//! 32-bit pixel carries two 16-bit sensor samples. Metadata rows (header and
//! footer) are transmitted together with the image, so the image on the wire
//! is taller than the sensor image.

use crate::{Error, Result};

/// Sensor width in pixels before downsampling.
pub const SENSOR_WIDTH: u32 = 1280;
/// Sensor height in pixels before downsampling.
pub const SENSOR_HEIGHT: u32 = 800;

const META_HEADER_ROWS: u32 = 2;
const META_FOOTER_ROWS: u32 = 2;
/// Word offset of the frame counter from the start of the metadata header.
const META_FRAME_COUNTER_OFFSET: u32 = 1258;
/// Word offset of the record flag from the start of the metadata header.
const META_RECORD_FLAG_OFFSET: u32 = 1257;
/// Number of 16-bit words holding the frame counter.
pub const FRAME_COUNTER_WORDS: u32 = 4;
/// Value of the record flag word while the acquisition software records.
pub const RECORD_FLAG_VALUE: u16 = 0xAD0;

const SIZE16: u32 = 2;
const SIZE32: u32 = 4;

/// Bytes per RGBA/8 pixel group on the wire.
pub const PGROUP_BYTES: u32 = SIZE32;

/// Layout of one frame for a given downsample factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamGeometry {
    /// Downsample factor set on the hub.
    pub downsample_factor: u32,
    /// Width of the delivered image in 16-bit samples.
    pub image_width: u32,
    /// Height of the delivered image in rows.
    pub image_height: u32,
    /// Width of the RGBA image on the wire.
    pub rtp_width: u32,
    /// Height of the RGBA image on the wire, metadata rows included.
    pub rtp_height: u32,
    /// First image row in the 16-bit view.
    pub header_offset: u32,
    /// One past the last image row in the 16-bit view.
    pub footer_offset: u32,
    /// Row of the 16-bit view holding the frame counter and record flag.
    pub meta_row: u32,
    /// Column of the first frame counter word within `meta_row`.
    pub frame_counter_col: u32,
    /// Column of the record flag word within `meta_row`.
    pub record_flag_col: u32,
}

impl StreamGeometry {
    pub fn new(downsample_factor: u32) -> Result<Self> {
        let ds = downsample_factor;
        if ds == 0 || SENSOR_WIDTH % ds != 0 || SENSOR_HEIGHT % ds != 0 {
            return Err(Error::InvalidDownsampleFactor(ds));
        }

        let header_bytes = META_HEADER_ROWS * SENSOR_WIDTH * SIZE16;
        let footer_bytes = META_FOOTER_ROWS * SENSOR_WIDTH * SIZE16;
        let meta_bytes = header_bytes + footer_bytes;

        let image_width = SENSOR_WIDTH / ds;
        let image_height = SENSOR_HEIGHT / ds;

        // Metadata lines expressed first in 16-bit and then in 32-bit rows.
        let meta_lines_16 = meta_bytes / image_width;
        let meta_lines_32 = (meta_lines_16 * SIZE16) / SIZE32;

        let rtp_width = image_width;
        let rtp_height = image_height + meta_lines_32;

        let header_offset = header_bytes / (SIZE16 * rtp_width);
        let footer_offset = image_height + header_offset;

        let meta_row = META_FRAME_COUNTER_OFFSET / rtp_width;
        let frame_counter_col = META_FRAME_COUNTER_OFFSET - meta_row * rtp_width;
        let record_flag_col = META_RECORD_FLAG_OFFSET - meta_row * rtp_width;

        if frame_counter_col + FRAME_COUNTER_WORDS > rtp_width
            || META_RECORD_FLAG_OFFSET / rtp_width != meta_row
            || meta_row >= header_offset
        {
            return Err(Error::InvalidDownsampleFactor(ds));
        }

        Ok(Self {
            downsample_factor: ds,
            image_width,
            image_height,
            rtp_width,
            rtp_height,
            header_offset,
            footer_offset,
            meta_row,
            frame_counter_col,
            record_flag_col,
        })
    }

    /// Bytes per line of the RGBA image on the wire.
    pub fn rtp_stride(&self) -> usize {
        self.rtp_width as usize * PGROUP_BYTES as usize
    }

    /// Bytes in one complete frame on the wire.
    pub fn frame_size_bytes(&self) -> usize {
        self.rtp_stride() * self.rtp_height as usize
    }

    /// Width of the 16-bit view of a frame.
    pub fn view16_width(&self) -> u32 {
        self.rtp_width
    }

    /// Height of the 16-bit view of a frame.
    pub fn view16_height(&self) -> u32 {
        self.rtp_height * (SIZE32 / SIZE16)
    }

    /// Number of samples in the delivered image.
    pub fn image_len(&self) -> usize {
        self.image_width as usize * self.image_height as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ds2_matches_hub_layout() {
        let g = StreamGeometry::new(2).unwrap();
        assert_eq!((g.image_width, g.image_height), (640, 400));
        assert_eq!((g.rtp_width, g.rtp_height), (640, 408));
        assert_eq!(g.frame_size_bytes(), 1_044_480);
        assert_eq!((g.view16_width(), g.view16_height()), (640, 816));
        assert_eq!((g.header_offset, g.footer_offset), (4, 404));
        assert_eq!(g.meta_row, 1);
        assert_eq!(g.frame_counter_col, 618);
        assert_eq!(g.record_flag_col, 617);
    }

    #[test]
    fn ds1_full_resolution() {
        let g = StreamGeometry::new(1).unwrap();
        assert_eq!((g.rtp_width, g.rtp_height), (1280, 804));
        assert_eq!((g.header_offset, g.footer_offset), (2, 802));
        assert_eq!(g.meta_row, 0);
        assert_eq!(g.frame_counter_col, 1258);
        assert_eq!(g.record_flag_col, 1257);
    }

    #[test]
    fn ds4() {
        let g = StreamGeometry::new(4).unwrap();
        assert_eq!((g.rtp_width, g.rtp_height), (320, 216));
        assert_eq!((g.header_offset, g.footer_offset), (8, 208));
        assert_eq!(g.meta_row, 3);
        assert_eq!(g.frame_counter_col, 298);
    }

    #[test]
    fn rejects_bad_factors() {
        for ds in [0, 3, 7, 1000] {
            assert!(
                matches!(StreamGeometry::new(ds), Err(Error::InvalidDownsampleFactor(x)) if x == ds),
                "ds={ds}"
            );
        }
    }
}
