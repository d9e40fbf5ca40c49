//! Read and write `.raw` files of 16-bit monochrome frames.
//!
//! The format has no header: every frame is `width * height` little-endian
//! `u16` samples written row after row, and frames follow each other
//! directly. The reader must therefore be told the frame geometry.

use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};

pub type RawResult<M> = std::result::Result<M, RawError>;

mod reader;
pub use crate::reader::RawReader;

#[derive(thiserror::Error, Debug)]
pub enum RawError {
    #[error("unexpected size {actual} (expected {expected})")]
    UnexpectedSize { expected: usize, actual: usize },
    #[error("frame is {width}x{height} but the file holds {file_width}x{file_height} frames")]
    UnexpectedDimensions {
        width: u32,
        height: u32,
        file_width: u32,
        file_height: u32,
    },
    #[error("file length {len} is not a multiple of the frame size {frame_bytes}")]
    TrailingData { len: u64, frame_bytes: u64 },
    #[error("zero sized frame")]
    ZeroSize,
    #[error("already closed")]
    AlreadyClosed,
    #[error("{source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("From {path}: {source}")]
    IoPath {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Access to the samples of a 16-bit monochrome image.
pub trait Mono16Image {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    /// Row-major samples, exactly `width * height` long.
    fn samples(&self) -> &[u16];
}

/// An owned 16-bit monochrome frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u16>,
}

impl RawFrame {
    pub fn new(width: u32, height: u32, data: Vec<u16>) -> RawResult<Self> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(RawError::UnexpectedSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Smallest and largest sample, `None` for an empty frame.
    pub fn min_max(&self) -> Option<(u16, u16)> {
        let min = self.data.iter().copied().min()?;
        let max = self.data.iter().copied().max()?;
        Some((min, max))
    }
}

impl Mono16Image for RawFrame {
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

/// Writes `.raw` frame files.
///
/// The geometry is fixed by the first frame written. All later frames must
/// have the same size.
pub struct RawWriter<F: Write> {
    f: Option<F>,
    dims: Option<(u32, u32)>,
    n_frames: u64,
}

impl<F: Write> RawWriter<F> {
    /// Open a new writer.
    pub fn new(f: F) -> Self {
        Self {
            f: Some(f),
            dims: None,
            n_frames: 0,
        }
    }

    /// Write a frame.
    pub fn write(&mut self, frame: &dyn Mono16Image) -> RawResult<()> {
        let f = self.f.as_mut().ok_or(RawError::AlreadyClosed)?;

        let (w, h) = (frame.width(), frame.height());
        match self.dims {
            None => {
                if w == 0 || h == 0 {
                    return Err(RawError::ZeroSize);
                }
                self.dims = Some((w, h));
            }
            Some((file_width, file_height)) => {
                if (w, h) != (file_width, file_height) {
                    return Err(RawError::UnexpectedDimensions {
                        width: w,
                        height: h,
                        file_width,
                        file_height,
                    });
                }
            }
        }

        let samples = frame.samples();
        let expected = w as usize * h as usize;
        if samples.len() != expected {
            return Err(RawError::UnexpectedSize {
                expected,
                actual: samples.len(),
            });
        }

        let mut buf = Vec::with_capacity(samples.len() * 2);
        for &value in samples {
            buf.write_u16::<LittleEndian>(value)?;
        }
        f.write_all(&buf)?;

        self.n_frames += 1;
        Ok(())
    }

    /// Number of frames written so far.
    pub fn n_frames(&self) -> u64 {
        self.n_frames
    }

    /// Flush and close the writer, returning the inner writer.
    ///
    /// Ideally, this is called prior to dropping to prevent the possibility of
    /// silently ignoring errors.
    pub fn close(mut self) -> RawResult<F> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> RawResult<F> {
        let mut f = self.f.take().ok_or(RawError::AlreadyClosed)?;
        f.flush()?;
        tracing::debug!("closed raw writer after {} frames", self.n_frames);
        Ok(f)
    }
}

/// This will silently ignore any error.
impl<F: Write> Drop for RawWriter<F> {
    fn drop(&mut self) {
        if self.f.is_some() {
            let _ = self.close_inner();
        }
    }
}
