use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::{RawError, RawFrame, RawResult};

/// Reads `.raw` frame files of known geometry.
pub struct RawReader<R: Read> {
    f: R,
    width: u32,
    height: u32,
    n_frames: Option<u64>,
}

impl RawReader<BufReader<File>> {
    /// Open a file, checking that its length is a whole number of frames.
    pub fn from_path<P: AsRef<Path>>(path: P, width: u32, height: u32) -> RawResult<Self> {
        let frame_bytes = frame_bytes(width, height)?;
        let f = File::open(&path).map_err(|source| RawError::IoPath {
            source,
            path: path.as_ref().display().to_string(),
        })?;
        let len = f.metadata()?.len();
        if len % frame_bytes != 0 {
            return Err(RawError::TrailingData { len, frame_bytes });
        }
        let mut reader = Self::new(BufReader::new(f), width, height)?;
        reader.n_frames = Some(len / frame_bytes);
        Ok(reader)
    }
}

impl<R: Read> RawReader<R> {
    pub fn new(f: R, width: u32, height: u32) -> RawResult<Self> {
        frame_bytes(width, height)?;
        Ok(Self {
            f,
            width,
            height,
            n_frames: None,
        })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Total number of frames, known when opened with [RawReader::from_path].
    pub fn n_frames(&self) -> Option<u64> {
        self.n_frames
    }

    /// Read the next frame, `Ok(None)` at a clean end of file.
    pub fn next_frame(&mut self) -> RawResult<Option<RawFrame>> {
        let n_samples = self.width as usize * self.height as usize;
        let mut data = vec![0u16; n_samples];

        // Distinguish a clean end of file from a truncated frame by reading
        // the first sample separately.
        let mut first = [0u8; 2];
        let n = read_fully(&mut self.f, &mut first)?;
        match n {
            0 => return Ok(None),
            2 => {}
            _ => {
                return Err(RawError::UnexpectedSize {
                    expected: n_samples * 2,
                    actual: n,
                });
            }
        }
        data[0] = u16::from_le_bytes(first);
        if let Err(e) = self.f.read_u16_into::<LittleEndian>(&mut data[1..]) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(RawError::UnexpectedSize {
                    expected: n_samples * 2,
                    actual: 0,
                });
            }
            return Err(e.into());
        }

        Ok(Some(RawFrame {
            width: self.width,
            height: self.height,
            data,
        }))
    }
}

impl<R: Read> Iterator for RawReader<R> {
    type Item = RawResult<RawFrame>;
    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}

fn frame_bytes(width: u32, height: u32) -> RawResult<u64> {
    let n = width as u64 * height as u64 * 2;
    if n == 0 {
        return Err(RawError::ZeroSize);
    }
    Ok(n)
}

fn read_fully<R: Read>(f: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match f.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RawWriter;

    #[test]
    fn test_read_back() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("isx_stream_0.raw");
        {
            let f = File::create(&path).unwrap();
            let mut writer = RawWriter::new(f);
            for i in 0..3u16 {
                let frame = RawFrame::new(4, 2, vec![i * 100; 8]).unwrap();
                writer.write(&frame).unwrap();
            }
            writer.close().unwrap();
        }

        let reader = RawReader::from_path(&path, 4, 2).unwrap();
        assert_eq!(reader.n_frames(), Some(3));
        let frames: Vec<RawFrame> = reader.collect::<RawResult<_>>().unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].data, vec![200; 8]);
    }

    #[test]
    fn test_trailing_data() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.raw");
        std::fs::write(&path, vec![0u8; 17]).unwrap();
        let err = RawReader::from_path(&path, 4, 2).err().unwrap();
        assert!(matches!(err, RawError::TrailingData { len: 17, .. }));
    }

    #[test]
    fn test_truncated_stream() {
        let buf = vec![0u8; 10];
        let mut reader = RawReader::new(&buf[..], 4, 2).unwrap();
        assert!(reader.next_frame().is_err());
    }
}
