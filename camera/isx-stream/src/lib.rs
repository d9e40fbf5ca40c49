//! Client for the real-time video stream of the Inscopix Data Acquisition
//! System (IDAS).
//!
//! The acquisition hub sends each frame as RTP packets carrying uncompressed
//! video ([RFC 4175](https://www.rfc-editor.org/rfc/rfc4175)) to a UDP port.
//! [IsxStream] listens on that port, reassembles and decodes the frames on a
//! background thread, and hands them to the caller one at a time through
//! [IsxStream::get_frame].
//!
//! ```no_run
//! use isx_stream::{IsxStream, IsxStreamConfig};
//!
//! let mut stream = IsxStream::new(IsxStreamConfig::default())?;
//! stream.start_stream()?;
//! loop {
//!     if let Some(frame) = stream.get_frame()? {
//!         println!("{}", frame.stats);
//!     }
//! #   break;
//! }
//! stream.stop_stream()?;
//! # Ok::<(), isx_stream::Error>(())
//! ```

use std::fs::File;
use std::io::BufWriter;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{
    Arc,
    mpsc::{Receiver, RecvTimeoutError, TryRecvError},
};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use isx_raw::RawWriter;
pub use isx_stream_types::{FrameStats, IsxStreamConfig, StreamCounters};

pub mod depay;
pub mod frame;
pub mod geometry;
mod receiver;
pub mod rtp;
pub mod sim;
mod stats;

pub use frame::{FrameMetadata, HostTimingInfo, IsxFrame, IsxFrameWithInfo};
pub use geometry::StreamGeometry;
pub use rtp::RtpError;
pub use stats::FrameStatsTracker;

use receiver::{Counters, ReceivedFrame, ReceiverHandle, ReceiverMsg, ReceiverParams};

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid downsample factor {0}")]
    InvalidDownsampleFactor(u32),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("stream already started")]
    AlreadyStarted,
    #[error("stream not started")]
    NotStarted,
    #[error("receiver thread disconnected")]
    ReceiverDisconnected,
    #[error("frame is {actual} bytes (expected {expected})")]
    FrameSizeMismatch { expected: usize, actual: usize },
    #[error("incomplete send")]
    IncompleteSend,
    #[error("storage error: {source}")]
    Storage {
        #[from]
        source: isx_raw::RawError,
    },
    #[error("configuration error: {source}")]
    Config {
        #[from]
        source: isx_stream_types::Error,
    },
    #[error("io error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
}

fn _test_error_is_send() {
    // Compile-time test to ensure Error implements Send trait.
    fn implements<T: Send>() {}
    implements::<Error>();
}

struct Running {
    rx: Receiver<ReceiverMsg>,
    // Dropping the handle stops the thread.
    receiver: ReceiverHandle,
    local_addr: SocketAddr,
}

struct Storage {
    path: PathBuf,
    writer: RawWriter<BufWriter<File>>,
}

/// A connection to the real-time stream.
pub struct IsxStream {
    cfg: IsxStreamConfig,
    geometry: StreamGeometry,
    tracker: FrameStatsTracker,
    counters: Arc<Counters>,
    running: Option<Running>,
    storage: Option<Storage>,
    n_withheld: u64,
    n_deliverable: u64,
    n_delivered: u64,
}

impl IsxStream {
    /// Validate the configuration. Nothing is opened until
    /// [IsxStream::start_stream].
    pub fn new(cfg: IsxStreamConfig) -> Result<Self> {
        let geometry = StreamGeometry::new(cfg.downsample_factor)?;
        if cfg.frame_decimation == 0 {
            return Err(Error::InvalidConfig(
                "frame_decimation must be at least 1".into(),
            ));
        }
        if cfg.queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if cfg.recv_timeout_msec == 0 {
            return Err(Error::InvalidConfig(
                "recv_timeout_msec must be at least 1".into(),
            ));
        }

        info!(
            "real-time stream on port {} with downsample factor {}, frame size {}x{}",
            cfg.port, cfg.downsample_factor, geometry.image_width, geometry.image_height
        );
        if cfg.sync_with_recording {
            info!("sync with recording enabled: start recording on the acquisition software to view the stream");
        } else {
            info!("sync with recording disabled");
        }
        if !cfg.file_storage {
            info!("file storage disabled");
        }

        Ok(Self {
            cfg,
            geometry,
            tracker: FrameStatsTracker::new(),
            counters: Arc::new(Counters::default()),
            running: None,
            storage: None,
            n_withheld: 0,
            n_deliverable: 0,
            n_delivered: 0,
        })
    }

    pub fn config(&self) -> &IsxStreamConfig {
        &self.cfg
    }

    pub fn geometry(&self) -> &StreamGeometry {
        &self.geometry
    }

    pub fn is_started(&self) -> bool {
        self.running.is_some()
    }

    /// Address of the bound socket while started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Path of the storage file while started with file storage enabled.
    pub fn storage_path(&self) -> Option<&Path> {
        self.storage.as_ref().map(|s| s.path.as_path())
    }

    /// Open the socket and start receiving.
    pub fn start_stream(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let buffer_size = self
            .cfg
            .socket_buffer_size
            .unwrap_or_else(|| self.geometry.frame_size_bytes());
        let socket = receiver::bind_socket(self.cfg.socket_addr(), buffer_size)?;
        let local_addr = socket.local_addr()?;

        if self.cfg.file_storage {
            let dir = self.cfg.expanded_output_dir()?;
            self.storage = Some(open_storage(&dir)?);
        }

        let (tx, rx) = std::sync::mpsc::sync_channel(self.cfg.queue_capacity);
        let params = ReceiverParams {
            geometry: self.geometry,
            read_timeout: Duration::from_millis(self.cfg.recv_timeout_msec),
            deliver_incomplete_frames: self.cfg.deliver_incomplete_frames,
        };
        let receiver = match receiver::spawn(socket, params, tx, self.counters.clone()) {
            Ok(receiver) => receiver,
            Err(e) => {
                self.close_storage()?;
                return Err(e);
            }
        };

        self.tracker = FrameStatsTracker::new();
        self.n_deliverable = 0;
        self.running = Some(Running {
            rx,
            receiver,
            local_addr,
        });
        info!("stream started");
        Ok(())
    }

    /// Stop receiving and close the storage file. Does nothing if not
    /// started.
    pub fn stop_stream(&mut self) -> Result<()> {
        if let Some(mut running) = self.running.take() {
            running.receiver.stop();
            info!("stream stopped");
        }
        self.close_storage()
    }

    /// Return the next frame, or `None` if no new frame is ready.
    ///
    /// Does not block. Frames are returned oldest first. Frames withheld by
    /// recording synchronisation or decimation are consumed without being
    /// returned.
    pub fn get_frame(&mut self) -> Result<Option<IsxFrameWithInfo>> {
        loop {
            let msg = {
                let running = self.running.as_ref().ok_or(Error::NotStarted)?;
                match running.rx.try_recv() {
                    Ok(msg) => msg,
                    Err(TryRecvError::Empty) => return Ok(None),
                    Err(TryRecvError::Disconnected) => return Err(Error::ReceiverDisconnected),
                }
            };
            if let Some(frame) = self.process(msg?)? {
                return Ok(Some(frame));
            }
        }
    }

    /// Like [IsxStream::get_frame] but wait up to `timeout` for a frame.
    pub fn wait_frame(&mut self, timeout: Duration) -> Result<Option<IsxFrameWithInfo>> {
        let deadline = Instant::now() + timeout;
        loop {
            let msg = {
                let running = self.running.as_ref().ok_or(Error::NotStarted)?;
                let remaining = deadline.saturating_duration_since(Instant::now());
                match running.rx.recv_timeout(remaining) {
                    Ok(msg) => msg,
                    Err(RecvTimeoutError::Timeout) => return Ok(None),
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(Error::ReceiverDisconnected);
                    }
                }
            };
            if let Some(frame) = self.process(msg?)? {
                return Ok(Some(frame));
            }
        }
    }

    /// Packet and frame totals since this stream was created.
    pub fn counters(&self) -> StreamCounters {
        StreamCounters {
            frames_withheld: self.n_withheld,
            frames_delivered: self.n_delivered,
            ..self.counters.snapshot()
        }
    }

    fn process(&mut self, received: ReceivedFrame) -> Result<Option<IsxFrameWithInfo>> {
        let ReceivedFrame { frame, host_timing } = received;
        let meta = FrameMetadata::decode(&self.geometry, &frame.data)?;
        let stats = self.tracker.update(&meta);

        if self.cfg.sync_with_recording && !stats.isxd_record {
            trace!("withholding frame #{}: not recording", stats.seq_id);
            self.n_withheld += 1;
            return Ok(None);
        }

        let deliverable_idx = self.n_deliverable;
        self.n_deliverable += 1;
        if deliverable_idx % self.cfg.frame_decimation as u64 != 0 {
            trace!("withholding frame #{}: decimation", stats.seq_id);
            self.n_withheld += 1;
            return Ok(None);
        }

        let image = IsxFrame::decode(&self.geometry, &frame.data)?;
        if let Some(storage) = self.storage.as_mut() {
            storage.writer.write(&image)?;
        }

        self.n_delivered += 1;
        Ok(Some(IsxFrameWithInfo {
            image,
            stats,
            host_timing,
            rtp_timestamp: frame.rtp_timestamp,
            complete: frame.complete,
        }))
    }

    fn close_storage(&mut self) -> Result<()> {
        if let Some(storage) = self.storage.take() {
            let n_frames = storage.writer.n_frames();
            storage.writer.close()?;
            info!(
                "saved {} frames to {}",
                n_frames,
                storage.path.display()
            );
        }
        Ok(())
    }
}

impl Drop for IsxStream {
    fn drop(&mut self) {
        if let Err(e) = self.stop_stream() {
            tracing::error!("error stopping stream: {e}");
        }
    }
}

/// Create `isx_stream_<unix seconds>.raw` in `dir`, adding a suffix if a
/// file of that name exists.
fn open_storage(dir: &Path) -> Result<Storage> {
    std::fs::create_dir_all(dir)?;
    let stamp = chrono::Utc::now().timestamp();
    let mut suffix = 0;
    loop {
        let fname = if suffix == 0 {
            format!("isx_stream_{stamp}.raw")
        } else {
            format!("isx_stream_{stamp}_{suffix}.raw")
        };
        let path = dir.join(fname);
        match File::options().write(true).create_new(true).open(&path) {
            Ok(f) => {
                info!("file storage enabled, storage file: {}", path.display());
                return Ok(Storage {
                    path,
                    writer: RawWriter::new(BufWriter::new(f)),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!("{} exists", path.display());
                suffix += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
