//! Configuration and per-frame statistics for the Inscopix (IDAS) real-time
//! stream client.
//!
//! [IsxStreamConfig] is read from TOML files by the command line tool and can
//! also be constructed directly. [FrameStats] is attached to every frame
//! handed out by the stream.

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};

/// The configuration error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A shell variable in a path could not be expanded.
    #[error("lookup error on variable: {source}")]
    ShellExpandLookupVarError {
        /// The underlying lookup error.
        #[from]
        source: shellexpand::LookupError<std::env::VarError>,
    },
    /// A path was not valid UTF-8.
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(std::path::PathBuf),
    /// An IO error.
    #[error("IO error: {source}")]
    IoError {
        /// The underlying IO error.
        #[from]
        source: std::io::Error,
    },
    /// The TOML could not be parsed.
    #[error("TOML deserialization error: {source}")]
    TomlDeError {
        /// The underlying TOML error.
        #[from]
        source: toml::de::Error,
    },
    /// The configuration could not be serialized to TOML.
    #[error("TOML serialization error: {source}")]
    TomlSerError {
        /// The underlying TOML error.
        #[from]
        source: toml::ser::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// The default value for [IsxStreamConfig::port].
pub const DEFAULT_PORT: u16 = 5014;

/// The default value for [IsxStreamConfig::downsample_factor].
pub const DEFAULT_DOWNSAMPLE_FACTOR: u32 = 2;

/// The default value for [IsxStreamConfig::bind_addr].
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";

/// The default value for [IsxStreamConfig::queue_capacity].
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// The default value for [IsxStreamConfig::recv_timeout_msec].
pub const DEFAULT_RECV_TIMEOUT_MSEC: u64 = 100;

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_downsample_factor() -> u32 {
    DEFAULT_DOWNSAMPLE_FACTOR
}

fn default_bind_addr() -> std::net::IpAddr {
    std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
}

fn default_output_dir() -> std::path::PathBuf {
    ".".into()
}

fn default_frame_decimation() -> u32 {
    1
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_recv_timeout_msec() -> u64 {
    DEFAULT_RECV_TIMEOUT_MSEC
}

fn default_true() -> bool {
    true
}

/// Settings for one real-time stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IsxStreamConfig {
    /// UDP port on which the acquisition system sends the stream.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Local interface address to bind. Defaults to all IPv4 interfaces.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: std::net::IpAddr,
    /// Downsample factor set on the acquisition hub.
    ///
    /// This determines the geometry of the frames on the wire and must match
    /// the hub setting. To reduce the delivered frame rate on the client, use
    /// [IsxStreamConfig::frame_decimation].
    #[serde(default = "default_downsample_factor")]
    pub downsample_factor: u32,
    /// Store delivered frames to `isx_stream_<timestamp>.raw`.
    #[serde(default = "default_true")]
    pub file_storage: bool,
    /// Only deliver (and store) frames acquired while the acquisition
    /// software is recording.
    #[serde(default = "default_true")]
    pub sync_with_recording: bool,
    /// Directory in which storage files are created. Can contain shell
    /// variables such as `~`, `$A`, or `${B}`.
    #[serde(default = "default_output_dir")]
    pub output_dir: std::path::PathBuf,
    /// Deliver only every Nth frame. `1` delivers all frames.
    #[serde(default = "default_frame_decimation")]
    pub frame_decimation: u32,
    /// The size of the buffer, in number of frames, between the network
    /// receiver and the consumer.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How often, in milliseconds, the receiver wakes up to check for
    /// shutdown when no packets arrive.
    #[serde(default = "default_recv_timeout_msec")]
    pub recv_timeout_msec: u64,
    /// Requested socket receive buffer in bytes. If not set, the size of one
    /// frame is requested.
    #[serde(default)]
    pub socket_buffer_size: Option<usize>,
    /// Deliver frames for which some packets never arrived.
    #[serde(default)]
    pub deliver_incomplete_frames: bool,
}

impl Default for IsxStreamConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_addr: default_bind_addr(),
            downsample_factor: default_downsample_factor(),
            file_storage: true,
            sync_with_recording: true,
            output_dir: default_output_dir(),
            frame_decimation: default_frame_decimation(),
            queue_capacity: default_queue_capacity(),
            recv_timeout_msec: default_recv_timeout_msec(),
            socket_buffer_size: None,
            deliver_incomplete_frames: false,
        }
    }
}

impl IsxStreamConfig {
    /// Parse a configuration from a TOML string.
    pub fn from_toml_str(buf: &str) -> Result<Self> {
        Ok(toml::from_str(buf)?)
    }

    /// Read and parse a configuration TOML file.
    ///
    /// A relative `output_dir` is taken relative to the directory containing
    /// the file.
    pub fn from_toml_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let buf = std::fs::read_to_string(path)?;
        let mut cfg = Self::from_toml_str(&buf)?;
        let dirname = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        cfg.output_dir = fixup_relative_path(&cfg.output_dir, dirname)?;
        Ok(cfg)
    }

    /// Serialize to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    /// The output directory with `~` and environment variables expanded.
    pub fn expanded_output_dir(&self) -> Result<std::path::PathBuf> {
        expand_path(&self.output_dir)
    }

    /// The socket address on which the stream is received.
    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.bind_addr, self.port)
    }
}

fn expand_path(path: &std::path::Path) -> Result<std::path::PathBuf> {
    let pathstr = path
        .to_str()
        .ok_or_else(|| Error::NonUtf8Path(path.to_path_buf()))?;
    let expanded = shellexpand::full(pathstr)?;
    Ok(std::path::PathBuf::from(expanded.to_string()))
}

/// If `path` is relative (after expansion), make it relative to `dirname`.
fn fixup_relative_path(
    path: &std::path::Path,
    dirname: &std::path::Path,
) -> Result<std::path::PathBuf> {
    let expanded = expand_path(path)?;
    if expanded.is_relative() {
        Ok(dirname.join(expanded))
    } else {
        Ok(expanded)
    }
}

/// Statistics decoded from the metadata of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameStats {
    /// Frame counter of the acquisition system.
    pub seq_id: u32,
    /// Inclusive range of counter values skipped since the previous frame,
    /// if any.
    pub missing_frames_range: Option<(u32, u32)>,
    /// Whether the acquisition software was recording this frame.
    pub isxd_record: bool,
}

impl FrameStats {
    /// Number of frames skipped since the previous frame.
    pub fn n_missing(&self) -> u32 {
        match self.missing_frames_range {
            Some((first, last)) => last - first + 1,
            None => 0,
        }
    }
}

impl std::fmt::Display for FrameStats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Got Frame #{} Isxd record flag {} Missing frames: ",
            self.seq_id, self.isxd_record
        )?;
        match self.missing_frames_range {
            Some((first, last)) => write!(f, "[{first}, {last}]"),
            None => write!(f, "[]"),
        }
    }
}

/// Running totals for one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCounters {
    /// UDP datagrams received.
    pub packets_received: u64,
    /// Datagrams that were not valid RTP raw video packets.
    pub packets_invalid: u64,
    /// Frames for which every byte arrived.
    pub frames_complete: u64,
    /// Frames for which packets were lost.
    pub frames_incomplete: u64,
    /// Frames dropped because the consumer did not keep up.
    pub frames_dropped_queue_full: u64,
    /// Frames withheld by recording synchronisation or decimation.
    pub frames_withheld: u64,
    /// Frames returned to the caller.
    pub frames_delivered: u64,
}
