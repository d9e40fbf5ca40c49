use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use isx_raw::RawReader;
use isx_stream::{
    IsxStream, IsxStreamConfig, StreamGeometry,
    sim::{StreamSimulator, SyntheticFrame},
};
use isx_stream_types::DEFAULT_DOWNSAMPLE_FACTOR;

mod logging;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Settings that override the configuration file.
#[derive(Debug, clap::Args)]
struct ConfigArgs {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// UDP port of the real-time stream
    #[arg(long)]
    port: Option<u16>,

    /// Downsample factor set on the acquisition hub
    #[arg(long)]
    downsample_factor: Option<u32>,

    /// Do not store frames to disk
    #[arg(long)]
    no_file_storage: bool,

    /// Deliver frames also while the acquisition software is not recording
    #[arg(long)]
    no_sync_with_recording: bool,

    /// Directory for the storage file
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Deliver only every Nth frame
    #[arg(long)]
    frame_decimation: Option<u32>,
}

impl ConfigArgs {
    fn load(&self) -> anyhow::Result<IsxStreamConfig> {
        let mut cfg = match &self.config {
            Some(path) => IsxStreamConfig::from_toml_path(path)
                .with_context(|| format!("reading configuration {}", path.display()))?,
            None => IsxStreamConfig::default(),
        };
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(ds) = self.downsample_factor {
            cfg.downsample_factor = ds;
        }
        if self.no_file_storage {
            cfg.file_storage = false;
        }
        if self.no_sync_with_recording {
            cfg.sync_with_recording = false;
        }
        if let Some(output_dir) = &self.output_dir {
            cfg.output_dir = output_dir.clone();
        }
        if let Some(n) = self.frame_decimation {
            cfg.frame_decimation = n;
        }
        Ok(cfg)
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Receive the stream and print one line per frame
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        /// Print frame statistics as JSON
        #[arg(long)]
        json: bool,

        /// Also write the log to this file
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Send a synthetic stream, as the acquisition hub would
    Simulate {
        /// Destination address, e.g. 127.0.0.1:5014
        #[arg(long)]
        dest: SocketAddr,

        #[arg(long, default_value_t = DEFAULT_DOWNSAMPLE_FACTOR)]
        downsample_factor: u32,

        /// Frames per second
        #[arg(long, default_value_t = 20.0)]
        fps: f64,

        /// Stop after this many frames
        #[arg(long)]
        count: Option<u64>,

        /// Set the record flag from this frame on
        #[arg(long, default_value_t = 0)]
        record_after: u64,

        /// Skip every Nth frame counter value, as if the frame were lost
        #[arg(long)]
        skip_every: Option<u32>,
    },
    /// Print frame count and sample range of a stored .raw file
    RawInfo {
        input: PathBuf,

        /// Downsample factor in effect when the file was written
        #[arg(long, default_value_t = DEFAULT_DOWNSAMPLE_FACTOR)]
        downsample_factor: u32,
    },
    /// Print the effective configuration as TOML
    ShowConfig {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

/// Set by the Ctrl-C handler.
fn install_quit_handler() -> anyhow::Result<Arc<AtomicBool>> {
    let quit = Arc::new(AtomicBool::new(false));
    let flag = quit.clone();
    ctrlc::set_handler(move || {
        info!("got Ctrl-C, shutting down");
        flag.store(true, Ordering::Relaxed);
    })
    .context("setting Ctrl-C handler")?;
    Ok(quit)
}

fn run(cfg: IsxStreamConfig, json: bool) -> anyhow::Result<()> {
    let quit = install_quit_handler()?;
    let mut stream = IsxStream::new(cfg)?;
    stream.start_stream().context("starting stream")?;

    while !quit.load(Ordering::Relaxed) {
        let Some(frame) = stream.wait_frame(Duration::from_millis(100))? else {
            continue;
        };
        if json {
            println!("{}", serde_json::to_string(&frame.stats)?);
        } else {
            println!("{}", frame.stats);
        }
    }

    stream.stop_stream()?;
    let counters = stream.counters();
    if json {
        println!("{}", serde_json::to_string(&counters)?);
    } else {
        info!("{counters:?}");
    }
    Ok(())
}

fn simulate(
    dest: SocketAddr,
    downsample_factor: u32,
    fps: f64,
    count: Option<u64>,
    record_after: u64,
    skip_every: Option<u32>,
) -> anyhow::Result<()> {
    anyhow::ensure!(fps > 0.0, "fps must be positive");
    let quit = install_quit_handler()?;
    let mut sim = StreamSimulator::new(dest, downsample_factor, fps)?;
    let geometry = *sim.geometry();
    let interval = Duration::from_secs_f64(1.0 / fps);
    info!(
        "sending {}x{} frames to {dest} at {fps} fps",
        geometry.image_width, geometry.image_height
    );

    let start = Instant::now();
    let mut seq_id = 0u32;
    let mut i = 0u64;
    while count.is_none_or(|count| i < count) && !quit.load(Ordering::Relaxed) {
        seq_id = seq_id.wrapping_add(1);
        if let Some(n) = skip_every {
            if n > 0 && seq_id % n == 0 {
                seq_id = seq_id.wrapping_add(1);
            }
        }
        let offset = (i % geometry.image_width as u64) as u32;
        let frame = SyntheticFrame::from_fn(&geometry, seq_id, i >= record_after, |x, y| {
            (((x + offset) ^ y) & 0x0FFF) as u16
        });
        sim.send_frame(&frame)?;
        i += 1;

        let next = start + interval.mul_f64(i as f64);
        if let Some(wait) = next.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        } else {
            warn!("falling behind the requested frame rate");
        }
    }
    info!("sent {} frames", sim.n_sent());
    Ok(())
}

fn raw_info(input: PathBuf, downsample_factor: u32) -> anyhow::Result<()> {
    let geometry = StreamGeometry::new(downsample_factor)?;
    let reader = RawReader::from_path(&input, geometry.image_width, geometry.image_height)
        .with_context(|| format!("opening {}", input.display()))?;
    println!(
        "{}: {}x{}, {} frames",
        input.display(),
        reader.width(),
        reader.height(),
        reader.n_frames().unwrap_or(0)
    );
    for (i, frame) in reader.enumerate() {
        let frame = frame.with_context(|| format!("reading frame {i}"))?;
        match frame.min_max() {
            Some((min, max)) => println!("frame {i}: min {min}, max {max}"),
            None => println!("frame {i}: empty"),
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_file = match &cli.command {
        Commands::Run { log_file, .. } => log_file.clone(),
        _ => None,
    };
    logging::initiate_logging(log_file)?;

    match cli.command {
        Commands::Run { config, json, .. } => run(config.load()?, json),
        Commands::Simulate {
            dest,
            downsample_factor,
            fps,
            count,
            record_after,
            skip_every,
        } => simulate(dest, downsample_factor, fps, count, record_after, skip_every),
        Commands::RawInfo {
            input,
            downsample_factor,
        } => raw_info(input, downsample_factor),
        Commands::ShowConfig { config } => {
            print!("{}", config.load()?.to_toml_string()?);
            Ok(())
        }
    }
}
