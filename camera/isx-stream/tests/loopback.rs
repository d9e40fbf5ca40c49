use std::time::{Duration, Instant};

use isx_raw::{Mono16Image, RawReader};
use isx_stream::{
    IsxStream, IsxStreamConfig,
    sim::{DEFAULT_MAX_PAYLOAD, Packetizer, StreamSimulator, SyntheticFrame},
};
use test_log::test;

// Small frames keep each burst well inside the default socket buffer.
const DS: u32 = 8;
const TIMEOUT: Duration = Duration::from_secs(5);

fn loopback_config() -> IsxStreamConfig {
    IsxStreamConfig {
        port: 0,
        bind_addr: std::net::Ipv4Addr::LOCALHOST.into(),
        downsample_factor: DS,
        file_storage: false,
        sync_with_recording: false,
        ..Default::default()
    }
}

fn start(cfg: IsxStreamConfig) -> anyhow::Result<(IsxStream, StreamSimulator)> {
    let mut stream = IsxStream::new(cfg)?;
    stream.start_stream()?;
    let dest = stream
        .local_addr()
        .ok_or_else(|| anyhow::anyhow!("stream not bound"))?;
    let sim = StreamSimulator::new(dest, DS, 20.0)?;
    Ok((stream, sim))
}

fn pattern(seq_id: u32) -> impl Fn(u32, u32) -> u16 {
    move |x, y| ((x + 7 * y + seq_id) & 0x0FFF) as u16
}

/// Send one frame and wait until the receiver has assembled it, so frames
/// never pile up in the socket buffer.
fn send(
    stream: &IsxStream,
    sim: &mut StreamSimulator,
    seq_id: u32,
    isxd_record: bool,
) -> anyhow::Result<()> {
    let frame = SyntheticFrame::from_fn(sim.geometry(), seq_id, isxd_record, pattern(seq_id));
    let before = stream.counters().frames_complete;
    sim.send_frame(&frame)?;
    let start = Instant::now();
    while stream.counters().frames_complete == before {
        if start.elapsed() > TIMEOUT {
            anyhow::bail!("frame {seq_id} was not received");
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    Ok(())
}

/// Sends frames packet by packet so that individual packets can be lost.
struct LossySender {
    socket: std::net::UdpSocket,
    dest: std::net::SocketAddr,
    packetizer: Packetizer,
    geometry: isx_stream::StreamGeometry,
    rtp_timestamp: u32,
}

impl LossySender {
    fn new(stream: &IsxStream) -> anyhow::Result<Self> {
        let dest = stream
            .local_addr()
            .ok_or_else(|| anyhow::anyhow!("stream not bound"))?;
        let geometry = *stream.geometry();
        Ok(Self {
            socket: std::net::UdpSocket::bind("127.0.0.1:0")?,
            dest,
            packetizer: Packetizer::new(&geometry, DEFAULT_MAX_PAYLOAD),
            geometry,
            rtp_timestamp: 0,
        })
    }

    /// Send one frame, leaving out the packet at index `lose` if given, and
    /// wait until the receiver has finished the frame.
    fn send(
        &mut self,
        stream: &IsxStream,
        seq_id: u32,
        lose: Option<usize>,
    ) -> anyhow::Result<()> {
        let frame = SyntheticFrame::from_fn(&self.geometry, seq_id, false, pattern(seq_id));
        let data = frame.to_wire_bytes(&self.geometry)?;
        self.rtp_timestamp += 4500;
        let packets = self.packetizer.packetize(&data, self.rtp_timestamp);
        let finished = |s: &IsxStream| {
            let c = s.counters();
            c.frames_complete + c.frames_incomplete
        };
        let before = finished(stream);
        for (i, packet) in packets.iter().enumerate() {
            if Some(i) != lose {
                self.socket.send_to(packet, self.dest)?;
            }
        }
        let start = Instant::now();
        while finished(stream) == before {
            if start.elapsed() > TIMEOUT {
                anyhow::bail!("frame {seq_id} was not finished");
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    }

    /// Index of a packet well past the metadata header rows.
    fn middle_packet(&self) -> usize {
        let data = vec![0u8; self.geometry.frame_size_bytes()];
        let n = Packetizer::new(&self.geometry, DEFAULT_MAX_PAYLOAD)
            .packetize(&data, 0)
            .len();
        n / 2
    }
}

#[test]
fn frames_arrive_in_order() -> anyhow::Result<()> {
    let (mut stream, mut sim) = start(loopback_config())?;
    for seq_id in 1..=3 {
        send(&stream, &mut sim, seq_id, false)?;
    }

    for seq_id in 1..=3 {
        let frame = stream
            .get_frame()?
            .ok_or_else(|| anyhow::anyhow!("expected frame {seq_id}"))?;
        assert_eq!(frame.stats.seq_id, seq_id);
        assert_eq!(frame.stats.missing_frames_range, None);
        assert!(!frame.stats.isxd_record);
        assert!(frame.complete);
        assert_eq!((frame.image.width(), frame.image.height()), (160, 100));
        assert_eq!(frame.image.pixel(3, 2), Some(pattern(seq_id)(3, 2)));
        assert_eq!(frame.host_timing.fno, seq_id as u64);
    }
    assert!(stream.get_frame()?.is_none());

    let counters = stream.counters();
    assert_eq!(counters.frames_complete, 3);
    assert_eq!(counters.frames_delivered, 3);
    assert_eq!(counters.packets_invalid, 0);

    stream.stop_stream()?;
    assert!(!stream.is_started());
    Ok(())
}

#[test]
fn get_frame_without_traffic_is_none() -> anyhow::Result<()> {
    let (mut stream, _sim) = start(loopback_config())?;
    assert!(stream.get_frame()?.is_none());
    assert!(stream.wait_frame(Duration::from_millis(50))?.is_none());
    Ok(())
}

#[test]
fn reports_missing_frames() -> anyhow::Result<()> {
    let (mut stream, mut sim) = start(loopback_config())?;
    for seq_id in [10, 11, 15] {
        send(&stream, &mut sim, seq_id, false)?;
    }
    let mut stats = Vec::new();
    while let Some(frame) = stream.get_frame()? {
        stats.push(frame.stats);
    }
    assert_eq!(stats.len(), 3);
    assert_eq!(stats[1].missing_frames_range, None);
    assert_eq!(stats[2].missing_frames_range, Some((12, 14)));
    assert_eq!(stats[2].n_missing(), 3);
    Ok(())
}

#[test]
fn sync_with_recording_withholds_frames() -> anyhow::Result<()> {
    let cfg = IsxStreamConfig {
        sync_with_recording: true,
        ..loopback_config()
    };
    let (mut stream, mut sim) = start(cfg)?;
    for (seq_id, recording) in [(1, false), (2, true), (3, false), (4, true)] {
        send(&stream, &mut sim, seq_id, recording)?;
    }

    let mut delivered = Vec::new();
    while let Some(frame) = stream.get_frame()? {
        assert!(frame.stats.isxd_record);
        // Withheld frames still count toward gap detection.
        assert_eq!(frame.stats.missing_frames_range, None);
        delivered.push(frame.stats.seq_id);
    }
    assert_eq!(delivered, vec![2, 4]);
    assert_eq!(stream.counters().frames_withheld, 2);
    Ok(())
}

#[test]
fn frame_decimation() -> anyhow::Result<()> {
    let cfg = IsxStreamConfig {
        frame_decimation: 2,
        ..loopback_config()
    };
    let (mut stream, mut sim) = start(cfg)?;
    for seq_id in 1..=5 {
        send(&stream, &mut sim, seq_id, false)?;
    }
    let mut delivered = Vec::new();
    while let Some(frame) = stream.wait_frame(Duration::from_millis(100))? {
        delivered.push(frame.stats.seq_id);
    }
    assert_eq!(delivered, vec![1, 3, 5]);
    Ok(())
}

#[test]
fn stores_delivered_frames() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = IsxStreamConfig {
        file_storage: true,
        sync_with_recording: true,
        output_dir: dir.path().to_path_buf(),
        ..loopback_config()
    };
    let (mut stream, mut sim) = start(cfg)?;
    let path = stream
        .storage_path()
        .ok_or_else(|| anyhow::anyhow!("no storage file"))?
        .to_path_buf();
    assert!(path.starts_with(dir.path()));

    for (seq_id, recording) in [(1, false), (2, true), (3, true)] {
        send(&stream, &mut sim, seq_id, recording)?;
    }
    while stream.get_frame()?.is_some() {}
    stream.stop_stream()?;
    assert!(stream.storage_path().is_none());

    let mut reader = RawReader::from_path(&path, 160, 100)?;
    assert_eq!(reader.n_frames(), Some(2));
    for seq_id in [2, 3] {
        let frame = reader
            .next_frame()?
            .ok_or_else(|| anyhow::anyhow!("missing stored frame"))?;
        let expected = SyntheticFrame::from_fn(sim.geometry(), seq_id, true, pattern(seq_id));
        assert_eq!(frame.samples(), expected.image.as_slice());
    }
    assert!(reader.next_frame()?.is_none());
    Ok(())
}

#[test]
fn start_twice_fails() -> anyhow::Result<()> {
    let (mut stream, _sim) = start(loopback_config())?;
    assert!(matches!(
        stream.start_stream(),
        Err(isx_stream::Error::AlreadyStarted)
    ));
    Ok(())
}

#[test]
fn port_in_use_fails_to_start() -> anyhow::Result<()> {
    let (mut first, mut sim) = start(loopback_config())?;
    let port = first
        .local_addr()
        .ok_or_else(|| anyhow::anyhow!("stream not bound"))?
        .port();

    let mut second = IsxStream::new(IsxStreamConfig {
        port,
        ..loopback_config()
    })?;
    assert!(matches!(
        second.start_stream(),
        Err(isx_stream::Error::IoError { .. })
    ));
    assert!(!second.is_started());

    // The first stream keeps receiving.
    send(&first, &mut sim, 1, false)?;
    let frame = first
        .get_frame()?
        .ok_or_else(|| anyhow::anyhow!("expected frame"))?;
    assert_eq!(frame.stats.seq_id, 1);
    Ok(())
}

#[test]
fn incomplete_frames_dropped_by_default() -> anyhow::Result<()> {
    let (mut stream, _sim) = start(loopback_config())?;
    let mut sender = LossySender::new(&stream)?;
    let lose = sender.middle_packet();
    sender.send(&stream, 1, None)?;
    sender.send(&stream, 2, Some(lose))?;
    sender.send(&stream, 3, None)?;

    let mut stats = Vec::new();
    while let Some(frame) = stream.get_frame()? {
        assert!(frame.complete);
        stats.push(frame.stats);
    }
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[0].seq_id, 1);
    assert_eq!(stats[1].seq_id, 3);
    assert_eq!(stats[1].missing_frames_range, Some((2, 2)));

    let counters = stream.counters();
    assert_eq!(counters.frames_incomplete, 1);
    assert_eq!(counters.frames_complete, 2);
    Ok(())
}

#[test]
fn incomplete_frames_delivered_when_enabled() -> anyhow::Result<()> {
    let cfg = IsxStreamConfig {
        deliver_incomplete_frames: true,
        ..loopback_config()
    };
    let (mut stream, _sim) = start(cfg)?;
    let mut sender = LossySender::new(&stream)?;
    let lose = sender.middle_packet();
    sender.send(&stream, 1, Some(lose))?;
    sender.send(&stream, 2, None)?;

    let damaged = stream
        .get_frame()?
        .ok_or_else(|| anyhow::anyhow!("expected incomplete frame"))?;
    assert!(!damaged.complete);
    // Metadata rows arrived, so the frame is still identified.
    assert_eq!(damaged.stats.seq_id, 1);

    let intact = stream
        .get_frame()?
        .ok_or_else(|| anyhow::anyhow!("expected complete frame"))?;
    assert!(intact.complete);
    assert_eq!(intact.stats.seq_id, 2);
    assert_eq!(intact.stats.missing_frames_range, None);
    assert_eq!(intact.image.pixel(3, 2), Some(pattern(2)(3, 2)));

    assert_eq!(stream.counters().frames_incomplete, 1);
    assert_eq!(stream.counters().frames_delivered, 2);
    Ok(())
}

#[test]
fn full_queue_drops_frames() -> anyhow::Result<()> {
    let cfg = IsxStreamConfig {
        queue_capacity: 1,
        ..loopback_config()
    };
    let (mut stream, mut sim) = start(cfg)?;
    for seq_id in 1..=4 {
        send(&stream, &mut sim, seq_id, false)?;
    }

    let first = stream
        .get_frame()?
        .ok_or_else(|| anyhow::anyhow!("expected frame"))?;
    assert_eq!(first.stats.seq_id, 1);
    assert!(stream.get_frame()?.is_none());
    assert_eq!(stream.counters().frames_dropped_queue_full, 3);

    // The dropped frames show up as missing on the next frame.
    send(&stream, &mut sim, 5, false)?;
    let next = stream
        .get_frame()?
        .ok_or_else(|| anyhow::anyhow!("expected frame"))?;
    assert_eq!(next.stats.seq_id, 5);
    assert_eq!(next.stats.missing_frames_range, Some((2, 4)));
    Ok(())
}
