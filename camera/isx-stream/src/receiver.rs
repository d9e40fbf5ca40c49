use std::net::{SocketAddr, UdpSocket};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
    mpsc::{SyncSender, TrySendError},
};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use isx_stream_types::StreamCounters;

use crate::depay::{AssembledFrame, Depayloader};
use crate::frame::HostTimingInfo;
use crate::geometry::StreamGeometry;
use crate::rtp::RtpPacket;
use crate::{Error, Result};

/// Largest possible UDP datagram.
const MAX_DATAGRAM: usize = 65_536;

pub(crate) type ReceiverMsg = std::result::Result<ReceivedFrame, Error>;

pub(crate) struct ReceivedFrame {
    pub(crate) frame: AssembledFrame,
    pub(crate) host_timing: HostTimingInfo,
}

#[derive(Default)]
pub(crate) struct Counters {
    packets_received: AtomicU64,
    packets_invalid: AtomicU64,
    frames_complete: AtomicU64,
    frames_incomplete: AtomicU64,
    frames_dropped_queue_full: AtomicU64,
}

impl Counters {
    /// Snapshot of the receiver-side counts. Consumer-side fields are zero.
    pub(crate) fn snapshot(&self) -> StreamCounters {
        StreamCounters {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_invalid: self.packets_invalid.load(Ordering::Relaxed),
            frames_complete: self.frames_complete.load(Ordering::Relaxed),
            frames_incomplete: self.frames_incomplete.load(Ordering::Relaxed),
            frames_dropped_queue_full: self.frames_dropped_queue_full.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}

fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Open the UDP socket, asking the OS for a receive buffer of `buffer_size`
/// bytes.
pub(crate) fn bind_socket(addr: SocketAddr, buffer_size: usize) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_recv_buffer_size(buffer_size) {
        warn!("could not set receive buffer to {buffer_size} bytes: {e}");
    }
    let actual = socket.recv_buffer_size()?;
    if actual < buffer_size {
        warn!(
            "receive buffer is {actual} bytes, less than the requested {buffer_size}. \
            Frames may be lost. Raise net.core.rmem_max to fix."
        );
    }
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// A running receiver thread.
pub(crate) struct ReceiverHandle {
    is_done: Arc<AtomicBool>,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl ReceiverHandle {
    /// A handle with no thread behind it.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            is_done: Arc::new(AtomicBool::new(false)),
            join_handle: None,
        }
    }

    /// Signal the thread to stop and wait for it.
    pub(crate) fn stop(&mut self) {
        self.is_done.store(true, Ordering::Relaxed);
        if let Some(join_handle) = self.join_handle.take() {
            if join_handle.join().is_err() {
                error!("receiver thread panicked");
            }
        }
    }
}

impl Drop for ReceiverHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) struct ReceiverParams {
    pub(crate) geometry: StreamGeometry,
    pub(crate) read_timeout: std::time::Duration,
    pub(crate) deliver_incomplete_frames: bool,
}

pub(crate) fn spawn(
    socket: UdpSocket,
    params: ReceiverParams,
    tx: SyncSender<ReceiverMsg>,
    counters: Arc<Counters>,
) -> Result<ReceiverHandle> {
    socket.set_read_timeout(Some(params.read_timeout))?;
    let local_addr = socket.local_addr()?;

    let is_done = Arc::new(AtomicBool::new(false));
    let flag = is_done.clone();
    let thread_builder =
        std::thread::Builder::new().name(format!("isx-stream-rx-{}", local_addr.port()));
    let join_handle = thread_builder.spawn(move || {
        let mut receiver = Receiver {
            socket,
            depay: Depayloader::new(&params.geometry),
            deliver_incomplete_frames: params.deliver_incomplete_frames,
            tx,
            counters,
            fno: 0,
        };
        receiver.run(&flag);
        debug!(
            "closing thread {:?} ({:?})",
            std::thread::current().name(),
            std::thread::current().id(),
        );
    })?;
    info!("listening for the real-time stream on {local_addr}");

    Ok(ReceiverHandle {
        is_done,
        join_handle: Some(join_handle),
    })
}

struct Receiver {
    socket: UdpSocket,
    depay: Depayloader,
    deliver_incomplete_frames: bool,
    tx: SyncSender<ReceiverMsg>,
    counters: Arc<Counters>,
    fno: u64,
}

/// Whether the receive loop should keep going.
enum Flow {
    Continue,
    Stop,
}

impl Receiver {
    fn run(&mut self, is_done: &AtomicBool) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        while !is_done.load(Ordering::Relaxed) {
            let n = match self.socket.recv(&mut buf) {
                Ok(n) => n,
                Err(e) => match e.kind() {
                    std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted => continue,
                    // Reported on some platforms after an ICMP port
                    // unreachable; the socket stays usable.
                    std::io::ErrorKind::ConnectionReset => {
                        self.depay.reset();
                        continue;
                    }
                    _ => {
                        error!("error receiving from socket: {e}");
                        if self.tx.try_send(Err(e.into())).is_err() {
                            error!("could not report socket error to consumer");
                        }
                        return;
                    }
                },
            };
            if let Flow::Stop = self.handle_datagram(&buf[..n]) {
                return;
            }
        }
    }

    fn handle_datagram(&mut self, buf: &[u8]) -> Flow {
        incr(&self.counters.packets_received);
        let packet = match RtpPacket::parse(buf) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("ignoring datagram of {} bytes: {e}", buf.len());
                incr(&self.counters.packets_invalid);
                return Flow::Continue;
            }
        };

        let (finished, result) = self.depay.push(&packet);
        if let Err(e) = result {
            debug!("bad payload in packet {}: {e}", packet.sequence_number);
            incr(&self.counters.packets_invalid);
        }

        let now = chrono::Utc::now();
        for frame in finished {
            self.fno += 1;
            // Counted after the frame is queued so that a consumer seeing
            // the count can also receive the frame.
            let counter = if frame.complete {
                &self.counters.frames_complete
            } else {
                &self.counters.frames_incomplete
            };
            if !frame.complete && !self.deliver_incomplete_frames {
                warn!("dropping incomplete frame (rtp timestamp {})", frame.rtp_timestamp);
                incr(counter);
                continue;
            }

            let msg = Ok(ReceivedFrame {
                frame,
                host_timing: HostTimingInfo {
                    fno: self.fno,
                    datetime: now,
                },
            });
            let sent = self.tx.try_send(msg);
            incr(counter);
            match sent {
                Ok(()) => {}
                Err(TrySendError::Full(_msg)) => {
                    warn!("channel full, dropping frame");
                    incr(&self.counters.frames_dropped_queue_full);
                }
                Err(TrySendError::Disconnected(_msg)) => {
                    debug!("frame consumer disconnected");
                    return Flow::Stop;
                }
            }
        }
        Flow::Continue
    }
}
