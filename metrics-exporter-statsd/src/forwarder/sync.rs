use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

#[cfg(target_os = "linux")]
use std::os::unix::net::UnixDatagram;

use crossbeam_channel::Sender;
use tracing::{debug, error, trace, warn};

use crate::{
    queue::{Popped, QueueConsumer},
    record::MetricRecord,
    telemetry::{Telemetry, TelemetryReporter, TelemetryUpdate},
    writer::PayloadWriter,
};

use super::{ForwarderConfiguration, RemoteAddr, Transport, WorkerState, WorkerStateCell};

// Maximum number of already-queued records folded into a single flush.
const MAX_RECORDS_PER_FLUSH: usize = 1024;

enum Socket {
    Udp(UdpSocket),

    #[cfg(target_os = "linux")]
    Unixgram(UnixDatagram),
}

impl Socket {
    fn connect(remote_addr: &RemoteAddr, write_timeout: Duration) -> io::Result<Self> {
        match remote_addr {
            RemoteAddr::Udp(addrs) => {
                let local: SocketAddr = match addrs.first() {
                    Some(SocketAddr::V6(_)) => (Ipv6Addr::UNSPECIFIED, 0).into(),
                    _ => (Ipv4Addr::UNSPECIFIED, 0).into(),
                };

                UdpSocket::bind(local).and_then(|socket| {
                    socket.connect(&addrs[..])?;
                    socket.set_write_timeout(Some(write_timeout))?;
                    Ok(Socket::Udp(socket))
                })
            }

            #[cfg(target_os = "linux")]
            RemoteAddr::Unixgram(path) => UnixDatagram::unbound().and_then(|socket| {
                socket.connect(path)?;
                socket.set_write_timeout(Some(write_timeout))?;
                Ok(Socket::Unixgram(socket))
            }),
        }
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Udp(socket) => socket.send(buf),

            #[cfg(target_os = "linux")]
            Socket::Unixgram(socket) => socket.send(buf),
        }
    }
}

enum SocketState {
    // Intermediate state during send attempts.
    Inconsistent,

    // The socket failed and will be re-created on the next send.
    Disconnected,

    // The socket is ready to send payloads.
    Ready(Socket),
}

/// Datagram transport to a StatsD collector, over UDP or a Unix datagram socket.
///
/// The socket is created up front so that unrecoverable local errors surface when the client is built. If a send
/// fails, the socket is dropped and lazily re-created on the next send.
pub struct DatagramTransport {
    remote_addr: RemoteAddr,
    write_timeout: Duration,
    state: SocketState,
}

impl DatagramTransport {
    pub(crate) fn connect(remote_addr: RemoteAddr, write_timeout: Duration) -> io::Result<Self> {
        let socket = Socket::connect(&remote_addr, write_timeout)?;
        Ok(Self { remote_addr, write_timeout, state: SocketState::Ready(socket) })
    }
}

impl Transport for DatagramTransport {
    fn send(&mut self, payload: &[u8]) -> io::Result<usize> {
        loop {
            let old_state = std::mem::replace(&mut self.state, SocketState::Inconsistent);
            match old_state {
                SocketState::Inconsistent => unreachable!("transitioned _from_ inconsistent state"),
                SocketState::Disconnected => {
                    let socket = Socket::connect(&self.remote_addr, self.write_timeout);
                    match socket {
                        Ok(socket) => self.state = SocketState::Ready(socket),
                        Err(e) => {
                            self.state = SocketState::Disconnected;
                            return Err(e);
                        }
                    }
                }
                SocketState::Ready(mut socket) => {
                    let result = socket.send(payload);
                    if result.is_ok() {
                        self.state = SocketState::Ready(socket);
                    } else {
                        self.state = SocketState::Disconnected;
                    }

                    return result;
                }
            }
        }
    }

    fn transport_id(&self) -> &'static str {
        self.remote_addr.transport_id()
    }
}

/// Marks the forwarder as stopped when dropped, including when unwinding from a panic.
struct StoppedGuard {
    state: WorkerStateCell,
}

impl Drop for StoppedGuard {
    fn drop(&mut self) {
        self.state.set(WorkerState::Stopped);
    }
}

pub(crate) struct Forwarder<T> {
    transport: T,
    config: ForwarderConfiguration,
    consumer: QueueConsumer,
    telemetry: Arc<Telemetry>,
    state: WorkerStateCell,
    abandon: Arc<AtomicBool>,
    // Never sent on. The completion channel disconnects once this is dropped along with the rest of the forwarder,
    // which happens after the transport has been released.
    _done: Sender<()>,
}

impl<T: Transport> Forwarder<T> {
    /// Create a new synchronous `Forwarder`.
    pub fn new(
        transport: T,
        config: ForwarderConfiguration,
        consumer: QueueConsumer,
        telemetry: Arc<Telemetry>,
        state: WorkerStateCell,
        abandon: Arc<AtomicBool>,
        done: Sender<()>,
    ) -> Self {
        Forwarder { transport, config, consumer, telemetry, state, abandon, _done: done }
    }

    fn next_record(&self, next_report: Option<Instant>) -> Popped {
        match next_report {
            Some(deadline) => self.consumer.pop_deadline(deadline),
            None => self.consumer.pop(),
        }
    }

    fn observe_shutdown(&self) {
        if self.state.get() == WorkerState::Running && self.consumer.is_shutdown_signalled() {
            debug!(queued = self.consumer.len(), "Shutdown signalled, draining remaining records.");
            self.state.set(WorkerState::Draining);
        }
    }

    fn write_record(&self, writer: &mut PayloadWriter, record: &MetricRecord, update: &mut TelemetryUpdate) {
        let result = writer.write_record(record);
        if result.any_failures() {
            warn!(
                metric_name = record.name(),
                max_payload_len = self.config.max_payload_len,
                "Dropped record larger than the maximum payload length."
            );
            update.increment_records_dropped_oversized(result.records_dropped());
        } else {
            update.increment_records_written(result.records_written());
        }
    }

    fn flush(&mut self, writer: &mut PayloadWriter, update: &mut TelemetryUpdate) {
        let mut payloads = writer.payloads();
        let mut payloads_sent = 0;
        let mut payloads_dropped = 0;

        while let Some(payload) = payloads.next_payload() {
            match self.transport.send(payload) {
                Ok(_) => {
                    update.track_packet_send_succeeded(payload.len());
                    payloads_sent += 1;
                }
                Err(e) => {
                    error!(error = %e, transport = self.transport.transport_id(), "Failed to send payload.");
                    update.track_packet_send_failed(payload.len());
                    payloads_dropped += 1;
                }
            }

            if self.abandon.load(Ordering::Acquire) {
                break;
            }
        }

        trace!(payloads_sent, payloads_dropped, "Finished sending payloads.");
    }

    /// Run the forwarder, sending out records as they arrive until the queue is shut down and drained.
    pub fn run(mut self) {
        let _guard = StoppedGuard { state: self.state.clone() };

        let mut writer =
            PayloadWriter::new(self.config.max_payload_len).with_prefix(self.config.prefix.clone());
        let mut update = TelemetryUpdate::default();
        let mut reporter = TelemetryReporter::new();
        let mut next_report = self.config.telemetry_interval.map(|interval| Instant::now() + interval);

        debug!(transport = self.transport.transport_id(), "Forwarder started.");

        loop {
            self.observe_shutdown();

            if self.abandon.load(Ordering::Acquire) {
                let remaining = self.consumer.len();
                warn!(remaining, "Abandoning remaining records after close timeout.");
                self.telemetry.track_abandoned(remaining);
                break;
            }

            update.clear();
            match self.next_record(next_report) {
                Popped::Record(record) => {
                    self.write_record(&mut writer, &record, &mut update);

                    // Fold in whatever is already waiting, so that bursts share payloads.
                    for _ in 0..MAX_RECORDS_PER_FLUSH {
                        match self.consumer.try_pop() {
                            Popped::Record(record) => self.write_record(&mut writer, &record, &mut update),
                            Popped::Empty | Popped::Shutdown => break,
                        }
                    }
                }
                Popped::Empty => {}
                Popped::Shutdown => break,
            }

            if let Some(deadline) = next_report {
                if Instant::now() >= deadline {
                    // Account for what we're about to send before reporting it.
                    self.telemetry.apply_update(&update);
                    update.clear();

                    let snapshot = self.telemetry.snapshot();
                    reporter.report(&snapshot, &mut writer);
                    next_report = self.config.telemetry_interval.map(|interval| deadline.max(Instant::now()) + interval);
                }
            }

            if writer.has_pending() {
                self.flush(&mut writer, &mut update);
            }

            if update.had_updates() {
                self.telemetry.apply_update(&update);
            }
        }

        debug!(transport = self.transport.transport_id(), "Forwarder stopped.");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::UdpSocket,
        sync::{atomic::AtomicBool, Arc},
        thread,
        time::Duration,
    };

    use crossbeam_channel::bounded;

    use super::{DatagramTransport, Forwarder};
    use crate::{
        forwarder::{ForwarderConfiguration, RemoteAddr, Transport, WorkerState, WorkerStateCell},
        queue::{DeliveryQueue, OverflowPolicy},
        record::MetricRecord,
        telemetry::Telemetry,
    };

    fn config() -> ForwarderConfiguration {
        ForwarderConfiguration { max_payload_len: 1432, prefix: None, telemetry_interval: None }
    }

    #[test]
    fn datagram_transport_sends_to_collector() {
        let collector = UdpSocket::bind("127.0.0.1:0").unwrap();
        collector.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let remote_addr = RemoteAddr::try_from(collector.local_addr().unwrap().to_string().as_str()).unwrap();

        let mut transport = DatagramTransport::connect(remote_addr, Duration::from_secs(1)).unwrap();
        assert_eq!(transport.transport_id(), "udp");
        assert_eq!(transport.send(b"foo:1|c").unwrap(), 7);

        let mut buf = [0; 1500];
        let received = collector.recv(&mut buf).unwrap();
        assert_eq!(&buf[..received], b"foo:1|c");
    }

    #[test]
    fn forwarder_drains_queue_before_stopping() {
        let collector = UdpSocket::bind("127.0.0.1:0").unwrap();
        collector.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let remote_addr = RemoteAddr::try_from(collector.local_addr().unwrap().to_string().as_str()).unwrap();

        let transport = DatagramTransport::connect(remote_addr, Duration::from_secs(1)).unwrap();
        let (queue, consumer) = DeliveryQueue::new(None, OverflowPolicy::DropNewest);
        let telemetry = Arc::new(Telemetry::default());
        let state = WorkerStateCell::new();
        let (done_tx, done_rx) = bounded::<()>(0);

        // Queue everything and shut down before the forwarder even starts, so it has to drain.
        queue.push(MetricRecord::counter("a", 1).unwrap()).unwrap();
        queue.push(MetricRecord::counter("b", 2).unwrap()).unwrap();
        queue.signal_shutdown();

        let forwarder = Forwarder::new(
            transport,
            config(),
            consumer,
            Arc::clone(&telemetry),
            state.clone(),
            Arc::new(AtomicBool::new(false)),
            done_tx,
        );
        let handle = thread::spawn(move || forwarder.run());

        // The completion channel disconnects once the forwarder is done.
        assert!(done_rx.recv().is_err());
        handle.join().unwrap();
        assert_eq!(state.get(), WorkerState::Stopped);

        let mut buf = [0; 1500];
        let received = collector.recv(&mut buf).unwrap();
        assert_eq!(&buf[..received], b"a:1|c\nb:2|c");

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.records_written, 2);
        assert_eq!(snapshot.packets_sent, 1);
    }
}
