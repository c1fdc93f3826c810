use std::{
    io,
    net::{SocketAddr, ToSocketAddrs as _},
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use crossbeam_channel::bounded;
use quanta::Clock;
use thiserror::Error;
use tracing::debug;

use crate::{
    client::{Emitter, StatsdClient, WorkerHandle},
    forwarder::{sync::DatagramTransport, sync::Forwarder, ForwarderConfiguration, RemoteAddr, Transport, WorkerStateCell},
    queue::{DeliveryQueue, OverflowPolicy},
    record::validate_name,
    telemetry::Telemetry,
    writer::SMALLEST_VALID_PAYLOAD,
};

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_PAYLOAD_LEN: usize = 1432;
const DEFAULT_QUEUE_CAPACITY: usize = 65_536;

// Largest payload that fits in a single UDP datagram over IPv4.
const MAX_PAYLOAD_LEN: usize = 65_507;

/// Errors that could occur while building or installing a StatsD client.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Failed to parse the remote address.
    #[error("invalid remote address: {reason}")]
    InvalidRemoteAddress {
        /// Details about the parsing failure.
        reason: String,
    },

    /// The metric name prefix is not representable on the wire.
    #[error("invalid prefix '{prefix}'")]
    InvalidPrefix {
        /// The rejected prefix.
        prefix: String,
    },

    /// The maximum payload length is too small to hold any record, or too large for a datagram.
    #[error("invalid maximum payload length {len}, must be between 5 and 65507 bytes")]
    InvalidMaximumPayloadLength {
        /// The rejected length.
        len: usize,
    },

    /// The queue capacity was zero.
    #[error("queue capacity must be greater than zero")]
    InvalidQueueCapacity,

    /// Failed to create the local socket.
    #[error("failed to create transport: {0}")]
    Transport(#[source] io::Error),

    /// Failed to spawn the forwarder thread.
    #[error("failed to spawn forwarder thread")]
    Backend,

    /// Failed to install the recorder due to an existing global recorder already being installed.
    #[error("failed to install exporter as global recorder")]
    FailedToInstall,
}

/// Builder for a [`StatsdClient`].
pub struct StatsdBuilder {
    remote_addr: RemoteAddr,
    prefix: Option<String>,
    write_timeout: Duration,
    max_payload_len: usize,
    queue_capacity: Option<usize>,
    overflow_policy: OverflowPolicy,
    close_timeout: Option<Duration>,
    telemetry_interval: Option<Duration>,
    clock: Clock,
}

impl StatsdBuilder {
    /// Set the remote address to forward metrics to.
    ///
    /// For UDP, the address simply needs to be in the format of `<host>:<port>`, optionally prefixed with `udp://`. On
    /// Linux, a Unix datagram socket can be used with an address in the format of `unixgram://<path>`.
    ///
    /// Defaults to sending to `127.0.0.1:8125` over UDP.
    ///
    /// # Errors
    ///
    /// If the given address is not able to be parsed as a valid address, an error will be returned indicating the
    /// reason.
    pub fn with_remote_address<A>(mut self, addr: A) -> Result<Self, BuildError>
    where
        A: AsRef<str>,
    {
        self.remote_addr = RemoteAddr::try_from(addr.as_ref())
            .map_err(|reason| BuildError::InvalidRemoteAddress { reason })?;
        Ok(self)
    }

    /// Set the remote address to forward metrics to, from a separate host and port.
    ///
    /// # Errors
    ///
    /// If the host does not resolve to at least one address, an error will be returned indicating the reason.
    pub fn with_host_and_port(mut self, host: &str, port: u16) -> Result<Self, BuildError> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| BuildError::InvalidRemoteAddress { reason: e.to_string() })?
            .collect::<Vec<_>>();
        if addrs.is_empty() {
            return Err(BuildError::InvalidRemoteAddress {
                reason: format!("'{}' did not resolve to any addresses", host),
            });
        }

        self.remote_addr = RemoteAddr::Udp(addrs);
        Ok(self)
    }

    /// Set the prefix prepended to every metric name.
    ///
    /// The prefix is joined to each name with a `.`, so a prefix of `app` turns `requests` into `app.requests`. It is
    /// validated when the client is built.
    ///
    /// Defaults to no prefix.
    pub fn with_prefix<P>(mut self, prefix: P) -> Self
    where
        P: Into<String>,
    {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set the write timeout for forwarding metrics.
    ///
    /// When the socket's send buffer is full, sends block for at most this long before the payload is dropped.
    ///
    /// Defaults to 1 second.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the maximum payload length, in bytes.
    ///
    /// Records are batched into payloads up to this size. The default of 1432 bytes keeps each payload within a single
    /// Ethernet frame once IP and UDP headers are accounted for.
    ///
    /// Defaults to 1432 bytes.
    pub fn with_maximum_payload_length(mut self, max_payload_len: usize) -> Self {
        self.max_payload_len = max_payload_len;
        self
    }

    /// Set the capacity of the delivery queue, in records.
    ///
    /// `None` makes the queue unbounded, in which case the overflow policy has no effect.
    ///
    /// Defaults to 65,536 records.
    pub fn with_queue_capacity(mut self, capacity: Option<usize>) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set what happens when a record is emitted while the delivery queue is full.
    ///
    /// Defaults to [`OverflowPolicy::DropNewest`].
    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    /// Set how long closing the client waits for queued records to be sent.
    ///
    /// `None` waits indefinitely.
    ///
    /// Defaults to 5 seconds.
    pub fn with_close_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Set how often the client reports its own telemetry to the collector.
    ///
    /// Telemetry is sent as counters under the `statsd.client` namespace, after the configured prefix. `None` disables
    /// reporting, though telemetry is still available from [`StatsdClient::telemetry`].
    ///
    /// Defaults to `None`.
    pub fn with_telemetry_interval(mut self, interval: Option<Duration>) -> Self {
        self.telemetry_interval = interval;
        self
    }

    /// Set the clock used by timers.
    ///
    /// This is primarily useful for testing, with a mocked clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn validate(&self) -> Result<(), BuildError> {
        if let Some(prefix) = &self.prefix {
            if validate_name(prefix).is_err() {
                return Err(BuildError::InvalidPrefix { prefix: prefix.clone() });
            }
        }

        if !(SMALLEST_VALID_PAYLOAD.len()..=MAX_PAYLOAD_LEN).contains(&self.max_payload_len) {
            return Err(BuildError::InvalidMaximumPayloadLength { len: self.max_payload_len });
        }

        if self.queue_capacity == Some(0) {
            return Err(BuildError::InvalidQueueCapacity);
        }

        Ok(())
    }

    /// Builds the client.
    ///
    /// The socket to the remote address is created, and the forwarder thread is spawned.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, the socket cannot be created, or the forwarder thread cannot be spawned, an
    /// error will be returned.
    pub fn build(self) -> Result<StatsdClient, BuildError> {
        self.validate()?;

        let transport =
            DatagramTransport::connect(self.remote_addr.clone(), self.write_timeout).map_err(BuildError::Transport)?;
        self.build_with_transport(transport)
    }

    /// Builds the client, forwarding payloads to the given transport instead of the remote address.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, or the forwarder thread cannot be spawned, an error will be returned.
    pub fn build_with_transport<T>(self, transport: T) -> Result<StatsdClient, BuildError>
    where
        T: Transport,
    {
        self.validate()?;

        let telemetry = Arc::new(Telemetry::default());
        let (queue, consumer) = DeliveryQueue::new(self.queue_capacity, self.overflow_policy);
        let emitter = Arc::new(Emitter::new(queue, Arc::clone(&telemetry)));

        let forwarder_config = ForwarderConfiguration {
            max_payload_len: self.max_payload_len,
            prefix: self.prefix,
            telemetry_interval: self.telemetry_interval,
        };

        let state = WorkerStateCell::new();
        let abandon = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = bounded(0);
        let forwarder = Forwarder::new(
            transport,
            forwarder_config,
            consumer,
            Arc::clone(&telemetry),
            state.clone(),
            Arc::clone(&abandon),
            done_tx,
        );

        let thread = std::thread::Builder::new()
            .name("metrics-exporter-statsd-forwarder".to_string())
            .spawn(move || forwarder.run())
            .map_err(|_| BuildError::Backend)?;

        debug!(
            queue_capacity = ?self.queue_capacity,
            overflow_policy = ?self.overflow_policy,
            max_payload_len = self.max_payload_len,
            "Spawned forwarder."
        );

        let worker = WorkerHandle { thread, done: done_rx, state, abandon };
        Ok(StatsdClient::from_parts(emitter, worker, telemetry, self.close_timeout, self.clock))
    }

    /// Builds the client and installs a recorder for it as the global [`metrics`] recorder.
    ///
    /// The returned client must be kept alive for as long as metrics should be forwarded: dropping it closes the
    /// client, after which the installed recorder discards everything it is handed.
    ///
    /// # Errors
    ///
    /// If the client cannot be built, or if a global recorder is already installed, an error will be returned.
    pub fn install(self) -> Result<StatsdClient, BuildError> {
        let client = self.build()?;

        metrics::set_global_recorder(client.recorder()).map_err(|_| BuildError::FailedToInstall)?;
        Ok(client)
    }
}

impl Default for StatsdBuilder {
    fn default() -> Self {
        StatsdBuilder {
            remote_addr: RemoteAddr::Udp(vec![SocketAddr::from(([127, 0, 0, 1], 8125))]),
            prefix: None,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            queue_capacity: Some(DEFAULT_QUEUE_CAPACITY),
            overflow_policy: OverflowPolicy::default(),
            close_timeout: Some(DEFAULT_CLOSE_TIMEOUT),
            telemetry_interval: None,
            clock: Clock::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io, time::Duration};

    use super::{BuildError, StatsdBuilder};
    use crate::forwarder::Transport;

    struct Discard;

    impl Transport for Discard {
        fn send(&mut self, payload: &[u8]) -> io::Result<usize> {
            Ok(payload.len())
        }
    }

    #[test]
    fn rejects_invalid_remote_address() {
        let result = StatsdBuilder::default().with_remote_address("tcp://127.0.0.1:8125");
        assert!(matches!(result, Err(BuildError::InvalidRemoteAddress { .. })));
    }

    #[test]
    fn rejects_invalid_prefix() {
        for prefix in ["", "bad:prefix", "bad|prefix", "bad\nprefix"] {
            let result = StatsdBuilder::default().with_prefix(prefix).build_with_transport(Discard);
            assert!(matches!(result, Err(BuildError::InvalidPrefix { .. })), "prefix {:?} was accepted", prefix);
        }
    }

    #[test]
    fn rejects_invalid_payload_length() {
        for len in [0, 4, 65_508] {
            let result = StatsdBuilder::default().with_maximum_payload_length(len).build_with_transport(Discard);
            assert!(matches!(result, Err(BuildError::InvalidMaximumPayloadLength { len: l }) if l == len));
        }

        let client = StatsdBuilder::default().with_maximum_payload_length(5).build_with_transport(Discard);
        assert!(client.is_ok());
    }

    #[test]
    fn rejects_zero_queue_capacity() {
        let result = StatsdBuilder::default().with_queue_capacity(Some(0)).build_with_transport(Discard);
        assert!(matches!(result, Err(BuildError::InvalidQueueCapacity)));
    }

    #[test]
    fn builds_with_unbounded_queue() {
        let client = StatsdBuilder::default()
            .with_queue_capacity(None)
            .with_close_timeout(None)
            .with_telemetry_interval(Some(Duration::from_millis(10)))
            .build_with_transport(Discard)
            .unwrap();

        client.incr("hits", 1).unwrap();
        client.close().unwrap();
        assert_eq!(client.telemetry().records_enqueued, 1);
    }

    #[test]
    fn builds_udp_client() {
        let client = StatsdBuilder::default().with_host_and_port("127.0.0.1", 8125).unwrap().build().unwrap();
        client.close().unwrap();
    }
}
