use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use quanta::Clock;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::{
    builder::{BuildError, StatsdBuilder},
    forwarder::{WorkerState, WorkerStateCell},
    queue::{DeliveryQueue, PushOutcome, QueueClosed},
    record::{MetricRecord, RecordError, Value},
    recorder::StatsdRecorder,
    telemetry::{Telemetry, TelemetrySnapshot},
    timer::Timer,
};

/// Errors that could occur while emitting a metric.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EmitError {
    /// The client has been closed and no longer accepts records.
    #[error("client is closed")]
    Closed,

    /// The record could not be constructed.
    #[error("invalid record: {0}")]
    InvalidRecord(#[from] RecordError),
}

/// Errors that could occur while closing the client.
#[derive(Debug, Error)]
pub enum CloseError {
    /// The forwarder did not finish draining the queue in time.
    ///
    /// The forwarder is told to give up on whatever is left in the queue, and exits after the payload it is currently
    /// sending. The forwarder thread is detached rather than joined, so the transport is released asynchronously, after
    /// `close` has returned.
    #[error("forwarder did not finish draining within {timeout:?}")]
    ShutdownTimeout {
        /// The close timeout that elapsed.
        timeout: Duration,
    },

    /// The forwarder thread panicked.
    #[error("forwarder thread panicked")]
    WorkerPanicked,
}

/// Producer side of the client, shared between the client and any recorders created from it.
pub(crate) struct Emitter {
    queue: DeliveryQueue,
    telemetry: Arc<Telemetry>,
}

impl Emitter {
    pub fn new(queue: DeliveryQueue, telemetry: Arc<Telemetry>) -> Self {
        Self { queue, telemetry }
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Hands the record to the delivery queue.
    ///
    /// A record dropped by the overflow policy is not an error: it is counted in telemetry and the call succeeds.
    pub fn emit(&self, record: MetricRecord) -> Result<(), EmitError> {
        match self.queue.push(record) {
            Ok(PushOutcome::Enqueued) => self.telemetry.track_enqueued(),
            Ok(PushOutcome::DroppedNewest) => {
                trace!("Delivery queue full, dropped record.");
                self.telemetry.track_dropped_queue_full();
            }
            Ok(PushOutcome::EvictedOldest(evicted)) => {
                trace!(evicted, "Delivery queue full, evicted oldest records.");
                self.telemetry.track_evicted(evicted);
            }
            Err(QueueClosed) => return Err(EmitError::Closed),
        }

        Ok(())
    }

    fn signal_shutdown(&self) {
        self.queue.signal_shutdown();
    }
}

/// Handle to the forwarder thread.
pub(crate) struct WorkerHandle {
    pub thread: JoinHandle<()>,
    // Disconnects once the forwarder has exited and released its transport.
    pub done: Receiver<()>,
    pub state: WorkerStateCell,
    pub abandon: Arc<AtomicBool>,
}

/// A StatsD client.
///
/// Emission methods never block on the network: records are handed to a background forwarder thread, which batches
/// them into payloads and sends them to the collector. Whether a record arrives is best-effort, but records handed to
/// the client before [`close`][Self::close] are all attempted before the forwarder stops.
///
/// The client is closed when dropped, so holding it in a scope is enough to flush everything emitted within that scope
/// once the scope ends.
///
/// `StatsdClient` is `Send + Sync`, and can be shared between threads behind an `Arc`.
pub struct StatsdClient {
    emitter: Arc<Emitter>,
    worker: Mutex<Option<WorkerHandle>>,
    state: WorkerStateCell,
    telemetry: Arc<Telemetry>,
    close_timeout: Option<Duration>,
    clock: Clock,
}

impl StatsdClient {
    /// Creates a client sending to the collector at `host:port`, with every other setting left at its default.
    ///
    /// # Errors
    ///
    /// If the address does not resolve, or the local socket cannot be created, an error is returned.
    pub fn new(host: &str, port: u16) -> Result<Self, BuildError> {
        StatsdBuilder::default().with_host_and_port(host, port)?.build()
    }

    /// Creates a [`StatsdBuilder`] for configuring a client.
    pub fn builder() -> StatsdBuilder {
        StatsdBuilder::default()
    }

    pub(crate) fn from_parts(
        emitter: Arc<Emitter>, worker: WorkerHandle, telemetry: Arc<Telemetry>, close_timeout: Option<Duration>,
        clock: Clock,
    ) -> Self {
        let state = worker.state.clone();
        Self { emitter, worker: Mutex::new(Some(worker)), state, telemetry, close_timeout, clock }
    }

    /// Emits a counter.
    ///
    /// # Errors
    ///
    /// If the client is closed, or the name or sample rate is invalid, an error is returned.
    pub fn counter(&self, name: &str, delta: i64, sample_rate: Option<f64>) -> Result<(), EmitError> {
        self.ensure_open()?;
        self.emit(MetricRecord::counter(name, delta)?.with_maybe_sample_rate(sample_rate)?)
    }

    /// Increments a counter by `count`.
    ///
    /// # Errors
    ///
    /// If the client is closed, or the name is invalid, an error is returned.
    pub fn incr(&self, name: &str, count: i64) -> Result<(), EmitError> {
        self.counter(name, count, None)
    }

    /// Decrements a counter by `count`.
    ///
    /// # Errors
    ///
    /// If the client is closed, or the name is invalid, an error is returned.
    pub fn decr(&self, name: &str, count: i64) -> Result<(), EmitError> {
        self.counter(name, count.saturating_neg(), None)
    }

    /// Emits a timing, in milliseconds.
    ///
    /// # Errors
    ///
    /// If the client is closed, or the name, value or sample rate is invalid, an error is returned.
    pub fn timing<V: Into<Value>>(&self, name: &str, millis: V, sample_rate: Option<f64>) -> Result<(), EmitError> {
        self.ensure_open()?;
        self.emit(MetricRecord::timer(name, millis)?.with_maybe_sample_rate(sample_rate)?)
    }

    /// Sets a gauge to an absolute value.
    ///
    /// # Errors
    ///
    /// If the client is closed, or the name, value or sample rate is invalid, an error is returned.
    pub fn gauge<V: Into<Value>>(&self, name: &str, value: V, sample_rate: Option<f64>) -> Result<(), EmitError> {
        self.ensure_open()?;
        self.emit(MetricRecord::gauge(name, value)?.with_maybe_sample_rate(sample_rate)?)
    }

    /// Changes a gauge relative to its current value.
    ///
    /// # Errors
    ///
    /// If the client is closed, or the name, value or sample rate is invalid, an error is returned.
    pub fn gauge_delta<V: Into<Value>>(&self, name: &str, delta: V, sample_rate: Option<f64>) -> Result<(), EmitError> {
        self.ensure_open()?;
        self.emit(MetricRecord::gauge_delta(name, delta)?.with_maybe_sample_rate(sample_rate)?)
    }

    /// Adds a member to a set.
    ///
    /// # Errors
    ///
    /// If the client is closed, or the name, value or sample rate is invalid, an error is returned.
    pub fn set<V: Into<Value>>(&self, name: &str, value: V, sample_rate: Option<f64>) -> Result<(), EmitError> {
        self.ensure_open()?;
        self.emit(MetricRecord::set(name, value)?.with_maybe_sample_rate(sample_rate)?)
    }

    /// Emits a pre-built record.
    ///
    /// # Errors
    ///
    /// If the client is closed, an error is returned.
    pub fn emit(&self, record: MetricRecord) -> Result<(), EmitError> {
        self.emitter.emit(record)
    }

    /// Starts a timer that emits its elapsed time under `name` when stopped or dropped.
    pub fn timer(&self, name: &str) -> Timer<'_> {
        Timer::new(self, name, None)
    }

    /// Starts a timer whose timing is annotated with the given sample rate.
    pub fn timer_with_rate(&self, name: &str, sample_rate: f64) -> Timer<'_> {
        Timer::new(self, name, Some(sample_rate))
    }

    /// Runs `f`, emitting how long it took as a timing under `name`.
    ///
    /// The result of `f` is always returned. If the timing cannot be emitted, the failure is logged.
    pub fn time<F, R>(&self, name: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let timer = self.timer(name);
        let result = f();
        if let Err(e) = timer.stop() {
            debug!(error = %e, metric_name = name, "Failed to emit timing.");
        }
        result
    }

    /// Closes the client.
    ///
    /// No further records are accepted, and the call blocks until every record that was already queued has been
    /// handed to the transport and the transport has been released, or until the close timeout elapses. Calling
    /// `close` again has no further effect, though a call made while another thread is still closing the client waits for
    /// that thread to finish first.
    ///
    /// # Errors
    ///
    /// If the forwarder does not finish within the close timeout, [`CloseError::ShutdownTimeout`] is returned and the
    /// remaining records are abandoned. If the forwarder thread panicked, [`CloseError::WorkerPanicked`] is returned.
    pub fn close(&self) -> Result<(), CloseError> {
        self.emitter.signal_shutdown();

        // The guard is held until the forwarder is done, so concurrent callers return only after it has drained.
        let mut guard = self.worker.lock();
        let Some(worker) = guard.take() else {
            return Ok(());
        };

        debug!(close_timeout = ?self.close_timeout, "Closing client.");

        if let Some(timeout) = self.close_timeout {
            if let Err(RecvTimeoutError::Timeout) = worker.done.recv_timeout(timeout) {
                warn!(?timeout, "Forwarder did not drain in time, abandoning remaining records.");
                worker.abandon.store(true, Ordering::Release);
                return Err(CloseError::ShutdownTimeout { timeout });
            }
        } else {
            // Nothing is ever sent on the completion channel, so this only returns once it disconnects.
            let _ = worker.done.recv();
        }

        worker.thread.join().map_err(|_| CloseError::WorkerPanicked)
    }

    /// Returns `true` if the client has been closed.
    pub fn is_closed(&self) -> bool {
        self.emitter.is_closed()
    }

    /// Returns the current state of the forwarder thread.
    pub fn worker_state(&self) -> WorkerState {
        self.state.get()
    }

    /// Returns a snapshot of the client's telemetry.
    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Creates a [`metrics`] recorder that forwards to this client.
    ///
    /// The recorder shares this client's queue and forwarder, and so stops forwarding once the client is closed.
    pub fn recorder(&self) -> StatsdRecorder {
        StatsdRecorder::new(Arc::clone(&self.emitter))
    }

    pub(crate) fn clock(&self) -> &Clock {
        &self.clock
    }

    fn ensure_open(&self) -> Result<(), EmitError> {
        if self.emitter.is_closed() {
            Err(EmitError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for StatsdClient {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "Failed to cleanly close StatsD client.");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        thread,
        time::{Duration, Instant},
    };

    use crate::{
        forwarder::{Transport, WorkerState},
        record::RecordError,
        CloseError, EmitError, OverflowPolicy, StatsdBuilder,
    };

    #[derive(Clone, Default)]
    struct Recording {
        payloads: Arc<Mutex<Vec<String>>>,
    }

    impl Recording {
        fn lines(&self) -> Vec<String> {
            self.payloads.lock().unwrap().iter().flat_map(|p| p.lines().map(str::to_string).collect::<Vec<_>>()).collect()
        }
    }

    impl Transport for Recording {
        fn send(&mut self, payload: &[u8]) -> io::Result<usize> {
            self.payloads.lock().unwrap().push(String::from_utf8(payload.to_vec()).unwrap());
            Ok(payload.len())
        }
    }

    struct Stalled;

    impl Transport for Stalled {
        fn send(&mut self, payload: &[u8]) -> io::Result<usize> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(payload.len())
        }
    }

    #[test]
    fn emits_every_kind() {
        let transport = Recording::default();
        let client = StatsdBuilder::default().build_with_transport(transport.clone()).unwrap();

        client.incr("hits", 1).unwrap();
        client.decr("hits", 2).unwrap();
        client.counter("sampled", 3, Some(0.5)).unwrap();
        client.timing("latency", 320, None).unwrap();
        client.gauge("temp", 12.5, None).unwrap();
        client.gauge_delta("temp", -3, None).unwrap();
        client.set("users", 42, None).unwrap();
        client.close().unwrap();

        assert_eq!(
            transport.lines(),
            [
                "hits:1|c",
                "hits:-2|c",
                "sampled:3|c|@0.5",
                "latency:320|ms",
                "temp:12.500000|g",
                "temp:-3|g",
                "users:42|s"
            ]
        );
    }

    #[test]
    fn close_is_idempotent() {
        let client = StatsdBuilder::default().build_with_transport(Recording::default()).unwrap();
        assert_eq!(client.worker_state(), WorkerState::Running);

        client.close().unwrap();
        assert!(client.is_closed());
        assert_eq!(client.worker_state(), WorkerState::Stopped);

        client.close().unwrap();
        assert_eq!(client.worker_state(), WorkerState::Stopped);
    }

    #[test]
    fn concurrent_close_waits_for_drain() {
        struct Slow {
            sent: Arc<AtomicUsize>,
        }

        impl Transport for Slow {
            fn send(&mut self, payload: &[u8]) -> io::Result<usize> {
                thread::sleep(Duration::from_millis(300));
                self.sent.fetch_add(1, Ordering::SeqCst);
                Ok(payload.len())
            }
        }

        let sent = Arc::new(AtomicUsize::new(0));
        let client = Arc::new(
            StatsdBuilder::default()
                .with_close_timeout(None)
                .build_with_transport(Slow { sent: Arc::clone(&sent) })
                .unwrap(),
        );
        client.incr("hits", 1).unwrap();

        let first = {
            let client = Arc::clone(&client);
            thread::spawn(move || client.close())
        };
        thread::sleep(Duration::from_millis(50));

        // Whichever call gets there second still returns only once the record is out.
        client.close().unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 1);
        assert_eq!(client.worker_state(), WorkerState::Stopped);

        first.join().unwrap().unwrap();
    }

    #[test]
    fn close_timeout_holds_with_blocked_producer() {
        struct Sleepy;

        impl Transport for Sleepy {
            fn send(&mut self, payload: &[u8]) -> io::Result<usize> {
                thread::sleep(Duration::from_secs(3));
                Ok(payload.len())
            }
        }

        let client = Arc::new(
            StatsdBuilder::default()
                .with_overflow_policy(OverflowPolicy::Block)
                .with_queue_capacity(Some(1))
                .with_close_timeout(Some(Duration::from_millis(50)))
                .build_with_transport(Sleepy)
                .unwrap(),
        );

        let producer = {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                for i in 0..5 {
                    if client.incr("blocked", i).is_err() {
                        break;
                    }
                }
            })
        };

        // Let the forwarder get stuck in its first send, and the producer on the full queue behind it.
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        let result = client.close();
        assert!(matches!(result, Err(CloseError::ShutdownTimeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(1), "close took {:?}", started.elapsed());

        producer.join().unwrap();
    }

    #[test]
    fn emit_after_close_fails() {
        let client = StatsdBuilder::default().build_with_transport(Recording::default()).unwrap();
        client.close().unwrap();

        assert_eq!(client.incr("hits", 1), Err(EmitError::Closed));
        assert_eq!(client.gauge("temp", 1, None), Err(EmitError::Closed));
    }

    #[test]
    fn invalid_records_are_rejected() {
        let client = StatsdBuilder::default().build_with_transport(Recording::default()).unwrap();

        assert_eq!(client.incr("", 1), Err(EmitError::InvalidRecord(RecordError::EmptyName)));
        assert_eq!(
            client.counter("hits", 1, Some(1.5)),
            Err(EmitError::InvalidRecord(RecordError::InvalidSampleRate { rate: 1.5 }))
        );
        assert_eq!(client.gauge("temp", f64::NAN, None), Err(EmitError::InvalidRecord(RecordError::NonFiniteValue)));
    }

    #[test]
    fn close_times_out_on_stalled_transport() {
        let client = StatsdBuilder::default()
            .with_close_timeout(Some(Duration::from_millis(50)))
            .build_with_transport(Stalled)
            .unwrap();

        for i in 0..10 {
            client.incr(&format!("hits{}", i), 1).unwrap();
        }
        // Give the forwarder a chance to pick the first batch up.
        std::thread::sleep(Duration::from_millis(20));
        for i in 0..10 {
            client.incr(&format!("late{}", i), 1).unwrap();
        }

        match client.close() {
            Err(CloseError::ShutdownTimeout { timeout }) => assert_eq!(timeout, Duration::from_millis(50)),
            other => panic!("expected shutdown timeout, got {:?}", other),
        }

        // A second close does not wait again.
        client.close().unwrap();
    }

    #[test]
    fn time_returns_closure_result() {
        let transport = Recording::default();
        let client = StatsdBuilder::default().build_with_transport(transport.clone()).unwrap();

        let value = client.time("work", || 42);
        assert_eq!(value, 42);
        client.close().unwrap();

        let lines = transport.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("work:") && lines[0].ends_with("|ms"));
    }
}
