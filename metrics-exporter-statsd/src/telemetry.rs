use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

use crate::{record::MetricRecord, writer::PayloadWriter};

/// Client telemetry.
///
/// `Telemetry` collects information about the client's behavior: how many records were queued or dropped on the
/// producer side, and how many payloads and bytes the forwarder sent or failed to send. Producers update it directly,
/// while the forwarder batches its updates through [`TelemetryUpdate`].
#[derive(Default)]
pub(crate) struct Telemetry {
    records_enqueued: AtomicU64,
    records_dropped_queue_full: AtomicU64,
    records_evicted: AtomicU64,
    records_written: AtomicU64,
    records_dropped_oversized: AtomicU64,
    records_abandoned: AtomicU64,
    packets_sent: AtomicU64,
    packets_dropped: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_dropped: AtomicU64,
}

impl Telemetry {
    pub fn track_enqueued(&self) {
        self.records_enqueued.fetch_add(1, Relaxed);
    }

    pub fn track_dropped_queue_full(&self) {
        self.records_dropped_queue_full.fetch_add(1, Relaxed);
    }

    pub fn track_evicted(&self, count: usize) {
        self.records_enqueued.fetch_add(1, Relaxed);
        self.records_evicted.fetch_add(count as u64, Relaxed);
    }

    pub fn track_abandoned(&self, count: usize) {
        self.records_abandoned.fetch_add(count as u64, Relaxed);
    }

    /// Applies the given telemetry update.
    pub fn apply_update(&self, update: &TelemetryUpdate) {
        self.records_written.fetch_add(update.records_written, Relaxed);
        self.records_dropped_oversized.fetch_add(update.records_dropped_oversized, Relaxed);
        self.packets_sent.fetch_add(update.packets_sent, Relaxed);
        self.packets_dropped.fetch_add(update.packets_dropped, Relaxed);
        self.bytes_sent.fetch_add(update.bytes_sent, Relaxed);
        self.bytes_dropped.fetch_add(update.bytes_dropped, Relaxed);
    }

    /// Takes a point-in-time copy of the counters.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            records_enqueued: self.records_enqueued.load(Relaxed),
            records_dropped_queue_full: self.records_dropped_queue_full.load(Relaxed),
            records_evicted: self.records_evicted.load(Relaxed),
            records_written: self.records_written.load(Relaxed),
            records_dropped_oversized: self.records_dropped_oversized.load(Relaxed),
            records_abandoned: self.records_abandoned.load(Relaxed),
            packets_sent: self.packets_sent.load(Relaxed),
            packets_dropped: self.packets_dropped.load(Relaxed),
            bytes_sent: self.bytes_sent.load(Relaxed),
            bytes_dropped: self.bytes_dropped.load(Relaxed),
        }
    }
}

/// Point-in-time copy of the client's telemetry counters.
///
/// All counters are cumulative over the lifetime of the client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Records accepted into the delivery queue.
    pub records_enqueued: u64,

    /// Records dropped because the delivery queue was full.
    pub records_dropped_queue_full: u64,

    /// Queued records evicted to make room for newer ones.
    pub records_evicted: u64,

    /// Records encoded into a payload.
    pub records_written: u64,

    /// Records dropped because their encoding exceeded the maximum payload length.
    pub records_dropped_oversized: u64,

    /// Records left in the queue when the forwarder was told to give up after a close timeout.
    pub records_abandoned: u64,

    /// Payloads handed to the transport successfully.
    pub packets_sent: u64,

    /// Payloads the transport failed to send.
    pub packets_dropped: u64,

    /// Bytes handed to the transport successfully.
    pub bytes_sent: u64,

    /// Bytes the transport failed to send.
    pub bytes_dropped: u64,
}

/// A buffer for collecting telemetry updates.
#[derive(Default)]
pub(crate) struct TelemetryUpdate {
    records_written: u64,
    records_dropped_oversized: u64,
    packets_sent: u64,
    packets_dropped: u64,
    bytes_sent: u64,
    bytes_dropped: u64,
}

impl TelemetryUpdate {
    /// Clears the update buffer, resetting it back to an empty state.
    pub fn clear(&mut self) {
        *self = TelemetryUpdate::default();
    }

    /// Returns `true` if any updates have been recorded.
    pub fn had_updates(&self) -> bool {
        self.records_written > 0
            || self.records_dropped_oversized > 0
            || self.packets_sent > 0
            || self.packets_dropped > 0
    }

    pub fn increment_records_written(&mut self, value: u64) {
        self.records_written += value;
    }

    pub fn increment_records_dropped_oversized(&mut self, value: u64) {
        self.records_dropped_oversized += value;
    }

    /// Tracks a successful packet send.
    pub fn track_packet_send_succeeded(&mut self, bytes_len: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes_len as u64;
    }

    /// Tracks a failed packet send.
    pub fn track_packet_send_failed(&mut self, bytes_len: usize) {
        self.packets_dropped += 1;
        self.bytes_dropped += bytes_len as u64;
    }
}

const TELEMETRY_NAMESPACE: &str = "statsd.client";

/// Periodically reports the client's own telemetry to the collector.
///
/// Each report writes the change in every counter since the previous report as a StatsD counter under the
/// `statsd.client` namespace, so the collector can sum them like any other counter.
pub(crate) struct TelemetryReporter {
    last: TelemetrySnapshot,
}

impl TelemetryReporter {
    pub fn new() -> Self {
        Self { last: TelemetrySnapshot::default() }
    }

    /// Writes the deltas between `current` and the previous report into `writer`.
    pub fn report(&mut self, current: &TelemetrySnapshot, writer: &mut PayloadWriter) -> u64 {
        let deltas = [
            ("records_enqueued", current.records_enqueued - self.last.records_enqueued),
            (
                "records_dropped_queue_full",
                current.records_dropped_queue_full - self.last.records_dropped_queue_full,
            ),
            ("records_evicted", current.records_evicted - self.last.records_evicted),
            ("records_written", current.records_written - self.last.records_written),
            (
                "records_dropped_oversized",
                current.records_dropped_oversized - self.last.records_dropped_oversized,
            ),
            ("packets_sent", current.packets_sent - self.last.packets_sent),
            ("packets_dropped", current.packets_dropped - self.last.packets_dropped),
            ("bytes_sent", current.bytes_sent - self.last.bytes_sent),
            ("bytes_dropped", current.bytes_dropped - self.last.bytes_dropped),
        ];
        self.last = *current;

        let mut written = 0;
        for (name, delta) in deltas {
            let delta = i64::try_from(delta).unwrap_or(i64::MAX);
            let record = MetricRecord::counter(format!("{}.{}", TELEMETRY_NAMESPACE, name), delta);
            if let Ok(record) = record {
                written += writer.write_record(&record).records_written();
            }
        }

        written
    }
}
