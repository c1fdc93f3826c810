use std::{
    fmt::Write as _,
    ops::{Deref, DerefMut},
    vec::Drain,
};

use crate::record::{MetricKind, MetricRecord, Value};

pub(crate) const SMALLEST_VALID_PAYLOAD: &[u8] = b"a:0|c";

/// Number of decimal places used when writing floating-point values.
pub const FLOAT_PRECISION: usize = 6;

struct MetricValueFormatter {
    int_writer: itoa::Buffer,
    scratch: String,
}

impl MetricValueFormatter {
    fn new() -> Self {
        Self { int_writer: itoa::Buffer::new(), scratch: String::new() }
    }

    fn format(&mut self, value: Value) -> &str {
        match value {
            Value::Integer(v) => self.int_writer.format(v),
            Value::Float(v) => {
                // Collapse negative zero so that it doesn't pick up a sign.
                let v = if v == 0.0 { 0.0 } else { v };

                self.scratch.clear();
                let _ = write!(self.scratch, "{:.*}", FLOAT_PRECISION, v);
                &self.scratch
            }
        }
    }

    fn format_sample_rate(&mut self, rate: f64) -> &str {
        // `Display` for floats never switches to exponent notation, and yields the shortest representation that
        // round trips.
        self.scratch.clear();
        let _ = write!(self.scratch, "{}", rate);
        &self.scratch
    }
}

/// Encodes a single metric record into its line protocol representation.
///
/// The output has the form `name:value|type[|@rate]`, with `name` optionally qualified by `prefix`. An absolute gauge
/// with a negative value is encoded as two lines, first resetting the gauge to zero, as a leading sign would otherwise
/// be interpreted as a relative change by the collector.
pub fn encode(record: &MetricRecord, prefix: Option<&str>) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut formatter = MetricValueFormatter::new();
    encode_into(&mut buf, &mut formatter, record, prefix);
    buf
}

fn encode_into(
    buf: &mut Vec<u8>,
    formatter: &mut MetricValueFormatter,
    record: &MetricRecord,
    prefix: Option<&str>,
) {
    let value = record.value();
    if record.kind() == MetricKind::Gauge && !record.is_relative() && value.is_negative() {
        let zero = match value {
            Value::Integer(_) => Value::Integer(0),
            Value::Float(_) => Value::Float(0.0),
        };
        write_line(buf, formatter, prefix, record.name(), zero, false, MetricKind::Gauge, None);
        buf.push(b'\n');
    }

    write_line(
        buf,
        formatter,
        prefix,
        record.name(),
        value,
        record.is_relative(),
        record.kind(),
        record.sample_rate(),
    );
}

#[allow(clippy::too_many_arguments)]
fn write_line(
    buf: &mut Vec<u8>,
    formatter: &mut MetricValueFormatter,
    prefix: Option<&str>,
    name: &str,
    value: Value,
    explicit_sign: bool,
    kind: MetricKind,
    maybe_sample_rate: Option<f64>,
) {
    if let Some(prefix) = prefix {
        buf.extend_from_slice(prefix.as_bytes());
        buf.push(b'.');
    }
    buf.extend_from_slice(name.as_bytes());

    buf.push(b':');
    if explicit_sign && !value.is_negative() {
        buf.push(b'+');
    }
    buf.extend_from_slice(formatter.format(value).as_bytes());

    buf.push(b'|');
    buf.extend_from_slice(kind.type_tag().as_bytes());

    // Write the sample rate only if it's below 1.0, as that is the implied default.
    if let Some(sample_rate) = maybe_sample_rate.filter(|rate| *rate < 1.0) {
        buf.extend_from_slice(b"|@");
        buf.extend_from_slice(formatter.format_sample_rate(sample_rate).as_bytes());
    }
}

#[derive(Debug, Default)]
pub struct WriteResult {
    records_written: u64,
    records_dropped: u64,
}

impl WriteResult {
    const fn success(records_written: u64) -> Self {
        Self { records_written, records_dropped: 0 }
    }

    const fn failure(records_dropped: u64) -> Self {
        Self { records_written: 0, records_dropped }
    }

    pub const fn any_failures(&self) -> bool {
        self.records_dropped != 0
    }

    pub const fn records_written(&self) -> u64 {
        self.records_written
    }

    pub const fn records_dropped(&self) -> u64 {
        self.records_dropped
    }
}

/// Writes encoded records into larger buffers for more efficient network I/O.
///
/// StatsD lines are newline delimited, which means that multiple records can be sent in a single "payload", and then
/// trivially split apart by the collector. This saves on the number of system calls required to send the records over
/// the network.
///
/// A maximum payload length must be specified. When iterating over the payloads, byte slices are returned that contain
/// one or more complete lines, joined by a newline, while never exceeding the maximum payload length. No trailing
/// newline is written.
pub(crate) struct PayloadWriter {
    max_payload_len: usize,
    payloads_buf: Vec<u8>,
    offsets: Vec<usize>,
    line_buf: Vec<u8>,
    formatter: MetricValueFormatter,
    prefix: Option<String>,
}

impl PayloadWriter {
    /// Creates a new `PayloadWriter` with the given maximum payload length.
    pub fn new(max_payload_len: usize) -> Self {
        // NOTE: This is also validated in the builder, but we want to double check here that we're getting a properly
        // sanitized value.
        assert!(
            max_payload_len >= SMALLEST_VALID_PAYLOAD.len(),
            "maximum payload length is too small to allow any metrics to be written (must be {} or greater)",
            SMALLEST_VALID_PAYLOAD.len()
        );

        Self {
            max_payload_len,
            payloads_buf: Vec::new(),
            offsets: Vec::new(),
            line_buf: Vec::new(),
            formatter: MetricValueFormatter::new(),
            prefix: None,
        }
    }

    /// Sets the prefix applied to all metric names.
    pub fn with_prefix(mut self, prefix: Option<String>) -> Self {
        self.prefix = prefix;
        self
    }

    fn last_offset(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    /// Returns the number of bytes in the current, unfinalized payload.
    fn current_payload_len(&self) -> usize {
        self.payloads_buf.len() - self.last_offset()
    }

    /// Returns `true` if any records have been written but not yet drained through [`PayloadWriter::payloads`].
    pub fn has_pending(&self) -> bool {
        !self.payloads_buf.is_empty()
    }

    /// Finalizes the current payload and starts a new one.
    ///
    /// If the current payload is empty, this method does nothing.
    fn finalize_current_payload(&mut self) {
        if self.current_payload_len() == 0 {
            return;
        }

        self.offsets.push(self.payloads_buf.len());
    }

    /// Commits the encoded line(s) in the line buffer to the current payload.
    ///
    /// If the encoded record is larger than the maximum payload length, it is discarded. If the current payload cannot
    /// fit the record without exceeding the maximum payload length, the current payload is finalized first.
    ///
    /// Returns `true` if the record was committed, or `false` if it was discarded.
    fn commit(&mut self) -> bool {
        let line_len = self.line_buf.len();
        if line_len > self.max_payload_len {
            self.line_buf.clear();
            return false;
        }

        // Account for the newline separating this record from the previous one in the same payload.
        let current_payload_len = self.current_payload_len();
        if current_payload_len > 0 && current_payload_len + 1 + line_len > self.max_payload_len {
            self.finalize_current_payload();
        }

        if self.current_payload_len() > 0 {
            self.payloads_buf.push(b'\n');
        }
        self.payloads_buf.extend_from_slice(&self.line_buf);
        self.line_buf.clear();

        true
    }

    /// Writes a single metric record.
    pub fn write_record(&mut self, record: &MetricRecord) -> WriteResult {
        self.line_buf.clear();
        encode_into(&mut self.line_buf, &mut self.formatter, record, self.prefix.as_deref());

        if self.commit() {
            WriteResult::success(1)
        } else {
            WriteResult::failure(1)
        }
    }

    /// Returns a consuming iterator over all payloads written by this writer.
    ///
    /// The iterator will yield payloads in the order they were written, and the payloads will be cleared from the
    /// writer when the iterator is dropped.
    pub fn payloads(&mut self) -> Payloads<'_> {
        self.finalize_current_payload();
        self.line_buf.clear();

        Payloads::new(&mut self.payloads_buf, &mut self.offsets)
    }
}

/// Iterator over all payloads written by a `PayloadWriter`.
pub struct Payloads<'a> {
    payloads_buf: ConsumingBufferSwap<'a, u8>,
    start: usize,
    offsets: Drain<'a, usize>,
}

impl<'a> Payloads<'a> {
    fn new(payload_buf: &'a mut Vec<u8>, offsets: &'a mut Vec<usize>) -> Self {
        Self {
            payloads_buf: ConsumingBufferSwap::new(payload_buf),
            start: 0,
            offsets: offsets.drain(..),
        }
    }

    /// Returns the next payload.
    ///
    /// If there are no more payloads, `None` is returned.
    pub fn next_payload(&mut self) -> Option<&[u8]> {
        let offset = self.offsets.next()?;

        let offset_buf = &self.payloads_buf[self.start..offset];
        self.start = offset;

        Some(offset_buf)
    }
}

// Swaps out a buffer that is meant to be fully drained during an operation.
//
// The source buffer is replaced with an empty one up front, so it is already in its cleared end state even if our drop
// logic never runs. On drop, the original allocation is cleared and handed back to the source for reuse.
struct ConsumingBufferSwap<'a, T> {
    source: &'a mut Vec<T>,
    original: Vec<T>,
}

impl<'a, T> ConsumingBufferSwap<'a, T> {
    fn new(source: &'a mut Vec<T>) -> Self {
        let original = std::mem::take(source);
        Self { source, original }
    }
}

impl<T> Drop for ConsumingBufferSwap<'_, T> {
    fn drop(&mut self) {
        self.original.clear();
        std::mem::swap(self.source, &mut self.original);
    }
}

impl<T> Deref for ConsumingBufferSwap<'_, T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Self::Target {
        &self.original
    }
}

impl<T> DerefMut for ConsumingBufferSwap<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.original
    }
}
