use std::fmt;

use thiserror::Error;

/// Errors that could occur while constructing a metric record.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RecordError {
    /// The metric name was empty.
    #[error("metric name cannot be empty")]
    EmptyName,

    /// The metric name contained characters that cannot be represented on the wire.
    ///
    /// Names must be ASCII and cannot contain `:`, `|`, or line breaks.
    #[error("invalid metric name '{name}'")]
    InvalidName {
        /// The offending name.
        name: String,
    },

    /// The metric value was `NaN` or infinite.
    #[error("metric value must be finite")]
    NonFiniteValue,

    /// The sample rate was outside of `(0, 1]`.
    #[error("invalid sample rate {rate} (must be in (0, 1])")]
    InvalidSampleRate {
        /// The offending sample rate.
        rate: f64,
    },
}

/// Metric kind.
///
/// Each kind maps to a fixed type tag in the StatsD line protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// A delta to be summed by the collector.
    Counter,

    /// A duration, in milliseconds.
    Timer,

    /// An absolute point-in-time value, or a relative change when sent as a delta.
    Gauge,

    /// Membership of a value in a per-interval set of unique values.
    Set,
}

impl MetricKind {
    /// Returns the type tag used on the wire for this kind.
    pub const fn type_tag(self) -> &'static str {
        match self {
            MetricKind::Counter => "c",
            MetricKind::Timer => "ms",
            MetricKind::Gauge => "g",
            MetricKind::Set => "s",
        }
    }

    /// Returns the kind for the given wire type tag, if it is known.
    pub fn from_type_tag(tag: &str) -> Option<Self> {
        match tag {
            "c" => Some(MetricKind::Counter),
            "ms" => Some(MetricKind::Timer),
            "g" => Some(MetricKind::Gauge),
            "s" => Some(MetricKind::Set),
            _ => None,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::Counter => "counter",
            MetricKind::Timer => "timer",
            MetricKind::Gauge => "gauge",
            MetricKind::Set => "set",
        };
        f.write_str(name)
    }
}

/// Numeric payload of a metric.
///
/// Integers are written verbatim, while floating-point values are written as fixed-precision decimals.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    /// An integer value.
    Integer(i64),

    /// A floating-point value.
    Float(f64),
}

impl Value {
    /// Returns `true` if the value is negative.
    pub fn is_negative(&self) -> bool {
        match *self {
            Value::Integer(v) => v < 0,
            Value::Float(v) => v < 0.0,
        }
    }

    /// Returns the value as an `f64`.
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::Integer(v) => v as f64,
            Value::Float(v) => v,
        }
    }

    fn is_finite(&self) -> bool {
        match *self {
            Value::Integer(_) => true,
            Value::Float(v) => v.is_finite(),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(f64::from(v))
    }
}

/// A single metric, ready to be handed to the delivery queue.
///
/// Records are validated when they are constructed, so encoding a record never fails. Once built, a record is
/// immutable.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricRecord {
    name: String,
    kind: MetricKind,
    value: Value,
    sample_rate: Option<f64>,
    relative: bool,
}

impl MetricRecord {
    /// Creates a new `MetricRecord`.
    ///
    /// # Errors
    ///
    /// If the name is empty or not representable on the wire, or the value is not finite, an error is returned.
    pub fn new<N, V>(name: N, kind: MetricKind, value: V) -> Result<Self, RecordError>
    where
        N: Into<String>,
        V: Into<Value>,
    {
        let name = name.into();
        validate_name(&name)?;

        let value = value.into();
        if !value.is_finite() {
            return Err(RecordError::NonFiniteValue);
        }

        Ok(Self { name, kind, value, sample_rate: None, relative: false })
    }

    /// Creates a counter record.
    ///
    /// # Errors
    ///
    /// See [`MetricRecord::new`].
    pub fn counter<N: Into<String>>(name: N, delta: i64) -> Result<Self, RecordError> {
        Self::new(name, MetricKind::Counter, delta)
    }

    /// Creates a timer record, where `value` is in milliseconds.
    ///
    /// # Errors
    ///
    /// See [`MetricRecord::new`].
    pub fn timer<N, V>(name: N, value: V) -> Result<Self, RecordError>
    where
        N: Into<String>,
        V: Into<Value>,
    {
        Self::new(name, MetricKind::Timer, value)
    }

    /// Creates an absolute gauge record.
    ///
    /// # Errors
    ///
    /// See [`MetricRecord::new`].
    pub fn gauge<N, V>(name: N, value: V) -> Result<Self, RecordError>
    where
        N: Into<String>,
        V: Into<Value>,
    {
        Self::new(name, MetricKind::Gauge, value)
    }

    /// Creates a relative gauge record, which adjusts the current gauge value by `delta`.
    ///
    /// # Errors
    ///
    /// See [`MetricRecord::new`].
    pub fn gauge_delta<N, V>(name: N, delta: V) -> Result<Self, RecordError>
    where
        N: Into<String>,
        V: Into<Value>,
    {
        let mut record = Self::new(name, MetricKind::Gauge, delta)?;
        record.relative = true;
        Ok(record)
    }

    /// Creates a set record.
    ///
    /// # Errors
    ///
    /// See [`MetricRecord::new`].
    pub fn set<N, V>(name: N, value: V) -> Result<Self, RecordError>
    where
        N: Into<String>,
        V: Into<Value>,
    {
        Self::new(name, MetricKind::Set, value)
    }

    /// Annotates the record with the rate at which it was sampled.
    ///
    /// The caller is responsible for having already decided to emit this sample: the rate is only carried on the
    /// wire so that the collector can extrapolate.
    ///
    /// # Errors
    ///
    /// If the rate is not within `(0, 1]`, an error is returned.
    pub fn with_sample_rate(mut self, rate: f64) -> Result<Self, RecordError> {
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(RecordError::InvalidSampleRate { rate });
        }

        self.sample_rate = Some(rate);
        Ok(self)
    }

    /// Annotates the record with an optional sample rate.
    ///
    /// # Errors
    ///
    /// See [`MetricRecord::with_sample_rate`].
    pub fn with_maybe_sample_rate(self, rate: Option<f64>) -> Result<Self, RecordError> {
        match rate {
            Some(rate) => self.with_sample_rate(rate),
            None => Ok(self),
        }
    }

    /// Returns the metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the metric kind.
    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Returns the metric value.
    pub fn value(&self) -> Value {
        self.value
    }

    /// Returns the sample rate, if any.
    pub fn sample_rate(&self) -> Option<f64> {
        self.sample_rate
    }

    /// Returns `true` if this is a gauge that adjusts, rather than replaces, the current value.
    pub fn is_relative(&self) -> bool {
        self.relative
    }
}

/// Checks that a metric name, or name prefix, is representable in the line protocol.
pub(crate) fn validate_name(name: &str) -> Result<(), RecordError> {
    if name.is_empty() {
        return Err(RecordError::EmptyName);
    }

    let invalid = name.bytes().any(|b| !b.is_ascii() || matches!(b, b':' | b'|' | b'\n' | b'\r'));
    if invalid {
        return Err(RecordError::InvalidName { name: name.to_string() });
    }

    Ok(())
}
