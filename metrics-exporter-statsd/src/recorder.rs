use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering::AcqRel},
    Arc,
};

use metrics::{
    Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder, SharedString, Unit,
};
use metrics_util::registry::{Registry, Storage};
use tracing::trace;

use crate::{
    client::Emitter,
    record::{MetricRecord, RecordError},
};

/// A recorder that forwards metrics to a StatsD collector through a [`StatsdClient`][crate::StatsdClient].
///
/// Every update is forwarded as its own record, so the collector does all aggregation:
///
/// - counter increments become counters (`c`), and absolute counter values are forwarded as the increase since the
///   previous absolute value
/// - gauge values become absolute gauges (`g`), and gauge increments and decrements become relative gauges
/// - histogram samples become timers (`ms`)
///
/// Labels have no representation in the plain StatsD line protocol, and are ignored.
pub struct StatsdRecorder {
    registry: Registry<Key, StatsdStorage>,
}

impl StatsdRecorder {
    pub(crate) fn new(emitter: Arc<Emitter>) -> Self {
        StatsdRecorder { registry: Registry::new(StatsdStorage { emitter }) }
    }
}

impl Recorder for StatsdRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        self.registry.get_or_create_counter(key, |existing| Counter::from_arc(Arc::clone(existing)))
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        self.registry.get_or_create_gauge(key, |existing| Gauge::from_arc(Arc::clone(existing)))
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        self.registry.get_or_create_histogram(key, |existing| Histogram::from_arc(Arc::clone(existing)))
    }
}

pub(crate) struct StatsdStorage {
    emitter: Arc<Emitter>,
}

impl Storage<Key> for StatsdStorage {
    type Counter = Arc<ForwardingCounter>;
    type Gauge = Arc<ForwardingGauge>;
    type Histogram = Arc<ForwardingHistogram>;

    fn counter(&self, key: &Key) -> Self::Counter {
        Arc::new(ForwardingCounter {
            handle: Handle::new(key, &self.emitter),
            has_absolute: AtomicBool::new(false),
            last_absolute: AtomicU64::new(0),
        })
    }

    fn gauge(&self, key: &Key) -> Self::Gauge {
        Arc::new(ForwardingGauge { handle: Handle::new(key, &self.emitter) })
    }

    fn histogram(&self, key: &Key) -> Self::Histogram {
        Arc::new(ForwardingHistogram { handle: Handle::new(key, &self.emitter) })
    }
}

struct Handle {
    name: String,
    emitter: Arc<Emitter>,
}

impl Handle {
    fn new(key: &Key, emitter: &Arc<Emitter>) -> Self {
        Self { name: key.name().to_string(), emitter: Arc::clone(emitter) }
    }

    fn forward(&self, record: Result<MetricRecord, RecordError>) {
        let result = record.map_err(Into::into).and_then(|record| self.emitter.emit(record));
        if let Err(e) = result {
            trace!(error = %e, metric_name = self.name.as_str(), "Dropped metric update.");
        }
    }
}

pub(crate) struct ForwardingCounter {
    handle: Handle,
    has_absolute: AtomicBool,
    last_absolute: AtomicU64,
}

impl CounterFn for ForwardingCounter {
    fn increment(&self, value: u64) {
        let delta = i64::try_from(value).unwrap_or(i64::MAX);
        self.handle.forward(MetricRecord::counter(self.handle.name.as_str(), delta));
    }

    fn absolute(&self, value: u64) {
        // The first absolute value only establishes a baseline.
        let last = self.last_absolute.swap(value, AcqRel);
        if self.has_absolute.swap(true, AcqRel) && value > last {
            self.increment(value - last);
        }
    }
}

pub(crate) struct ForwardingGauge {
    handle: Handle,
}

impl GaugeFn for ForwardingGauge {
    fn increment(&self, value: f64) {
        self.handle.forward(MetricRecord::gauge_delta(self.handle.name.as_str(), value));
    }

    fn decrement(&self, value: f64) {
        self.handle.forward(MetricRecord::gauge_delta(self.handle.name.as_str(), -value));
    }

    fn set(&self, value: f64) {
        self.handle.forward(MetricRecord::gauge(self.handle.name.as_str(), value));
    }
}

pub(crate) struct ForwardingHistogram {
    handle: Handle,
}

impl HistogramFn for ForwardingHistogram {
    fn record(&self, value: f64) {
        self.handle.forward(MetricRecord::timer(self.handle.name.as_str(), value));
    }
}
