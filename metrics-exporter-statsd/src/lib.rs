//! A non-blocking client for sending metrics to a [StatsD][statsd]-compatible collector.
//!
//! [statsd]: https://github.com/statsd/statsd/blob/master/docs/metric_types.md
//!
//! # Usage
//!
//! ```no_run
//! # use metrics_exporter_statsd::{StatsdBuilder, StatsdClient};
//! // The quickest way to get going is to point a client at a collector:
//! let client = StatsdClient::new("127.0.0.1", 8125).expect("failed to build client");
//!
//! client.incr("requests", 1).expect("client is open");
//! client.timing("request.latency", 320, None).expect("client is open");
//! client.gauge("connections", 12, None).expect("client is open");
//! client.set("users", 42, Some(0.5)).expect("client is open");
//!
//! // Timers emit the elapsed time, in milliseconds, when stopped or dropped.
//! {
//!     let _timer = client.timer("work");
//!     // ...
//! }
//!
//! // Closing the client sends anything still queued and waits for the background thread to finish. Dropping the
//! // client does the same.
//! client.close().expect("failed to flush in time");
//!
//! // The builder exposes everything else, such as a prefix for every metric name, or how full queues are handled:
//! let client = StatsdBuilder::default()
//!     .with_remote_address("127.0.0.1:8125")
//!     .expect("invalid address")
//!     .with_prefix("myapp")
//!     .build()
//!     .expect("failed to build client");
//! ```
//!
//! # Design
//!
//! ## Fire and forget
//!
//! Emitting a metric validates it and pushes it onto a queue, and nothing more. A single background thread owns the
//! socket, pulls records off the queue, and packs them into newline-delimited payloads no larger than the maximum
//! payload length before sending them. Network errors are logged and counted, but never surface to the caller.
//!
//! ## Bounded queue
//!
//! By default, the queue holds up to 65,536 records and drops newly emitted records when it is full, so that a stalled
//! collector can never block or exhaust the memory of the application. The capacity and the overflow behavior can be
//! changed with [`StatsdBuilder::with_queue_capacity`] and [`StatsdBuilder::with_overflow_policy`].
//!
//! ## Orderly shutdown
//!
//! [`StatsdClient::close`] stops accepting records, waits for everything already queued to be sent, and releases the
//! socket. If that takes longer than the close timeout, the remaining records are abandoned.
//!
//! ## Sampling
//!
//! Sample rates are carried on the wire as given. The client never decides on its own whether to send a sampled
//! metric: that is left to the caller.
//!
//! ## `metrics` integration
//!
//! [`StatsdBuilder::install`] installs a recorder for the client as the global [`metrics`] recorder, so that the
//! `metrics` macros are forwarded to the collector. Counters become StatsD counters, gauges become gauges, and
//! histograms become timers.
//!
//! ## Telemetry
//!
//! The client keeps counters of its own behavior, such as records dropped because the queue was full or payloads that
//! failed to send, available through [`StatsdClient::telemetry`]. These can also be reported to the collector
//! periodically under the `statsd.client` namespace.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod builder;
pub use self::builder::{BuildError, StatsdBuilder};

mod client;
pub use self::client::{CloseError, EmitError, StatsdClient};

mod forwarder;
pub use self::forwarder::{Transport, WorkerState};

mod queue;
pub use self::queue::OverflowPolicy;

mod record;
pub use self::record::{MetricKind, MetricRecord, RecordError, Value};

mod recorder;
pub use self::recorder::StatsdRecorder;

mod telemetry;
pub use self::telemetry::TelemetrySnapshot;

mod timer;
pub use self::timer::Timer;

mod writer;
pub use self::writer::{encode, FLOAT_PRECISION};
