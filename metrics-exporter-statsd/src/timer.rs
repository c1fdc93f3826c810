use std::time::Duration;

use quanta::Instant;
use tracing::debug;

use crate::client::{EmitError, StatsdClient};

/// A running timer.
///
/// Created by [`StatsdClient::timer`]. When stopped, or when dropped without being stopped or discarded, the elapsed
/// time is emitted as a timing in whole milliseconds, rounded to the nearest millisecond.
#[must_use = "a timer emits when dropped, so it should be bound to a variable for as long as it should run"]
pub struct Timer<'a> {
    client: &'a StatsdClient,
    name: String,
    sample_rate: Option<f64>,
    start: Instant,
    finished: bool,
}

impl<'a> Timer<'a> {
    pub(crate) fn new(client: &'a StatsdClient, name: &str, sample_rate: Option<f64>) -> Self {
        let start = client.clock().now();
        Self { client, name: name.to_string(), sample_rate, start, finished: false }
    }

    /// Returns the time elapsed since the timer was started.
    pub fn elapsed(&self) -> Duration {
        self.client.clock().now().duration_since(self.start)
    }

    /// Stops the timer and emits the elapsed time.
    ///
    /// Returns the elapsed time in milliseconds, as emitted.
    ///
    /// # Errors
    ///
    /// If the client is closed, or the name or sample rate is invalid, an error is returned.
    pub fn stop(mut self) -> Result<i64, EmitError> {
        self.finished = true;
        self.send()
    }

    /// Stops the timer without emitting anything.
    pub fn discard(mut self) {
        self.finished = true;
    }

    fn send(&self) -> Result<i64, EmitError> {
        let millis = duration_to_millis(self.elapsed());
        self.client.timing(&self.name, millis, self.sample_rate)?;
        Ok(millis)
    }
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.send() {
                debug!(error = %e, metric_name = self.name.as_str(), "Failed to emit timing.");
            }
        }
    }
}

fn duration_to_millis(elapsed: Duration) -> i64 {
    (elapsed.as_secs_f64() * 1000.0).round() as i64
}
