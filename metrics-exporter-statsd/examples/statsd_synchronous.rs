use std::{thread, time::Duration};

use metrics::{counter, gauge, histogram};
use metrics_exporter_statsd::StatsdBuilder;
use rand::Rng;

fn main() {
    tracing_subscriber::fmt::init();

    let client = StatsdBuilder::default()
        .with_remote_address("localhost:8125")
        .expect("failed to parse remote address")
        .with_prefix("example")
        .with_telemetry_interval(Some(Duration::from_secs(10)))
        .install()
        .expect("failed to install StatsD recorder");

    counter!("idle_metric").increment(1);
    gauge!("testing").set(42.0);

    let server_loops = counter!("tcp_server_loops");
    let server_loop_delta_ms = histogram!("tcp_server_loop_delta_ms");

    let mut rng = rand::rng();

    // Loop for a while, pretending to do some work.
    for _ in 0..1000 {
        let work = client.timer("work");
        thread::sleep(Duration::from_millis(rng.random_range(1..10)));
        drop(work);

        server_loops.increment(1);
        server_loop_delta_ms.record(rng.random_range(0.0..1000.0));
        client.set("unique_workers", rng.random_range(0..16_i64), None).expect("client is open");

        let gauge = gauge!("lucky_iterations");
        if rand::random_bool(0.75) {
            gauge.increment(1.0);
        } else {
            gauge.decrement(1.0);
        }
    }

    client.close().expect("failed to flush remaining metrics");
}
