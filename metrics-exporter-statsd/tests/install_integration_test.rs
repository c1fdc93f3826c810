use std::{net::UdpSocket, time::Duration};

use metrics::{counter, gauge, histogram};
use metrics_exporter_statsd::{BuildError, StatsdBuilder};

// Installing a global recorder can only happen once per process, so everything that depends on it lives in this one
// test.
#[test]
fn installed_recorder_forwards_macros() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let collector = UdpSocket::bind("127.0.0.1:0").unwrap();
    collector.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let addr = collector.local_addr().unwrap().to_string();

    let client = StatsdBuilder::default().with_remote_address(&addr).unwrap().with_prefix("app").install().unwrap();

    counter!("requests", "method" => "GET").increment(3);
    gauge!("connections").set(7.0);
    gauge!("connections").decrement(2.0);
    histogram!("latency").record(12.5);

    client.close().unwrap();

    let mut buf = [0; 65_535];
    let mut lines = Vec::new();
    while lines.len() < 4 {
        let len = collector.recv(&mut buf).unwrap();
        lines.extend(std::str::from_utf8(&buf[..len]).unwrap().split('\n').map(str::to_string));
    }
    assert_eq!(
        lines,
        ["app.requests:3|c", "app.connections:7.000000|g", "app.connections:-2.000000|g", "app.latency:12.500000|ms"]
    );

    // A second install fails, since the first recorder is still installed.
    let result = StatsdBuilder::default().with_remote_address(&addr).unwrap().install();
    assert!(matches!(result, Err(BuildError::FailedToInstall)));
}
