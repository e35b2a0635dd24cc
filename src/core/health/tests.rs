use super::*;
use crate::core::clock::system_clock;
use crate::core::requests::{ConcurrencyLimits, RequestConfig};
use crate::core::transport::mock::MockTransport;
use crate::core::transport::{TransportError, TransportErrorCode, TransportResponse};
use std::sync::atomic::{AtomicUsize, Ordering};

fn monitor_with(transport: Arc<MockTransport>, tweak: impl FnOnce(&mut HealthConfig)) -> HealthMonitor {
    let requests = RequestManager::new(transport, system_clock(), RequestConfig::default());
    let mut config = HealthConfig::new("http://backend.test/");
    config.max_jitter = Duration::ZERO;
    tweak(&mut config);
    HealthMonitor::new(requests, ConnectivitySignal::online(), system_clock(), config)
}

fn monitor(transport: Arc<MockTransport>) -> HealthMonitor {
    monitor_with(transport, |_| {})
}

fn refused() -> TransportError {
    TransportError::new(TransportErrorCode::ConnectionRefused, "127.0.0.1:8000")
}

#[tokio::test(start_paused = true)]
async fn consecutive_failures_then_recovery() {
    let transport = MockTransport::new(|_, call| {
        if call < 3 {
            Err(refused())
        } else {
            Ok(TransportResponse::new(200, r#"{"status":"healthy"}"#))
        }
    });
    let monitor = monitor(transport.clone());
    assert_eq!(monitor.status().status, HealthStatus::Unknown);

    for _ in 0..3 {
        assert!(!monitor.force_check().await);
    }
    let status = monitor.status();
    assert_eq!(status.status, HealthStatus::Disconnected);
    assert_eq!(status.consecutive_errors, 3);
    assert_eq!(status.total_errors, 3);

    assert!(monitor.force_check().await);
    let status = monitor.status();
    assert_eq!(status.status, HealthStatus::Connected);
    assert_eq!(status.consecutive_errors, 0);
    assert_eq!(status.total_errors, 3);
    assert!(status.last_check.is_some());
    assert_eq!(transport.seen()[0].url, "http://backend.test/api/health");
}

#[tokio::test(start_paused = true)]
async fn latency_at_threshold_is_slow() {
    let transport = MockTransport::ok("{}").with_latency(Duration::from_secs(3));
    let monitor = monitor(transport);

    assert!(monitor.force_check().await);
    let status = monitor.status();
    assert_eq!(status.status, HealthStatus::Slow);
    assert!(status.last_latency >= Some(Duration::from_secs(3)));
}

#[tokio::test(start_paused = true)]
async fn probe_timeout_counts_as_failure() {
    let transport = MockTransport::ok("{}").with_latency(Duration::from_secs(30));
    let monitor = monitor(transport);

    assert!(!monitor.force_check().await);
    let status = monitor.status();
    assert_eq!(status.status, HealthStatus::Disconnected);
    assert_eq!(status.consecutive_errors, 1);
    let history = monitor.history();
    assert!(history[0].error.as_deref().is_some_and(|e| e.contains("timed out")));
}

#[tokio::test(start_paused = true)]
async fn platform_offline_skips_the_probe_and_error_counts() {
    let transport = MockTransport::ok("{}");
    let monitor = monitor(transport.clone());
    monitor.connectivity().set_online(false);

    assert!(!monitor.force_check().await);
    let status = monitor.status();
    assert_eq!(status.status, HealthStatus::Disconnected);
    assert_eq!(status.consecutive_errors, 0);
    assert_eq!(status.total_errors, 0);
    assert_eq!(transport.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn subscribers_see_each_transition_once() {
    let transport = MockTransport::new(|_, call| {
        if call == 1 {
            Err(refused())
        } else {
            Ok(TransportResponse::new(200, "{}"))
        }
    });
    let monitor = monitor(transport);
    let changes = Arc::new(Mutex::new(Vec::new()));

    let _panicky = monitor.subscribe(|_| panic!("subscriber failure"));
    let _recorder = {
        let changes = Arc::clone(&changes);
        monitor.subscribe(move |change: &StatusChange| lock(&changes).push(*change))
    };

    monitor.force_check().await;
    monitor.force_check().await;
    monitor.force_check().await;
    monitor.force_check().await;

    let seen = lock(&changes).clone();
    assert_eq!(
        seen,
        [
            StatusChange { new: HealthStatus::Connected, old: HealthStatus::Unknown },
            StatusChange { new: HealthStatus::Disconnected, old: HealthStatus::Connected },
            StatusChange { new: HealthStatus::Connected, old: HealthStatus::Disconnected },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn loop_polls_fast_while_disconnected_and_stops_cleanly() {
    let transport = MockTransport::failing(TransportErrorCode::ConnectionRefused);
    let monitor = monitor(transport.clone());

    monitor.start();
    monitor.start();
    tokio::time::sleep(Duration::from_millis(10_500)).await;
    assert_eq!(transport.calls(), 3);
    assert_eq!(monitor.status().consecutive_errors, 3);

    monitor.stop();
    assert!(!monitor.is_running());
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn loop_backs_off_while_connected() {
    let transport = MockTransport::ok("{}");
    let monitor = monitor(transport.clone());

    monitor.start();
    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(transport.calls(), 1);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(transport.calls(), 2);
    monitor.stop();
}

#[tokio::test(start_paused = true)]
async fn connectivity_transition_wakes_the_loop() {
    let transport = MockTransport::ok("{}");
    let monitor = monitor(transport.clone());
    let hits = Arc::new(AtomicUsize::new(0));
    let _sub = {
        let hits = Arc::clone(&hits);
        monitor.subscribe(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    };

    monitor.start();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(monitor.status().status, HealthStatus::Connected);

    monitor.connectivity().set_online(false);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(monitor.status().status, HealthStatus::Disconnected);

    monitor.connectivity().set_online(true);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(monitor.status().status, HealthStatus::Connected);
    assert_eq!(transport.calls(), 2);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    monitor.stop();
}

#[tokio::test(start_paused = true)]
async fn history_is_bounded_and_feeds_stats() {
    let transport = MockTransport::new(|_, call| {
        if call % 2 == 0 {
            Ok(TransportResponse::new(200, "{}"))
        } else {
            Err(refused())
        }
    })
    .with_latency(Duration::from_millis(100));
    let monitor = monitor_with(transport, |config| config.history_capacity = 4);

    for _ in 0..6 {
        monitor.force_check().await;
    }

    assert_eq!(monitor.history().len(), 4);
    let stats = monitor.stats();
    assert_eq!(stats.checks, 4);
    assert_eq!(stats.successes, 2);
    assert_eq!(stats.success_rate, Some(0.5));
    let average = stats.average_latency.unwrap_or_default();
    assert!(average >= Duration::from_millis(100) && average < Duration::from_millis(102));
}

#[test]
fn interval_adapts_to_status() {
    let config = HealthConfig::new("http://backend.test");
    assert_eq!(
        config.interval_for(HealthStatus::Disconnected, HealthStatus::Connected),
        Duration::from_secs(5)
    );
    assert_eq!(
        config.interval_for(HealthStatus::Connected, HealthStatus::Connected),
        Duration::from_secs(30)
    );
    assert_eq!(
        config.interval_for(HealthStatus::Slow, HealthStatus::Connected),
        Duration::from_secs(30)
    );
    assert_eq!(
        config.interval_for(HealthStatus::Slow, HealthStatus::Slow),
        Duration::from_secs(60)
    );
}

#[tokio::test(start_paused = true)]
async fn saturated_request_slots_do_not_read_as_backend_down() {
    let transport = MockTransport::ok("{}").with_latency(Duration::from_secs(20));
    let limits = ConcurrencyLimits {
        max_concurrent: 2,
        high: 2,
        normal: 2,
        low: 2,
    };
    let requests = RequestManager::new(
        transport.clone(),
        system_clock(),
        RequestConfig {
            limits,
            ..RequestConfig::default()
        },
    );
    for message in ["one", "two"] {
        let requests = requests.clone();
        let spec = RequestSpec::post_json(
            "http://backend.test/api/chat",
            &serde_json::json!({ "message": message }),
        )
        .unwrap();
        tokio::spawn(async move { requests.execute(spec, RequestOptions::chat()).await });
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(requests.stats().active, 2);

    transport.set_latency(Duration::from_millis(100));
    let mut config = HealthConfig::new("http://backend.test/");
    config.max_jitter = Duration::ZERO;
    let monitor = HealthMonitor::new(requests, ConnectivitySignal::online(), system_clock(), config);

    assert!(monitor.force_check().await);
    let status = monitor.status();
    assert_eq!(status.status, HealthStatus::Connected);
    assert!(status.last_latency < Some(Duration::from_secs(1)));
}

#[tokio::test(start_paused = true)]
async fn oversized_intervals_keep_the_loop_alive() {
    let transport = MockTransport::ok("{}");
    let monitor = monitor_with(transport.clone(), |config| {
        config.connected_interval = Duration::MAX;
        config.max_jitter = Duration::from_secs(1);
    });

    monitor.start();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.calls(), 1);
    assert!(monitor.is_running());
    assert_eq!(monitor.status().status, HealthStatus::Connected);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(transport.calls(), 1);
    monitor.stop();
}
