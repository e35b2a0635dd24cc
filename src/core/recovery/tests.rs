use super::*;
use crate::core::clock::system_clock;
use crate::core::health::HealthConfig;
use crate::core::requests::{RequestConfig, RequestError, RequestManager};
use crate::core::transport::mock::MockTransport;
use crate::core::transport::TransportError;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::Instant;

fn service() -> RecoveryService {
    RecoveryService::new(RecoveryConfig::default(), system_clock())
}

fn status(code: u16) -> RequestError {
    RequestError::Status {
        status: code,
        message: format!("HTTP {code}"),
        retry_after: None,
    }
}

fn refused() -> RequestError {
    RequestError::Transport(TransportError::new(
        TransportErrorCode::ConnectionRefused,
        "127.0.0.1:8000",
    ))
}

/// Fails with `error` on every attempt, counting attempts.
async fn always_fail(
    service: &RecoveryService,
    name: &str,
    error: RequestError,
    options: RecoveryOptions<String>,
) -> (Result<String, RecoveryError<RequestError>>, u32) {
    let attempts = AtomicU32::new(0);
    let result = service
        .execute_with_recovery(
            name,
            |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                let error = error.clone();
                async move { Err::<String, _>(error) }
            },
            options,
        )
        .await;
    (result, attempts.load(Ordering::SeqCst))
}

#[tokio::test(start_paused = true)]
async fn success_is_cached_and_served_after_failure() {
    let service = service();

    let fresh = service
        .execute_with_recovery(
            "error_stats",
            |_| async { Ok::<_, RequestError>("42 errors".to_string()) },
            RecoveryOptions::default().cached("stats", Duration::from_secs(60)),
        )
        .await;
    assert_eq!(fresh.unwrap(), "42 errors");
    assert_eq!(service.cache_len(), 1);

    let options = RecoveryOptions::default().cached("stats", Duration::from_secs(60));
    let (stale, attempts) = always_fail(&service, "error_stats", status(400), options).await;
    assert_eq!(stale.unwrap(), "42 errors");
    assert_eq!(attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn expired_cache_is_not_served() {
    let service = service();
    service
        .execute_with_recovery(
            "error_stats",
            |_| async { Ok::<_, RequestError>("fresh".to_string()) },
            RecoveryOptions::default().cached("stats", Duration::from_secs(5)),
        )
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(6)).await;
    let options = RecoveryOptions::default().cached("stats", Duration::from_secs(5));
    let (result, _) = always_fail(&service, "error_stats", status(400), options).await;
    assert!(matches!(result, Err(RecoveryError::Failed { attempts: 1, .. })));
}

#[tokio::test(start_paused = true)]
async fn timeouts_retry_three_times_with_growing_delays() {
    let service = service();
    let stamps = Mutex::new(Vec::new());

    let result = service
        .execute_with_recovery(
            "chat",
            |_| {
                lock(&stamps).push(Instant::now());
                async {
                    Err::<String, _>(RequestError::Timeout {
                        after: Duration::from_secs(45),
                    })
                }
            },
            RecoveryOptions::default(),
        )
        .await;

    assert!(matches!(result, Err(RecoveryError::Failed { attempts: 4, .. })));
    let stamps = lock(&stamps).clone();
    assert_eq!(stamps.len(), 4);
    let gaps: Vec<Duration> = stamps.windows(2).map(|pair| pair[1] - pair[0]).collect();
    assert!(gaps[0] >= Duration::from_secs(2) && gaps[0] < Duration::from_millis(2_300));
    assert!(gaps[1] >= Duration::from_secs(4));
    assert!(gaps[2] >= Duration::from_secs(8));
    assert!(gaps.windows(2).all(|pair| pair[1] >= pair[0]));
}

#[tokio::test(start_paused = true)]
async fn retry_ceilings_follow_the_failure_class() {
    let service = service();
    let cases = [
        (status(400), 1),
        (status(422), 1),
        (status(503), 3),
        (status(429), 2),
        (refused(), 4),
        (RequestError::Decode("not json".into()), 2),
    ];
    for (index, (error, expected)) in cases.into_iter().enumerate() {
        let name = format!("op-{index}");
        let (result, attempts) = always_fail(&service, &name, error, RecoveryOptions::default()).await;
        assert!(result.is_err());
        assert_eq!(attempts, expected, "attempts for {name}");
    }
}

#[tokio::test(start_paused = true)]
async fn max_retries_override_caps_attempts() {
    let service = service();
    let options = RecoveryOptions::default().with_max_retries(0);
    let (_, attempts) = always_fail(&service, "chat", refused(), options).await;
    assert_eq!(attempts, 1);

    let options = RecoveryOptions::default()
        .with_retry(RetryPolicy::exponential(Duration::from_millis(10), 5));
    let (_, attempts) = always_fail(&service, "chat-custom", status(400), options).await;
    assert_eq!(attempts, 6);
}

#[tokio::test(start_paused = true)]
async fn retry_after_stretches_the_wait() {
    let service = service();
    let started = Instant::now();

    let result = service
        .execute_with_recovery(
            "chat",
            |attempt| async move {
                if attempt == 0 {
                    Err(RequestError::Status {
                        status: 429,
                        message: "slow down".into(),
                        retry_after: Some(Duration::from_secs(30)),
                    })
                } else {
                    Ok("ok".to_string())
                }
            },
            RecoveryOptions::default(),
        )
        .await;

    assert_eq!(result.unwrap(), "ok");
    assert!(started.elapsed() >= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_rejects_and_closes_after_trial() {
    let service = service();
    for _ in 0..5 {
        let (result, _) = always_fail(&service, "chat", status(400), RecoveryOptions::default()).await;
        assert!(matches!(result, Err(RecoveryError::Failed { .. })));
    }
    assert_eq!(service.circuit_state("chat"), CircuitState::Open);

    service.cache().insert("chat-cache", "cached".to_string(), Duration::from_secs(600));
    let options = RecoveryOptions::default().cached("chat-cache", Duration::from_secs(600));
    let (rejected, attempts) = always_fail(&service, "chat", status(400), options).await;
    assert!(matches!(rejected, Err(RecoveryError::CircuitOpen { .. })));
    assert_eq!(attempts, 0);

    tokio::time::advance(Duration::from_secs(30)).await;
    let trial = service
        .execute_with_recovery(
            "chat",
            |_| async { Ok::<_, RequestError>("back".to_string()) },
            RecoveryOptions::default(),
        )
        .await;
    assert_eq!(trial.unwrap(), "back");
    assert_eq!(service.circuit_state("chat"), CircuitState::Closed);
    let snapshot = service.circuit_states();
    assert_eq!(snapshot[0].failures, 0);
}

#[tokio::test(start_paused = true)]
async fn reset_circuit_reopens_one_operation_only() {
    let service = service();
    for name in ["chat", "error_stats"] {
        for _ in 0..5 {
            always_fail(&service, name, status(400), RecoveryOptions::default()).await;
        }
    }
    assert_eq!(service.circuit_state("chat"), CircuitState::Open);

    service.reset_circuit("chat");
    assert_eq!(service.circuit_state("chat"), CircuitState::Closed);
    assert_eq!(service.circuit_state("error_stats"), CircuitState::Open);

    let (result, attempts) = always_fail(&service, "chat", status(400), RecoveryOptions::default()).await;
    assert!(matches!(result, Err(RecoveryError::Failed { .. })));
    assert_eq!(attempts, 1);
    let (rejected, _) = always_fail(&service, "error_stats", status(400), RecoveryOptions::default()).await;
    assert!(matches!(rejected, Err(RecoveryError::CircuitOpen { .. })));
}

#[tokio::test(start_paused = true)]
async fn fallback_is_used_when_nothing_is_cached() {
    let service = service();
    let options = RecoveryOptions::default().with_fallback("placeholder".to_string());
    let (result, attempts) = always_fail(&service, "history", status(404), options).await;
    assert_eq!(result.unwrap(), "placeholder");
    assert_eq!(attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_backoff_is_not_a_failure() {
    let service = service();
    let token = CancellationToken::new();
    let cancel_later = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel_later.cancel();
    });

    let options = RecoveryOptions::default().with_cancel(token);
    let (result, attempts) = always_fail(&service, "chat", refused(), options).await;
    assert!(matches!(result, Err(RecoveryError::Cancelled)));
    assert_eq!(attempts, 1);
    assert_eq!(service.circuit_states()[0].failures, 0);
}

#[tokio::test(start_paused = true)]
async fn offline_mode_serves_cache_or_rejects() {
    let service = service();
    let changes = Arc::new(Mutex::new(Vec::new()));
    let _sub = {
        let changes = Arc::clone(&changes);
        service.subscribe(move |change| lock(&changes).push(*change))
    };
    service.cache().insert("stats", "cached".to_string(), Duration::from_secs(600));

    service.report_connectivity(false);
    assert!(service.is_offline());
    assert_eq!(service.degradation_level(), OFFLINE_LEVEL);

    let cached = RecoveryOptions::default().cached("stats", Duration::from_secs(60));
    let (served, attempts) = always_fail(&service, "error_stats", refused(), cached).await;
    assert_eq!(served.unwrap(), "cached");
    assert_eq!(attempts, 0);

    let (rejected, attempts) =
        always_fail(&service, "chat", refused(), RecoveryOptions::default()).await;
    assert!(matches!(rejected, Err(RecoveryError::Offline { .. })));
    assert_eq!(attempts, 0);

    service.report_connectivity(true);
    tokio::time::sleep(Duration::from_secs(9)).await;
    assert!(service.is_offline());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!service.is_offline());
    assert_eq!(service.degradation_level(), 0);

    assert_eq!(
        *lock(&changes),
        [
            OfflineChange { offline: true, degradation_level: OFFLINE_LEVEL },
            OfflineChange { offline: false, degradation_level: 0 },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn flapping_connectivity_restarts_the_grace_period() {
    let service = service();
    service.set_degradation_level(1);
    service.report_connectivity(false);

    service.report_connectivity(true);
    tokio::time::sleep(Duration::from_secs(8)).await;
    service.report_connectivity(false);
    service.report_connectivity(true);
    tokio::time::sleep(Duration::from_secs(8)).await;
    assert!(service.is_offline());

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!service.is_offline());
    assert_eq!(service.degradation_level(), 1);
}

#[tokio::test(start_paused = true)]
async fn degradation_gates_named_features() {
    let service = service();
    assert_eq!(service.set_degradation_level(2), 2);
    assert!(!service.is_feature_available("streaming"));
    assert!(service.is_feature_available("send_message"));

    let called = AtomicU32::new(0);
    let result = service
        .execute_with_recovery(
            "stream",
            |_| {
                called.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, RequestError>(String::new()) }
            },
            RecoveryOptions::default().gated_by("streaming"),
        )
        .await;
    assert!(matches!(
        result,
        Err(RecoveryError::FeatureUnavailable { level: 2, .. })
    ));
    assert_eq!(called.load(Ordering::SeqCst), 0);

    assert_eq!(service.set_degradation_level(42), MAX_LEVEL);
    assert_eq!(service.set_degradation_level(-1), 0);
}

#[tokio::test(start_paused = true)]
async fn refresh_resets_everything() {
    let service = service();
    service.cache().insert("k", 1u32, Duration::from_secs(60));
    for _ in 0..5 {
        always_fail(&service, "chat", status(400), RecoveryOptions::default()).await;
    }
    service.set_degradation_level(4);

    service.refresh();
    assert_eq!(service.cache_len(), 0);
    assert!(service.circuit_states().is_empty());
    assert_eq!(service.circuit_state("chat"), CircuitState::Closed);
    assert_eq!(service.degradation_level(), 0);
}

#[tokio::test(start_paused = true)]
async fn follows_health_monitor_and_platform_signal() {
    let transport = MockTransport::failing(TransportErrorCode::ConnectionRefused);
    let requests = RequestManager::new(transport, system_clock(), RequestConfig::default());
    let connectivity = ConnectivitySignal::online();
    let monitor = HealthMonitor::new(
        requests,
        connectivity.clone(),
        system_clock(),
        HealthConfig::new("http://backend.test"),
    );

    let service = service();
    let _attached = service.attach(&monitor);
    monitor.force_check().await;
    assert!(service.is_offline());

    let platform = RecoveryService::new(RecoveryConfig::default(), system_clock());
    platform.watch_connectivity(&connectivity);
    connectivity.set_online(false);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(platform.is_offline());
    platform.shutdown();
}

#[test]
fn recovery_errors_classify_through_to_the_cause() {
    let failed: RecoveryError<RequestError> = RecoveryError::Failed {
        error: status(503),
        attempts: 3,
    };
    assert_eq!(failed.failure_class(), FailureClass::Server);
    assert!(failed.is_retryable());
    assert_eq!(failed.to_string(), "server responded with 503: HTTP 503");

    let open: RecoveryError<RequestError> = RecoveryError::CircuitOpen {
        operation: "chat".into(),
    };
    assert!(open.is_retryable());
    assert!(!RecoveryError::<RequestError>::Cancelled.is_retryable());
}
