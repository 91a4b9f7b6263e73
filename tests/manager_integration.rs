//! End-to-end behavior of the reliability manager.

use ballast::{
    AlertChannel, AlertCondition, AlertRule, BackpressureConfig, ChannelKind, CircuitBreakerConfig,
    ErrorCategory, ManualClock, MemorySink, OverflowStrategy, RateLimitConfig, ReliabilityConfig,
    ReliabilityEvent, ReliabilityManager, RetryConfig, Severity, TelemetryError, TelemetryEvent,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn manager_with_clock(
    config: ReliabilityConfig,
) -> (Arc<ReliabilityManager>, ManualClock) {
    let clock = ManualClock::new();
    let manager = ReliabilityManager::with_clock(config, Arc::new(clock.clone()))
        .expect("valid configuration");
    (manager, clock)
}

fn storage_error(message: &str) -> TelemetryError {
    TelemetryError::new(message, ErrorCategory::Storage, Severity::High).retryable(true)
}

#[tokio::test]
async fn rate_limiter_denies_the_third_call_and_recovers_after_the_window() {
    let (manager, clock) = manager_with_clock(ReliabilityConfig {
        rate_limit: RateLimitConfig {
            enabled: true,
            max_requests: 2,
            window: Duration::from_millis(1_000),
        },
        ..Default::default()
    });

    let event = TelemetryEvent::new("ingest", "flush");
    manager.check_rate_limit(&event).unwrap();
    clock.advance(10);
    manager.check_rate_limit(&event).unwrap();
    clock.advance(10);

    let denied = manager.check_rate_limit(&event).unwrap_err();
    assert_eq!(denied.category, ErrorCategory::System);
    assert_eq!(denied.severity, Severity::Medium);
    assert!(!denied.retryable);
    assert_eq!(denied.context.get("retry_after_ms").map(String::as_str), Some("980"));

    clock.advance(1_080); // t = 1100, past the window
    manager.check_rate_limit(&event).unwrap();

    let stats = manager.error_stats();
    assert_eq!(stats.by_category.get(&ErrorCategory::System), Some(&1));
}

#[tokio::test]
async fn circuit_opens_then_recovers_through_half_open_probes() {
    let (manager, clock) = manager_with_clock(ReliabilityConfig {
        circuit: CircuitBreakerConfig {
            enabled: true,
            threshold: 3,
            timeout: Duration::from_millis(500),
            half_open_required: 2,
        },
        ..Default::default()
    });

    // Three failures at t = 0, 10, 20 open the circuit.
    for _ in 0..3 {
        let result: Result<(), _> = manager
            .execute_with_circuit_breaker("storage:write", || async {
                Err(storage_error("disk full"))
            })
            .await;
        assert!(result.is_err());
        clock.advance(10);
    }

    // t = 100: still cooling down, the operation must not run.
    clock.advance(80);
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_clone = ran.clone();
    let rejected = manager
        .execute_with_circuit_breaker("storage:write", move || {
            let ran = ran_clone.clone();
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TelemetryError>(())
            }
        })
        .await
        .unwrap_err();
    assert_eq!(rejected.context.get("circuit_state").map(String::as_str), Some("open"));
    assert_eq!(rejected.category, ErrorCategory::Storage, "category inferred from key prefix");
    assert_eq!(rejected.severity, Severity::High);
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    // t = 620: cooldown elapsed, a probe is admitted; one success keeps the
    // circuit half-open, the second closes it.
    clock.advance(520);
    manager
        .execute_with_circuit_breaker("storage:write", || async { Ok::<_, TelemetryError>(1) })
        .await
        .unwrap();
    manager
        .execute_with_circuit_breaker("storage:write", || async { Ok::<_, TelemetryError>(2) })
        .await
        .unwrap();

    let report = manager.reliability_report();
    let snapshot = &report.circuits["storage:write"];
    assert_eq!(snapshot.state, ballast::CircuitState::Closed);
}

#[tokio::test]
async fn circuit_transitions_are_published_to_subscribers() {
    let (manager, clock) = manager_with_clock(ReliabilityConfig {
        circuit: CircuitBreakerConfig {
            enabled: true,
            threshold: 1,
            timeout: Duration::from_millis(100),
            half_open_required: 1,
        },
        ..Default::default()
    });
    let mut events = manager.subscribe();

    let _ = manager
        .execute_with_circuit_breaker("streaming:export", || async {
            Err::<(), _>(storage_error("broken pipe"))
        })
        .await;
    clock.advance(150);
    manager
        .execute_with_circuit_breaker("streaming:export", || async { Ok::<_, TelemetryError>(()) })
        .await
        .unwrap();

    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ReliabilityEvent::CircuitStateChange { key, from, to, .. } = event {
            assert_eq!(key, "streaming:export");
            transitions.push((from, to));
        }
    }
    use ballast::CircuitState::*;
    assert_eq!(transitions, vec![(Closed, Open), (Open, HalfOpen), (HalfOpen, Closed)]);
}

#[tokio::test]
async fn drop_oldest_queue_reports_pressure_and_relief() {
    let (manager, _) = manager_with_clock(ReliabilityConfig {
        backpressure: BackpressureConfig {
            high_water: 3,
            low_water: 1,
            max_size: 4,
            strategy: OverflowStrategy::DropOldest,
        },
        ..Default::default()
    });
    let mut events = manager.subscribe();

    for action in ["a", "b", "c", "d", "e"] {
        assert!(manager
            .push_event(Some("spans"), TelemetryEvent::new("span", action))
            .await
            .unwrap());
    }
    let stats = manager.backpressure_stats();
    assert_eq!(stats["spans"].size, 4);
    assert_eq!(stats["spans"].dropped, 1);
    assert!(stats["spans"].under_pressure);

    // The oldest event was evicted; the queue starts at "b".
    assert_eq!(manager.next_event(Some("spans")).await.unwrap().action, "b");
    assert!(manager.backpressure_stats()["spans"].under_pressure);

    manager.next_event(Some("spans")).await.unwrap();
    manager.next_event(Some("spans")).await.unwrap();
    let stats = manager.backpressure_stats();
    assert_eq!(stats["spans"].size, 1);
    assert!(!stats["spans"].under_pressure, "low watermark reached");

    let mut saw_pressure = false;
    let mut saw_relief = false;
    while let Ok(event) = events.try_recv() {
        match event {
            ReliabilityEvent::Pressure { queue, level } => {
                assert_eq!(queue, "spans");
                assert!(level > 0.0 && level <= 1.0);
                saw_pressure = true;
            }
            ReliabilityEvent::Relief { queue } => {
                assert_eq!(queue, "spans");
                saw_relief = true;
            }
            _ => {}
        }
    }
    assert!(saw_pressure);
    assert!(saw_relief);
}

#[tokio::test]
async fn retry_succeeds_on_the_third_attempt_with_exponential_sleeps() {
    let (manager, _) = manager_with_clock(ReliabilityConfig {
        retry: RetryConfig {
            enabled: true,
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
        },
        ..Default::default()
    });

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();
    let started = std::time::Instant::now();
    let value = manager
        .execute_with_retry(
            move || {
                let attempts = attempts_clone.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(TelemetryError::new(
                            format!("connection reset ({n})"),
                            ErrorCategory::Network,
                            Severity::Medium,
                        )
                        .retryable(true))
                    } else {
                        Ok(99)
                    }
                }
            },
            Some("ingest"),
        )
        .await
        .unwrap();

    assert_eq!(value, 99);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(280), "sleeps of 100ms and 200ms, got {elapsed:?}");
}

#[tokio::test]
async fn retries_share_one_correlation_id() {
    let (manager, _) = manager_with_clock(ReliabilityConfig {
        retry: RetryConfig {
            initial_delay: Duration::from_millis(1),
            ..Default::default()
        },
        ..Default::default()
    });

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();
    let _ = manager
        .execute_with_retry(
            move || {
                let attempts = attempts_clone.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(
                        TelemetryError::new(
                            format!("connection reset ({n})"),
                            ErrorCategory::Network,
                            Severity::Medium,
                        )
                        .retryable(true),
                    )
                }
            },
            Some("ingest"),
        )
        .await;

    let attempt_errors: Vec<_> = manager
        .recent_errors(Duration::from_secs(300))
        .into_iter()
        .filter(|e| e.category == ErrorCategory::Network)
        .collect();
    assert_eq!(attempt_errors.len(), 3);

    let correlations: std::collections::BTreeSet<_> =
        attempt_errors.iter().map(|e| e.correlation_id).collect();
    assert_eq!(correlations.len(), 1, "all attempts share one correlation id");
    assert!(attempt_errors[0].correlation_id.is_some());

    // The exhaustion record carries the same id and the attempt log.
    let exhausted: Vec<_> = manager
        .recent_errors(Duration::from_secs(300))
        .into_iter()
        .filter(|e| e.category == ErrorCategory::System)
        .collect();
    assert_eq!(exhausted.len(), 1);
    assert_eq!(exhausted[0].correlation_id, attempt_errors[0].correlation_id);
    assert!(exhausted[0].context.contains_key("attempt_3"));
}

#[tokio::test]
async fn non_retryable_errors_short_circuit_the_retry_loop() {
    let (manager, _) = manager_with_clock(ReliabilityConfig::default());

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();
    let err = manager
        .execute_with_retry(
            move || {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TelemetryError::new(
                        "schema rejected",
                        ErrorCategory::Validation,
                        Severity::Medium,
                    ))
                }
            },
            None,
        )
        .await
        .unwrap_err();

    assert_eq!(err.category, ErrorCategory::Validation);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn graceful_degradation_returns_the_fallback_value() {
    let (manager, _) = manager_with_clock(ReliabilityConfig {
        retry: RetryConfig {
            enabled: true,
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        },
        ..Default::default()
    });

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();
    let value = manager
        .execute_with_graceful_degradation(
            "storage:write",
            move || {
                let attempts = attempts_clone.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<&str, _>(storage_error(&format!("disk full ({n})")))
                }
            },
            || async { Ok("from-cache") },
        )
        .await
        .unwrap();

    assert_eq!(value, "from-cache");
    assert_eq!(attempts.load(Ordering::SeqCst), 3, "primary retried to exhaustion");

    let stats = manager.error_stats();
    assert_eq!(stats.by_category.get(&ErrorCategory::Storage), Some(&3));
    assert_eq!(stats.by_severity.get(&Severity::Critical), None, "fallback succeeded");
}

#[tokio::test]
async fn double_failure_surfaces_a_critical_error_with_both_messages() {
    let (manager, _) = manager_with_clock(ReliabilityConfig {
        retry: RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            ..Default::default()
        },
        ..Default::default()
    });

    let err = manager
        .execute_with_graceful_degradation(
            "storage:write",
            || async { Err::<(), _>(storage_error("disk full")) },
            || async {
                Err::<(), _>(TelemetryError::new(
                    "cache eviction race",
                    ErrorCategory::Storage,
                    Severity::High,
                ))
            },
        )
        .await
        .unwrap_err();

    assert_eq!(err.severity, Severity::Critical);
    assert_eq!(err.category, ErrorCategory::System);
    assert!(!err.retryable);
    assert!(err.message.contains("disk full"));
    assert!(err.message.contains("cache eviction race"));

    let stats = manager.error_stats();
    assert_eq!(stats.by_severity.get(&Severity::Critical), Some(&1));
}

#[tokio::test]
async fn alert_rule_fires_once_per_cooldown() {
    let (manager, clock) = manager_with_clock(ReliabilityConfig::default());
    let sink = MemorySink::new(100);
    manager.add_alert_channel(
        AlertChannel::new("ops", ChannelKind::Custom),
        Arc::new(sink.clone()),
    );
    manager.add_alert_rule(AlertRule {
        id: "burst".into(),
        name: "error burst".into(),
        condition: AlertCondition::ErrorCount {
            threshold: 5,
            window: Duration::from_secs(60),
            severity_filter: None,
        },
        channels: vec!["ops".into()],
        cooldown: Duration::from_secs(10),
        severity: None,
    });

    let feed = |offset: usize| {
        for i in 0..5 {
            manager.handle_error(TelemetryError::new(
                format!("ingest failure {offset}-{i}"),
                ErrorCategory::Streaming,
                Severity::Medium,
            ));
        }
    };

    feed(0);
    assert_eq!(manager.check_alerts().len(), 1, "first batch fires");

    clock.advance(5_000);
    feed(1);
    assert_eq!(manager.check_alerts().len(), 0, "cooldown suppresses at t=5s");

    clock.advance(6_000);
    feed(2);
    assert_eq!(manager.check_alerts().len(), 1, "second firing at t=11s");

    // Give the dispatch tasks a chance to run.
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(sink.len(), 2);
    assert_eq!(manager.alert_history(None).len(), 2);
}

#[tokio::test]
async fn report_covers_every_component() {
    let (manager, _) = manager_with_clock(ReliabilityConfig::default());

    manager.check_rate_limit(&TelemetryEvent::new("ingest", "flush")).unwrap();
    manager
        .push_event(None, TelemetryEvent::new("ingest", "flush"))
        .await
        .unwrap();
    let _ = manager
        .execute_with_circuit_breaker("storage:write", || async {
            Err::<(), _>(storage_error("disk full"))
        })
        .await;

    let report = manager.reliability_report();
    assert_eq!(report.rate_limiter.total_checks, 1);
    assert!(report.circuits.contains_key("storage:write"));
    assert_eq!(report.queues["events"].size, 1);
    assert!(report.errors.total >= 1);

    // Serializes for external consumers.
    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("storage:write"));
}

#[tokio::test]
async fn health_rollup_reflects_open_circuits() {
    let (manager, _) = manager_with_clock(ReliabilityConfig {
        circuit: CircuitBreakerConfig {
            enabled: true,
            threshold: 1,
            timeout: Duration::from_secs(60),
            half_open_required: 1,
        },
        ..Default::default()
    });

    let healthy = manager.system_health().await;
    assert_eq!(healthy.overall, ballast::HealthStatus::Healthy);
    assert!(healthy.checks.contains_key("error_rate"));
    assert!(healthy.checks.contains_key("circuit_breakers"));
    assert!(healthy.checks.contains_key("resources"));
    assert!(healthy.checks.contains_key("backpressure"));

    let _ = manager
        .execute_with_circuit_breaker("storage:write", || async {
            Err::<(), _>(storage_error("disk full"))
        })
        .await;

    let degraded = manager.system_health().await;
    assert_ne!(degraded.overall, ballast::HealthStatus::Healthy);
    let circuits = &degraded.checks["circuit_breakers"];
    assert_ne!(circuits.status, ballast::HealthStatus::Healthy);
}

#[tokio::test]
async fn shutdown_rejects_new_work_and_wakes_waiters() {
    let (manager, _) = manager_with_clock(ReliabilityConfig::default());
    manager.start();

    // A consumer parked on an empty queue.
    let waiting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.next_event(None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    manager.shutdown();

    let woken = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .expect("waiter wakes on shutdown")
        .unwrap();
    assert!(woken.unwrap_err().context.contains_key("shutdown"));

    assert!(manager.check_rate_limit(&TelemetryEvent::new("a", "b")).is_err());
    assert!(manager
        .push_event(None, TelemetryEvent::new("a", "b"))
        .await
        .is_err());
    let gated: Result<(), _> = manager
        .execute_with_retry(|| async { Ok(()) }, None)
        .await;
    assert!(gated.is_err());

    // Idempotent.
    manager.shutdown();
}

#[tokio::test]
async fn custom_metrics_drive_custom_conditions() {
    let (manager, _) = manager_with_clock(ReliabilityConfig::default());
    let sink = MemorySink::new(10);
    manager.add_alert_channel(
        AlertChannel::new("ops", ChannelKind::Custom),
        Arc::new(sink.clone()),
    );
    manager.add_alert_rule(AlertRule {
        id: "lag".into(),
        name: "consumer lag".into(),
        condition: AlertCondition::Custom(Arc::new(|ctx: &ballast::AlertContext| {
            ctx.custom_metrics.get("lag").copied().unwrap_or(0.0) > 100.0
        })),
        channels: vec!["ops".into()],
        cooldown: Duration::ZERO,
        severity: Some(Severity::High),
    });

    assert!(manager.check_alerts().is_empty());
    manager.set_custom_metric("lag", 500.0);
    assert_eq!(manager.check_alerts().len(), 1);
}
