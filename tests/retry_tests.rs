use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use duraflow::runtime::{ActivityRegistry, OrchestrationRegistry};
use duraflow::{ErrorDetails, EventKind, OrchestrationContext, OrchestrationStatus, RetryPolicy};

mod common;
use common::*;

fn flaky_activities(calls: Arc<AtomicU32>, fail_first: u32) -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("Flaky", move |ctx, input: String| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                assert_eq!(ctx.attempt(), n);
                if n <= fail_first {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok(format!("{input} ok on {n}"))
                }
            }
        })
        .build()
        .unwrap()
}

fn retrying(max_attempts: u32) -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("Retrying", move |ctx: OrchestrationContext, input: String| async move {
            let policy = RetryPolicy::new(Duration::from_millis(10), max_attempts);
            match ctx.call_activity_with_retry("Flaky", input, policy).await {
                Ok(out) => Ok(out),
                Err(e) => Ok(format!("gave up: {e}")),
            }
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn succeeds_once_an_attempt_passes() {
    let store = memory_store();
    let calls = Arc::new(AtomicU32::new(0));
    let rt = start(store.clone(), flaky_activities(calls.clone(), 2), retrying(4)).await;
    let client = rt.client();

    let id = client.start_orchestration("Retrying", "job").await.unwrap();
    let state = client.wait_for_orchestration(&id, WAIT).await.unwrap();
    assert_eq!(state.status, OrchestrationStatus::Completed);
    assert_eq!(state.output.as_deref(), Some("job ok on 3"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let events = client.read_history(&id).await.unwrap().events;
    assert_eq!(scheduled_attempts(&events, "Flaky"), vec![1, 2, 3]);
    let first = events
        .iter()
        .find(|e| matches!(e.kind, EventKind::ActivityScheduled { attempt: 1, .. }))
        .map(|e| e.seq)
        .unwrap();
    // retries point back at the first record; only the last attempt completes
    assert!(events.iter().all(|e| match &e.kind {
        EventKind::ActivityScheduled { attempt, retry_of, .. } => (*attempt == 1) == retry_of.is_none()
            && retry_of.map_or(true, |r| r == first),
        _ => true,
    }));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::ActivityCompleted { .. } | EventKind::ActivityFailed { .. }))
            .count(),
        1
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_surface_one_failure_with_the_attempt_count() {
    let store = memory_store();
    let calls = Arc::new(AtomicU32::new(0));
    let rt = start(store.clone(), flaky_activities(calls.clone(), u32::MAX), retrying(4)).await;
    let client = rt.client();

    let id = client.start_orchestration("Retrying", "job").await.unwrap();
    let state = client.wait_for_orchestration(&id, WAIT).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let expected = ErrorDetails::ActivityExecution {
        activity: "Flaky".into(),
        attempts: 4,
        message: "attempt 4 failed".into(),
    };
    assert_eq!(state.output, Some(format!("gave up: {expected}")));

    let events = client.read_history(&id).await.unwrap().events;
    let failures: Vec<&ErrorDetails> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::ActivityFailed { error, .. } => Some(error),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![&expected]);
    rt.shutdown().await;
}

#[tokio::test]
async fn without_a_policy_the_first_failure_is_final() {
    let store = memory_store();
    let calls = Arc::new(AtomicU32::new(0));
    let orchestrations = OrchestrationRegistry::builder()
        .register("Once", |ctx: OrchestrationContext, input: String| async move {
            ctx.call_activity("Flaky", input).await.map_err(|e| e.to_string())
        })
        .build()
        .unwrap();
    let rt = start(store.clone(), flaky_activities(calls.clone(), 1), orchestrations).await;
    let client = rt.client();

    let id = client.start_orchestration("Once", "job").await.unwrap();
    let state = client.wait_for_orchestration(&id, WAIT).await.unwrap();
    assert_eq!(state.status, OrchestrationStatus::Failed);
    assert!(matches!(state.error, Some(ErrorDetails::Application { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn attempts_are_spaced_by_the_back_off() {
    let store = memory_store();
    let policy = RetryPolicy::new(Duration::from_millis(100), 3).with_backoff_coefficient(2.0);
    let started: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = started.clone();
    let activities = ActivityRegistry::builder()
        .register("Stamp", move |ctx, _input: String| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(Instant::now());
                if ctx.attempt() < 3 {
                    Err("not yet".to_string())
                } else {
                    Ok("stamped".to_string())
                }
            }
        })
        .build()
        .unwrap();
    let call_policy = policy.clone();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Spaced", move |ctx: OrchestrationContext, input: String| {
            let policy = call_policy.clone();
            async move {
                ctx.call_activity_with_retry("Stamp", input, policy)
                    .await
                    .map_err(|e| e.to_string())
            }
        })
        .build()
        .unwrap();
    let rt = start(store.clone(), activities, orchestrations).await;
    let client = rt.client();

    let id = client.start_orchestration("Spaced", "").await.unwrap();
    let state = client.wait_for_orchestration(&id, WAIT).await.unwrap();
    assert_eq!(state.output.as_deref(), Some("stamped"));

    // wall clock: attempt n + 1 starts no earlier than the delay after attempt n
    let started = started.lock().unwrap().clone();
    assert_eq!(started.len(), 3);
    for (n, pair) in started.windows(2).enumerate() {
        let failed_attempt = n as u32 + 1;
        assert!(
            pair[1] - pair[0] >= policy.delay_for_attempt(failed_attempt),
            "attempt {} started {:?} after attempt {failed_attempt}",
            failed_attempt + 1,
            pair[1] - pair[0]
        );
    }

    // history: each retry record is due one delay after the previous attempt was recorded
    let events = client.read_history(&id).await.unwrap().events;
    let records: Vec<(u32, u64, u64)> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::ActivityScheduled {
                attempt, not_before_ms, ..
            } => Some((*attempt, *not_before_ms, e.timestamp_ms)),
            _ => None,
        })
        .collect();
    assert_eq!(records.iter().map(|r| r.0).collect::<Vec<_>>(), vec![1, 2, 3]);
    for pair in records.windows(2) {
        let (previous, retry) = (pair[0], pair[1]);
        let delay = policy.delay_for_attempt(previous.0).as_millis() as u64;
        assert!(retry.1 >= previous.2 + delay, "{records:?}");
        assert!(retry.1 <= retry.2 + delay, "{records:?}");
    }
    rt.shutdown().await;
}
