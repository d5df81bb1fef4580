//! Unit tests for the per-key single-flight primitive.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_switchboard::supervisor::single_flight::SingleFlight;

/// Five concurrent callers for one key run the work exactly once and all
/// observe the same value.
#[tokio::test]
async fn concurrent_callers_coalesce() {
    let flight = Arc::new(SingleFlight::<String>::new());
    let runs = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let flight = Arc::clone(&flight);
        let runs = Arc::clone(&runs);
        handles.push(tokio::spawn(async move {
            flight
                .run("claude-code:/home/u/proj", move || async move {
                    let n = runs.fetch_add(1, Ordering::SeqCst);
                    // Hold the flight open so every caller attaches.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    format!("result-{n}")
                })
                .await
        }));
    }

    let mut values = Vec::new();
    for handle in handles {
        values.push(handle.await.expect("task"));
    }

    assert_eq!(
        runs.load(Ordering::SeqCst),
        1,
        "work must run exactly once for one key"
    );
    assert!(
        values.iter().all(|v| v == "result-0"),
        "every caller must observe the leader's value: {values:?}"
    );
}

/// Different keys run independently.
#[tokio::test]
async fn distinct_keys_run_separately() {
    let flight = Arc::new(SingleFlight::<usize>::new());
    let runs = Arc::new(AtomicUsize::new(0));

    let a = {
        let runs = Arc::clone(&runs);
        flight.run("key-a", move || async move {
            runs.fetch_add(1, Ordering::SeqCst)
        })
    };
    let b = {
        let runs = Arc::clone(&runs);
        flight.run("key-b", move || async move {
            runs.fetch_add(1, Ordering::SeqCst)
        })
    };

    let (a, b) = tokio::join!(a, b);
    assert_ne!(a, b, "each key must run its own work");
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// After a flight completes, the key is free again: a later caller runs
/// fresh work instead of seeing a stale value.
#[tokio::test]
async fn key_is_reusable_after_completion() {
    let flight = SingleFlight::<usize>::new();
    let runs = AtomicUsize::new(0);

    let first = flight
        .run("key", || async { runs.fetch_add(1, Ordering::SeqCst) })
        .await;
    let second = flight
        .run("key", || async { runs.fetch_add(1, Ordering::SeqCst) })
        .await;

    assert_eq!(first, 0);
    assert_eq!(second, 1, "sequential calls must not coalesce");
}

/// Errors propagate to every attached caller, mirroring the spawn-failure
/// contract.
#[tokio::test]
async fn error_values_fan_out() {
    let flight = Arc::new(SingleFlight::<Result<String, String>>::new());

    let mut handles = Vec::new();
    for _ in 0..3 {
        let flight = Arc::clone(&flight);
        handles.push(tokio::spawn(async move {
            flight
                .run("key", || async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Err::<String, String>("spawn failed".to_owned())
                })
                .await
        }));
    }

    for handle in handles {
        let outcome = handle.await.expect("task");
        assert_eq!(outcome, Err("spawn failed".to_owned()));
    }
}
