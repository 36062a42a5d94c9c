//! Shutdown tests.
//!
//! However a run ends, no worker survives it and no ownership claim is
//! left behind. Aborted runs still return everything that finished.

use std::time::Duration;

use orchestra::core::{Role, TaskId};
use orchestra::orchestration::{AbortCause, Anomaly, FailurePolicy, RunSettings};
use orchestra::workflow::RunStatus;
use serde_json::json;

use crate::fixtures::{
    coordinator, expect_abort, fast_settings, ids, liveness_settings, set, task, Event, Recorder,
};

fn failing_layer() -> Vec<orchestra::core::Task> {
    vec![
        task("bad", Role::TechnicalImpl, 0).with_context(json!({ "fail": true })),
        task("slow_tests", Role::QaVerifier, 0).with_context(json!({ "sleep_ms": 300 })),
        task("slow_docs", Role::DocsMaintainer, 0).with_context(json!({ "sleep_ms": 300 })),
        task("next", Role::Researcher, 1),
    ]
}

/// Given a failing task with two slow siblings and a next layer
/// When the failure policy stops on the first failure
/// Then the siblings are cancelled, the next layer never starts and
/// every worker is shut down gracefully
#[tokio::test]
async fn test_failure_stops_run_and_cancels_siblings() {
    let recorder = Recorder::new();
    let coord = coordinator(fast_settings(), &recorder);

    let (cause, partial) = expect_abort(coord.run("fail fast", failing_layer()).await);

    assert_eq!(
        cause,
        AbortCause::TaskFailed {
            task_ids: vec![TaskId::from("bad")]
        }
    );
    assert_eq!(ids(&partial.failed), set(&["bad"]));
    assert_eq!(ids(&partial.cancelled), set(&["slow_tests", "slow_docs", "next"]));
    assert!(partial.completed.is_empty());
    assert_eq!(partial.aborted, Some(cause));

    assert!(!recorder.started("next"));
    let events = recorder.events();
    assert!(!events.contains(&Event::Finished("slow_tests".to_string())));
    assert!(!events.contains(&Event::Finished("slow_docs".to_string())));

    assert_eq!(coord.status(), RunStatus::Aborted);
    let teardown = coord.last_teardown().unwrap();
    assert!(teardown.is_complete());
    assert_eq!(teardown.workers.len(), 3);
    assert!(!partial
        .anomalies
        .iter()
        .any(|a| matches!(a, Anomaly::ForcedTermination { .. })));
}

/// Under the drain policy the failed layer finishes before the run aborts.
#[tokio::test]
async fn test_drain_policy_finishes_layer_first() {
    let recorder = Recorder::new();
    let settings = RunSettings {
        failure_policy: FailurePolicy::DrainLayer,
        ..fast_settings()
    };
    let coord = coordinator(settings, &recorder);

    let (cause, partial) = expect_abort(coord.run("drain", failing_layer()).await);

    assert!(matches!(cause, AbortCause::TaskFailed { .. }));
    assert_eq!(ids(&partial.completed), set(&["slow_tests", "slow_docs"]));
    assert_eq!(ids(&partial.failed), set(&["bad"]));
    assert_eq!(ids(&partial.cancelled), set(&["next"]));
    assert!(!recorder.started("next"));
    assert!(coord.last_teardown().unwrap().is_complete());
}

/// A run past its deadline aborts with a partial result.
#[tokio::test]
async fn test_run_timeout_returns_partial() {
    let recorder = Recorder::new();
    let tasks = vec![
        task("quick", Role::Researcher, 0),
        task("forever", Role::TechnicalImpl, 0).with_context(json!({ "stall": true })),
        task("docs", Role::DocsMaintainer, 0).with_dependencies(["quick"]),
    ];
    let settings = RunSettings {
        run_timeout: Some(Duration::from_millis(150)),
        ..fast_settings()
    };
    let coord = coordinator(settings, &recorder);

    let (cause, partial) = expect_abort(coord.run("deadline", tasks).await);

    assert_eq!(
        cause,
        AbortCause::Timeout {
            after: Duration::from_millis(150)
        }
    );
    assert_eq!(ids(&partial.completed), set(&["quick", "docs"]));
    assert_eq!(ids(&partial.cancelled), set(&["forever"]));
    assert!(coord.last_teardown().unwrap().is_complete());
}

/// A worker that cannot acknowledge shutdown within the grace period is
/// forced down and the forced termination is recorded.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unresponsive_worker_is_forced_down() {
    let recorder = Recorder::new();
    let tasks = vec![
        task("blocker", Role::TechnicalImpl, 0).with_context(json!({ "block_ms": 400 })),
        task("quick", Role::QaVerifier, 0),
        task("notes", Role::DocsMaintainer, 0),
    ];
    let settings = RunSettings {
        run_timeout: Some(Duration::from_millis(100)),
        grace: Duration::from_millis(50),
        ..fast_settings()
    };
    let coord = coordinator(settings, &recorder);

    let (cause, partial) = expect_abort(coord.run("blocked", tasks).await);

    assert!(matches!(cause, AbortCause::Timeout { .. }));
    assert!(ids(&partial.cancelled).contains("blocker"));
    let forced = partial
        .anomalies
        .iter()
        .filter(|a| matches!(a, Anomaly::ForcedTermination { .. }))
        .count();
    assert_eq!(forced, 1);

    let teardown = coord.last_teardown().unwrap();
    assert!(teardown.is_complete());
}

/// Given a blocked worker whose replacement handshake is still waiting
/// for an ack
/// When the run deadline cuts the handshake short
/// Then shutdown still finishes that worker and releases its claim
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_during_replacement_leaves_nothing_behind() {
    let recorder = Recorder::new();
    let tasks = vec![
        task("blocker", Role::TechnicalImpl, 0).with_context(json!({ "block_ms": 1500 })),
        task("quick", Role::QaVerifier, 0),
        task("notes", Role::DocsMaintainer, 0),
    ];
    let settings = RunSettings {
        run_timeout: Some(Duration::from_millis(300)),
        grace: Duration::from_millis(800),
        ..liveness_settings()
    };
    let coord = coordinator(settings, &recorder);

    let (cause, partial) = expect_abort(coord.run("cut short", tasks).await);

    assert_eq!(
        cause,
        AbortCause::Timeout {
            after: Duration::from_millis(300)
        }
    );
    assert!(ids(&partial.cancelled).contains("blocker"));
    assert_eq!(ids(&partial.completed), set(&["quick", "notes"]));

    let teardown = coord.last_teardown().unwrap();
    assert!(
        teardown.is_complete(),
        "states: {:?}",
        teardown.workers.iter().map(|w| w.state).collect::<Vec<_>>()
    );
    assert!(partial
        .anomalies
        .iter()
        .any(|a| matches!(a, Anomaly::ForcedTermination { .. })));
}

/// A malformed graph aborts before anything runs.
#[tokio::test]
async fn test_unresolved_dependency_aborts_before_start() {
    let recorder = Recorder::new();
    let tasks = vec![
        task("a", Role::Researcher, 0),
        task("b", Role::TechnicalImpl, 0).with_dependencies(["ghost"]),
    ];
    let coord = coordinator(fast_settings(), &recorder);

    let (cause, partial) = expect_abort(coord.run("broken", tasks).await);

    assert!(matches!(cause, AbortCause::Structural { .. }));
    assert_eq!(ids(&partial.cancelled), set(&["a", "b"]));
    assert!(recorder.events().is_empty());
    assert!(coord.last_teardown().unwrap().is_complete());
}
