//! Ownership exclusivity tests.
//!
//! Two same-layer tasks whose globs intersect can never hold claims at
//! the same time: the second either waits for the first to release or
//! the run aborts, depending on the ownership policy.

use orchestra::core::{Role, TaskId};
use orchestra::orchestration::{
    AbortCause, Anomaly, ModePreference, OwnershipPolicy, OwnershipRegistry, RunSettings,
    WorkerId,
};
use orchestra::Error;
use serde_json::json;

use crate::fixtures::{coordinator, expect_abort, fast_settings, ids, set, task, Recorder};

fn overlapping_tasks() -> Vec<orchestra::core::Task> {
    vec![
        task("broad", Role::TechnicalImpl, 0)
            .with_ownership(["src/**"])
            .with_context(json!({ "sleep_ms": 60 })),
        task("narrow", Role::Refactorer, 0)
            .with_ownership(["src/api/**"])
            .with_context(json!({ "sleep_ms": 10 })),
    ]
}

fn concurrent(policy: OwnershipPolicy) -> RunSettings {
    RunSettings {
        mode: ModePreference::Concurrent,
        ownership_policy: policy,
        ..fast_settings()
    }
}

/// Given two same-layer tasks claiming `src/**` and `src/api/**`
/// When the ownership policy is abort
/// Then the run aborts with an ownership conflict naming the second task
#[tokio::test]
async fn test_overlapping_claims_abort_the_run() {
    let recorder = Recorder::new();
    let coord = coordinator(concurrent(OwnershipPolicy::Abort), &recorder);

    let (cause, partial) = expect_abort(coord.run("overlap", overlapping_tasks()).await);

    match cause {
        AbortCause::OwnershipConflict { task_id, pattern, .. } => {
            assert_eq!(task_id, TaskId::from("narrow"));
            assert_eq!(pattern, "src/**");
        }
        other => panic!("expected ownership conflict, got {other}"),
    }
    assert!(!recorder.started("narrow"));
    assert_eq!(ids(&partial.cancelled), set(&["broad", "narrow"]));
    assert!(coord.last_teardown().unwrap().is_complete());
}

/// Given the same overlapping tasks
/// When the ownership policy is defer
/// Then both complete, one after the other, and the deferral is recorded
#[tokio::test]
async fn test_overlapping_claims_defer_until_release() {
    let recorder = Recorder::new();
    let coord = coordinator(concurrent(OwnershipPolicy::Defer), &recorder);

    let result = coord.run("overlap", overlapping_tasks()).await.unwrap();

    assert_eq!(ids(&result.completed), set(&["broad", "narrow"]));
    assert!(recorder.finished_before_started("broad", "narrow"));
    assert_eq!(recorder.max_in_flight(), 1);

    let deferred: Vec<&Anomaly> = result
        .anomalies
        .iter()
        .filter(|a| matches!(a, Anomaly::DeferredSpawn { .. }))
        .collect();
    assert_eq!(deferred.len(), 1, "deferral should be recorded once");
    match deferred[0] {
        Anomaly::DeferredSpawn { task_id, pattern, .. } => {
            assert_eq!(task_id, &TaskId::from("narrow"));
            assert_eq!(pattern, "src/**");
        }
        _ => unreachable!(),
    }
}

/// Disjoint globs in one layer run side by side.
#[tokio::test]
async fn test_disjoint_claims_run_together() {
    let recorder = Recorder::new();
    let tasks = vec![
        task("api", Role::TechnicalImpl, 0)
            .with_ownership(["src/api/**"])
            .with_context(json!({ "sleep_ms": 50 })),
        task("ui", Role::TechnicalImpl, 0)
            .with_ownership(["src/ui/**"])
            .with_context(json!({ "sleep_ms": 50 })),
        task("guide", Role::DocsMaintainer, 0)
            .with_ownership(["docs/guide/*.md"])
            .with_context(json!({ "sleep_ms": 50 })),
    ];
    let coord = coordinator(concurrent(OwnershipPolicy::Abort), &recorder);

    let result = coord.run("split", tasks).await.unwrap();

    assert_eq!(result.completed.len(), 3);
    assert_eq!(recorder.max_in_flight(), 3);
    assert!(result.anomalies.is_empty());
}

/// Claims are released once a run ends, whatever the outcome.
#[tokio::test]
async fn test_claims_released_after_failed_run() {
    let recorder = Recorder::new();
    let tasks = vec![
        task("bad", Role::TechnicalImpl, 0).with_context(json!({ "fail": true })),
        task("slow", Role::QaVerifier, 0).with_context(json!({ "sleep_ms": 200 })),
        task("notes", Role::DocsMaintainer, 0).with_context(json!({ "sleep_ms": 200 })),
    ];
    let coord = coordinator(fast_settings(), &recorder);

    let (cause, _) = expect_abort(coord.run("fail", tasks).await);

    assert!(matches!(cause, AbortCause::TaskFailed { .. }));
    let teardown = coord.last_teardown().unwrap();
    assert!(teardown.claims.is_empty());
    assert!(teardown.is_complete());
}

#[test]
fn test_registry_conflict_names_holder() {
    let registry = OwnershipRegistry::new();
    let first = WorkerId::new();
    let second = WorkerId::new();

    registry.claim(first, &["src/**".to_string()]).unwrap();
    match registry.claim(second, &["src/components/Button.tsx".to_string()]) {
        Err(Error::OwnershipConflict {
            conflicting_worker_id,
            overlapping_pattern,
            requested_pattern,
        }) => {
            assert_eq!(conflicting_worker_id, first);
            assert_eq!(overlapping_pattern, "src/**");
            assert_eq!(requested_pattern, "src/components/Button.tsx");
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert!(registry.patterns_for(second).is_empty());

    registry.release(first);
    registry
        .claim(second, &["src/components/Button.tsx".to_string()])
        .unwrap();
    assert_eq!(registry.claims().len(), 1);
}
