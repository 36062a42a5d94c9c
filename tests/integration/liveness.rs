//! Liveness tests: stall escalation, failure retries and guidance.
//!
//! Stall scenarios run on paused time so the escalation ladder advances
//! deterministically with the liveness ticks.

use std::sync::Arc;

use orchestra::core::{Role, TaskId};
use orchestra::orchestration::{
    AbortCause, Anomaly, Escalation, EscalationPolicy, ModePreference, OrchestrationMode,
    RunSettings, StaticGuidance,
};
use serde_json::json;

use crate::fixtures::{
    coordinator, escalations, expect_abort, fast_settings, ids, liveness_settings, set, task,
    Recorder,
};

fn escalating(guide_attempts: u32, max_replacements: u32) -> RunSettings {
    RunSettings {
        mode: ModePreference::Concurrent,
        escalation: EscalationPolicy {
            guide_attempts,
            max_replacements,
        },
        ..liveness_settings()
    }
}

/// Given a layer-0 task that never reports progress, a healthy sibling,
/// and one layer-1 dependent of each
/// When the stalled worker exhausts its guidance budget with no
/// replacements allowed
/// Then its task and dependent are cancelled and the rest of the run completes
#[tokio::test(start_paused = true)]
async fn test_stall_is_guided_then_cancelled() {
    let recorder = Recorder::new();
    let tasks = vec![
        task("stuck", Role::TechnicalImpl, 0).with_context(json!({ "stall": true })),
        task("fine", Role::QaVerifier, 0),
        task("after_stuck", Role::DocsMaintainer, 1).with_dependencies(["stuck"]),
        task("independent", Role::Researcher, 1).with_dependencies(["fine"]),
    ];
    let coord = coordinator(escalating(2, 0), &recorder);

    let result = coord.run("stall", tasks).await.unwrap();

    assert_eq!(ids(&result.completed), set(&["fine", "independent"]));
    assert_eq!(ids(&result.cancelled), set(&["stuck", "after_stuck"]));
    assert!(result.failed.is_empty());
    assert_eq!(escalations(&result, Escalation::Guide), 2);
    assert_eq!(escalations(&result, Escalation::Replace), 0);
    assert_eq!(escalations(&result, Escalation::Cancel), 1);
    assert!(!recorder.started("after_stuck"));
    assert!(coord.last_teardown().unwrap().is_complete());
}

/// A task that stalls once is handed to a replacement worker and finishes there.
#[tokio::test(start_paused = true)]
async fn test_stalled_task_moves_to_replacement() {
    let recorder = Recorder::new();
    let tasks = vec![
        task("flaky", Role::TechnicalImpl, 0).with_context(json!({ "stall_first": true })),
        task("steady", Role::QaVerifier, 0),
    ];
    let coord = coordinator(escalating(1, 1), &recorder);

    let result = coord.run("replace", tasks).await.unwrap();

    assert_eq!(ids(&result.completed), set(&["flaky", "steady"]));
    assert_eq!(recorder.start_count("flaky"), 2);
    assert_eq!(escalations(&result, Escalation::Guide), 1);
    assert_eq!(escalations(&result, Escalation::Replace), 1);
    assert_eq!(escalations(&result, Escalation::Cancel), 0);

    let teardown = coord.last_teardown().unwrap();
    assert!(teardown.is_complete());
    assert_eq!(
        teardown.workers.len(),
        3,
        "stalled worker, its replacement, and the steady worker"
    );
}

/// Inline execution climbs the same stall ladder, so a stalling graph
/// ends the same way in either mode.
#[tokio::test(start_paused = true)]
async fn test_stall_handling_matches_across_modes() {
    for mode in [ModePreference::Sequential, ModePreference::Concurrent] {
        let recorder = Recorder::new();
        let tasks = vec![
            task("stuck", Role::TechnicalImpl, 0).with_context(json!({ "stall": true })),
            task("fine", Role::QaVerifier, 0),
            task("after_stuck", Role::DocsMaintainer, 1).with_dependencies(["stuck"]),
            task("independent", Role::Researcher, 1).with_dependencies(["fine"]),
        ];
        let settings = RunSettings {
            mode,
            ..escalating(2, 0)
        };

        let result = coordinator(settings, &recorder)
            .run("stall", tasks)
            .await
            .unwrap_or_else(|e| panic!("mode {mode:?}: {e}"));

        assert_eq!(ids(&result.completed), set(&["fine", "independent"]), "{mode:?}");
        assert_eq!(ids(&result.cancelled), set(&["stuck", "after_stuck"]), "{mode:?}");
        assert_eq!(escalations(&result, Escalation::Guide), 2, "{mode:?}");
        assert_eq!(escalations(&result, Escalation::Cancel), 1, "{mode:?}");
    }
}

/// Inline, a replacement restarts the task as its next attempt.
#[tokio::test(start_paused = true)]
async fn test_sequential_stall_restarts_task() {
    let recorder = Recorder::new();
    let tasks = vec![
        task("flaky", Role::TechnicalImpl, 0).with_context(json!({ "stall_first": true })),
        task("steady", Role::QaVerifier, 1),
    ];
    let settings = RunSettings {
        mode: ModePreference::Sequential,
        ..escalating(1, 1)
    };

    let result = coordinator(settings, &recorder)
        .run("replace", tasks)
        .await
        .unwrap();

    assert_eq!(result.mode, OrchestrationMode::Sequential);
    assert_eq!(ids(&result.completed), set(&["flaky", "steady"]));
    assert_eq!(recorder.start_count("flaky"), 2);
    assert_eq!(escalations(&result, Escalation::Replace), 1);
}

/// With `abort_on_stall_cancel`, exhausting the budget ends the run.
#[tokio::test(start_paused = true)]
async fn test_stall_cancel_aborts_when_configured() {
    let recorder = Recorder::new();
    let tasks = vec![
        task("stuck", Role::TechnicalImpl, 0).with_context(json!({ "stall": true })),
        task("later", Role::QaVerifier, 1),
    ];
    let settings = RunSettings {
        abort_on_stall_cancel: true,
        ..escalating(0, 0)
    };
    let coord = coordinator(settings, &recorder);

    let (cause, partial) = expect_abort(coord.run("stall", tasks).await);

    match cause {
        AbortCause::Stalled { task_ids, .. } => {
            assert_eq!(task_ids, vec![TaskId::from("stuck")]);
        }
        other => panic!("expected stall abort, got {other}"),
    }
    assert_eq!(ids(&partial.cancelled), set(&["stuck", "later"]));
    assert!(!recorder.started("later"));
}

/// Failed attempts are retried on fresh workers within the budget.
#[tokio::test]
async fn test_failed_task_retried_on_fresh_worker() {
    let recorder = Recorder::new();
    let tasks = vec![
        task("wobbly", Role::TechnicalImpl, 0).with_context(json!({ "fail_times": 2 })),
        task("solid", Role::QaVerifier, 0),
        task("notes", Role::DocsMaintainer, 1).with_dependencies(["wobbly"]),
    ];
    let settings = RunSettings {
        max_task_retries: 2,
        ..fast_settings()
    };
    let coord = coordinator(settings, &recorder);

    let result = coord.run("retry", tasks).await.unwrap();

    assert_eq!(result.completed.len(), 3);
    assert_eq!(recorder.start_count("wobbly"), 3);
    let retried: Vec<u32> = result
        .anomalies
        .iter()
        .filter_map(|a| match a {
            Anomaly::TaskRetried { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retried, vec![1, 2]);
}

/// Once the retry budget is spent the failure stands.
#[tokio::test]
async fn test_retry_budget_exhausted() {
    let recorder = Recorder::new();
    let tasks = vec![
        task("wobbly", Role::TechnicalImpl, 0).with_context(json!({ "fail_times": 5 })),
        task("solid", Role::QaVerifier, 0),
        task("notes", Role::DocsMaintainer, 0),
    ];
    let settings = RunSettings {
        max_task_retries: 1,
        ..fast_settings()
    };
    let coord = coordinator(settings, &recorder);

    let (cause, partial) = expect_abort(coord.run("retry", tasks).await);

    assert_eq!(
        cause,
        AbortCause::TaskFailed {
            task_ids: vec![TaskId::from("wobbly")]
        }
    );
    assert_eq!(ids(&partial.failed), set(&["wobbly"]));
    assert_eq!(recorder.start_count("wobbly"), 2);
}

/// A worker that asks for guidance gets the coordinator's answer, in
/// both modes.
#[tokio::test]
async fn test_guidance_request_is_answered() {
    for mode in [ModePreference::Concurrent, ModePreference::Sequential] {
        let recorder = Recorder::new();
        let tasks = vec![
            task("curious", Role::Researcher, 0).with_context(json!({ "ask": true })),
            task("quiet", Role::QaVerifier, 0),
        ];
        let settings = RunSettings {
            mode,
            ..fast_settings()
        };
        let coord = coordinator(settings, &recorder).with_guidance(Arc::new(StaticGuidance {
            answer: "use the cache".to_string(),
        }));

        let result = coord.run("ask", tasks).await.unwrap();

        assert_eq!(
            result.summary["curious"],
            json!({ "guidance": "use the cache" }),
            "mode {mode:?}"
        );
    }
}
