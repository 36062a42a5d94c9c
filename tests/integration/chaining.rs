//! Follow-up chaining tests.
//!
//! A completed task's result can add more work to the run. Added tasks
//! sit above their trigger and respect the same layer rules as planned
//! ones.

use std::sync::Arc;

use orchestra::core::{Role, Task, TaskId};
use orchestra::orchestration::{
    Anomaly, FollowUp, ModePreference, NoFollowUps, OrchestrationMode, RunSettings,
};
use serde_json::{json, Value};

use crate::fixtures::{coordinator, fast_settings, ids, set, task, Recorder};

fn audit_graph() -> Vec<Task> {
    vec![
        task("audit", Role::SecurityAuditor, 0).with_context(json!({
            "result": { "findings": [{ "severity": "critical", "file": "src/auth.rs" }] }
        })),
        task("tests", Role::QaVerifier, 0),
        task("notes", Role::DocsMaintainer, 0),
    ]
}

/// Given a security audit that reports a critical finding
/// When the run finishes the audit
/// Then a fix and a write-up are added one layer up and run after it,
/// in either mode
#[tokio::test]
async fn test_critical_finding_adds_follow_ups() {
    for mode in [ModePreference::Concurrent, ModePreference::Sequential] {
        let recorder = Recorder::new();
        let settings = RunSettings {
            mode,
            ..fast_settings()
        };

        let result = coordinator(settings, &recorder)
            .run("audit", audit_graph())
            .await
            .unwrap_or_else(|e| panic!("mode {mode:?}: {e}"));

        assert_eq!(
            ids(&result.completed),
            set(&[
                "audit",
                "tests",
                "notes",
                "audit.technical-impl",
                "audit.docs-maintainer"
            ]),
            "{mode:?}"
        );
        let added: Vec<(&str, &str, u32)> = result
            .follow_ups
            .iter()
            .map(|f| (f.task_id.as_str(), f.triggered_by.as_str(), f.layer))
            .collect();
        assert_eq!(
            added,
            vec![
                ("audit.technical-impl", "audit", 1),
                ("audit.docs-maintainer", "audit", 1),
            ],
            "{mode:?}"
        );
        assert!(recorder.finished_before_started("audit", "audit.technical-impl"));
        assert!(recorder.finished_before_started("notes", "audit.docs-maintainer"));
        let fix = result.outcome(&TaskId::from("audit.technical-impl")).unwrap();
        assert_eq!(fix.layer, 1);
    }
}

/// Results without the well-known fields add nothing.
#[tokio::test]
async fn test_plain_results_add_no_follow_ups() {
    let recorder = Recorder::new();
    let result = coordinator(fast_settings(), &recorder)
        .run("plain", crate::fixtures::diamond_tasks())
        .await
        .unwrap();

    assert_eq!(result.mode, OrchestrationMode::Concurrent);
    assert!(result.follow_ups.is_empty());
}

/// Chaining can be switched off per coordinator.
#[tokio::test]
async fn test_follow_ups_disabled() {
    let recorder = Recorder::new();
    let result = coordinator(fast_settings(), &recorder)
        .with_follow_up(Arc::new(NoFollowUps))
        .run("audit", audit_graph())
        .await
        .unwrap();

    assert_eq!(result.completed.len(), 3);
    assert!(result.follow_ups.is_empty());
}

/// Adds a layer-0 task once `late` completes, after layer 0 closed.
struct Backfill;

impl FollowUp for Backfill {
    fn follow_ups(&self, task: &Task, _result: &Value) -> Vec<Task> {
        if task.id.as_str() == "late" {
            vec![Task::new("early_fix", Role::TechnicalImpl).with_layer(0)]
        } else {
            Vec::new()
        }
    }
}

/// A follow-up aimed at a layer whose work already started is refused;
/// the run still completes.
#[tokio::test]
async fn test_follow_up_into_closed_layer_rejected() {
    let recorder = Recorder::new();
    let tasks = vec![
        task("first", Role::Researcher, 0),
        task("late", Role::TechnicalImpl, 1).with_dependencies(["first"]),
        task("check", Role::QaVerifier, 1),
    ];

    let result = coordinator(fast_settings(), &recorder)
        .with_follow_up(Arc::new(Backfill))
        .run("backfill", tasks)
        .await
        .unwrap();

    assert_eq!(ids(&result.completed), set(&["first", "late", "check"]));
    assert!(result.follow_ups.is_empty());
    assert!(!recorder.started("early_fix"));
    let rejected: Vec<&Anomaly> = result
        .anomalies
        .iter()
        .filter(|a| matches!(a, Anomaly::FollowUpRejected { .. }))
        .collect();
    match rejected.as_slice() {
        [Anomaly::FollowUpRejected {
            task_id,
            triggered_by,
            reason,
        }] => {
            assert_eq!(task_id.as_str(), "early_fix");
            assert_eq!(triggered_by.as_str(), "late");
            assert!(reason.contains("already started"), "{reason}");
        }
        other => panic!("expected one rejection, got {other:?}"),
    }
}

/// Follow-ups past the run's budget are recorded, not added.
#[tokio::test]
async fn test_follow_up_budget() {
    let recorder = Recorder::new();
    let settings = RunSettings {
        max_follow_ups: 1,
        ..fast_settings()
    };

    let result = coordinator(settings, &recorder)
        .run("audit", audit_graph())
        .await
        .unwrap();

    assert_eq!(result.follow_ups.len(), 1);
    assert_eq!(result.follow_ups[0].task_id.as_str(), "audit.technical-impl");
    assert!(!recorder.started("audit.docs-maintainer"));
    assert!(result.anomalies.iter().any(|a| matches!(
        a,
        Anomaly::FollowUpRejected { task_id, reason, .. }
            if task_id.as_str() == "audit.docs-maintainer" && reason.contains("budget")
    )));
}
