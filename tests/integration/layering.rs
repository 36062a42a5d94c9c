//! Layer gating tests.
//!
//! Tasks of one layer run concurrently; nothing of the next layer starts
//! before every task below it has finished.

use orchestra::core::{Role, TaskBoard, TaskId, TaskStatus};
use orchestra::orchestration::{OrchestrationMode, WorkerId};
use serde_json::json;

use crate::fixtures::{coordinator, fast_settings, set, task, two_layer_tasks, ids, Recorder};

/// Given three independent layer-0 tasks and two layer-1 tasks depending on all of them
/// When the run executes concurrently
/// Then all layer-0 tasks run at once and no layer-1 task starts before they finish
#[tokio::test]
async fn test_layer_zero_runs_together_and_gates_layer_one() {
    let recorder = Recorder::new();
    let coord = coordinator(fast_settings(), &recorder);

    let result = coord.run("ship", two_layer_tasks(100)).await.unwrap();

    assert_eq!(result.mode, OrchestrationMode::Concurrent);
    assert_eq!(
        ids(&result.completed),
        set(&["impl", "tests", "docs", "refactor", "review"])
    );
    assert!(recorder.max_in_flight() >= 3, "layer 0 did not run concurrently");
    for first in ["impl", "tests", "docs"] {
        for second in ["refactor", "review"] {
            assert!(
                recorder.finished_before_started(first, second),
                "{second} started before {first} finished"
            );
        }
    }
}

/// Given a layer-2 task that depends directly on a layer-0 task
/// When the run executes
/// Then the layer-1 task still gates it
#[tokio::test]
async fn test_cross_layer_dependency_respects_layer_floor() {
    let recorder = Recorder::new();
    let tasks = vec![
        task("root", Role::Researcher, 0),
        task("middle", Role::TechnicalImpl, 1).with_context(json!({ "sleep_ms": 50 })),
        task("leaf", Role::DocsMaintainer, 2).with_dependencies(["root"]),
    ];

    let result = coordinator(fast_settings(), &recorder)
        .run("gate", tasks)
        .await
        .unwrap();

    assert_eq!(result.completed.len(), 3);
    assert!(recorder.finished_before_started("root", "middle"));
    assert!(recorder.finished_before_started("middle", "leaf"));
}

/// Given a same-layer dependency chain
/// When the run executes
/// Then the dependent starts only after its dependency finished
#[tokio::test]
async fn test_same_layer_dependency_is_ordered() {
    let recorder = Recorder::new();
    let tasks = vec![
        task("schema", Role::TechnicalImpl, 0).with_context(json!({ "sleep_ms": 30 })),
        task("fixtures", Role::QaVerifier, 0).with_dependencies(["schema"]),
        task("notes", Role::DocsMaintainer, 0),
    ];

    let result = coordinator(fast_settings(), &recorder)
        .run("chain", tasks)
        .await
        .unwrap();

    assert_eq!(result.completed.len(), 3);
    assert!(recorder.finished_before_started("schema", "fixtures"));
}

/// The board itself never promotes a layer-1 task while layer 0 is open.
#[test]
fn test_board_layer_gating_property() {
    let board = TaskBoard::from_tasks(two_layer_tasks(0)).unwrap();
    let worker = WorkerId::new();

    for id in ["impl", "tests", "docs"] {
        let id = TaskId::from(id);
        assert_eq!(board.get_task(&id).unwrap().status, TaskStatus::Runnable);
        board.start_task(&id, worker).unwrap();
    }
    let layer_one = |board: &TaskBoard| {
        ["refactor", "review"]
            .iter()
            .map(|id| board.get_task(&TaskId::from(*id)).unwrap().status)
            .collect::<Vec<_>>()
    };

    board.mark_done(&TaskId::from("impl"), json!(1)).unwrap();
    board.mark_done(&TaskId::from("tests"), json!(2)).unwrap();
    assert!(layer_one(&board).iter().all(|s| *s == TaskStatus::Pending));
    assert_eq!(board.current_layer(), 0);

    board.mark_done(&TaskId::from("docs"), json!(3)).unwrap();
    assert!(layer_one(&board).iter().all(|s| *s == TaskStatus::Runnable));
    assert_eq!(board.current_layer(), 1);
}

/// Results from every task reach the synthesized summary.
#[tokio::test]
async fn test_summary_collects_all_results() {
    let recorder = Recorder::new();
    let result = coordinator(fast_settings(), &recorder)
        .run("ship", two_layer_tasks(0))
        .await
        .unwrap();

    assert_eq!(result.summary["impl"], "impl:done");
    assert_eq!(result.summary["review"], "review:done");
    assert!(result.is_success());
    assert!(result.finished_at >= result.started_at);
}
