//! Mode selection tests.
//!
//! Small plans run sequentially in-process; plans that need three or more
//! roles get a worker team. Both modes must agree on what a plan produces.

use std::sync::Arc;

use orchestra::core::{Role, TaskId};
use orchestra::orchestration::{
    AbortCause, Capabilities, CommandExecutor, Coordinator, ModePreference, OrchestrationMode,
    RunSettings,
};
use orchestra::workflow::{templates, Plan};
use serde_json::json;

use crate::fixtures::{
    coordinator, diamond_tasks, expect_abort, fast_settings, ids, set, task, Recorder,
};

/// Given a plan with only two distinct roles
/// When the mode is left to the selector
/// Then it runs sequentially, one task at a time, with no workers spawned
#[tokio::test]
async fn test_two_roles_run_sequentially() {
    let recorder = Recorder::new();
    let tasks = vec![
        task("survey", Role::Researcher, 0),
        task("build", Role::TechnicalImpl, 0).with_context(json!({ "sleep_ms": 20 })),
        task("polish", Role::TechnicalImpl, 1).with_dependencies(["build"]),
    ];
    let coord = coordinator(fast_settings(), &recorder);

    let result = coord.run("small", tasks).await.unwrap();

    assert_eq!(result.mode, OrchestrationMode::Sequential);
    assert_eq!(ids(&result.completed), set(&["survey", "build", "polish"]));
    assert_eq!(recorder.max_in_flight(), 1);
    assert!(coord.last_teardown().unwrap().workers.is_empty());
}

/// Three roles are enough for a team.
#[tokio::test]
async fn test_three_roles_run_concurrently() {
    let recorder = Recorder::new();
    let result = coordinator(fast_settings(), &recorder)
        .run("diamond", diamond_tasks())
        .await
        .unwrap();

    assert_eq!(result.mode, OrchestrationMode::Concurrent);
    assert_eq!(result.completed.len(), 4);
}

/// The same graph yields the same results in either mode.
#[tokio::test]
async fn test_modes_produce_same_results() {
    let mut results = Vec::new();
    for mode in [ModePreference::Sequential, ModePreference::Concurrent] {
        let recorder = Recorder::new();
        let settings = RunSettings {
            mode,
            ..fast_settings()
        };
        let result = coordinator(settings, &recorder)
            .run("diamond", diamond_tasks())
            .await
            .unwrap();
        assert!(recorder.finished_before_started("a", "b"));
        assert!(recorder.finished_before_started("b", "d"));
        assert!(recorder.finished_before_started("c", "d"));
        results.push(result);
    }

    assert_eq!(results[0].mode, OrchestrationMode::Sequential);
    assert_eq!(results[1].mode, OrchestrationMode::Concurrent);
    assert_eq!(results[0].results(), results[1].results());
    assert_eq!(results[0].summary, results[1].summary);
}

/// Without spawn and messaging support a team is never formed, even on request.
#[tokio::test]
async fn test_missing_capabilities_force_sequential() {
    let recorder = Recorder::new();
    let settings = RunSettings {
        mode: ModePreference::Concurrent,
        ..fast_settings()
    };
    let coord = coordinator(settings, &recorder).with_capabilities(Capabilities::none());

    let result = coord.run("diamond", diamond_tasks()).await.unwrap();

    assert_eq!(result.mode, OrchestrationMode::Sequential);
    assert_eq!(recorder.max_in_flight(), 1);
}

/// A sequential failure stops the walk; later tasks never start.
#[tokio::test]
async fn test_sequential_failure_stops_walk() {
    let recorder = Recorder::new();
    let tasks = vec![
        task("first", Role::Researcher, 0).with_context(json!({ "fail": true })),
        task("second", Role::TechnicalImpl, 1),
        task("third", Role::TechnicalImpl, 2),
    ];
    let coord = coordinator(fast_settings(), &recorder);

    let (cause, partial) = expect_abort(coord.run("seq", tasks).await);

    assert_eq!(
        cause,
        AbortCause::TaskFailed {
            task_ids: vec![TaskId::from("first")]
        }
    );
    assert_eq!(partial.mode, OrchestrationMode::Sequential);
    assert_eq!(ids(&partial.cancelled), set(&["second", "third"]));
    assert!(!recorder.started("second"));
}

/// Every built-in template expands into a plan that runs as a team.
#[tokio::test]
async fn test_templates_run_end_to_end() {
    for template in templates::list() {
        let recorder = Recorder::new();
        let plan = template.expand("harden the payment service");
        let expected: Vec<TaskId> = plan.tasks.iter().map(|t| t.id.clone()).collect();

        let result = coordinator(fast_settings(), &recorder)
            .run_plan(plan)
            .await
            .unwrap_or_else(|e| panic!("template {} failed: {e}", template.name));

        assert_eq!(result.mode, OrchestrationMode::Concurrent, "{}", template.name);
        assert_eq!(result.completed.len(), expected.len(), "{}", template.name);
        assert_eq!(result.goal, "harden the payment service");
    }
}

/// Plan files run through the command executor.
#[cfg(unix)]
#[tokio::test]
async fn test_plan_with_commands() {
    let plan = Plan::from_toml_str(
        r#"
goal = "smoke"

[[task]]
id = "greet"
role = "researcher"
command = ["echo", "hello"]

[[task]]
id = "check"
role = "qa-verifier"
depends_on = ["greet"]
command = ["true"]

[[task]]
id = "write"
role = "docs-maintainer"
prompt = "Write it down"
"#,
    )
    .unwrap();

    let coord = Coordinator::new(fast_settings(), Arc::new(CommandExecutor::new()));
    let result = coord.run_plan(plan).await.unwrap();

    assert_eq!(result.mode, OrchestrationMode::Concurrent);
    assert_eq!(result.summary["greet"]["stdout"], "hello\n");
    assert_eq!(result.summary["check"]["exit_code"], 0);
    assert_eq!(result.summary["write"]["acknowledged"], "Write it down");
}

/// A failing command fails its task and the run.
#[cfg(unix)]
#[tokio::test]
async fn test_plan_with_failing_command() {
    let plan = Plan::from_toml_str(
        r#"
goal = "smoke"

[[task]]
id = "broken"
role = "technical-impl"
command = ["false"]
"#,
    )
    .unwrap();

    let coord = Coordinator::new(fast_settings(), Arc::new(CommandExecutor::new()));
    let (cause, partial) = expect_abort(coord.run_plan(plan).await);

    assert!(matches!(cause, AbortCause::TaskFailed { .. }));
    assert_eq!(ids(&partial.failed), set(&["broken"]));
}
