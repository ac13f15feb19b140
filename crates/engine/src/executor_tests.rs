//! Integration tests for the flow interpreter.
//!
//! These tests drive `FlowExecutor` with `MockInvoker` so no network is
//! required; timing-sensitive cases run under a paused tokio clock.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use actions::mock::MockInvoker;

use crate::executor::{ExecutorConfig, FlowExecutor, RunConfig, RunStatus};
use crate::validate::Flow;

fn flow(doc: Value) -> Flow {
    Flow::from_value(&doc).expect("definition should validate")
}

fn executor(invoker: Arc<MockInvoker>) -> FlowExecutor {
    FlowExecutor::new(invoker, ExecutorConfig::default())
}

fn no_invoker() -> Arc<MockInvoker> {
    Arc::new(MockInvoker::broken("no actions expected in this test"))
}

/// A single-action flow with the given extra attributes spliced into the
/// action state.  A `Handled` recovery state exists whenever a catcher can
/// reach it.
fn action_flow(extra: Value) -> Flow {
    let mut action = json!({
        "type": "Action",
        "action_url": "https://actions.example.org/transfer",
        "parameters": { "src.$": "$.src" },
        "end": true
    });
    let has_catch = extra.get("catch").is_some();
    for (key, value) in extra.as_object().expect("extra must be a mapping") {
        action[key] = value.clone();
    }

    let mut states = serde_json::Map::new();
    states.insert("Transfer".to_string(), action);
    if has_catch {
        states.insert(
            "Handled".to_string(),
            json!({
                "type": "Pass",
                "result": true,
                "result_path": "$.handled",
                "end": true
            }),
        );
    }
    flow(json!({ "start_at": "Transfer", "states": states }))
}

// ============================================================
// Pass / ExpressionEval / Choice
// ============================================================

#[tokio::test]
async fn pass_through_keeps_document_intact() {
    let definition = flow(json!({
        "start_at": "Identity",
        "states": { "Identity": { "type": "Pass", "end": true } }
    }));

    let outcome = executor(no_invoker())
        .run(&definition, json!({ "x": 1 }), RunConfig::default())
        .await;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.document, json!({ "x": 1 }));
    assert_eq!(outcome.trail, vec!["Identity"]);
    assert!(outcome.error.is_none());
}

#[tokio::test]
async fn expression_eval_projects_into_result_path() {
    let definition = flow(json!({
        "start_at": "Start",
        "states": {
            "Start": { "type": "Pass", "next": "EE" },
            "EE": {
                "type": "ExpressionEval",
                "parameters": { "y.$": "$.x" },
                "result_path": "$.out",
                "end": true
            }
        }
    }));

    let outcome = executor(no_invoker())
        .run(&definition, json!({ "x": 42 }), RunConfig::default())
        .await;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.document, json!({ "x": 42, "out": { "y": 42 } }));
}

fn routing_flow(default: Option<&str>) -> Flow {
    let mut choice = json!({
        "type": "Choice",
        "choices": [
            { "variable": "$.x", "NumericEquals": 1, "next": "A" }
        ]
    });
    if let Some(default) = default {
        choice["default"] = json!(default);
    }
    let mut states = serde_json::Map::new();
    states.insert("C".to_string(), choice);
    states.insert(
        "A".to_string(),
        json!({ "type": "Pass", "result": "A", "result_path": "$.route", "end": true }),
    );
    if default.is_some() {
        states.insert(
            "B".to_string(),
            json!({ "type": "Pass", "result": "B", "result_path": "$.route", "end": true }),
        );
    }
    flow(json!({ "start_at": "C", "states": states }))
}

#[tokio::test]
async fn choice_routes_to_first_matching_rule() {
    let outcome = executor(no_invoker())
        .run(&routing_flow(Some("B")), json!({ "x": 1 }), RunConfig::default())
        .await;
    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.document["route"], "A");
}

#[tokio::test]
async fn choice_falls_through_to_default() {
    let outcome = executor(no_invoker())
        .run(&routing_flow(Some("B")), json!({ "x": 2 }), RunConfig::default())
        .await;
    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.document["route"], "B");
}

#[tokio::test]
async fn choice_without_default_fails_when_nothing_matches() {
    let outcome = executor(no_invoker())
        .run(&routing_flow(None), json!({ "x": 2 }), RunConfig::default())
        .await;
    assert_eq!(outcome.status, RunStatus::Failed);
    let error = outcome.error.expect("failed runs carry an error record");
    assert_eq!(error.kind, "NO_CHOICE_MATCHED");
    assert_eq!(error.state_name, "C");
}

#[tokio::test]
async fn first_match_ordering_is_observed() {
    // Both rules match x = 1; the first in list order must win.
    let definition = flow(json!({
        "start_at": "C",
        "states": {
            "C": {
                "type": "Choice",
                "choices": [
                    { "variable": "$.x", "NumericGreaterThanEquals": 0, "next": "First" },
                    { "variable": "$.x", "NumericEquals": 1, "next": "Second" }
                ]
            },
            "First": { "type": "Pass", "result": 1, "result_path": "$.winner", "end": true },
            "Second": { "type": "Pass", "result": 2, "result_path": "$.winner", "end": true }
        }
    }));

    let outcome = executor(no_invoker())
        .run(&definition, json!({ "x": 1 }), RunConfig::default())
        .await;
    assert_eq!(outcome.document["winner"], 1);
}

#[tokio::test]
async fn erroring_choice_rule_falls_through_to_default() {
    // `$.x` is a string, so the numeric rule errors and must not match.
    let definition = flow(json!({
        "start_at": "C",
        "states": {
            "C": {
                "type": "Choice",
                "choices": [
                    { "variable": "$.x", "NumericEquals": 1, "next": "A" }
                ],
                "default": "B"
            },
            "A": { "type": "Pass", "result": "A", "result_path": "$.route", "end": true },
            "B": { "type": "Pass", "result": "B", "result_path": "$.route", "end": true }
        }
    }));

    let outcome = executor(no_invoker())
        .run(&definition, json!({ "x": "not-a-number" }), RunConfig::default())
        .await;
    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.document["route"], "B");
}

#[tokio::test]
async fn fail_state_terminates_with_cause_and_error() {
    let definition = flow(json!({
        "start_at": "Nope",
        "states": {
            "Nope": { "type": "Fail", "error": "QuotaExceeded", "cause": "too many runs" }
        }
    }));

    let outcome = executor(no_invoker())
        .run(&definition, json!({}), RunConfig::default())
        .await;
    assert_eq!(outcome.status, RunStatus::Failed);
    let error = outcome.error.expect("error record");
    assert_eq!(error.kind, "QuotaExceeded");
    assert_eq!(error.message, "too many runs");
    assert_eq!(error.state_name, "Nope");
}

#[tokio::test]
async fn pass_input_path_error_fails_the_run() {
    let definition = flow(json!({
        "start_at": "Narrow",
        "states": { "Narrow": { "type": "Pass", "input_path": "$.missing", "end": true } }
    }));

    let outcome = executor(no_invoker())
        .run(&definition, json!({}), RunConfig::default())
        .await;
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.error.expect("error record").kind, "PATH_NOT_FOUND");
}

// ============================================================
// Action dispatch
// ============================================================

#[tokio::test]
async fn action_success_writes_result_and_releases() {
    let invoker = Arc::new(MockInvoker::succeeding(json!({ "bytes": 1024 })));
    let definition = action_flow(json!({ "result_path": "$.transfer", "action_scope": "transfer:all" }));

    let outcome = executor(invoker.clone())
        .run(&definition, json!({ "src": "/data/a" }), RunConfig::default())
        .await;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.document["transfer"], json!({ "bytes": 1024 }));

    // The body is the parameter projection; scope is forwarded.
    let runs = invoker.runs.lock().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].body, json!({ "src": "/data/a" }));
    assert_eq!(runs[0].scope.as_deref(), Some("transfer:all"));
    drop(runs);

    assert_eq!(invoker.release_count(), 1);
}

#[tokio::test]
async fn action_input_path_builds_the_body() {
    let invoker = Arc::new(MockInvoker::succeeding(json!({})));
    let definition = flow(json!({
        "start_at": "Send",
        "states": {
            "Send": {
                "type": "Action",
                "action_url": "https://actions.example.org/send",
                "input_path": "$.payload",
                "end": true
            }
        }
    }));

    executor(invoker.clone())
        .run(
            &definition,
            json!({ "payload": { "to": "q" }, "noise": true }),
            RunConfig::default(),
        )
        .await;

    assert_eq!(invoker.runs.lock().unwrap()[0].body, json!({ "to": "q" }));
}

#[tokio::test]
async fn matching_catcher_resumes_at_its_next_state() {
    let invoker = Arc::new(MockInvoker::failing(json!({ "reason": "denied" })));
    let definition = action_flow(json!({
        "catch": [ { "error_equals": ["States.ALL"], "next": "Handled" } ]
    }));

    let outcome = executor(invoker)
        .run(&definition, json!({ "src": "/data/a" }), RunConfig::default())
        .await;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.document["handled"], true);
    assert_eq!(outcome.trail, vec!["Transfer", "Handled"]);
}

#[tokio::test]
async fn catcher_result_path_receives_the_error_record() {
    let invoker = Arc::new(MockInvoker::failing(json!({ "reason": "denied" })));
    let definition = action_flow(json!({
        "catch": [ {
            "error_equals": ["ACTION_FAILED"],
            "next": "Handled",
            "result_path": "$.err"
        } ]
    }));

    let outcome = executor(invoker)
        .run(&definition, json!({ "src": "/data/a" }), RunConfig::default())
        .await;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.document["err"]["kind"], "ACTION_FAILED");
    assert_eq!(outcome.document["err"]["state_name"], "Transfer");
    assert_eq!(outcome.document["err"]["result"], json!({ "reason": "denied" }));
}

#[tokio::test]
async fn unmatched_catcher_fails_the_run() {
    let invoker = Arc::new(MockInvoker::failing(json!({})));
    let definition = action_flow(json!({
        "catch": [ { "error_equals": ["TIMEOUT"], "next": "Handled" } ]
    }));

    let outcome = executor(invoker)
        .run(&definition, json!({ "src": "/data/a" }), RunConfig::default())
        .await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.error.expect("error record").kind, "ACTION_FAILED");
}

#[tokio::test]
async fn action_failure_without_exception_continues_normally() {
    let invoker = Arc::new(MockInvoker::failing(json!({ "reason": "denied" })));
    let definition = action_flow(json!({
        "exception_on_action_failure": false,
        "result_path": "$.outcome"
    }));

    let outcome = executor(invoker)
        .run(&definition, json!({ "src": "/data/a" }), RunConfig::default())
        .await;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.document["outcome"], json!({ "reason": "denied" }));
}

#[tokio::test]
async fn transport_errors_are_catchable_as_their_own_kind() {
    let invoker = Arc::new(MockInvoker::broken("connection refused"));
    let definition = action_flow(json!({
        "catch": [ { "error_equals": ["TRANSPORT_ERROR"], "next": "Handled" } ]
    }));

    let outcome = executor(invoker)
        .run(&definition, json!({ "src": "/data/a" }), RunConfig::default())
        .await;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.document["handled"], true);
}

#[tokio::test]
async fn each_action_step_gets_its_own_stable_request_id() {
    let invoker = Arc::new(MockInvoker::succeeding(json!({})));
    let definition = flow(json!({
        "start_at": "First",
        "states": {
            "First": {
                "type": "Action",
                "action_url": "https://actions.example.org/one",
                "parameters": {},
                "result_path": "$.first",
                "next": "Second"
            },
            "Second": {
                "type": "Action",
                "action_url": "https://actions.example.org/two",
                "parameters": {},
                "result_path": "$.second",
                "end": true
            }
        }
    }));

    let outcome = executor(invoker.clone())
        .run(&definition, json!({}), RunConfig::default())
        .await;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    let ids = invoker.request_ids();
    // One `run` call per step, each with a distinct idempotency key.
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);
}

// ============================================================
// Polling, backoff, timeouts (paused clock)
// ============================================================

#[tokio::test(start_paused = true)]
async fn poll_backoff_grows_geometrically_from_one_second() {
    let invoker = Arc::new(MockInvoker::succeeding_after(3, json!({})));
    let definition = action_flow(json!({ "result_path": "$.out" }));

    let started = Instant::now();
    let outcome = executor(invoker.clone())
        .run(&definition, json!({ "src": "/data/a" }), RunConfig::default())
        .await;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(invoker.poll_count(), 4);
    // Sleeps of 1 s, 1.2 s, 1.44 s between the four polls.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(3640), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(3700), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn poll_interval_is_capped_at_thirty_two_seconds() {
    let invoker = Arc::new(MockInvoker::succeeding_after(2, json!({})));
    let config = ExecutorConfig {
        poll_initial: Duration::from_secs(30),
        ..ExecutorConfig::default()
    };
    let definition = action_flow(json!({ "wait_time": 600 }));

    let started = Instant::now();
    let outcome = FlowExecutor::new(invoker, config)
        .run(&definition, json!({ "src": "/data/a" }), RunConfig::default())
        .await;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    // 30 s, then 30 × 1.2 = 36 s capped to 32 s.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(62), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(63), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn action_times_out_after_wait_time() {
    let invoker = Arc::new(MockInvoker::succeeding_after(1000, json!({})));
    let definition = action_flow(json!({ "wait_time": 2 }));

    let outcome = executor(invoker)
        .run(&definition, json!({ "src": "/data/a" }), RunConfig::default())
        .await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.error.expect("error record").kind, "TIMEOUT");
}

#[tokio::test(start_paused = true)]
async fn timeouts_are_catchable() {
    let invoker = Arc::new(MockInvoker::succeeding_after(1000, json!({})));
    let definition = action_flow(json!({
        "wait_time": 2,
        "catch": [ { "error_equals": ["TIMEOUT"], "next": "Handled" } ]
    }));

    let outcome = executor(invoker)
        .run(&definition, json!({ "src": "/data/a" }), RunConfig::default())
        .await;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.document["handled"], true);
}

// ============================================================
// Wait dispatch
// ============================================================

#[tokio::test]
async fn wait_by_seconds_path_of_zero_completes_immediately() {
    let definition = flow(json!({
        "start_at": "W",
        "states": { "W": { "type": "Wait", "seconds_path": "$.delay", "end": true } }
    }));

    let outcome = executor(no_invoker())
        .run(&definition, json!({ "delay": 0 }), RunConfig::default())
        .await;
    assert_eq!(outcome.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn negative_seconds_path_is_a_type_error_at_run_time() {
    let definition = flow(json!({
        "start_at": "W",
        "states": { "W": { "type": "Wait", "seconds_path": "$.delay", "end": true } }
    }));

    let outcome = executor(no_invoker())
        .run(&definition, json!({ "delay": -1 }), RunConfig::default())
        .await;
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.error.expect("error record").kind, "TYPE_ERROR");
}

#[tokio::test(start_paused = true)]
async fn wait_seconds_suspends_for_the_requested_duration() {
    let definition = flow(json!({
        "start_at": "W",
        "states": {
            "W": { "type": "Wait", "seconds": 90, "next": "Done" },
            "Done": { "type": "Pass", "end": true }
        }
    }));

    let started = Instant::now();
    let outcome = executor(no_invoker())
        .run(&definition, json!({}), RunConfig::default())
        .await;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert!(started.elapsed() >= Duration::from_secs(90));
}

#[tokio::test]
async fn past_timestamp_waits_zero() {
    let definition = flow(json!({
        "start_at": "W",
        "states": {
            "W": { "type": "Wait", "timestamp": "2001-01-01T00:00:00Z", "end": true }
        }
    }));

    let outcome = executor(no_invoker())
        .run(&definition, json!({}), RunConfig::default())
        .await;
    assert_eq!(outcome.status, RunStatus::Succeeded);
}

// ============================================================
// Cancellation and deadline
// ============================================================

#[tokio::test(start_paused = true)]
async fn cancellation_releases_the_inflight_action() {
    let invoker = Arc::new(MockInvoker::succeeding_after(1000, json!({})));
    let definition = action_flow(json!({ "wait_time": 300 }));

    let cancel = CancellationToken::new();
    let run_config = RunConfig {
        deadline: None,
        cancel: cancel.clone(),
    };

    let canceller = async {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();
    };
    let exec = executor(invoker.clone());
    let (outcome, ()) = tokio::join!(
        exec.run(&definition, json!({ "src": "/data/a" }), run_config),
        canceller
    );

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.error.expect("error record").kind, "CANCELLED");
    assert_eq!(invoker.release_count(), 1);
}

#[tokio::test]
async fn pre_cancelled_run_never_starts_an_action() {
    let invoker = Arc::new(MockInvoker::succeeding(json!({})));
    let definition = action_flow(json!({}));

    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = executor(invoker.clone())
        .run(
            &definition,
            json!({ "src": "/data/a" }),
            RunConfig {
                deadline: None,
                cancel,
            },
        )
        .await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.error.expect("error record").kind, "CANCELLED");
    assert_eq!(invoker.run_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn run_deadline_interrupts_long_waits() {
    let definition = flow(json!({
        "start_at": "W",
        "states": { "W": { "type": "Wait", "seconds": 3600, "end": true } }
    }));

    let started = Instant::now();
    let outcome = executor(no_invoker())
        .run(
            &definition,
            json!({}),
            RunConfig {
                deadline: Some(Duration::from_secs(5)),
                cancel: CancellationToken::new(),
            },
        )
        .await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.error.expect("error record").kind, "TIMEOUT");
    assert!(started.elapsed() < Duration::from_secs(6));
}
