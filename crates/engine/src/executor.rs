//! The flow interpreter.
//!
//! `FlowExecutor` walks a validated definition over a mutable document:
//! 1. Starts at `start_at` with the caller-supplied input.
//! 2. Dispatches on the state variant; projection and choice evaluation go
//!    through the path engine and choice evaluator.
//! 3. `Action` states run through the shared `ActionInvoker`, polled with
//!    exponential backoff until terminal or `wait_time` elapses.
//! 4. Errors fail the run immediately unless a catcher on the erroring
//!    `Action` state matches the error kind.
//!
//! One run executes sequentially and owns its document exclusively;
//! cancellation and the optional per-run deadline are checked at every
//! suspension point.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use actions::{ActionHandle, ActionInvoker, ActionRequest, ActionState as InvocationState};

use crate::choice;
use crate::error::EngineError;
use crate::models::{
    ActionState, ChoiceState, ExpressionEvalState, PassState, State, WaitState,
};
use crate::path::{self, JsonPath};
use crate::validate::Flow;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the executor's action poll loop.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// First interval between status polls.
    pub poll_initial: Duration,
    /// Growth factor applied after each poll.
    pub poll_multiplier: f64,
    /// Upper bound on the interval between polls.
    pub poll_cap: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_initial: Duration::from_secs(1),
            poll_multiplier: 1.2,
            poll_cap: Duration::from_secs(32),
        }
    }
}

/// Per-run options supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    /// Wall-clock budget for the whole run.
    pub deadline: Option<Duration>,
    /// External cancellation signal, checked at every suspension point.
    pub cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// Run outcome
// ---------------------------------------------------------------------------

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Active,
    Inactive,
    Succeeded,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = match self {
            RunStatus::Active => "ACTIVE",
            RunStatus::Inactive => "INACTIVE",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
        };
        f.write_str(token)
    }
}

/// The error record attached to a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunError {
    /// Error-kind token (`ACTION_FAILED`, `TIMEOUT`, ...) or, for `Fail`
    /// states, the state's own `error` token.
    pub kind: String,
    pub message: String,
    pub state_name: String,
}

/// The result of one run over a validated flow.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// The document as of termination.
    pub document: Value,
    pub error: Option<RunError>,
    /// State names in visit order.
    pub trail: Vec<String>,
}

enum Transition {
    Next(String),
    End,
    Fail {
        error: Option<String>,
        cause: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// FlowExecutor
// ---------------------------------------------------------------------------

/// Stateless interpreter for validated flows.
///
/// Holds only the shared invoker and poll configuration, so one executor can
/// drive any number of concurrent runs.
pub struct FlowExecutor {
    invoker: Arc<dyn ActionInvoker>,
    config: ExecutorConfig,
}

impl FlowExecutor {
    pub fn new(invoker: Arc<dyn ActionInvoker>, config: ExecutorConfig) -> Self {
        Self { invoker, config }
    }

    /// Execute `flow` against `input` until it terminates.
    #[instrument(skip_all, fields(start_at = %flow.start_at()))]
    pub async fn run(&self, flow: &Flow, input: Value, run: RunConfig) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let mut document = input;
        let mut trail: Vec<String> = Vec::new();
        let mut name = flow.start_at().to_string();

        loop {
            let Some(state) = flow.state(&name) else {
                // Unreachable for validator-produced flows.
                error!(state = %name, "current state is not defined");
                return RunOutcome {
                    run_id,
                    status: RunStatus::Failed,
                    document,
                    error: Some(RunError {
                        kind: crate::error::ErrorKind::Referential.token().to_string(),
                        message: format!("state '{name}' is not defined"),
                        state_name: name,
                    }),
                    trail,
                };
            };
            trail.push(name.clone());
            debug!(state = %name, state_type = state.type_name(), "dispatching");

            let step = self
                .dispatch(&name, state, &mut document, &run, started)
                .await;

            match step {
                Ok(Transition::Next(next)) => name = next,
                Ok(Transition::End) => {
                    info!(%run_id, states = trail.len(), "run succeeded");
                    return RunOutcome {
                        run_id,
                        status: RunStatus::Succeeded,
                        document,
                        error: None,
                        trail,
                    };
                }
                Ok(Transition::Fail { error, cause }) => {
                    info!(%run_id, state = %name, "run failed via Fail state");
                    return RunOutcome {
                        run_id,
                        status: RunStatus::Failed,
                        document,
                        error: Some(RunError {
                            kind: error.unwrap_or_else(|| "FAILED".to_string()),
                            message: cause.unwrap_or_default(),
                            state_name: name,
                        }),
                        trail,
                    };
                }
                Err(engine_err) => {
                    let token = engine_err.kind().token();
                    // Catchers apply only to Action state errors.
                    let catcher = match state {
                        State::Action(action) => action
                            .catch
                            .iter()
                            .flatten()
                            .find(|catcher| catcher.matches(token)),
                        _ => None,
                    };

                    let Some(catcher) = catcher else {
                        error!(%run_id, state = %name, error = %engine_err, "run failed");
                        return RunOutcome {
                            run_id,
                            status: RunStatus::Failed,
                            document,
                            error: Some(RunError {
                                kind: token.to_string(),
                                message: engine_err.to_string(),
                                state_name: name,
                            }),
                            trail,
                        };
                    };

                    warn!(
                        state = %name,
                        error = %engine_err,
                        next = %catcher.next,
                        "error caught"
                    );
                    if let Some(result_path) = &catcher.result_path {
                        let record = error_record(&engine_err, &name);
                        if let Err(write_err) = write_result(
                            &mut document,
                            Some(result_path.as_str()),
                            record,
                        ) {
                            return RunOutcome {
                                run_id,
                                status: RunStatus::Failed,
                                document,
                                error: Some(RunError {
                                    kind: write_err.kind().token().to_string(),
                                    message: write_err.to_string(),
                                    state_name: name,
                                }),
                                trail,
                            };
                        }
                    }
                    name = catcher.next.clone();
                }
            }
        }
    }

    async fn dispatch(
        &self,
        name: &str,
        state: &State,
        document: &mut Value,
        run: &RunConfig,
        started: Instant,
    ) -> Result<Transition, EngineError> {
        match state {
            State::Pass(s) => run_pass(s, document),
            State::ExpressionEval(s) => run_expression_eval(s, document),
            State::Choice(s) => run_choice(name, s, document),
            State::Fail(s) => Ok(Transition::Fail {
                error: s.error.clone(),
                cause: s.cause.clone(),
            }),
            State::Wait(s) => self.run_wait(s, document, run, started).await,
            State::Action(s) => self.run_action(name, s, document, run, started).await,
        }
    }

    // -----------------------------------------------------------------------
    // Wait
    // -----------------------------------------------------------------------

    async fn run_wait(
        &self,
        s: &WaitState,
        document: &Value,
        run: &RunConfig,
        started: Instant,
    ) -> Result<Transition, EngineError> {
        let delay = wait_delay(s, document)?;
        if !delay.is_zero() {
            info!(delay_secs = delay.as_secs_f64(), "waiting");
        }
        self.suspend(delay, run, started).await?;
        Ok(transition(s.next.as_deref()))
    }

    // -----------------------------------------------------------------------
    // Action
    // -----------------------------------------------------------------------

    async fn run_action(
        &self,
        name: &str,
        s: &ActionState,
        document: &mut Value,
        run: &RunConfig,
        started: Instant,
    ) -> Result<Transition, EngineError> {
        let body = if let Some(params) = &s.parameters {
            Value::Object(path::project(params, document)?)
        } else if let Some(input_path) = &s.input_path {
            JsonPath::parse(input_path)?.get_required(document)?.clone()
        } else {
            // Validation guarantees one of the two; tolerate an empty body.
            Value::Object(Map::new())
        };

        // One id per step: provider-level retries of this dispatch must stay
        // idempotent.
        let request_id = Uuid::new_v4();
        let request = ActionRequest {
            action_url: s.action_url.clone(),
            scope: s.action_scope.clone(),
            run_as: s.run_as.clone(),
            body,
            request_id,
        };

        self.check_interrupts(run, started)?;
        info!(state = %name, action_url = %s.action_url, %request_id, "starting action");
        let handle = self.invoker.run(request).await?;

        let wait_time = Duration::from_secs(s.wait_time_secs());
        let poll_started = Instant::now();
        let mut interval = self.config.poll_initial;

        loop {
            let status = self.invoker.status(&handle).await?;
            match status.status {
                InvocationState::Succeeded => {
                    debug!(state = %name, action_id = %handle.action_id, "action succeeded");
                    self.release_quietly(&handle).await;
                    write_result(
                        document,
                        s.result_path.as_deref(),
                        status.result.unwrap_or(Value::Null),
                    )?;
                    return Ok(transition(s.next.as_deref()));
                }
                InvocationState::Failed => {
                    self.release_quietly(&handle).await;
                    let result = status.result.unwrap_or(Value::Null);
                    if s.raises_on_failure() {
                        return Err(EngineError::ActionFailed {
                            state: name.to_string(),
                            result,
                        });
                    }
                    warn!(state = %name, "action failed; continuing without exception");
                    write_result(document, s.result_path.as_deref(), result)?;
                    return Ok(transition(s.next.as_deref()));
                }
                InvocationState::Active | InvocationState::Inactive => {
                    if poll_started.elapsed() >= wait_time {
                        return Err(EngineError::Timeout {
                            state: name.to_string(),
                            wait_time: s.wait_time_secs(),
                        });
                    }
                    if let Err(interrupt) = self.suspend(interval, run, started).await {
                        if matches!(interrupt, EngineError::Cancelled) {
                            // Best-effort release of the in-flight action.
                            self.release_quietly(&handle).await;
                        }
                        return Err(interrupt);
                    }
                    interval = self.next_interval(interval);
                }
            }
        }
    }

    fn next_interval(&self, current: Duration) -> Duration {
        current
            .mul_f64(self.config.poll_multiplier)
            .min(self.config.poll_cap)
    }

    async fn release_quietly(&self, handle: &ActionHandle) {
        if let Err(e) = self.invoker.release(handle).await {
            warn!(action_id = %handle.action_id, error = %e, "failed to release action");
        }
    }

    // -----------------------------------------------------------------------
    // Suspension points
    // -----------------------------------------------------------------------

    fn check_interrupts(&self, run: &RunConfig, started: Instant) -> Result<(), EngineError> {
        if run.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if let Some(deadline) = run.deadline {
            if started.elapsed() >= deadline {
                return Err(EngineError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Sleep for `delay`, interruptible by cancellation and clamped to the
    /// remaining run deadline.
    async fn suspend(
        &self,
        delay: Duration,
        run: &RunConfig,
        started: Instant,
    ) -> Result<(), EngineError> {
        let sleep_for = match run.deadline {
            Some(deadline) => {
                let remaining = deadline
                    .checked_sub(started.elapsed())
                    .ok_or(EngineError::DeadlineExceeded)?;
                delay.min(remaining)
            }
            None => delay,
        };

        tokio::select! {
            _ = run.cancel.cancelled() => return Err(EngineError::Cancelled),
            _ = tokio::time::sleep(sleep_for) => {}
        }

        if sleep_for < delay {
            // The remaining deadline elapsed before the wait completed.
            return Err(EngineError::DeadlineExceeded);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pure dispatch helpers
// ---------------------------------------------------------------------------

fn transition(next: Option<&str>) -> Transition {
    match next {
        Some(next) => Transition::Next(next.to_string()),
        None => Transition::End,
    }
}

fn run_pass(s: &PassState, document: &mut Value) -> Result<Transition, EngineError> {
    let projection = if let Some(result) = &s.result {
        result.clone()
    } else if let Some(params) = &s.parameters {
        Value::Object(path::project(params, document)?)
    } else if let Some(input_path) = &s.input_path {
        JsonPath::parse(input_path)?.get_required(document)?.clone()
    } else {
        document.clone()
    };
    write_result(document, s.result_path.as_deref(), projection)?;
    Ok(transition(s.next.as_deref()))
}

fn run_expression_eval(
    s: &ExpressionEvalState,
    document: &mut Value,
) -> Result<Transition, EngineError> {
    // Absent parameters means identity projection.
    let projection = match &s.parameters {
        Some(params) => Value::Object(path::project(params, document)?),
        None => document.clone(),
    };
    write_result(document, s.result_path.as_deref(), projection)?;
    Ok(transition(s.next.as_deref()))
}

fn run_choice(
    name: &str,
    s: &ChoiceState,
    document: &Value,
) -> Result<Transition, EngineError> {
    for (i, rule) in s.choices.iter().enumerate() {
        match choice::evaluate(rule, document) {
            Ok(true) => {
                if let Some(next) = &rule.next {
                    debug!(state = %name, rule = i, next = %next, "choice matched");
                    return Ok(Transition::Next(next.clone()));
                }
            }
            Ok(false) => {}
            // An erroring rule does not match; the state falls through to
            // its default (or NO_CHOICE_MATCHED).
            Err(e) => warn!(state = %name, rule = i, error = %e, "choice rule evaluation failed"),
        }
    }
    match &s.default {
        Some(default) => Ok(Transition::Next(default.clone())),
        None => Err(EngineError::NoChoiceMatched {
            state: name.to_string(),
        }),
    }
}

/// Write a projection to `result_path`; the document root when absent.
fn write_result(
    document: &mut Value,
    result_path: Option<&str>,
    value: Value,
) -> Result<(), EngineError> {
    match result_path {
        Some(raw) => JsonPath::parse(raw)?.set(document, value, true),
        None => {
            *document = value;
            Ok(())
        }
    }
}

/// Compute the delay requested by a Wait state.
fn wait_delay(s: &WaitState, document: &Value) -> Result<Duration, EngineError> {
    if let Some(seconds) = s.seconds {
        return Ok(Duration::from_secs(seconds));
    }
    if let Some(expr) = &s.seconds_path {
        let value = JsonPath::parse(expr)?.get_required(document)?;
        let seconds = value.as_i64().ok_or_else(|| EngineError::TypeError {
            message: format!("'{expr}' must resolve to an integer, got {value}"),
        })?;
        if seconds < 0 {
            return Err(EngineError::TypeError {
                message: format!("'{expr}' resolved to {seconds}; waits must not be negative"),
            });
        }
        return Ok(Duration::from_secs(seconds as u64));
    }

    let raw = if let Some(timestamp) = &s.timestamp {
        timestamp.clone()
    } else if let Some(expr) = &s.timestamp_path {
        let value = JsonPath::parse(expr)?.get_required(document)?;
        value
            .as_str()
            .ok_or_else(|| EngineError::TypeError {
                message: format!("'{expr}' must resolve to a timestamp string, got {value}"),
            })?
            .to_string()
    } else {
        // Validation guarantees one of the four sources.
        return Ok(Duration::ZERO);
    };

    let target = choice::parse_timestamp(&raw)?;
    let delta = target.signed_duration_since(chrono::Utc::now());
    // Timestamps in the past wait zero rather than erroring.
    Ok(delta.to_std().unwrap_or(Duration::ZERO))
}

/// The record written through a catcher's `result_path`.
fn error_record(error: &EngineError, state_name: &str) -> Value {
    let mut record = json!({
        "kind": error.kind().token(),
        "message": error.to_string(),
        "state_name": state_name,
    });
    if let EngineError::ActionFailed { result, .. } = error {
        record["result"] = result.clone();
    }
    record
}
