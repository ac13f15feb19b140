//! The `ActionInvoker` trait — the contract between the interpreter and a
//! remote action provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::InvokerError;

/// Everything needed to start one action instance.
///
/// Defined here (in the actions crate) so both the engine and individual
/// invoker implementations can import it without a circular dependency.
#[derive(Debug, Clone, Serialize)]
pub struct ActionRequest {
    /// Base URL of the action provider.
    pub action_url: String,
    /// OAuth scope the provider expects, if any.
    pub scope: Option<String>,
    /// Identity the action should run as, if the provider supports it.
    pub run_as: Option<String>,
    /// The JSON body built from the state's parameter projection.
    pub body: Value,
    /// Idempotency key.  Retried `run` calls for the same step MUST reuse
    /// the same id so the provider can deduplicate.
    pub request_id: Uuid,
}

/// Opaque handle to a running action instance.
///
/// Carries the provider URL so `status`/`release` can be routed without the
/// caller holding any extra state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionHandle {
    pub action_url: String,
    pub action_id: String,
}

/// Lifecycle states an action instance can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionState {
    Active,
    Inactive,
    Succeeded,
    Failed,
}

impl ActionState {
    /// Whether the action has stopped making progress for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, ActionState::Succeeded | ActionState::Failed)
    }
}

/// A poll response: the current lifecycle state plus whatever result body
/// the provider has produced so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStatus {
    pub status: ActionState,
    #[serde(default)]
    pub result: Option<Value>,
}

/// The core invoker trait.
///
/// One instance is shared by all concurrent runs; implementations must be
/// safe to call from multiple tasks at once.
#[async_trait]
pub trait ActionInvoker: Send + Sync {
    /// Start one action instance and return a handle to it.
    async fn run(&self, request: ActionRequest) -> Result<ActionHandle, InvokerError>;

    /// Poll the current status of a previously started action.
    async fn status(&self, handle: &ActionHandle) -> Result<ActionStatus, InvokerError>;

    /// Discard provider-side state for a terminal action.
    async fn release(&self, handle: &ActionHandle) -> Result<(), InvokerError>;
}
