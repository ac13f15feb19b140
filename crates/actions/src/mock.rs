//! `MockInvoker` — a test double for `ActionInvoker`.
//!
//! Useful in unit and integration tests where a real action provider is
//! either unavailable or irrelevant.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    ActionHandle, ActionInvoker, ActionRequest, ActionState, ActionStatus, InvokerError,
};

/// Behaviour injected into `MockInvoker` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Report SUCCEEDED with the given result on the first poll.
    Succeed(Value),
    /// Report ACTIVE for `polls` status calls, then SUCCEEDED.
    SucceedAfter { polls: u32, result: Value },
    /// Report FAILED with the given result on the first poll.
    Fail(Value),
    /// Every operation fails with a `Transport` error.
    Broken(String),
}

/// A mock invoker that records every call it receives and plays back a
/// programmer-specified behaviour.
pub struct MockInvoker {
    /// What the invoker will do when polled.
    pub behaviour: MockBehaviour,
    /// All run requests seen (in call order).
    pub runs: Arc<Mutex<Vec<ActionRequest>>>,
    /// Total number of status polls across all actions.
    pub polls: Arc<Mutex<u32>>,
    /// Handles released so far.
    pub releases: Arc<Mutex<Vec<ActionHandle>>>,
}

impl MockInvoker {
    fn with_behaviour(behaviour: MockBehaviour) -> Self {
        Self {
            behaviour,
            runs: Arc::new(Mutex::new(Vec::new())),
            polls: Arc::new(Mutex::new(0)),
            releases: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Mock whose actions succeed immediately with the given result.
    pub fn succeeding(result: Value) -> Self {
        Self::with_behaviour(MockBehaviour::Succeed(result))
    }

    /// Mock whose actions stay ACTIVE for `polls` status calls first.
    pub fn succeeding_after(polls: u32, result: Value) -> Self {
        Self::with_behaviour(MockBehaviour::SucceedAfter { polls, result })
    }

    /// Mock whose actions terminate FAILED with the given result.
    pub fn failing(result: Value) -> Self {
        Self::with_behaviour(MockBehaviour::Fail(result))
    }

    /// Mock where every call errors at the transport level.
    pub fn broken(message: impl Into<String>) -> Self {
        Self::with_behaviour(MockBehaviour::Broken(message.into()))
    }

    /// Number of actions started through this mock.
    pub fn run_count(&self) -> usize {
        self.runs.lock().unwrap().len()
    }

    /// Number of status polls received.
    pub fn poll_count(&self) -> u32 {
        *self.polls.lock().unwrap()
    }

    /// Number of release calls received.
    pub fn release_count(&self) -> usize {
        self.releases.lock().unwrap().len()
    }

    /// Request ids of every started action, in call order.
    pub fn request_ids(&self) -> Vec<Uuid> {
        self.runs.lock().unwrap().iter().map(|r| r.request_id).collect()
    }

    fn transport_error(&self, message: &str) -> InvokerError {
        InvokerError::Transport {
            url: "mock://".to_string(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl ActionInvoker for MockInvoker {
    async fn run(&self, request: ActionRequest) -> Result<ActionHandle, InvokerError> {
        if let MockBehaviour::Broken(msg) = &self.behaviour {
            return Err(self.transport_error(msg));
        }

        let handle = ActionHandle {
            action_url: request.action_url.clone(),
            action_id: format!("mock-{}", self.run_count()),
        };
        self.runs.lock().unwrap().push(request);
        Ok(handle)
    }

    async fn status(&self, _handle: &ActionHandle) -> Result<ActionStatus, InvokerError> {
        let mut polls = self.polls.lock().unwrap();
        *polls += 1;

        match &self.behaviour {
            MockBehaviour::Succeed(result) => Ok(ActionStatus {
                status: ActionState::Succeeded,
                result: Some(result.clone()),
            }),
            MockBehaviour::SucceedAfter { polls: needed, result } => {
                if *polls <= *needed {
                    Ok(ActionStatus {
                        status: ActionState::Active,
                        result: None,
                    })
                } else {
                    Ok(ActionStatus {
                        status: ActionState::Succeeded,
                        result: Some(result.clone()),
                    })
                }
            }
            MockBehaviour::Fail(result) => Ok(ActionStatus {
                status: ActionState::Failed,
                result: Some(result.clone()),
            }),
            MockBehaviour::Broken(msg) => Err(self.transport_error(msg)),
        }
    }

    async fn release(&self, handle: &ActionHandle) -> Result<(), InvokerError> {
        if let MockBehaviour::Broken(msg) = &self.behaviour {
            return Err(self.transport_error(msg));
        }
        self.releases.lock().unwrap().push(handle.clone());
        Ok(())
    }
}
