//! `engine` crate — flow-definition model, validation, and the local
//! interpreter.
//!
//! A flow definition is parsed and validated into an immutable [`Flow`];
//! [`FlowExecutor`] then drives runs over it, dispatching `Action` states
//! through the `actions` crate's invoker trait.

pub mod choice;
pub mod error;
pub mod executor;
pub mod models;
pub mod path;
pub mod validate;

pub use error::{EngineError, ErrorKind, ValidationError};
pub use executor::{ExecutorConfig, FlowExecutor, RunConfig, RunError, RunOutcome, RunStatus};
pub use models::{Catcher, ChoiceRule, Comparator, FlowDefinition, State};
pub use path::JsonPath;
pub use validate::Flow;

#[cfg(test)]
mod executor_tests;
