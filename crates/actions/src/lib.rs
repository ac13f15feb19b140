//! `actions` crate — the `ActionInvoker` trait and concrete invoker implementations.
//!
//! The engine crate drives every `Action` state through [`ActionInvoker`]
//! without knowing anything about the transport behind it.  Production code
//! uses [`HttpInvoker`]; tests use [`mock::MockInvoker`].

pub mod error;
pub mod http;
pub mod mock;
pub mod traits;

pub use error::InvokerError;
pub use http::HttpInvoker;
pub use traits::{ActionHandle, ActionInvoker, ActionRequest, ActionState, ActionStatus};
