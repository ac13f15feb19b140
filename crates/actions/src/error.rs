//! Invoker-level error type.

use thiserror::Error;

/// Errors returned by an [`crate::ActionInvoker`] operation.
///
/// The engine uses the variant to keep failure classes distinguishable:
/// - `Transport` — the provider was never reached (DNS, connect, TLS, I/O).
/// - `Protocol`  — the provider answered, but with a non-success response;
///   the structured body is preserved verbatim for the caller.
#[derive(Debug, Error, Clone)]
pub enum InvokerError {
    /// The request never produced an HTTP response.
    #[error("transport failure talking to '{url}': {message}")]
    Transport { url: String, message: String },

    /// The provider returned an error response.
    #[error("action provider '{url}' returned {status}: {body}")]
    Protocol {
        url: String,
        status: u16,
        body: String,
    },
}
