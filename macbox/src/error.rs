//! Typed lookup failures.
//!
//! Everything else travels as `anyhow::Error`; these variants are the ones
//! callers branch on, so they are recoverable through `downcast_ref`.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("workspace '{0}' not found")]
    WorkspaceNotFound(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("flow '{0}' is not declared")]
    FlowNotFound(String),
}

/// Find a [`LookupError`] anywhere in an error chain.
pub fn find_lookup_error(err: &anyhow::Error) -> Option<&LookupError> {
    err.chain().find_map(|cause| cause.downcast_ref::<LookupError>())
}
