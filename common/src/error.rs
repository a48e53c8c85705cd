//! Error kinds shared across the workspace.
//!
//! Each downstream crate defines its own `Error` and wraps this one where it
//! needs to surface a data-model-level failure (bad config, TTH mismatch, an
//! invalid share reference). `client::Error` is the union a caller actually
//! sees.

use thiserror::Error;

use crate::tth::Tth;

/// Errors that can originate from the shared data model.
#[derive(Error, Debug)]
pub enum Error {
    /// The client configuration failed validation before any I/O was attempted.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A download's computed Tiger-Tree-Hash didn't match what was requested.
    #[error("TTH mismatch: expected {expected}, computed {computed}")]
    TthMismatch {
        /// The hash requested by the caller.
        expected: Tth,
        /// The hash computed while downloading.
        computed: Tth,
    },

    /// A requested share resource doesn't exist.
    #[error("resource not available: {0}")]
    ResourceNotAvailable(String),
}
