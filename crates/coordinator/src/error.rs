//! Coordinator error types.

use stitch_overlay::OverlayError;

/// Errors from tunnel orchestration.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// The overlay failed; fatal when it means the service is gone.
    #[error(transparent)]
    Overlay(#[from] OverlayError),

    /// The local backend never became dialable within the retry budget.
    #[error("local backend on port {port} unreachable after {attempts} attempts")]
    BackendUnreachable {
        /// The port the backend was expected to listen on.
        port: u16,
        /// How many dial attempts were made.
        attempts: u32,
    },

    /// Binding the local tunnel listener failed.
    #[error("failed to bind local listener on port {port}: {source}")]
    Bind {
        /// The chosen port.
        port: u16,
        /// The underlying bind error.
        #[source]
        source: std::io::Error,
    },
}
