// =============================================================================
// Typed errors for the external adapters
// =============================================================================
//
// The worker loops deliberately stay on `anyhow`: no error crosses a loop
// boundary, so all they need is context and a `failed` transition. The
// adapters carry typed errors instead, because the dispatcher must tell a
// terminal order failure (REJECTED, insufficient funds) apart from a
// transport problem.
// =============================================================================

use thiserror::Error;

/// Errors produced by the broker adapter.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The order reached a terminal non-complete state (REJECTED, CANCELLED,
    /// TIMEOUT) or could not be constructed (e.g. insufficient funds for a
    /// single share). The task that triggered it fails; the loop continues.
    #[error("order {status}: {message}")]
    OrderFailed {
        order_id: Option<String>,
        status: String,
        message: String,
    },

    /// The broker responded with a non-success HTTP status.
    #[error("broker returned {status}: {message}")]
    Api { status: u16, message: String },

    /// Session renewal after a 401 did not produce a usable token.
    #[error("session renewal failed: {0}")]
    Auth(String),

    /// GTT trigger legs violate the ordering constraints.
    #[error("invalid gtt trigger: {0}")]
    InvalidTrigger(String),

    /// The response body did not have the expected shape.
    #[error("unexpected broker response: {0}")]
    Malformed(String),

    #[error("broker request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl BrokerError {
    /// Terminal failures fail the task outright; everything else is treated
    /// as transient by the caller's retry budget.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::OrderFailed { .. } | Self::InvalidTrigger(_))
    }
}

/// Errors produced by the ingester adapter. `sync` retries internally, so a
/// surfaced error means the retry budget is already exhausted.
#[derive(Debug, Error)]
pub enum IngesterError {
    #[error("ingester returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("unexpected ingester response: {0}")]
    Malformed(String),

    #[error("ingester request failed: {0}")]
    Transport(#[from] reqwest::Error),
}
