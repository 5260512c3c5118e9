//! Errors surfaced by the broker to its callers.

use thiserror::Error;

/// Caller-visible broker failures.
///
/// Internal invariant violations panic instead of surfacing here, and timer
/// callbacks that find their target already resolved are silent no-ops.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker is not active on this node.
    #[error("eval broker disabled")]
    Disabled,

    /// Construction-time configuration rejection.
    #[error("invalid broker config: {0}")]
    InvalidConfig(&'static str),

    /// The evaluation id has no in-flight delivery.
    #[error("evaluation is not outstanding")]
    NotOutstanding,

    /// The evaluation is in flight under a different token; the caller is
    /// stale after a redelivery or leadership change.
    #[error("evaluation token does not match")]
    TokenMismatch,

    /// The nack timer fired before the timer operation; the evaluation is
    /// already being redelivered.
    #[error("evaluation nack timeout reached")]
    NackTimeoutReached,

    /// The ack arrived after the nack timer expired and the work was handed
    /// out again; the caller must treat its result as abandoned.
    #[error("evaluation acked after nack timer expired")]
    AckedAfterNack,
}
