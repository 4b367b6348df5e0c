//! The error types surfaced by the listener and the interceptor pipeline.

/// Error produced while processing a single delivery.
///
/// `ConsumeError` never reaches the application: it flows outward through
/// the interceptor chain, where it is logged and recorded as a metric, and
/// is then discarded. The per-message retry policy has already made its
/// ack/requeue decision by the time the error propagates.
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    /// The delivery body could not be decoded into an [`Envelope`](crate::envelope::Envelope).
    ///
    /// Decode failures are permanent for a given message: the message is
    /// dropped, not retried.
    #[error("failed to decode message envelope")]
    Envelope(#[source] serde_json::Error),
    /// The application handler returned an error.
    ///
    /// Handler failures are assumed transient and resolved by a bounded
    /// republish-with-incremented-counter retry.
    #[error("message handler failed")]
    Handler(#[source] anyhow::Error),
    /// The application handler panicked.
    ///
    /// Converted by the recovery interceptor, never propagated as a panic.
    #[error("message handler panicked: {0}")]
    Panic(String),
    /// An ack/reject instruction could not be dispatched to the broker.
    #[error("broker operation failed")]
    Broker(#[source] lapin::Error),
}

/// Error returned when a connection to the broker (or a channel on it)
/// could not be established within the bounded retry budget.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("failed to connect to RabbitMQ after {attempts} attempts")]
    Connection {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to open a RabbitMQ channel after {attempts} attempts")]
    Channel {
        attempts: u32,
        #[source]
        source: lapin::Error,
    },
    /// The attempt was abandoned because the listener is shutting down.
    #[error("connection attempt aborted by shutdown")]
    Aborted,
}
