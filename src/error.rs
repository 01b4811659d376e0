//! Error taxonomy for the Room State Machine and Signaling Dispatcher.
//!
//! These are kinds, not exception types: every fallible operation in the
//! core returns one of these variants instead of panicking or propagating an
//! opaque error.

use thiserror::Error;

/// Unified error type returned by every Room State Machine operation.
#[derive(Debug, Error, Clone)]
pub enum RoomError {
    /// Referenced Room, Peer, Transport, Producer, or Consumer does not
    /// exist in the expected scope. Replied to the caller; not logged as an
    /// error.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation issued in the wrong peer state (e.g. produce before join),
    /// or a duplicate resource where idempotence does not apply.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The Router refused the (producer, rtpCapabilities) pair.
    #[error("cannot consume: {0}")]
    CannotConsume(String),

    /// The underlying media worker call failed.
    #[error("media error: {0}")]
    MediaError(String),

    /// The operation exceeded its deadline; any partial allocation it made
    /// has been rolled back by the room actor.
    #[error("timed out")]
    Timeout,

    /// The media worker died. The process is expected to terminate shortly
    /// after this is observed.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl RoomError {
    /// Stable, lowercase wire identifier for this error kind, used in the
    /// `{"error": ...}` reply payload.
    pub fn kind(&self) -> &'static str {
        match self {
            RoomError::NotFound(_) => "not_found",
            RoomError::PreconditionFailed(_) => "precondition_failed",
            RoomError::CannotConsume(_) => "cannot_consume",
            RoomError::MediaError(_) => "media_error",
            RoomError::Timeout => "timeout",
            RoomError::Fatal(_) => "fatal",
        }
    }

    /// Emit this error at the `tracing` severity matching its kind.
    /// `NotFound` logs at debug, not error: it's an expected outcome of
    /// races between disconnect and in-flight requests.
    pub fn log(&self, context: &str) {
        match self {
            RoomError::NotFound(msg) => {
                tracing::debug!(context, %msg, "not found");
            }
            RoomError::PreconditionFailed(msg) => {
                tracing::info!(context, %msg, "precondition failed");
            }
            RoomError::CannotConsume(msg) => {
                tracing::info!(context, %msg, "cannot consume");
            }
            RoomError::MediaError(msg) => {
                tracing::warn!(context, %msg, "media worker call failed");
            }
            RoomError::Timeout => {
                tracing::warn!(context, "operation timed out");
            }
            RoomError::Fatal(msg) => {
                tracing::error!(context, %msg, "fatal error");
            }
        }
    }
}

pub type RoomResult<T> = Result<T, RoomError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(RoomError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(
            RoomError::PreconditionFailed("x".into()).kind(),
            "precondition_failed"
        );
        assert_eq!(RoomError::CannotConsume("x".into()).kind(), "cannot_consume");
        assert_eq!(RoomError::MediaError("x".into()).kind(), "media_error");
        assert_eq!(RoomError::Timeout.kind(), "timeout");
        assert_eq!(RoomError::Fatal("x".into()).kind(), "fatal");
    }

    #[test]
    fn display_includes_message() {
        let err = RoomError::NotFound("producer pA".into());
        assert!(err.to_string().contains("producer pA"));
    }
}
