//! Structured error types for the courier pipeline.
//!
//! `Error` provides pattern-matchable errors instead of generic `anyhow::Error`.
//! The distinction between variants is load-bearing: the [`Acknowledge`]
//! stage consults [`Error::is_retryable`] to decide whether a failed delivery
//! goes back to the transport with a backoff delay or is rejected outright
//! (dead-lettered).
//!
//! # The Error Boundary Rule
//!
//! - `anyhow` is internal transport for backend failures (store drivers,
//!   broker clients), which keeps adapters ergonomic to write.
//! - `Error` is the only type that crosses stage boundaries; adapters wrap
//!   their failures via [`Error::store`], [`Error::transport`], or
//!   [`Error::handler`].
//!
//! [`Acknowledge`]: crate::retry::Acknowledge
//!
//! # Example
//!
//! ```ignore
//! use courier::Error;
//!
//! match endpoint_result {
//!     Err(Error::Conflict { saga, instance, .. }) => {
//!         // Another worker won the race for this instance.
//!         // The whole unit of work is retried by the Acknowledge stage.
//!     }
//!     Err(Error::Validation { .. }) => {
//!         // Never retried - the message itself is malformed.
//!     }
//!     _ => {}
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Structured error type for courier operations.
///
/// Variants split into two families, distinguished by [`Error::is_retryable`]:
///
/// - **Terminal**: the delivery can never succeed ([`Error::Validation`],
///   [`Error::Integrity`], [`Error::Config`], [`Error::Routing`],
///   [`Error::DuplicateCommandHandler`]). The Acknowledge stage rejects these
///   immediately.
/// - **Transient**: a later attempt may succeed ([`Error::Conflict`],
///   [`Error::Timeout`], [`Error::NotFound`], [`Error::Store`],
///   [`Error::Transport`], [`Error::Handler`]). These are retried with
///   backoff up to the policy's attempt cap.
#[derive(Debug, Error)]
pub enum Error {
    /// The message is malformed or self-rejecting. Never retried.
    #[error("message validation failed: {reason}")]
    Validation {
        /// Why the message was rejected.
        reason: String,
    },

    /// No destination endpoint could be resolved for a unicast message.
    #[error("no route for unicast message type {message_type}")]
    Routing {
        /// The message type that could not be routed.
        message_type: String,
    },

    /// A saga instance was saved with a stale revision.
    ///
    /// Another writer modified the instance since it was loaded. The caller
    /// must restart the whole unit of work (reload + reapply), not merely
    /// resend.
    #[error("revision conflict for saga {saga} instance {instance}: expected r{expected}, found r{actual}")]
    Conflict {
        /// The saga the instance belongs to.
        saga: String,
        /// The conflicting instance.
        instance: String,
        /// The revision the caller held.
        expected: u64,
        /// The revision the store holds.
        actual: u64,
    },

    /// Storage is corrupt or cross-wired (e.g. a snapshot that belongs to a
    /// different saga, or a mapping key owned by another instance). Fatal,
    /// never retried.
    #[error("storage integrity violation: {detail}")]
    Integrity {
        /// What was found to be inconsistent.
        detail: String,
    },

    /// A message mapped to no saga instance and is not a trigger type.
    ///
    /// Only surfaced when the saga's not-found behavior is
    /// [`NotFoundBehavior::Fail`](crate::saga::NotFoundBehavior::Fail).
    /// Classified transient: a trigger racing ahead of its followers
    /// resolves itself on redelivery.
    #[error("saga {saga} has no instance for message type {message_type}")]
    NotFound {
        /// The saga that could not map the message.
        saga: String,
        /// The unmapped message type.
        message_type: String,
    },

    /// The endpoint is misconfigured (e.g. the outbox stage runs without a
    /// data store). Fatal.
    #[error("configuration error: {detail}")]
    Config {
        /// What is missing or inconsistent.
        detail: String,
    },

    /// Two handlers both claimed the same command type at dispatch-table
    /// build time. Commands must have exactly one recipient.
    #[error("duplicate handler registration for command type {message_type}")]
    DuplicateCommandHandler {
        /// The command type claimed twice.
        message_type: String,
    },

    /// One inbound delivery exceeded its time budget.
    #[error("delivery timed out after {duration:?}")]
    Timeout {
        /// The configured delivery timeout.
        duration: Duration,
    },

    /// A storage backend failed (connection, serialization, I/O).
    #[error("storage backend error: {0}")]
    Store(#[source] anyhow::Error),

    /// A transport operation failed (broker unavailable, publish error).
    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),

    /// A message handler failed with a business-logic error.
    #[error("handler error: {0}")]
    Handler(#[source] anyhow::Error),
}

impl Error {
    /// Wrap a storage backend failure.
    pub fn store(err: impl Into<anyhow::Error>) -> Self {
        Error::Store(err.into())
    }

    /// Wrap a transport failure.
    pub fn transport(err: impl Into<anyhow::Error>) -> Self {
        Error::Transport(err.into())
    }

    /// Wrap a handler's business-logic failure.
    pub fn handler(err: impl Into<anyhow::Error>) -> Self {
        Error::Handler(err.into())
    }

    /// Build a validation error.
    pub fn validation(reason: impl Into<String>) -> Self {
        Error::Validation {
            reason: reason.into(),
        }
    }

    /// Build a configuration error.
    pub fn config(detail: impl Into<String>) -> Self {
        Error::Config {
            detail: detail.into(),
        }
    }

    /// Build an integrity error.
    pub fn integrity(detail: impl Into<String>) -> Self {
        Error::Integrity {
            detail: detail.into(),
        }
    }

    /// Whether a later delivery attempt of the same message may succeed.
    ///
    /// The retry policy consults this before computing a backoff delay;
    /// non-retryable errors are rejected regardless of the attempt count.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Validation { .. }
            | Error::Routing { .. }
            | Error::Integrity { .. }
            | Error::Config { .. }
            | Error::DuplicateCommandHandler { .. } => false,
            Error::Conflict { .. }
            | Error::NotFound { .. }
            | Error::Timeout { .. }
            | Error::Store(_)
            | Error::Transport(_)
            | Error::Handler(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_errors_are_not_retryable() {
        let errors = vec![
            Error::validation("bad payload"),
            Error::Routing {
                message_type: "orphan.Msg".into(),
            },
            Error::integrity("snapshot belongs to saga A, expected B"),
            Error::config("no data store"),
            Error::DuplicateCommandHandler {
                message_type: "billing.Open".into(),
            },
        ];
        for err in errors {
            assert!(!err.is_retryable(), "{err} should be terminal");
        }
    }

    #[test]
    fn transient_errors_are_retryable() {
        let errors = vec![
            Error::Conflict {
                saga: "transfer".into(),
                instance: "abc".into(),
                expected: 3,
                actual: 4,
            },
            Error::NotFound {
                saga: "transfer".into(),
                message_type: "bank.Credited".into(),
            },
            Error::Timeout {
                duration: Duration::from_secs(5),
            },
            Error::store(anyhow::anyhow!("connection reset")),
            Error::transport(anyhow::anyhow!("broker unavailable")),
            Error::handler(anyhow::anyhow!("downstream 503")),
        ];
        for err in errors {
            assert!(err.is_retryable(), "{err} should be transient");
        }
    }

    #[test]
    fn conflict_display_names_both_revisions() {
        let err = Error::Conflict {
            saga: "transfer".into(),
            instance: "i-1".into(),
            expected: 3,
            actual: 5,
        };
        let text = err.to_string();
        assert!(text.contains("r3"));
        assert!(text.contains("r5"));
        assert!(text.contains("transfer"));
    }

    #[test]
    fn error_is_pattern_matchable() {
        let err = Error::Routing {
            message_type: "foo.Bar".into(),
        };
        match &err {
            Error::Routing { message_type } => assert_eq!(message_type, "foo.Bar"),
            _ => panic!("expected Routing"),
        }
    }
}
