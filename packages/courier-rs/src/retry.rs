//! Retry policy and the Acknowledge stage.
//!
//! # Overview
//!
//! The Acknowledge stage sits first in the inbound chain. It claims the
//! delivery's receipt, runs the rest of the chain, and signals the transport
//! exactly once with the outcome:
//!
//! - success → ack
//! - retryable failure → retry, with a delay chosen by the [`RetryPolicy`]
//! - terminal failure, or attempts exhausted → reject (dead-letter)
//!
//! The default policy is [`ExponentialBackoff`]: a few immediate attempts to
//! ride out races (a command arriving before the transaction that caused it
//! commits), then exponentially growing delays, then rejection.
//!
//! Some transports cannot report how often a message has been delivered.
//! With an unknown delivery count the policy cannot tell a first failure
//! from a hundredth, so it assumes the worst and applies its maximum
//! backoff. The message stays retried forever rather than dead-lettered,
//! which keeps a transient outage from destroying messages, at the price of
//! requiring operator attention for true poison messages.

use std::time::Duration;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, warn};

use crate::envelope::{Envelope, InboundEnvelope};
use crate::error::{Error, Result};
use crate::pipeline::{DeliveryContext, InboundNext, InboundStage};

// =============================================================================
// Retry policy
// =============================================================================

/// What to do with a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Redeliver after the delay.
    Retry { delay: Duration },
    /// Dead-letter the message.
    Reject,
}

/// Chooses a [`RetryDecision`] for one failed delivery attempt.
pub trait RetryPolicy: Send + Sync + 'static {
    /// Decide based on the envelope, the zero-based delivery attempt (when
    /// the transport reports one), and the error that failed the attempt.
    fn decide(
        &self,
        envelope: &Envelope,
        delivery_count: Option<u32>,
        err: &Error,
    ) -> RetryDecision;
}

/// Immediate retries followed by exponential backoff.
///
/// With the defaults (3 immediate, 10 total, 1s base) the delay schedule by
/// attempt is `0s 0s 0s 1s 2s 4s 8s 16s 32s 64s reject`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    immediate_attempts: u32,
    max_attempts: u32,
    base: Duration,
}

impl ExponentialBackoff {
    /// The default schedule: 3 immediate attempts, 10 attempts total, 1s
    /// base delay.
    pub fn new() -> Self {
        Self {
            immediate_attempts: 3,
            max_attempts: 10,
            base: Duration::from_secs(1),
        }
    }

    /// Set how many attempts retry without delay.
    pub fn with_immediate_attempts(mut self, immediate_attempts: u32) -> Self {
        self.immediate_attempts = immediate_attempts;
        self
    }

    /// Set the attempt count after which messages are rejected.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the first backoff delay; each later attempt doubles it.
    pub fn with_base_delay(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    fn backoff(&self, exponent: u32) -> Duration {
        self.base.saturating_mul(2u32.saturating_pow(exponent))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn decide(
        &self,
        _envelope: &Envelope,
        delivery_count: Option<u32>,
        err: &Error,
    ) -> RetryDecision {
        if !err.is_retryable() {
            return RetryDecision::Reject;
        }
        match delivery_count {
            Some(attempt) if attempt >= self.max_attempts => RetryDecision::Reject,
            Some(attempt) if attempt < self.immediate_attempts => RetryDecision::Retry {
                delay: Duration::ZERO,
            },
            Some(attempt) => RetryDecision::Retry {
                delay: self.backoff(attempt - self.immediate_attempts),
            },
            // Unknown attempt count: maximum backoff, never reject.
            None => RetryDecision::Retry {
                delay: self
                    .backoff(self.max_attempts.saturating_sub(self.immediate_attempts + 1)),
            },
        }
    }
}

// =============================================================================
// Acknowledge stage
// =============================================================================

/// First inbound stage: owns the receipt, signals the delivery outcome.
pub struct Acknowledge {
    policy: Arc<dyn RetryPolicy>,
}

impl Acknowledge {
    /// Wrap a retry policy.
    pub fn new(policy: Arc<dyn RetryPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl InboundStage for Acknowledge {
    async fn deliver(
        &self,
        ctx: &mut DeliveryContext,
        mut inbound: InboundEnvelope,
        next: InboundNext<'_>,
    ) -> Result<()> {
        let receipt = inbound.take_receipt().ok_or_else(|| {
            Error::config("delivery has no receipt; is Acknowledge installed twice?")
        })?;
        let envelope = inbound.envelope().clone();
        let delivery_count = inbound.delivery_count();

        match next.deliver(ctx, inbound).await {
            Ok(()) => receipt.ack().await,
            Err(err) => match self.policy.decide(&envelope, delivery_count, &err) {
                RetryDecision::Retry { delay } => {
                    warn!(
                        message_id = %envelope.message_id(),
                        message_type = envelope.message_type(),
                        ?delivery_count,
                        ?delay,
                        %err,
                        "delivery failed, retrying"
                    );
                    receipt.retry(delay, &err).await
                }
                RetryDecision::Reject => {
                    error!(
                        message_id = %envelope.message_id(),
                        message_type = envelope.message_type(),
                        ?delivery_count,
                        %err,
                        "delivery failed terminally, rejecting"
                    );
                    receipt.reject(&err).await
                }
            },
        }
    }
}
