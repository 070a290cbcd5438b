//! Envelopes: identity and causality for messages in flight.
//!
//! # Overview
//!
//! An [`Envelope`] wraps a message with the metadata the pipeline needs to
//! track where it came from and what caused it:
//!
//! - `message_id`: globally unique identity of this message
//! - `causation_id`: the message that directly caused this one
//! - `correlation_id`: the root message of the whole conversation
//!
//! The causality tree is flattened: every descendant of a root envelope
//! shares the root's correlation ID, while causation always points one
//! generation up. For a root envelope all three IDs are equal.
//!
//! ```text
//! root            child = root.new_child(m)     grandchild = child.new_child(m)
//! id = A          id = B                        id = C
//! causation = A   causation = A                 causation = B
//! correlation = A correlation = A               correlation = A
//! ```
//!
//! Envelopes are immutable once constructed; no component mutates an
//! envelope after creation. Cloning is cheap, the payload is behind an
//! `Arc`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{AnyMessage, Message};
use crate::transport::Receipt;

// =============================================================================
// MessageId
// =============================================================================

/// Globally unique identity of one message.
///
/// Immutable once generated. Also used as the outbox key: the outbox entry
/// for an inbound message is keyed by that message's ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a fresh random ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// A message plus its identity and causality metadata. Immutable value.
#[derive(Clone)]
pub struct Envelope {
    message_id: MessageId,
    causation_id: MessageId,
    correlation_id: MessageId,
    created_at: DateTime<Utc>,
    send_at: DateTime<Utc>,
    message: Arc<dyn AnyMessage>,
}

impl Envelope {
    /// Create a root envelope: causation and correlation both equal the
    /// fresh message ID.
    pub fn new(message: impl Message) -> Self {
        Self::from_message(Arc::new(message))
    }

    /// Create a root envelope from an already type-erased message.
    pub fn from_message(message: Arc<dyn AnyMessage>) -> Self {
        let id = MessageId::generate();
        let now = Utc::now();
        Self {
            message_id: id,
            causation_id: id,
            correlation_id: id,
            created_at: now,
            send_at: now,
            message,
        }
    }

    /// Derive a child envelope: fresh message ID, causation pointing at this
    /// envelope, correlation inherited unchanged.
    pub fn new_child(&self, message: impl Message) -> Self {
        self.child_from(Arc::new(message))
    }

    /// Derive a child envelope scheduled for a later send time.
    ///
    /// Honoring the delay is the transport's job; [`Envelope::delay`] exposes
    /// it for that purpose.
    pub fn new_child_at(&self, message: impl Message, send_at: DateTime<Utc>) -> Self {
        let mut child = self.child_from(Arc::new(message));
        child.send_at = send_at;
        child
    }

    /// Derive a child envelope from an already type-erased message.
    pub fn child_from(&self, message: Arc<dyn AnyMessage>) -> Self {
        let now = Utc::now();
        Self {
            message_id: MessageId::generate(),
            causation_id: self.message_id,
            correlation_id: self.correlation_id,
            created_at: now,
            send_at: now,
            message,
        }
    }

    /// This message's unique ID.
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// The ID of the message that directly caused this one.
    pub fn causation_id(&self) -> MessageId {
        self.causation_id
    }

    /// The ID of the root message of this conversation.
    pub fn correlation_id(&self) -> MessageId {
        self.correlation_id
    }

    /// When the envelope was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The earliest time the message should be sent.
    pub fn send_at(&self) -> DateTime<Utc> {
        self.send_at
    }

    /// `max(0, send_at - created_at)`, how long the transport should hold
    /// the message before sending.
    pub fn delay(&self) -> Duration {
        (self.send_at - self.created_at).to_std().unwrap_or_default()
    }

    /// The message payload.
    pub fn message(&self) -> &Arc<dyn AnyMessage> {
        &self.message
    }

    /// Shorthand for the payload's type name.
    pub fn message_type(&self) -> &'static str {
        self.message.message_type()
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("message_id", &self.message_id)
            .field("causation_id", &self.causation_id)
            .field("correlation_id", &self.correlation_id)
            .field("type", &self.message.message_type())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Inbound / Outbound
// =============================================================================

/// An envelope received from the transport, consumed once per delivery
/// attempt.
pub struct InboundEnvelope {
    envelope: Envelope,
    source_endpoint: String,
    delivery_count: Option<u32>,
    receipt: Option<Box<dyn Receipt>>,
}

impl InboundEnvelope {
    /// Assemble an inbound envelope as a transport would.
    ///
    /// `delivery_count` is the zero-based attempt number, or `None` when the
    /// transport does not report one (the retry policy then assumes the
    /// worst and applies maximum backoff).
    pub fn new(
        envelope: Envelope,
        source_endpoint: impl Into<String>,
        delivery_count: Option<u32>,
        receipt: Box<dyn Receipt>,
    ) -> Self {
        Self {
            envelope,
            source_endpoint: source_endpoint.into(),
            delivery_count,
            receipt: Some(receipt),
        }
    }

    /// The wrapped envelope.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// The endpoint that sent the message, as reported by the transport.
    pub fn source_endpoint(&self) -> &str {
        &self.source_endpoint
    }

    /// Zero-based delivery attempt, if the transport reports one.
    pub fn delivery_count(&self) -> Option<u32> {
        self.delivery_count
    }

    /// Take the completion receipt. The Acknowledge stage claims it before
    /// forwarding; it can be taken only once.
    pub fn take_receipt(&mut self) -> Option<Box<dyn Receipt>> {
        self.receipt.take()
    }
}

impl fmt::Debug for InboundEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundEnvelope")
            .field("envelope", &self.envelope)
            .field("source_endpoint", &self.source_endpoint)
            .field("delivery_count", &self.delivery_count)
            .finish_non_exhaustive()
    }
}

/// How an outbound envelope is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Sent to exactly one endpoint. The router must resolve a destination
    /// before the transport sees the envelope.
    Unicast,
    /// Published to all subscribed endpoints; no destination needed.
    Multicast,
}

/// An envelope on its way out, produced by a sender and consumed by the
/// router then the transport.
#[derive(Debug, Clone)]
pub struct OutboundEnvelope {
    envelope: Envelope,
    operation: Operation,
    destination: Option<String>,
}

impl OutboundEnvelope {
    /// A unicast envelope with no destination yet; the router resolves one.
    pub fn unicast(envelope: Envelope) -> Self {
        Self {
            envelope,
            operation: Operation::Unicast,
            destination: None,
        }
    }

    /// A unicast envelope with a preset destination; passes through the
    /// router unchanged.
    pub fn unicast_to(envelope: Envelope, destination: impl Into<String>) -> Self {
        Self {
            envelope,
            operation: Operation::Unicast,
            destination: Some(destination.into()),
        }
    }

    /// A multicast envelope; never routed.
    pub fn multicast(envelope: Envelope) -> Self {
        Self {
            envelope,
            operation: Operation::Multicast,
            destination: None,
        }
    }

    /// The wrapped envelope.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Unicast or multicast.
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// The destination endpoint, if resolved or preset.
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// A copy of this envelope with the destination set.
    pub fn with_destination(&self, destination: impl Into<String>) -> Self {
        Self {
            envelope: self.envelope.clone(),
            operation: self.operation,
            destination: Some(destination.into()),
        }
    }
}
