//! The transport seam: how courier talks to a broker.
//!
//! Courier does not implement a broker. A [`Transport`] adapter owns the
//! wire protocol and queue topology; the pipeline only needs four
//! operations: initialize, subscribe, send, receive.
//!
//! Delivery is at-least-once: the transport may redeliver a message until
//! its [`Receipt`] is consumed with an ack or a reject. The outbox stage is
//! what turns that into effectively-once handler execution.
//!
//! # Example Implementation (sketch)
//!
//! ```ignore
//! struct AmqpTransport { /* channel, queues, codec */ }
//!
//! #[async_trait]
//! impl Transport for AmqpTransport {
//!     async fn initialize(&self, endpoint_name: &str) -> Result<()> {
//!         // declare the endpoint's queue and exchange bindings
//!     }
//!
//!     async fn subscribe(&self, operation: Operation, message_types: &[&str]) -> Result<()> {
//!         // bind routing keys for each type; unicast types bind the
//!         // endpoint queue, multicast types bind a fanout exchange
//!     }
//!
//!     async fn send(&self, outbound: OutboundEnvelope) -> Result<()> {
//!         // marshal via the codec, publish with outbound.envelope().delay()
//!     }
//!
//!     async fn receive(&self) -> Result<Option<InboundEnvelope>> {
//!         // next delivery, with a Receipt wrapping the broker ack handle
//!     }
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;

use crate::envelope::{InboundEnvelope, Operation, OutboundEnvelope};
use crate::error::{Error, Result};

/// Completion handle for one delivery attempt, consumed exactly once.
#[async_trait]
pub trait Receipt: Send {
    /// The message was handled; remove it from the queue.
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Handling failed transiently; redeliver after `delay`.
    async fn retry(self: Box<Self>, delay: Duration, err: &Error) -> Result<()>;

    /// Handling failed terminally; dead-letter the message.
    async fn reject(self: Box<Self>, err: &Error) -> Result<()>;
}

/// A connection to a message broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Prepare the transport for an endpoint. Called once, before any
    /// subscribe/send/receive.
    async fn initialize(&self, endpoint_name: &str) -> Result<()>;

    /// Declare interest in a set of message types.
    ///
    /// Unicast subscriptions consume the endpoint's own queue; multicast
    /// subscriptions join the named types' publish fan-out.
    async fn subscribe(&self, operation: Operation, message_types: &[&str]) -> Result<()>;

    /// Send one outbound envelope. Unicast envelopes arrive here with a
    /// resolved destination; the router guarantees it.
    async fn send(&self, outbound: OutboundEnvelope) -> Result<()>;

    /// Receive the next delivery, or `None` when the transport has shut
    /// down and no further deliveries will arrive.
    async fn receive(&self) -> Result<Option<InboundEnvelope>>;
}
