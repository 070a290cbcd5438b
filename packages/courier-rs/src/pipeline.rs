//! Pipeline stages and the delivery context.
//!
//! # Overview
//!
//! An endpoint owns two ordered chains of stages:
//!
//! ```text
//! inbound:  Transport → Acknowledge → TimeLimiter → Deduplicate → Dispatch
//! outbound: Sender → Router → TransportStage → Transport
//! ```
//!
//! Each stage may transform a delivery before forwarding it to the suffix of
//! the chain via its `next` handle, or short-circuit by returning an error.
//! Stages are the sole extension mechanism: timeouts, deduplication,
//! validation and observability are stages, not hooks baked into the
//! dispatcher.
//!
//! # The delivery context
//!
//! Everything ambient travels explicitly on [`DeliveryContext`]: the data
//! store, the open transaction (if any), the envelope currently being
//! handled, and the sender. There is no task-local side channel; a stage or
//! handler that wants the transaction reads a field.
//!
//! Handlers send messages through the context. Each sent message becomes a
//! *child* of the envelope being handled, so causality chains are maintained
//! without handler cooperation:
//!
//! ```ignore
//! async fn handle(&self, ctx: &mut DeliveryContext, envelope: &Envelope) -> Result<()> {
//!     // withdrawal.message_id is fresh; its causation is `envelope`,
//!     // its correlation is the conversation root.
//!     ctx.execute_command(Withdraw { account_id, amount }).await
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::envelope::{Envelope, InboundEnvelope, Operation, OutboundEnvelope};
use crate::error::{Error, Result};
use crate::message::{AnyMessage, Message, MessageKind};
use crate::storage::{DataStore, Tx};
use crate::transport::Transport;

/// Default time budget for one inbound delivery.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Sender
// =============================================================================

/// Entry point into the outbound chain, as seen by handlers.
///
/// The real sender forwards into the outbound pipeline. The outbox stage
/// temporarily swaps in a buffering sender so a handler's output can be
/// captured and persisted before anything reaches the transport.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Accept one outbound envelope.
    async fn send_message(&self, outbound: OutboundEnvelope) -> Result<()>;
}

// =============================================================================
// Initialize context
// =============================================================================

/// Configuration-time state handed to every stage once, front-to-back, when
/// the endpoint starts.
#[derive(Debug)]
pub struct InitializeContext {
    endpoint_name: String,
    subscriptions: Vec<(Operation, &'static str)>,
}

impl InitializeContext {
    /// Create an initialize context for the named endpoint.
    pub fn new(endpoint_name: impl Into<String>) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            subscriptions: Vec::new(),
        }
    }

    /// The endpoint being started.
    pub fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    /// Declare interest in a message type. The endpoint forwards collected
    /// subscriptions to the transport after all stages have initialized.
    pub fn subscribe(&mut self, operation: Operation, message_type: &'static str) {
        self.subscriptions.push((operation, message_type));
    }

    /// Drain the collected subscriptions.
    pub fn take_subscriptions(&mut self) -> Vec<(Operation, &'static str)> {
        std::mem::take(&mut self.subscriptions)
    }
}

// =============================================================================
// Delivery context
// =============================================================================

/// Per-delivery execution context, threaded explicitly through the inbound
/// chain.
pub struct DeliveryContext {
    data_store: Option<Arc<dyn DataStore>>,
    tx: Option<Tx>,
    parent: Option<Envelope>,
    sender: Arc<dyn Sender>,
}

impl DeliveryContext {
    /// Create a fresh context for one delivery.
    pub fn new(data_store: Option<Arc<dyn DataStore>>, sender: Arc<dyn Sender>) -> Self {
        Self {
            data_store,
            tx: None,
            parent: None,
            sender,
        }
    }

    /// The configured data store, or a configuration error if the endpoint
    /// was built without one.
    pub fn data_store(&self) -> Result<Arc<dyn DataStore>> {
        self.data_store
            .clone()
            .ok_or_else(|| Error::config("no data store configured for this endpoint"))
    }

    /// The ambient transaction, if one is open.
    pub fn tx(&self) -> Option<&Tx> {
        self.tx.as_ref()
    }

    /// The ambient transaction, or a configuration error when a stage that
    /// requires one runs outside the outbox stage.
    pub fn require_tx(&self) -> Result<&Tx> {
        self.tx
            .as_ref()
            .ok_or_else(|| Error::config("no ambient transaction; is the outbox stage installed?"))
    }

    /// Install the ambient transaction. Only the stage that opened it calls
    /// this, and only that stage commits.
    pub fn set_tx(&mut self, tx: Tx) {
        self.tx = Some(tx);
    }

    /// Remove the ambient transaction after commit or rollback.
    pub fn clear_tx(&mut self) -> Option<Tx> {
        self.tx.take()
    }

    /// The envelope currently being handled, if any.
    pub fn parent(&self) -> Option<&Envelope> {
        self.parent.as_ref()
    }

    /// Install the envelope being handled, so sent messages chain as its
    /// children. The dispatcher calls this before invoking handlers.
    pub fn set_parent(&mut self, envelope: Envelope) {
        self.parent = Some(envelope);
    }

    /// The active sender.
    pub fn sender(&self) -> Arc<dyn Sender> {
        self.sender.clone()
    }

    /// Swap the active sender, returning the previous one. The outbox stage
    /// uses this to capture handler output.
    pub fn replace_sender(&mut self, sender: Arc<dyn Sender>) -> Arc<dyn Sender> {
        std::mem::replace(&mut self.sender, sender)
    }

    /// Send a command to its single recipient.
    ///
    /// The command becomes a child of the envelope being handled, or a root
    /// envelope when called from outside a delivery (edge sends).
    pub async fn execute_command(&self, command: impl Message) -> Result<()> {
        self.send(Arc::new(command), Operation::Unicast).await
    }

    /// Publish an event to all subscribers. Chained like
    /// [`execute_command`](Self::execute_command).
    pub async fn publish_event(&self, event: impl Message) -> Result<()> {
        self.send(Arc::new(event), Operation::Multicast).await
    }

    /// Type-erased send; the operation must match the message's kind.
    pub async fn send(&self, message: Arc<dyn AnyMessage>, operation: Operation) -> Result<()> {
        match (message.kind(), operation) {
            (MessageKind::Command, Operation::Unicast) | (MessageKind::Event, Operation::Multicast) => {}
            (kind, _) => {
                return Err(Error::validation(format!(
                    "{} {} cannot be sent as {operation:?}",
                    kind,
                    message.message_type(),
                )))
            }
        }

        let envelope = match &self.parent {
            Some(parent) => parent.child_from(message),
            None => Envelope::from_message(message),
        };
        let outbound = match operation {
            Operation::Unicast => OutboundEnvelope::unicast(envelope),
            Operation::Multicast => OutboundEnvelope::multicast(envelope),
        };
        self.sender.send_message(outbound).await
    }
}

// =============================================================================
// Inbound chain
// =============================================================================

/// One stage of the inbound chain.
#[async_trait]
pub trait InboundStage: Send + Sync + 'static {
    /// Configuration-time hook, called once per endpoint start.
    async fn initialize(&self, init: &mut InitializeContext) -> Result<()> {
        let _ = init;
        Ok(())
    }

    /// Handle one delivery, forwarding to `next` zero or one times.
    async fn deliver(
        &self,
        ctx: &mut DeliveryContext,
        inbound: InboundEnvelope,
        next: InboundNext<'_>,
    ) -> Result<()>;
}

/// Handle on the remaining suffix of the inbound chain.
pub struct InboundNext<'a> {
    stages: &'a [Arc<dyn InboundStage>],
}

impl InboundNext<'static> {
    /// A next handle with no remaining stages, for exercising terminal
    /// stages in isolation.
    #[cfg(any(test, feature = "testing"))]
    pub fn empty() -> Self {
        Self { stages: &[] }
    }
}

impl<'a> InboundNext<'a> {
    /// A next handle over an explicit stage slice, for exercising one stage
    /// in isolation.
    #[cfg(any(test, feature = "testing"))]
    pub fn over(stages: &'a [Arc<dyn InboundStage>]) -> Self {
        Self { stages }
    }
}

impl InboundNext<'_> {
    /// Forward the delivery to the next stage.
    pub async fn deliver(self, ctx: &mut DeliveryContext, inbound: InboundEnvelope) -> Result<()> {
        match self.stages.split_first() {
            Some((head, rest)) => head.deliver(ctx, inbound, InboundNext { stages: rest }).await,
            None => Err(Error::config("inbound pipeline has no terminal stage")),
        }
    }
}

/// An ordered chain of inbound stages, terminating at the dispatcher.
pub struct InboundPipeline {
    stages: Vec<Arc<dyn InboundStage>>,
}

impl InboundPipeline {
    /// Build a pipeline from stages in delivery order.
    pub fn new(stages: Vec<Arc<dyn InboundStage>>) -> Self {
        Self { stages }
    }

    /// Initialize all stages front-to-back.
    pub async fn initialize(&self, init: &mut InitializeContext) -> Result<()> {
        for stage in &self.stages {
            stage.initialize(init).await?;
        }
        Ok(())
    }

    /// Run one delivery through the whole chain.
    pub async fn deliver(&self, ctx: &mut DeliveryContext, inbound: InboundEnvelope) -> Result<()> {
        InboundNext {
            stages: &self.stages,
        }
        .deliver(ctx, inbound)
        .await
    }
}

// =============================================================================
// Outbound chain
// =============================================================================

/// One stage of the outbound chain.
#[async_trait]
pub trait OutboundStage: Send + Sync + 'static {
    /// Configuration-time hook, called once per endpoint start.
    async fn initialize(&self, init: &mut InitializeContext) -> Result<()> {
        let _ = init;
        Ok(())
    }

    /// Accept one outbound envelope, forwarding to `next` zero or one times.
    async fn accept(&self, outbound: OutboundEnvelope, next: OutboundNext<'_>) -> Result<()>;
}

/// Handle on the remaining suffix of the outbound chain.
pub struct OutboundNext<'a> {
    stages: &'a [Arc<dyn OutboundStage>],
}

impl OutboundNext<'static> {
    /// A next handle with no remaining stages, for exercising terminal
    /// stages in isolation.
    #[cfg(any(test, feature = "testing"))]
    pub fn empty() -> Self {
        Self { stages: &[] }
    }
}

impl<'a> OutboundNext<'a> {
    /// A next handle over an explicit stage slice, for exercising one stage
    /// in isolation.
    #[cfg(any(test, feature = "testing"))]
    pub fn over(stages: &'a [Arc<dyn OutboundStage>]) -> Self {
        Self { stages }
    }
}

impl OutboundNext<'_> {
    /// Forward the envelope to the next stage.
    pub async fn accept(self, outbound: OutboundEnvelope) -> Result<()> {
        match self.stages.split_first() {
            Some((head, rest)) => head.accept(outbound, OutboundNext { stages: rest }).await,
            None => Err(Error::config("outbound pipeline has no terminal stage")),
        }
    }
}

/// An ordered chain of outbound stages, terminating at the transport.
pub struct OutboundPipeline {
    stages: Vec<Arc<dyn OutboundStage>>,
}

impl OutboundPipeline {
    /// Build a pipeline from stages in acceptance order. The final stage
    /// must be transport-backed (see [`TransportStage`]).
    pub fn new(stages: Vec<Arc<dyn OutboundStage>>) -> Self {
        Self { stages }
    }

    /// Initialize all stages front-to-back.
    pub async fn initialize(&self, init: &mut InitializeContext) -> Result<()> {
        for stage in &self.stages {
            stage.initialize(init).await?;
        }
        Ok(())
    }

    /// Run one envelope through the whole chain.
    pub async fn accept(&self, outbound: OutboundEnvelope) -> Result<()> {
        OutboundNext {
            stages: &self.stages,
        }
        .accept(outbound)
        .await
    }
}

/// Terminal outbound stage: hands the envelope to the transport.
pub struct TransportStage {
    transport: Arc<dyn Transport>,
}

impl TransportStage {
    /// Wrap a transport as the terminal stage.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl OutboundStage for TransportStage {
    async fn accept(&self, outbound: OutboundEnvelope, _next: OutboundNext<'_>) -> Result<()> {
        if outbound.operation() == Operation::Unicast && outbound.destination().is_none() {
            // A unicast envelope can only get here unrouted if no router
            // stage is installed ahead of us.
            return Err(Error::Routing {
                message_type: outbound.envelope().message_type().to_string(),
            });
        }
        debug!(
            message_id = %outbound.envelope().message_id(),
            message_type = outbound.envelope().message_type(),
            destination = outbound.destination().unwrap_or("*"),
            "sending"
        );
        self.transport.send(outbound).await
    }
}

/// The real sender: forwards into the outbound pipeline.
pub struct PipelineSender {
    pipeline: Arc<OutboundPipeline>,
}

impl PipelineSender {
    /// Wrap an outbound pipeline as a sender.
    pub fn new(pipeline: Arc<OutboundPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Sender for PipelineSender {
    async fn send_message(&self, outbound: OutboundEnvelope) -> Result<()> {
        self.pipeline.accept(outbound).await
    }
}

// =============================================================================
// Time limiter
// =============================================================================

/// Bounds one inbound delivery to a fixed time budget, canceling in-flight
/// store and transport calls when exceeded.
pub struct TimeLimiter {
    timeout: Duration,
}

impl TimeLimiter {
    /// Create a limiter with the given budget.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TimeLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_DELIVERY_TIMEOUT)
    }
}

#[async_trait]
impl InboundStage for TimeLimiter {
    async fn deliver(
        &self,
        ctx: &mut DeliveryContext,
        inbound: InboundEnvelope,
        next: InboundNext<'_>,
    ) -> Result<()> {
        match tokio::time::timeout(self.timeout, next.deliver(ctx, inbound)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                duration: self.timeout,
            }),
        }
    }
}
