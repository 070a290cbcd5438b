//! Dispatch: the terminal inbound stage.
//!
//! # Overview
//!
//! A [`DispatchTable`] maps message type names to handlers. Commands get
//! exactly one handler; events get any number. The table is immutable after
//! [`DispatchTableBuilder::build`], which is also where the single-command-
//! handler rule is enforced, so a misconfigured endpoint fails at startup
//! rather than at delivery time.
//!
//! Handlers for one message run sequentially in registration order, and the
//! first error stops the run. Combined with the outbox stage upstream this
//! keeps a partial failure safe: nothing the earlier handlers sent leaves
//! the endpoint, and the redelivery runs the full handler list again.
//!
//! # Example
//!
//! ```ignore
//! let table = DispatchTableBuilder::new()
//!     .register(Arc::new(AccountHandler::new(store)))
//!     .register(Arc::new(AuditLogHandler::new()))
//!     .build()?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::envelope::{Envelope, InboundEnvelope, Operation};
use crate::error::{Error, Result};
use crate::message::MessageKind;
use crate::pipeline::{DeliveryContext, InboundNext, InboundStage, InitializeContext};

/// Handles one or more message types.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handler name, for logs and duplicate-registration errors.
    fn name(&self) -> &'static str;

    /// The message types this handler claims, with their kinds.
    fn message_types(&self) -> Vec<(&'static str, MessageKind)>;

    /// Handle one envelope. Downcast the payload at the edge:
    ///
    /// ```ignore
    /// let Some(cmd) = envelope.message().downcast_ref::<OpenAccount>() else {
    ///     return Ok(());
    /// };
    /// ```
    async fn handle(&self, ctx: &mut DeliveryContext, envelope: &Envelope) -> Result<()>;
}

type HandlerList = SmallVec<[Arc<dyn MessageHandler>; 1]>;

/// Immutable map from message type to handlers.
pub struct DispatchTable {
    entries: HashMap<&'static str, (MessageKind, HandlerList)>,
}

impl DispatchTable {
    /// The handlers registered for a type, if any.
    fn handlers(&self, message_type: &str) -> Option<&HandlerList> {
        self.entries.get(message_type).map(|(_, list)| list)
    }

    /// All registered types with their kinds, for subscription setup.
    pub fn subscribed_types(&self) -> impl Iterator<Item = (&'static str, MessageKind)> + '_ {
        self.entries.iter().map(|(ty, (kind, _))| (*ty, *kind))
    }
}

/// Builds a [`DispatchTable`], rejecting invalid registrations.
#[derive(Default)]
pub struct DispatchTableBuilder {
    registrations: Vec<Arc<dyn MessageHandler>>,
}

impl DispatchTableBuilder {
    /// An empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler. Validation happens in [`build`](Self::build).
    pub fn register(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.registrations.push(handler);
        self
    }

    /// Whether any handlers were registered.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Validate and freeze the table.
    ///
    /// Fails with [`Error::DuplicateCommandHandler`] when two handlers claim
    /// the same command type, and with [`Error::Config`] when registrations
    /// disagree about a type's kind.
    pub fn build(self) -> Result<DispatchTable> {
        let mut entries: HashMap<&'static str, (MessageKind, HandlerList)> = HashMap::new();
        for handler in self.registrations {
            for (message_type, kind) in handler.message_types() {
                let (existing_kind, list) = entries
                    .entry(message_type)
                    .or_insert_with(|| (kind, SmallVec::new()));
                if *existing_kind != kind {
                    return Err(Error::config(format!(
                        "handler {} registers {message_type} as {kind}, already registered as {existing_kind}",
                        handler.name(),
                    )));
                }
                if kind.is_command() && !list.is_empty() {
                    return Err(Error::DuplicateCommandHandler {
                        message_type: message_type.to_string(),
                    });
                }
                list.push(handler.clone());
            }
        }
        Ok(DispatchTable { entries })
    }
}

/// Terminal inbound stage: validates, then hands the envelope to handlers.
pub struct Dispatch {
    table: DispatchTable,
}

impl Dispatch {
    /// Wrap a built dispatch table as the terminal stage.
    pub fn new(table: DispatchTable) -> Self {
        Self { table }
    }
}

#[async_trait]
impl InboundStage for Dispatch {
    async fn initialize(&self, init: &mut InitializeContext) -> Result<()> {
        for (message_type, kind) in self.table.subscribed_types() {
            let operation = match kind {
                MessageKind::Command => Operation::Unicast,
                MessageKind::Event => Operation::Multicast,
            };
            init.subscribe(operation, message_type);
        }
        Ok(())
    }

    async fn deliver(
        &self,
        ctx: &mut DeliveryContext,
        inbound: InboundEnvelope,
        _next: InboundNext<'_>,
    ) -> Result<()> {
        let envelope = inbound.envelope().clone();
        envelope.message().validate_message()?;

        let Some(handlers) = self.table.handlers(envelope.message_type()) else {
            // Stale subscription or misrouted message. Acking it (by
            // returning Ok) beats endless redelivery of something nobody
            // will ever handle.
            warn!(
                message_type = envelope.message_type(),
                message_id = %envelope.message_id(),
                "no handler registered, dropping"
            );
            return Ok(());
        };

        ctx.set_parent(envelope.clone());
        for handler in handlers {
            debug!(
                handler = handler.name(),
                message_type = envelope.message_type(),
                message_id = %envelope.message_id(),
                "dispatching"
            );
            handler.handle(ctx, &envelope).await?;
        }
        Ok(())
    }
}
