//! Sagas: long-running, message-driven state machines.
//!
//! # Overview
//!
//! A saga instance is born when a *trigger* message arrives that maps to no
//! existing instance, mutates as further messages map to it, and may
//! eventually report itself complete. Completion is a predicate, not a
//! deletion; finished instances stay queryable.
//!
//! Business logic never mutates saga data directly. A handler inspects the
//! current data and *records* events; each recorded event is applied to the
//! data through the saga's `apply` function and published to subscribers.
//! Because `apply` is the only mutation path, the same function
//! reconstructs state from the event stream under event sourcing.
//!
//! ```ignore
//! #[async_trait]
//! impl Saga for Enrollment {
//!     type Data = EnrollmentData;
//!
//!     fn name(&self) -> &'static str { "enrollment" }
//!
//!     fn triggers(&self) -> &'static [(&'static str, MessageKind)] {
//!         &[("school.enrollment.Requested", MessageKind::Event)]
//!     }
//!
//!     fn handles(&self) -> &'static [(&'static str, MessageKind)] {
//!         &[("school.enrollment.SeatAssigned", MessageKind::Event)]
//!     }
//!
//!     async fn handle(&self, envelope: &Envelope, scope: &mut SagaScope<'_, Self>) -> Result<()> {
//!         if let Some(req) = envelope.message().downcast_ref::<Requested>() {
//!             scope.record(Accepted { student: req.student.clone() }).await?;
//!             scope.execute(AssignSeat { student: req.student.clone() }).await?;
//!         }
//!         Ok(())
//!     }
//!
//!     fn apply(&self, data: &mut Self::Data, event: &dyn AnyMessage) {
//!         if let Some(a) = event.downcast_ref::<Accepted>() {
//!             data.student = Some(a.student.clone());
//!         }
//!     }
//! }
//! ```
//!
//! The [`SagaHandler`] adapter plugs a saga into the dispatch table,
//! combining a [`MappingStrategy`](crate::mapping::MappingStrategy) (which
//! instance?) with a [`SagaPersister`](crate::persistence::SagaPersister)
//! (how is it stored?).

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::MessageHandler;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::mapping::{MappingStrategy, Resolution};
use crate::message::{AnyMessage, Message, MessageKind};
use crate::persistence::SagaPersister;
use crate::pipeline::DeliveryContext;

// =============================================================================
// Identity and revision
// =============================================================================

/// Identity of one saga instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Derive an identifier deterministically from a key, with an optional
    /// static prefix. The same inputs always produce the same identifier.
    pub fn from_parts(prefix: Option<&str>, key: &str) -> Self {
        match prefix {
            Some(prefix) => Self(format!("{prefix}-{key}")),
            None => Self(key.to_string()),
        }
    }

    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic count of state changes applied to one instance.
///
/// Saving an instance requires the revision the caller last read; a
/// mismatch is a [`Error::Conflict`] and the caller restarts its whole
/// unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Revision(u64);

impl Revision {
    /// The revision of an instance with no applied changes.
    pub const NONE: Revision = Revision(0);

    /// The next revision.
    pub fn next(&self) -> Revision {
        Revision(self.0 + 1)
    }

    /// The revision after `count` further changes.
    pub fn advance(&self, count: u64) -> Revision {
        Revision(self.0 + count)
    }

    /// The raw counter value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Whether any changes have been applied.
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "r{}", self.0)
        }
    }
}

/// One saga instance: identity, business data, revision.
#[derive(Debug, Clone)]
pub struct Instance<D> {
    /// Instance identity.
    pub id: InstanceId,
    /// Business state, mutated only through the saga's `apply`.
    pub data: D,
    /// Optimistic concurrency token.
    pub revision: Revision,
}

impl<D: Default> Instance<D> {
    /// A fresh instance at revision NONE.
    pub fn new(id: InstanceId) -> Self {
        Self {
            id,
            data: D::default(),
            revision: Revision::NONE,
        }
    }
}

// =============================================================================
// Saga trait
// =============================================================================

/// What to do with a message that maps to no existing instance and is not
/// a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundBehavior {
    /// Drop the message silently (ack it).
    Ignore,
    /// Fail the delivery; the retry policy takes over.
    Fail,
}

/// A long-running, message-driven state machine.
#[async_trait]
pub trait Saga: Send + Sync + Sized + 'static {
    /// Business state. `Default` is the state of a freshly triggered
    /// instance.
    type Data: Clone + Default + Send + Sync + Serialize + DeserializeOwned + 'static;

    /// Stable saga name; keys persisted instances, streams and snapshots.
    fn name(&self) -> &'static str;

    /// Message types that may create a new instance.
    fn triggers(&self) -> &'static [(&'static str, MessageKind)];

    /// Message types handled only by existing instances.
    fn handles(&self) -> &'static [(&'static str, MessageKind)] {
        &[]
    }

    /// Handle one message against the mapped instance.
    async fn handle(&self, envelope: &Envelope, scope: &mut SagaScope<'_, Self>) -> Result<()>;

    /// Apply one recorded event to the data. Must be pure and total: it
    /// runs both at handling time and when reconstructing state from an
    /// event stream.
    fn apply(&self, data: &mut Self::Data, event: &dyn AnyMessage);

    /// Whether the instance has reached a terminal state.
    fn is_complete(&self, data: &Self::Data) -> bool {
        let _ = data;
        false
    }

    /// Policy for unmapped, non-trigger messages.
    fn on_not_found(&self) -> NotFoundBehavior {
        NotFoundBehavior::Ignore
    }

    /// The full mapping key set for the current data, recomputed after
    /// every handled message. Only key-set mapped sagas implement this.
    fn mapping_keys(&self, data: &Self::Data) -> BTreeSet<String> {
        let _ = data;
        BTreeSet::new()
    }
}

// =============================================================================
// Scope
// =============================================================================

/// Handler-facing view of one saga invocation.
///
/// Recording an event applies it to the data immediately, so later logic in
/// the same handler sees the updated state.
pub struct SagaScope<'a, S: Saga> {
    saga: &'a S,
    ctx: &'a DeliveryContext,
    instance: &'a mut Instance<S::Data>,
    recorded: Vec<Arc<dyn AnyMessage>>,
}

impl<'a, S: Saga> SagaScope<'a, S> {
    fn new(saga: &'a S, ctx: &'a DeliveryContext, instance: &'a mut Instance<S::Data>) -> Self {
        Self {
            saga,
            ctx,
            instance,
            recorded: Vec::new(),
        }
    }

    /// The mapped instance's identity.
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance.id
    }

    /// The current business data, including events recorded so far in this
    /// invocation.
    pub fn data(&self) -> &S::Data {
        &self.instance.data
    }

    /// Record an event: apply it to the data and publish it.
    pub async fn record(&mut self, event: impl Message) -> Result<()> {
        if !event.kind().is_event() {
            return Err(Error::validation(format!(
                "{} is a command; record() takes events, use execute()",
                event.message_type()
            )));
        }
        let event: Arc<dyn AnyMessage> = Arc::new(event);
        self.saga.apply(&mut self.instance.data, event.as_ref());
        self.recorded.push(event.clone());
        self.ctx
            .send(event, crate::envelope::Operation::Multicast)
            .await
    }

    /// Send a command to another endpoint. Commands are not recorded; they
    /// change no saga state.
    pub async fn execute(&self, command: impl Message) -> Result<()> {
        self.ctx.execute_command(command).await
    }

    fn into_recorded(self) -> Vec<Arc<dyn AnyMessage>> {
        self.recorded
    }
}

// =============================================================================
// Handler adapter
// =============================================================================

/// Adapts a [`Saga`] plus a mapping strategy and persister into a
/// [`MessageHandler`].
pub struct SagaHandler<S: Saga> {
    saga: Arc<S>,
    mapping: Arc<dyn MappingStrategy<S>>,
    persister: Arc<dyn SagaPersister<S>>,
}

impl<S: Saga> SagaHandler<S> {
    /// Assemble the adapter.
    pub fn new(
        saga: Arc<S>,
        mapping: Arc<dyn MappingStrategy<S>>,
        persister: Arc<dyn SagaPersister<S>>,
    ) -> Self {
        Self {
            saga,
            mapping,
            persister,
        }
    }

    fn is_trigger(&self, message_type: &str) -> bool {
        self.saga.triggers().iter().any(|(t, _)| *t == message_type)
    }

    fn not_found(&self, envelope: &Envelope) -> Result<()> {
        match self.saga.on_not_found() {
            NotFoundBehavior::Ignore => {
                debug!(
                    saga = self.saga.name(),
                    message_type = envelope.message_type(),
                    "no instance for non-trigger message, ignoring"
                );
                Ok(())
            }
            NotFoundBehavior::Fail => Err(Error::NotFound {
                saga: self.saga.name().to_string(),
                message_type: envelope.message_type().to_string(),
            }),
        }
    }
}

#[async_trait]
impl<S: Saga> MessageHandler for SagaHandler<S> {
    fn name(&self) -> &'static str {
        self.saga.name()
    }

    fn message_types(&self) -> Vec<(&'static str, MessageKind)> {
        let mut types: Vec<_> = self
            .saga
            .triggers()
            .iter()
            .chain(self.saga.handles())
            .copied()
            .collect();
        types.sort();
        types.dedup();
        types
    }

    async fn handle(&self, ctx: &mut DeliveryContext, envelope: &Envelope) -> Result<()> {
        let is_trigger = self.is_trigger(envelope.message_type());

        let id = match self.mapping.resolve(&self.saga, ctx, envelope).await? {
            Resolution::Instance(id) => id,
            Resolution::NotMapped if is_trigger => {
                // A trigger must map; a strategy that cannot name an
                // instance for its own trigger is misconfigured.
                return Err(Error::config(format!(
                    "saga {} trigger {} resolved to no instance",
                    self.saga.name(),
                    envelope.message_type()
                )));
            }
            Resolution::NotMapped => return self.not_found(envelope),
        };

        let mut instance = match self.persister.load(ctx, &self.saga, &id).await? {
            Some(instance) => instance,
            None if is_trigger => Instance::new(id),
            None => return self.not_found(envelope),
        };

        let mut scope = SagaScope::new(self.saga.as_ref(), ctx, &mut instance);
        self.saga.handle(envelope, &mut scope).await?;
        let recorded = scope.into_recorded();

        if recorded.is_empty() && !instance.revision.is_none() {
            // Nothing recorded means apply never ran: the data, and with it
            // the rebuilt key set, are exactly what was loaded. Skipping
            // both the save and the mapping update keeps the revision
            // stable.
            return Ok(());
        }

        self.persister
            .save(ctx, &self.saga, &mut instance, &recorded)
            .await?;
        self.mapping.update(&self.saga, ctx, &instance).await?;

        if self.saga.is_complete(&instance.data) {
            info!(
                saga = self.saga.name(),
                instance = %instance.id,
                revision = %instance.revision,
                "instance complete"
            );
        } else if instance.revision.is_none() {
            warn!(
                saga = self.saga.name(),
                instance = %instance.id,
                "trigger handled without recording any event"
            );
        }
        Ok(())
    }
}
