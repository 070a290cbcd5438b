//! Core message traits.
//!
//! # Overview
//!
//! Courier separates **commands** from **events**:
//! - A command is a request to do something; it has exactly one recipient.
//! - An event is a statement that something happened; it may have many
//!   subscribers (or none).
//!
//! Both are plain user types implementing [`Message`]. A message names its
//! own type with a dot-separated string (e.g. `"billing.account.OpenAccount"`)
//! which the router treats as a hierarchy: the portion before the final dot
//! is the message's namespace, used as the fallback destination for unicast
//! routing.
//!
//! # Type erasure
//!
//! The pipeline works with [`AnyMessage`] trait objects so stages never need
//! to know concrete message types. `AnyMessage` is implemented for every
//! `Message` automatically; handlers downcast at the edge.
//!
//! # Example
//!
//! ```ignore
//! use courier::{Message, MessageKind};
//!
//! #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
//! struct OpenAccount {
//!     account_id: uuid::Uuid,
//!     name: String,
//! }
//!
//! impl Message for OpenAccount {
//!     const TYPE: &'static str = "billing.account.OpenAccount";
//!     const KIND: MessageKind = MessageKind::Command;
//!
//!     fn validate(&self) -> courier::Result<()> {
//!         if self.name.is_empty() {
//!             return Err(courier::Error::validation("account name is empty"));
//!         }
//!         Ok(())
//!     }
//! }
//! ```

use std::any::Any;
use std::fmt;

use crate::error::Result;

/// The role of a message in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    /// A request to do something. Exactly one handler may claim a command
    /// type; the dispatch table enforces this at build time.
    Command,
    /// A statement that something happened. Any number of handlers may
    /// subscribe to an event type.
    Event,
}

impl MessageKind {
    /// Returns true for commands.
    pub fn is_command(&self) -> bool {
        matches!(self, MessageKind::Command)
    }

    /// Returns true for events.
    pub fn is_event(&self) -> bool {
        matches!(self, MessageKind::Event)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Command => write!(f, "command"),
            MessageKind::Event => write!(f, "event"),
        }
    }
}

/// A message that can travel through the pipeline.
///
/// `TYPE` is the stable, dot-separated type name. It appears in routing
/// tables, dispatch tables, subscriptions, and codec content types, so it
/// must not change once messages of this type exist in flight or in storage.
pub trait Message: Send + Sync + 'static {
    /// Stable dot-separated type name, e.g. `"billing.account.OpenAccount"`.
    const TYPE: &'static str;

    /// Whether this message is a command or an event.
    const KIND: MessageKind;

    /// Self-validation, run once before dispatch.
    ///
    /// A failure here is an [`Error::Validation`](crate::Error::Validation):
    /// the message is rejected immediately and never retried.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Type-erased view of a [`Message`], used throughout the pipeline.
///
/// Implemented automatically for every `Message`; never implement this
/// directly.
pub trait AnyMessage: Send + Sync {
    /// The message's stable type name.
    fn message_type(&self) -> &'static str;

    /// Whether the message is a command or an event.
    fn kind(&self) -> MessageKind;

    /// The portion of the type name before the final dot, or `None` for an
    /// undotted type name.
    fn namespace(&self) -> Option<&'static str>;

    /// Run the message's self-validation.
    fn validate_message(&self) -> Result<()>;

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;
}

impl<M: Message> AnyMessage for M {
    fn message_type(&self) -> &'static str {
        M::TYPE
    }

    fn kind(&self) -> MessageKind {
        M::KIND
    }

    fn namespace(&self) -> Option<&'static str> {
        M::TYPE.rsplit_once('.').map(|(ns, _)| ns)
    }

    fn validate_message(&self) -> Result<()> {
        self.validate()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn AnyMessage + '_ {
    /// Downcast to a concrete message type.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.as_any().downcast_ref()
    }

    /// Check whether the payload is of a concrete message type.
    pub fn is<M: Message>(&self) -> bool {
        self.as_any().is::<M>()
    }
}

impl fmt::Debug for dyn AnyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyMessage")
            .field("type", &self.message_type())
            .field("kind", &self.kind())
            .finish()
    }
}
