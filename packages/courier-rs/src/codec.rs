//! Wire codec: turning messages into bytes and back.
//!
//! Transports do not know message types; they carry opaque payloads tagged
//! with a content type. A [`Codec`] owns the mapping. The built-in
//! [`JsonCodec`] serializes with `serde_json` and encodes the message type
//! into the content type as `application/json; type=<TYPE>`, so the
//! receiving side can pick the right deserializer without peeking at the
//! body.
//!
//! Registration is explicit: an endpoint registers every concrete type it
//! sends or receives. An unregistered type is a configuration error, caught
//! the first time such a message crosses the wire.
//!
//! ```ignore
//! let codec = JsonCodec::new()
//!     .register::<OpenAccount>()
//!     .register::<AccountOpened>();
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::message::{AnyMessage, Message};

/// A marshaled message: bytes plus the content type describing them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarshaledMessage {
    /// Content type, e.g. `application/json; type=billing.account.OpenAccount`.
    pub content_type: String,
    /// Serialized payload.
    pub data: Vec<u8>,
}

/// Converts messages to and from their wire representation.
pub trait Codec: Send + Sync + 'static {
    /// Serialize a message.
    fn marshal(&self, message: &dyn AnyMessage) -> Result<MarshaledMessage>;

    /// Deserialize a payload, selecting the concrete type from the content
    /// type.
    fn unmarshal(&self, content_type: &str, data: &[u8]) -> Result<Arc<dyn AnyMessage>>;
}

type MarshalFn = Box<dyn Fn(&dyn AnyMessage) -> Result<Vec<u8>> + Send + Sync>;
type UnmarshalFn = Box<dyn Fn(&[u8]) -> Result<Arc<dyn AnyMessage>> + Send + Sync>;

struct CodecEntry {
    marshal: MarshalFn,
    unmarshal: UnmarshalFn,
}

/// JSON codec with explicit per-type registration.
#[derive(Default)]
pub struct JsonCodec {
    types: HashMap<&'static str, CodecEntry>,
}

impl JsonCodec {
    /// An empty codec; register types before use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message type for both directions.
    pub fn register<M>(mut self) -> Self
    where
        M: Message + Serialize + DeserializeOwned,
    {
        self.types.insert(
            M::TYPE,
            CodecEntry {
                marshal: Box::new(|message| {
                    let concrete = message.downcast_ref::<M>().ok_or_else(|| {
                        Error::config(format!(
                            "payload does not match registered type {}",
                            M::TYPE
                        ))
                    })?;
                    serde_json::to_vec(concrete)
                        .map_err(|e| Error::validation(format!("marshal {}: {e}", M::TYPE)))
                }),
                unmarshal: Box::new(|data| {
                    let concrete: M = serde_json::from_slice(data)
                        .map_err(|e| Error::validation(format!("unmarshal {}: {e}", M::TYPE)))?;
                    Ok(Arc::new(concrete) as Arc<dyn AnyMessage>)
                }),
            },
        );
        self
    }

    fn entry(&self, message_type: &str) -> Result<&CodecEntry> {
        self.types.get(message_type).ok_or_else(|| {
            Error::config(format!(
                "message type {message_type} is not registered with the codec"
            ))
        })
    }

    fn type_of(content_type: &str) -> Result<&str> {
        content_type
            .split(';')
            .filter_map(|part| part.trim().strip_prefix("type="))
            .next()
            .ok_or_else(|| {
                Error::validation(format!("content type {content_type:?} carries no type tag"))
            })
    }
}

impl Codec for JsonCodec {
    fn marshal(&self, message: &dyn AnyMessage) -> Result<MarshaledMessage> {
        let entry = self.entry(message.message_type())?;
        Ok(MarshaledMessage {
            content_type: format!("application/json; type={}", message.message_type()),
            data: (entry.marshal)(message)?,
        })
    }

    fn unmarshal(&self, content_type: &str, data: &[u8]) -> Result<Arc<dyn AnyMessage>> {
        let message_type = Self::type_of(content_type)?;
        let entry = self.entry(message_type)?;
        (entry.unmarshal)(data)
    }
}
