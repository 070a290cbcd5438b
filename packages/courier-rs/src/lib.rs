//! Courier is a messaging middleware layer: envelopes with causality
//! tracking, a staged delivery pipeline, prefix routing, retry with
//! exponential backoff, a transactional outbox for effectively-once
//! handling over at-least-once transports, and sagas with pluggable
//! mapping and persistence (CRUD or event-sourced, with snapshots).
//!
//! # Overview
//!
//! An endpoint receives messages from a [`Transport`], runs them through an
//! inbound chain of stages, and dispatches them to handlers. Handlers send
//! messages back out through an outbound chain that resolves destinations
//! and hands envelopes to the transport:
//!
//! ```text
//! Transport → Acknowledge → TimeLimiter → Deduplicate → Dispatch → handlers
//!                                                                      │
//! Transport ← TransportStage ← Router ← Sender ←──────────────────────┘
//! ```
//!
//! Every sent message becomes a child of the message being handled, so a
//! whole conversation shares one correlation ID and each message points at
//! its direct cause.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use courier::{EndpointBuilder, SagaHandler, KeySetMapping, CrudPersister};
//!
//! let endpoint = EndpointBuilder::new("billing")
//!     .with_transport(transport)
//!     .with_data_store(store)
//!     .with_outbox(outbox)
//!     .route("shipping", "shipping-svc")
//!     .register(Arc::new(SagaHandler::new(saga, mapping, persister)))
//!     .build()
//!     .await?;
//!
//! endpoint.run().await;
//! ```

pub mod codec;
pub mod dispatch;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod eventsourcing;
pub mod mapping;
pub mod message;
pub mod outbox;
pub mod persistence;
pub mod pipeline;
pub mod retry;
pub mod route;
pub mod saga;
pub mod storage;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Core types
pub use envelope::{Envelope, InboundEnvelope, MessageId, Operation, OutboundEnvelope};
pub use error::{Error, Result};
pub use message::{AnyMessage, Message, MessageKind};

// Pipeline
pub use dispatch::{Dispatch, DispatchTable, DispatchTableBuilder, MessageHandler};
pub use pipeline::{
    DeliveryContext, InboundPipeline, InboundStage, InitializeContext, OutboundPipeline,
    OutboundStage, Sender, TimeLimiter,
};
pub use retry::{Acknowledge, ExponentialBackoff, RetryDecision, RetryPolicy};
pub use route::{Router, RoutingTable};

// Outbox
pub use outbox::{Deduplicate, OutboxMessage, OutboxRepository};

// Sagas
pub use mapping::{DirectMapping, KeySetMapping, KeySetRepository, MappingStrategy, Resolution};
pub use saga::{Instance, InstanceId, NotFoundBehavior, Revision, Saga, SagaHandler, SagaScope};

// Persistence
pub use eventsourcing::{
    EventSourcedPersister, EventStream, Snapshot, SnapshotRepository, DEFAULT_SNAPSHOT_FREQUENCY,
};
pub use persistence::{CrudPersister, SagaPersister, SagaRepository, StoredInstance};
pub use storage::{DataStore, Tx, TxHandle};

// Edges
pub use codec::{Codec, JsonCodec, MarshaledMessage};
pub use endpoint::{Endpoint, EndpointBuilder};
pub use transport::{Receipt, Transport};
