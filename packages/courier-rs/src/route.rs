//! Prefix routing for unicast sends.
//!
//! # Overview
//!
//! A [`RoutingTable`] maps message-type prefixes to endpoint names. A prefix
//! matches a type when it equals the full type name or when the type starts
//! with `prefix + "."`; the longest matching prefix wins, so specific routes
//! override broad ones:
//!
//! ```ignore
//! let table = RoutingTable::new()
//!     .route("billing", "billing-svc")               // everything under billing
//!     .route("billing.refunds", "refund-svc")        // except refunds
//!     .route("billing.refunds.Escalate", "oncall");  // except this one type
//! ```
//!
//! The empty prefix is a catch-all matching every type; it always ranks
//! last. When no prefix matches, the [`Router`] falls back to the message's
//! namespace (the type name up to the final dot) as the destination, which
//! makes the common "endpoint named after its namespace" topology work with
//! an empty table.
//!
//! Multicast envelopes and envelopes with a preset destination pass through
//! untouched.

use dashmap::DashMap;

use async_trait::async_trait;
use tracing::trace;

use crate::envelope::{Operation, OutboundEnvelope};
use crate::error::{Error, Result};
use crate::pipeline::{OutboundNext, OutboundStage};

// =============================================================================
// RoutingTable
// =============================================================================

/// Ordered prefix-to-endpoint routes.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    // Sorted by descending prefix length at validate time, so resolution is
    // a linear scan that stops at the first (longest) match.
    entries: Vec<(String, String)>,
}

impl RoutingTable {
    /// An empty table; unicast routing falls back to namespaces.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route. The empty prefix is the catch-all.
    pub fn route(mut self, prefix: impl Into<String>, endpoint: impl Into<String>) -> Self {
        self.entries.push((prefix.into(), endpoint.into()));
        self
    }

    /// Reject duplicate prefixes and order entries for resolution.
    pub fn validate(mut self) -> Result<Self> {
        self.entries
            .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        for pair in self.entries.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(Error::config(format!(
                    "duplicate routing prefix {:?}",
                    pair[0].0
                )));
            }
        }
        Ok(self)
    }

    /// The endpoint for a message type, if any prefix matches.
    pub fn resolve(&self, message_type: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(prefix, _)| {
                prefix.is_empty()
                    || prefix == message_type
                    || (message_type.len() > prefix.len()
                        && message_type.as_bytes()[prefix.len()] == b'.'
                        && message_type.starts_with(prefix.as_str()))
            })
            .map(|(_, endpoint)| endpoint.as_str())
    }

    /// Whether the table has any routes.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Router stage
// =============================================================================

/// Outbound stage that resolves a destination for unicast envelopes.
pub struct Router {
    table: RoutingTable,
    // Resolution per type is stable for the life of the endpoint; the table
    // is immutable after validate(). Keyed by the 'static type name.
    cache: DashMap<&'static str, String>,
}

impl Router {
    /// Wrap a validated routing table.
    pub fn new(table: RoutingTable) -> Self {
        Self {
            table,
            cache: DashMap::new(),
        }
    }

    fn destination_for(&self, outbound: &OutboundEnvelope) -> Result<String> {
        let message = outbound.envelope().message();
        let message_type = message.message_type();
        if let Some(cached) = self.cache.get(message_type) {
            return Ok(cached.clone());
        }

        let resolved = self
            .table
            .resolve(message_type)
            .map(str::to_string)
            .or_else(|| message.namespace().map(str::to_string))
            .ok_or_else(|| Error::Routing {
                message_type: message_type.to_string(),
            })?;

        trace!(message_type, destination = %resolved, "resolved route");
        self.cache.insert(message_type, resolved.clone());
        Ok(resolved)
    }
}

#[async_trait]
impl OutboundStage for Router {
    async fn accept(&self, outbound: OutboundEnvelope, next: OutboundNext<'_>) -> Result<()> {
        if outbound.operation() == Operation::Multicast || outbound.destination().is_some() {
            return next.accept(outbound).await;
        }
        let destination = self.destination_for(&outbound)?;
        next.accept(outbound.with_destination(destination)).await
    }
}
