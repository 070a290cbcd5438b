//! Mapping strategies: which saga instance gets a message.
//!
//! # Overview
//!
//! Two strategies cover the practical cases:
//!
//! - [`DirectMapping`] derives the instance ID deterministically from
//!   message fields, optionally under a static prefix. No lookup table;
//!   resolution is a pure function.
//! - [`KeySetMapping`] computes a mapping key from the message and looks it
//!   up in a [`KeySetRepository`]. New instances get generated IDs; after
//!   every handled message the instance's full key set is recomputed from
//!   its data and persisted, so later messages can arrive keyed by anything
//!   the instance has learned (order ID, payment ID, shipment ID, ...).
//!
//! Key sets across instances of one saga must stay disjoint. The repository
//! enforces that at write time; a violation is an
//! [`Error::Integrity`](crate::Error::Integrity), not silently resolved.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::pipeline::DeliveryContext;
use crate::saga::{Instance, InstanceId, Saga};
use crate::storage::Tx;

/// The outcome of resolving a message to an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The message belongs to this instance (which may not exist yet).
    Instance(InstanceId),
    /// The strategy cannot name an instance for this message.
    NotMapped,
}

/// Decides which instance of a saga a message belongs to.
#[async_trait]
pub trait MappingStrategy<S: Saga>: Send + Sync + 'static {
    /// Resolve a message to an instance before handling.
    async fn resolve(
        &self,
        saga: &S,
        ctx: &DeliveryContext,
        envelope: &Envelope,
    ) -> Result<Resolution>;

    /// Refresh the strategy's lookup state after an instance was saved.
    /// Participates in the ambient transaction.
    async fn update(
        &self,
        saga: &S,
        ctx: &DeliveryContext,
        instance: &Instance<S::Data>,
    ) -> Result<()>;
}

type KeyFn = Box<dyn Fn(&Envelope) -> Option<String> + Send + Sync>;

// =============================================================================
// Direct
// =============================================================================

/// Derives the instance ID from the message itself.
pub struct DirectMapping {
    prefix: Option<String>,
    key: KeyFn,
}

impl DirectMapping {
    /// Map via a key extracted from the envelope; `None` means the message
    /// carries no usable key.
    pub fn new(key: impl Fn(&Envelope) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            prefix: None,
            key: Box::new(key),
        }
    }

    /// Prepend a static prefix to every derived ID, to keep sagas sharing a
    /// key space apart.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
}

#[async_trait]
impl<S: Saga> MappingStrategy<S> for DirectMapping {
    async fn resolve(
        &self,
        _saga: &S,
        _ctx: &DeliveryContext,
        envelope: &Envelope,
    ) -> Result<Resolution> {
        Ok(match (self.key)(envelope) {
            Some(key) => {
                Resolution::Instance(InstanceId::from_parts(self.prefix.as_deref(), &key))
            }
            None => Resolution::NotMapped,
        })
    }

    async fn update(
        &self,
        _saga: &S,
        _ctx: &DeliveryContext,
        _instance: &Instance<S::Data>,
    ) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Key-set
// =============================================================================

/// Storage for key-to-instance lookups of one saga.
///
/// `save_keys` must reject a key already owned by a *different* instance of
/// the same saga with [`Error::Integrity`]; disjointness is a store-level
/// invariant, not the saga's concern.
#[async_trait]
pub trait KeySetRepository: Send + Sync + 'static {
    /// The instance owning a key, if any. Reads committed state.
    async fn find_by_key(&self, saga_name: &str, key: &str) -> Result<Option<InstanceId>>;

    /// Replace an instance's key set. Participates in the caller's
    /// transaction.
    async fn save_keys(
        &self,
        tx: &Tx,
        saga_name: &str,
        instance: &InstanceId,
        keys: &BTreeSet<String>,
    ) -> Result<()>;
}

/// Maps messages to instances through a persisted key lookup.
pub struct KeySetMapping {
    key: KeyFn,
    repository: Arc<dyn KeySetRepository>,
}

impl KeySetMapping {
    /// Map via a key extracted from the envelope, resolved through the
    /// repository.
    pub fn new(
        key: impl Fn(&Envelope) -> Option<String> + Send + Sync + 'static,
        repository: Arc<dyn KeySetRepository>,
    ) -> Self {
        Self {
            key: Box::new(key),
            repository,
        }
    }
}

#[async_trait]
impl<S: Saga> MappingStrategy<S> for KeySetMapping {
    async fn resolve(
        &self,
        saga: &S,
        _ctx: &DeliveryContext,
        envelope: &Envelope,
    ) -> Result<Resolution> {
        let is_trigger = saga
            .triggers()
            .iter()
            .any(|(t, _)| *t == envelope.message_type());

        if let Some(key) = (self.key)(envelope) {
            if let Some(id) = self.repository.find_by_key(saga.name(), &key).await? {
                trace!(saga = saga.name(), key, instance = %id, "key mapped");
                return Ok(Resolution::Instance(id));
            }
        }
        if is_trigger {
            // No owner yet; a trigger starts a fresh instance.
            return Ok(Resolution::Instance(InstanceId::generate()));
        }
        Ok(Resolution::NotMapped)
    }

    async fn update(
        &self,
        saga: &S,
        ctx: &DeliveryContext,
        instance: &Instance<S::Data>,
    ) -> Result<()> {
        let keys = saga.mapping_keys(&instance.data);
        if keys.is_empty() {
            return Err(Error::validation(format!(
                "saga {} instance {} rebuilt an empty key set",
                saga.name(),
                instance.id
            )));
        }
        let tx = ctx.require_tx()?;
        self.repository
            .save_keys(tx, saga.name(), &instance.id, &keys)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AnyMessage, Message, MessageKind};
    use crate::saga::SagaScope;
    use crate::testing::{CapturingSender, MemoryDataStore, MemoryKeySetRepository};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: String,
    }

    impl Message for OrderPlaced {
        const TYPE: &'static str = "shop.order.Placed";
        const KIND: MessageKind = MessageKind::Event;
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct OrderData {
        order_id: Option<String>,
    }

    struct OrderSaga;

    #[async_trait]
    impl Saga for OrderSaga {
        type Data = OrderData;

        fn name(&self) -> &'static str {
            "order"
        }

        fn triggers(&self) -> &'static [(&'static str, MessageKind)] {
            &[("shop.order.Placed", MessageKind::Event)]
        }

        async fn handle(
            &self,
            _envelope: &Envelope,
            _scope: &mut SagaScope<'_, Self>,
        ) -> Result<()> {
            Ok(())
        }

        fn apply(&self, _data: &mut Self::Data, _event: &dyn AnyMessage) {}

        fn mapping_keys(&self, data: &Self::Data) -> BTreeSet<String> {
            data.order_id.iter().cloned().collect()
        }
    }

    fn order_key(envelope: &Envelope) -> Option<String> {
        envelope
            .message()
            .downcast_ref::<OrderPlaced>()
            .map(|m| m.order_id.clone())
    }

    fn ctx() -> DeliveryContext {
        DeliveryContext::new(
            Some(Arc::new(MemoryDataStore::new())),
            Arc::new(CapturingSender::new()),
        )
    }

    fn placed(order_id: &str) -> Envelope {
        Envelope::new(OrderPlaced {
            order_id: order_id.into(),
        })
    }

    // =========================================================================
    // Direct
    // =========================================================================

    #[tokio::test]
    async fn direct_mapping_is_deterministic() {
        let mapping = DirectMapping::new(order_key).with_prefix("order");
        let ctx = ctx();

        let a = mapping.resolve(&OrderSaga, &ctx, &placed("42")).await.unwrap();
        let b = mapping.resolve(&OrderSaga, &ctx, &placed("42")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a, Resolution::Instance(InstanceId::new("order-42")));
    }

    #[tokio::test]
    async fn direct_mapping_without_key_is_not_mapped() {
        let mapping = DirectMapping::new(|_| None);
        let res = MappingStrategy::<OrderSaga>::resolve(&mapping, &OrderSaga, &ctx(), &placed("42"))
            .await
            .unwrap();
        assert_eq!(res, Resolution::NotMapped);
    }

    // =========================================================================
    // Key-set
    // =========================================================================

    async fn persist_keys(mapping: &KeySetMapping, id: &InstanceId, order_id: &str) {
        let mut ctx = ctx();
        let store = ctx.data_store().unwrap();
        let tx = store.begin().await.unwrap();
        ctx.set_tx(tx.clone());
        let instance = Instance {
            id: id.clone(),
            data: OrderData {
                order_id: Some(order_id.into()),
            },
            revision: crate::saga::Revision::NONE.next(),
        };
        mapping.update(&OrderSaga, &ctx, &instance).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn trigger_without_owner_gets_a_fresh_instance() {
        let repo = Arc::new(MemoryKeySetRepository::new());
        let mapping = KeySetMapping::new(order_key, repo);

        match mapping.resolve(&OrderSaga, &ctx(), &placed("7")).await.unwrap() {
            Resolution::Instance(_) => {}
            other => panic!("expected a fresh instance, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn saved_keys_resolve_back_to_their_instance() {
        let repo = Arc::new(MemoryKeySetRepository::new());
        let mapping = KeySetMapping::new(order_key, repo.clone());
        let id = InstanceId::new("inst-1");
        persist_keys(&mapping, &id, "7").await;

        let res = mapping.resolve(&OrderSaga, &ctx(), &placed("7")).await.unwrap();
        assert_eq!(res, Resolution::Instance(id));
    }

    #[tokio::test]
    async fn non_trigger_without_owner_is_not_mapped() {
        #[derive(Debug, Clone, Serialize, Deserialize)]
        struct Shipped {
            order_id: String,
        }

        impl Message for Shipped {
            const TYPE: &'static str = "shop.order.Shipped";
            const KIND: MessageKind = MessageKind::Event;
        }

        let repo = Arc::new(MemoryKeySetRepository::new());
        let mapping = KeySetMapping::new(
            |e| {
                e.message()
                    .downcast_ref::<Shipped>()
                    .map(|m| m.order_id.clone())
            },
            repo,
        );

        let res = mapping
            .resolve(
                &OrderSaga,
                &ctx(),
                &Envelope::new(Shipped {
                    order_id: "7".into(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(res, Resolution::NotMapped);
    }

    #[tokio::test]
    async fn key_sets_must_stay_disjoint() {
        let repo = Arc::new(MemoryKeySetRepository::new());
        let mapping = KeySetMapping::new(order_key, repo.clone());
        persist_keys(&mapping, &InstanceId::new("inst-1"), "7").await;

        // A different instance claiming the same key is a store integrity
        // violation.
        let mut ctx2 = ctx();
        let store = ctx2.data_store().unwrap();
        ctx2.set_tx(store.begin().await.unwrap());
        let rival = Instance {
            id: InstanceId::new("inst-2"),
            data: OrderData {
                order_id: Some("7".into()),
            },
            revision: crate::saga::Revision::NONE.next(),
        };
        let err = mapping.update(&OrderSaga, &ctx2, &rival).await.unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
    }

    #[tokio::test]
    async fn empty_rebuilt_key_set_is_rejected() {
        let repo = Arc::new(MemoryKeySetRepository::new());
        let mapping = KeySetMapping::new(order_key, repo);

        let mut ctx = ctx();
        let store = ctx.data_store().unwrap();
        ctx.set_tx(store.begin().await.unwrap());
        let instance = Instance::<OrderData>::new(InstanceId::new("inst-1"));
        let err = mapping.update(&OrderSaga, &ctx, &instance).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
