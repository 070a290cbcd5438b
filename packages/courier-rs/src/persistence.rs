//! CRUD persistence for saga instances.
//!
//! # Overview
//!
//! The simplest way to store a saga: serialize the whole data document and
//! overwrite it on every save, guarded by optimistic concurrency. The
//! repository stores the data as opaque JSON so one table serves every
//! saga.
//!
//! A save carries the revision the caller loaded; if the store has moved
//! past it the save fails with [`Error::Conflict`] and the caller restarts
//! the whole unit of work (reload, re-handle). On success the revision
//! advances by the number of newly recorded events, keeping `revision ==
//! applied state changes` even though CRUD storage never sees the events
//! themselves.
//!
//! The alternative is event sourcing; see
//! [`eventsourcing`](crate::eventsourcing).

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::message::AnyMessage;
use crate::pipeline::DeliveryContext;
use crate::saga::{Instance, InstanceId, Revision, Saga};
use crate::storage::Tx;

/// A saga instance as the repository stores it: data opaque, revision
/// explicit.
#[derive(Debug, Clone)]
pub struct StoredInstance {
    /// Instance identity.
    pub id: InstanceId,
    /// Revision of the stored data.
    pub revision: Revision,
    /// Serialized business data.
    pub data: serde_json::Value,
}

/// Storage for CRUD-persisted saga instances.
///
/// `save` must compare `expected` with the stored revision and fail with
/// [`Error::Conflict`] on a mismatch, leaving the stored instance
/// unchanged.
#[async_trait]
pub trait SagaRepository: Send + Sync + 'static {
    /// Load an instance. Reads committed state.
    async fn load(&self, saga_name: &str, id: &InstanceId) -> Result<Option<StoredInstance>>;

    /// Save an instance, guarded by the expected revision. Participates in
    /// the caller's transaction.
    async fn save(
        &self,
        tx: &Tx,
        saga_name: &str,
        instance: &StoredInstance,
        expected: Revision,
    ) -> Result<()>;
}

/// Loads and saves typed instances for one saga; chosen per saga at
/// endpoint assembly.
#[async_trait]
pub trait SagaPersister<S: Saga>: Send + Sync + 'static {
    /// Load the instance, or `None` if it does not exist.
    async fn load(
        &self,
        ctx: &DeliveryContext,
        saga: &S,
        id: &InstanceId,
    ) -> Result<Option<Instance<S::Data>>>;

    /// Persist the instance with the events recorded this invocation,
    /// advancing its revision on success. Participates in the ambient
    /// transaction.
    async fn save(
        &self,
        ctx: &DeliveryContext,
        saga: &S,
        instance: &mut Instance<S::Data>,
        recorded: &[Arc<dyn AnyMessage>],
    ) -> Result<()>;
}

/// Document-per-instance persistence over a [`SagaRepository`].
pub struct CrudPersister {
    repository: Arc<dyn SagaRepository>,
}

impl CrudPersister {
    /// Wrap a repository.
    pub fn new(repository: Arc<dyn SagaRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl<S: Saga> SagaPersister<S> for CrudPersister {
    async fn load(
        &self,
        _ctx: &DeliveryContext,
        saga: &S,
        id: &InstanceId,
    ) -> Result<Option<Instance<S::Data>>> {
        let Some(stored) = self.repository.load(saga.name(), id).await? else {
            return Ok(None);
        };
        let data: S::Data = serde_json::from_value(stored.data).map_err(|e| {
            Error::integrity(format!(
                "saga {} instance {id} holds undecodable data: {e}",
                saga.name()
            ))
        })?;
        Ok(Some(Instance {
            id: stored.id,
            data,
            revision: stored.revision,
        }))
    }

    async fn save(
        &self,
        ctx: &DeliveryContext,
        saga: &S,
        instance: &mut Instance<S::Data>,
        recorded: &[Arc<dyn AnyMessage>],
    ) -> Result<()> {
        let expected = instance.revision;
        let advanced = expected.advance(recorded.len() as u64);
        let data = serde_json::to_value(&instance.data)
            .map_err(|e| Error::validation(format!("serialize saga {} data: {e}", saga.name())))?;
        let stored = StoredInstance {
            id: instance.id.clone(),
            revision: advanced,
            data,
        };
        self.repository
            .save(ctx.require_tx()?, saga.name(), &stored, expected)
            .await?;
        instance.revision = advanced;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::message::{Message, MessageKind};
    use crate::saga::SagaScope;
    use crate::storage::DataStore;
    use crate::testing::{CapturingSender, MemoryDataStore, MemorySagaRepository};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct TallyData {
        total: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Added {
        amount: i64,
    }

    impl Message for Added {
        const TYPE: &'static str = "tally.Added";
        const KIND: MessageKind = MessageKind::Event;
    }

    struct Tally;

    #[async_trait]
    impl Saga for Tally {
        type Data = TallyData;

        fn name(&self) -> &'static str {
            "tally"
        }

        fn triggers(&self) -> &'static [(&'static str, MessageKind)] {
            &[("tally.Added", MessageKind::Event)]
        }

        async fn handle(
            &self,
            _envelope: &Envelope,
            _scope: &mut SagaScope<'_, Self>,
        ) -> Result<()> {
            Ok(())
        }

        fn apply(&self, data: &mut Self::Data, event: &dyn crate::message::AnyMessage) {
            if let Some(added) = event.downcast_ref::<Added>() {
                data.total += added.amount;
            }
        }
    }

    fn recorded(amounts: &[i64]) -> Vec<Arc<dyn AnyMessage>> {
        amounts
            .iter()
            .map(|&amount| Arc::new(Added { amount }) as Arc<dyn AnyMessage>)
            .collect()
    }

    async fn ctx_with_tx(store: &Arc<MemoryDataStore>) -> DeliveryContext {
        let mut ctx = DeliveryContext::new(
            Some(store.clone() as Arc<dyn crate::storage::DataStore>),
            Arc::new(CapturingSender::new()),
        );
        ctx.set_tx(store.begin().await.unwrap());
        ctx
    }

    async fn commit(ctx: &mut DeliveryContext) {
        ctx.clear_tx().unwrap().commit().await.unwrap();
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = Arc::new(MemoryDataStore::new());
        let persister = CrudPersister::new(Arc::new(MemorySagaRepository::new()));
        let id = InstanceId::new("t1");

        let mut ctx = ctx_with_tx(&store).await;
        let mut instance = Instance::<TallyData>::new(id.clone());
        instance.data.total = 5;
        persister
            .save(&ctx, &Tally, &mut instance, &recorded(&[5]))
            .await
            .unwrap();
        commit(&mut ctx).await;
        assert_eq!(instance.revision, Revision::NONE.next());

        let ctx = ctx_with_tx(&store).await;
        let loaded = SagaPersister::<Tally>::load(&persister, &ctx, &Tally, &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.data, TallyData { total: 5 });
        assert_eq!(loaded.revision, Revision::NONE.next());
    }

    #[tokio::test]
    async fn missing_instance_loads_as_none() {
        let store = Arc::new(MemoryDataStore::new());
        let persister = CrudPersister::new(Arc::new(MemorySagaRepository::new()));
        let ctx = ctx_with_tx(&store).await;
        let loaded =
            SagaPersister::<Tally>::load(&persister, &ctx, &Tally, &InstanceId::new("nope"))
                .await
                .unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn revision_advances_by_recorded_event_count() {
        let store = Arc::new(MemoryDataStore::new());
        let persister = CrudPersister::new(Arc::new(MemorySagaRepository::new()));

        let mut ctx = ctx_with_tx(&store).await;
        let mut instance = Instance::<TallyData>::new(InstanceId::new("t1"));
        persister
            .save(&ctx, &Tally, &mut instance, &recorded(&[1, 2, 3]))
            .await
            .unwrap();
        commit(&mut ctx).await;
        assert_eq!(instance.revision.value(), 3);
    }

    #[tokio::test]
    async fn stale_revision_conflicts_and_leaves_the_store_unchanged() {
        let store = Arc::new(MemoryDataStore::new());
        let repository = Arc::new(MemorySagaRepository::new());
        let persister = CrudPersister::new(repository.clone());
        let id = InstanceId::new("t1");

        let mut ctx = ctx_with_tx(&store).await;
        let mut current = Instance::<TallyData>::new(id.clone());
        let mut stale = current.clone();
        current.data.total = 1;
        persister
            .save(&ctx, &Tally, &mut current, &recorded(&[1]))
            .await
            .unwrap();
        commit(&mut ctx).await;

        let ctx = ctx_with_tx(&store).await;
        stale.data.total = 99;
        let err = persister
            .save(&ctx, &Tally, &mut stale, &recorded(&[99]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        // The stale instance keeps its old revision.
        assert_eq!(stale.revision, Revision::NONE);

        let ctx2 = ctx_with_tx(&store).await;
        let loaded = SagaPersister::<Tally>::load(&persister, &ctx2, &Tally, &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.data, TallyData { total: 1 });
    }

    #[tokio::test]
    async fn save_without_ambient_tx_is_a_config_error() {
        let persister = CrudPersister::new(Arc::new(MemorySagaRepository::new()));
        let ctx = DeliveryContext::new(None, Arc::new(CapturingSender::new()));
        let mut instance = Instance::<TallyData>::new(InstanceId::new("t1"));
        let err = persister
            .save(&ctx, &Tally, &mut instance, &recorded(&[1]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
