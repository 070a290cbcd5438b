//! Event-sourced persistence for saga instances.
//!
//! # Overview
//!
//! Instead of overwriting a data document, the persister appends the events
//! recorded by each invocation to a per-instance stream. State is
//! reconstructed by replaying the stream through the saga's `apply`
//! function, the same function that applied the events at handling time, so
//! the two paths cannot drift.
//!
//! Appends are guarded by the expected revision: appending at an offset the
//! stream has moved past is a [`Error::Conflict`], same contract as CRUD
//! saves.
//!
//! # Snapshots
//!
//! Replaying a long-lived instance from event zero gets slow. A
//! [`SnapshotRepository`] stores the materialized data at a revision;
//! loading starts from the latest snapshot and replays only the tail. A
//! snapshot is written whenever an append crosses a multiple of the
//! snapshot frequency (default 1000), in the same transaction as the
//! append.
//!
//! A snapshot that belongs to a different saga than the one loading it
//! means cross-wired storage; that is a fatal
//! [`Error::Integrity`](crate::Error::Integrity), never retried.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{Error, Result};
use crate::message::AnyMessage;
use crate::persistence::SagaPersister;
use crate::pipeline::DeliveryContext;
use crate::saga::{Instance, InstanceId, Revision, Saga};
use crate::storage::Tx;

/// Default number of revisions between snapshots.
pub const DEFAULT_SNAPSHOT_FREQUENCY: u64 = 1000;

/// An ordered, append-only event stream per saga instance.
///
/// A production implementation serializes events through a
/// [`Codec`](crate::codec::Codec); the contract here is only about order
/// and offsets.
#[async_trait]
pub trait EventStream: Send + Sync + 'static {
    /// Append events at the expected offset. An offset mismatch is a
    /// [`Error::Conflict`]; the stream stays unchanged. Participates in the
    /// caller's transaction.
    async fn append(
        &self,
        tx: &Tx,
        saga_name: &str,
        id: &InstanceId,
        expected: Revision,
        events: &[Arc<dyn AnyMessage>],
    ) -> Result<()>;

    /// The events after the given revision, in append order. Reads
    /// committed state.
    async fn open(
        &self,
        saga_name: &str,
        id: &InstanceId,
        after: Revision,
    ) -> Result<Vec<Arc<dyn AnyMessage>>>;
}

/// Materialized instance data at a revision.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// The saga the instance belongs to.
    pub saga: String,
    /// Instance identity.
    pub instance: InstanceId,
    /// Revision the data reflects.
    pub revision: Revision,
    /// Serialized business data.
    pub data: serde_json::Value,
    /// When the snapshot was written.
    pub taken_at: DateTime<Utc>,
}

/// Storage for snapshots. Only the highest-revision snapshot per instance
/// is authoritative; implementations may drop older ones.
#[async_trait]
pub trait SnapshotRepository: Send + Sync + 'static {
    /// The latest snapshot for an instance, if any. Reads committed state.
    async fn load_snapshot(&self, saga_name: &str, id: &InstanceId) -> Result<Option<Snapshot>>;

    /// Store a snapshot. Participates in the caller's transaction.
    async fn save_snapshot(&self, tx: &Tx, snapshot: Snapshot) -> Result<()>;
}

/// Stream-backed persistence with optional snapshotting.
pub struct EventSourcedPersister {
    stream: Arc<dyn EventStream>,
    snapshots: Option<Arc<dyn SnapshotRepository>>,
    frequency: u64,
}

impl EventSourcedPersister {
    /// Persist through a stream, without snapshots.
    pub fn new(stream: Arc<dyn EventStream>) -> Self {
        Self {
            stream,
            snapshots: None,
            frequency: DEFAULT_SNAPSHOT_FREQUENCY,
        }
    }

    /// Enable snapshotting through a repository.
    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotRepository>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Set the number of revisions between snapshots. Values below 1 are
    /// treated as 1.
    pub fn with_snapshot_frequency(mut self, frequency: u64) -> Self {
        self.frequency = frequency.max(1);
        self
    }

    fn crosses_boundary(&self, before: Revision, after: Revision) -> bool {
        before.value() / self.frequency != after.value() / self.frequency
    }
}

#[async_trait]
impl<S: Saga> SagaPersister<S> for EventSourcedPersister {
    async fn load(
        &self,
        _ctx: &DeliveryContext,
        saga: &S,
        id: &InstanceId,
    ) -> Result<Option<Instance<S::Data>>> {
        let mut data = S::Data::default();
        let mut revision = Revision::NONE;
        let mut from_snapshot = false;

        if let Some(snapshots) = &self.snapshots {
            if let Some(snapshot) = snapshots.load_snapshot(saga.name(), id).await? {
                if snapshot.saga != saga.name() {
                    return Err(Error::integrity(format!(
                        "snapshot for instance {id} belongs to saga {}, expected {}",
                        snapshot.saga,
                        saga.name()
                    )));
                }
                data = serde_json::from_value(snapshot.data).map_err(|e| {
                    Error::integrity(format!(
                        "snapshot for saga {} instance {id} holds undecodable data: {e}",
                        saga.name()
                    ))
                })?;
                revision = snapshot.revision;
                from_snapshot = true;
            }
        }

        let tail = self.stream.open(saga.name(), id, revision).await?;
        if tail.is_empty() && !from_snapshot {
            return Ok(None);
        }
        debug!(
            saga = saga.name(),
            instance = %id,
            snapshot = %revision,
            replayed = tail.len(),
            "reconstructed instance"
        );
        for event in &tail {
            saga.apply(&mut data, event.as_ref());
            revision = revision.next();
        }
        Ok(Some(Instance {
            id: id.clone(),
            data,
            revision,
        }))
    }

    async fn save(
        &self,
        ctx: &DeliveryContext,
        saga: &S,
        instance: &mut Instance<S::Data>,
        recorded: &[Arc<dyn AnyMessage>],
    ) -> Result<()> {
        let tx = ctx.require_tx()?;
        let expected = instance.revision;
        self.stream
            .append(tx, saga.name(), &instance.id, expected, recorded)
            .await?;
        let advanced = expected.advance(recorded.len() as u64);

        if let Some(snapshots) = &self.snapshots {
            if self.crosses_boundary(expected, advanced) {
                let data = serde_json::to_value(&instance.data).map_err(|e| {
                    Error::validation(format!("serialize saga {} snapshot: {e}", saga.name()))
                })?;
                snapshots
                    .save_snapshot(
                        tx,
                        Snapshot {
                            saga: saga.name().to_string(),
                            instance: instance.id.clone(),
                            revision: advanced,
                            data,
                            taken_at: Utc::now(),
                        },
                    )
                    .await?;
            }
        }
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
    use crate::testing::{
        CapturingSender, MemoryDataStore, MemoryEventStream, MemorySnapshotRepository,
    };
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct LedgerData {
        balance: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Credited {
        amount: i64,
    }

    impl Message for Credited {
        const TYPE: &'static str = "ledger.Credited";
        const KIND: MessageKind = MessageKind::Event;
    }

    struct Ledger;

    #[async_trait]
    impl Saga for Ledger {
        type Data = LedgerData;

        fn name(&self) -> &'static str {
            "ledger"
        }

        fn triggers(&self) -> &'static [(&'static str, MessageKind)] {
            &[("ledger.Credited", MessageKind::Event)]
        }

        async fn handle(
            &self,
            _envelope: &Envelope,
            _scope: &mut SagaScope<'_, Self>,
        ) -> Result<()> {
            Ok(())
        }

        fn apply(&self, data: &mut Self::Data, event: &dyn AnyMessage) {
            if let Some(credited) = event.downcast_ref::<Credited>() {
                data.balance += credited.amount;
            }
        }
    }

    fn credits(amounts: &[i64]) -> Vec<Arc<dyn AnyMessage>> {
        amounts
            .iter()
            .map(|&amount| Arc::new(Credited { amount }) as Arc<dyn AnyMessage>)
            .collect()
    }

    struct Fixture {
        store: Arc<MemoryDataStore>,
        snapshots: Arc<MemorySnapshotRepository>,
        persister: EventSourcedPersister,
    }

    fn fixture() -> Fixture {
        let snapshots = Arc::new(MemorySnapshotRepository::new());
        Fixture {
            store: Arc::new(MemoryDataStore::new()),
            snapshots: snapshots.clone(),
            persister: EventSourcedPersister::new(Arc::new(MemoryEventStream::new()))
                .with_snapshots(snapshots),
        }
    }

    impl Fixture {
        async fn ctx_with_tx(&self) -> DeliveryContext {
            let mut ctx = DeliveryContext::new(
                Some(self.store.clone() as Arc<dyn crate::storage::DataStore>),
                Arc::new(CapturingSender::new()),
            );
            ctx.set_tx(self.store.begin().await.unwrap());
            ctx
        }

        /// Load, append the events, commit.
        async fn append(&self, id: &InstanceId, amounts: &[i64]) -> Result<Instance<LedgerData>> {
            let mut ctx = self.ctx_with_tx().await;
            let mut instance =
                SagaPersister::<Ledger>::load(&self.persister, &ctx, &Ledger, id)
                    .await?
                    .unwrap_or_else(|| Instance::new(id.clone()));
            for event in credits(amounts) {
                Ledger.apply(&mut instance.data, event.as_ref());
            }
            self.persister
                .save(&ctx, &Ledger, &mut instance, &credits(amounts))
                .await?;
            ctx.clear_tx().unwrap().commit().await.unwrap();
            Ok(instance)
        }

        async fn load(&self, id: &InstanceId) -> Option<Instance<LedgerData>> {
            let ctx = self.ctx_with_tx().await;
            SagaPersister::<Ledger>::load(&self.persister, &ctx, &Ledger, id)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn replay_reconstructs_state_and_revision() {
        let f = fixture();
        let id = InstanceId::new("acct-1");
        f.append(&id, &[10, 20]).await.unwrap();
        f.append(&id, &[-5]).await.unwrap();

        let loaded = f.load(&id).await.unwrap();
        assert_eq!(loaded.data, LedgerData { balance: 25 });
        assert_eq!(loaded.revision.value(), 3);
    }

    #[tokio::test]
    async fn unknown_instance_loads_as_none() {
        let f = fixture();
        assert!(f.load(&InstanceId::new("nope")).await.is_none());
    }

    #[tokio::test]
    async fn stale_append_conflicts() {
        let f = fixture();
        let id = InstanceId::new("acct-1");
        f.append(&id, &[10]).await.unwrap();

        let ctx = f.ctx_with_tx().await;
        let mut stale = Instance::<LedgerData>::new(id.clone());
        let err = f
            .persister
            .save(&ctx, &Ledger, &mut stale, &credits(&[1]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(stale.revision, Revision::NONE);
    }

    #[tokio::test]
    async fn snapshot_written_exactly_when_a_boundary_is_crossed() {
        let f = fixture();
        let id = InstanceId::new("acct-1");

        // 1..=999: below the default frequency, no snapshot.
        f.append(&id, &vec![1; 999]).await.unwrap();
        assert_eq!(f.snapshots.saves(), 0);

        // 999 -> 1001 crosses 1000 exactly once.
        f.append(&id, &[1, 1]).await.unwrap();
        assert_eq!(f.snapshots.saves(), 1);

        let snapshot = f
            .snapshots
            .load_snapshot("ledger", &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.revision.value(), 1001);
    }

    #[tokio::test]
    async fn load_from_snapshot_replays_only_the_tail() {
        let f = fixture();
        let id = InstanceId::new("acct-1");
        f.append(&id, &vec![1; 1000]).await.unwrap();
        f.append(&id, &[5]).await.unwrap();

        let loaded = f.load(&id).await.unwrap();
        assert_eq!(loaded.data, LedgerData { balance: 1005 });
        assert_eq!(loaded.revision.value(), 1001);
    }

    #[tokio::test]
    async fn snapshot_from_another_saga_is_an_integrity_error() {
        let f = fixture();
        let id = InstanceId::new("acct-1");
        f.append(&id, &[1]).await.unwrap();

        // Cross-wire the storage: hand the instance a snapshot written by a
        // different saga.
        let ctx = f.ctx_with_tx().await;
        let tx = ctx.tx().unwrap().clone();
        f.snapshots
            .save_snapshot(
                &tx,
                Snapshot {
                    saga: "impostor".to_string(),
                    instance: id.clone(),
                    revision: Revision::NONE.next(),
                    data: serde_json::json!({"balance": 0}),
                    taken_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let ctx = f.ctx_with_tx().await;
        let err = SagaPersister::<Ledger>::load(&f.persister, &ctx, &Ledger, &id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
    }
}
