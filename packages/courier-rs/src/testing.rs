//! In-memory fakes for tests and local development.
//!
//! Available to downstream crates through the `testing` feature. Everything
//! here honors the same contracts as a real adapter: the repositories stage
//! their writes on the transaction and apply them at commit, the saga
//! repositories enforce optimistic concurrency, and the key-set repository
//! enforces disjointness. Tests against these fakes exercise the same
//! failure paths a database-backed deployment hits.

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::envelope::{Envelope, InboundEnvelope, MessageId, Operation, OutboundEnvelope};
use crate::error::{Error, Result};
use crate::eventsourcing::{EventStream, Snapshot, SnapshotRepository};
use crate::mapping::KeySetRepository;
use crate::message::AnyMessage;
use crate::outbox::{OutboxMessage, OutboxRepository};
use crate::persistence::{SagaRepository, StoredInstance};
use crate::pipeline::{OutboundNext, OutboundStage, Sender};
use crate::saga::{InstanceId, Revision};
use crate::storage::{DataStore, Tx, TxHandle};
use crate::transport::{Receipt, Transport};

// =============================================================================
// Receipts
// =============================================================================

/// Receipt that accepts every outcome and records nothing.
pub struct NullReceipt;

#[async_trait]
impl Receipt for NullReceipt {
    async fn ack(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn retry(self: Box<Self>, _delay: Duration, _err: &Error) -> Result<()> {
        Ok(())
    }

    async fn reject(self: Box<Self>, _err: &Error) -> Result<()> {
        Ok(())
    }
}

/// How a delivery attempt was signaled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptOutcome {
    Acked,
    Retried { delay: Duration },
    Rejected,
}

/// Shared log of receipt outcomes, observed from the test body.
#[derive(Debug, Clone, Default)]
pub struct ReceiptLog {
    outcomes: Arc<Mutex<Vec<ReceiptOutcome>>>,
}

impl ReceiptLog {
    /// Everything signaled so far, in order.
    pub fn outcomes(&self) -> Vec<ReceiptOutcome> {
        self.outcomes.lock().unwrap().clone()
    }

    fn push(&self, outcome: ReceiptOutcome) {
        self.outcomes.lock().unwrap().push(outcome);
    }
}

/// Receipt that records its outcome into a [`ReceiptLog`].
pub struct RecordingReceipt {
    log: ReceiptLog,
}

impl RecordingReceipt {
    /// A boxed receipt writing into the given log.
    pub fn boxed(log: &ReceiptLog) -> Box<Self> {
        Box::new(Self { log: log.clone() })
    }
}

#[async_trait]
impl Receipt for RecordingReceipt {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.log.push(ReceiptOutcome::Acked);
        Ok(())
    }

    async fn retry(self: Box<Self>, delay: Duration, _err: &Error) -> Result<()> {
        self.log.push(ReceiptOutcome::Retried { delay });
        Ok(())
    }

    async fn reject(self: Box<Self>, _err: &Error) -> Result<()> {
        self.log.push(ReceiptOutcome::Rejected);
        Ok(())
    }
}

// =============================================================================
// Senders and stages
// =============================================================================

/// Sender that collects envelopes instead of sending them.
#[derive(Default)]
pub struct CapturingSender {
    sent: Mutex<Vec<OutboundEnvelope>>,
}

impl CapturingSender {
    /// An empty sender.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything sent so far.
    pub fn take(&self) -> Vec<OutboundEnvelope> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }
}

#[async_trait]
impl Sender for CapturingSender {
    async fn send_message(&self, outbound: OutboundEnvelope) -> Result<()> {
        self.sent.lock().unwrap().push(outbound);
        Ok(())
    }
}

/// Terminal outbound stage that collects envelopes.
#[derive(Default)]
pub struct CapturingStage {
    accepted: Mutex<Vec<OutboundEnvelope>>,
}

impl CapturingStage {
    /// An empty stage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything accepted so far.
    pub fn take(&self) -> Vec<OutboundEnvelope> {
        std::mem::take(&mut self.accepted.lock().unwrap())
    }
}

#[async_trait]
impl OutboundStage for CapturingStage {
    async fn accept(&self, outbound: OutboundEnvelope, _next: OutboundNext<'_>) -> Result<()> {
        self.accepted.lock().unwrap().push(outbound);
        Ok(())
    }
}

// =============================================================================
// Data store
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Open,
    Committed,
    RolledBack,
}

/// A journaling in-memory transaction.
///
/// Repositories stage closures against their own committed state; commit
/// runs the journal in order, rollback drops it. Conflict and disjointness
/// checks happen at stage time against committed state, mirroring a
/// database that checks on write. Constraints that must hold against
/// *other* transactions (the outbox unique key) are staged as checked
/// writes: they re-check at commit and fail it. A failing write aborts the
/// remaining journal.
pub struct MemoryTx {
    journal: Mutex<Vec<Box<dyn FnOnce() -> Result<()> + Send>>>,
    state: Mutex<TxState>,
}

impl MemoryTx {
    fn new() -> Self {
        Self {
            journal: Mutex::new(Vec::new()),
            state: Mutex::new(TxState::Open),
        }
    }

    /// Stage one write to run at commit.
    pub fn stage(&self, write: impl FnOnce() + Send + 'static) {
        self.stage_checked(move || {
            write();
            Ok(())
        });
    }

    /// Stage one write that may still fail at commit, the way a database
    /// enforces a unique constraint on write.
    pub fn stage_checked(&self, write: impl FnOnce() -> Result<()> + Send + 'static) {
        self.journal.lock().unwrap().push(Box::new(write));
    }

    fn close(&self, target: TxState) -> Result<Vec<Box<dyn FnOnce() -> Result<()> + Send>>> {
        let mut state = self.state.lock().unwrap();
        let current = *state;
        if current != TxState::Open {
            return Err(Error::store(anyhow::anyhow!(
                "transaction already {current:?}"
            )));
        }
        *state = target;
        Ok(std::mem::take(&mut self.journal.lock().unwrap()))
    }
}

#[async_trait]
impl TxHandle for MemoryTx {
    async fn commit(&self) -> Result<()> {
        for write in self.close(TxState::Committed)? {
            write()?;
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.close(TxState::RolledBack)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Data store handing out [`MemoryTx`] transactions.
#[derive(Default)]
pub struct MemoryDataStore;

impl MemoryDataStore {
    /// A fresh store.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn begin(&self) -> Result<Tx> {
        Ok(Tx::new(Arc::new(MemoryTx::new())))
    }
}

fn memory_tx(tx: &Tx) -> Result<&MemoryTx> {
    tx.downcast_ref::<MemoryTx>()
        .ok_or_else(|| Error::store(anyhow::anyhow!("transaction is not a MemoryTx")))
}

// =============================================================================
// Outbox
// =============================================================================

type OutboxState = Arc<Mutex<HashMap<MessageId, Vec<OutboxMessage>>>>;

fn duplicate_outbox_entry(message_id: MessageId) -> Error {
    Error::store(anyhow::anyhow!(
        "outbox entry for {message_id} already exists"
    ))
}

/// In-memory [`OutboxRepository`].
///
/// `save_outbox` enforces the one-entry-per-message unique key: it rejects
/// a duplicate at stage time against committed state, and again at commit
/// for the case where two open transactions both passed the first check.
#[derive(Default)]
pub struct MemoryOutboxRepository {
    state: OutboxState,
}

impl MemoryOutboxRepository {
    /// An empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip every entry under a causation back to unsent, simulating a
    /// crash between send and confirm.
    pub fn force_unsent(&self, causation_id: MessageId) {
        if let Some(entries) = self.state.lock().unwrap().get_mut(&causation_id) {
            for entry in entries {
                entry.sent = false;
            }
        }
    }
}

#[async_trait]
impl OutboxRepository for MemoryOutboxRepository {
    async fn load_outbox(&self, message_id: MessageId) -> Result<Option<Vec<OutboxMessage>>> {
        Ok(self.state.lock().unwrap().get(&message_id).cloned())
    }

    async fn save_outbox(
        &self,
        tx: &Tx,
        message_id: MessageId,
        messages: &[OutboundEnvelope],
    ) -> Result<()> {
        if self.state.lock().unwrap().contains_key(&message_id) {
            return Err(duplicate_outbox_entry(message_id));
        }
        let entries: Vec<OutboxMessage> = messages
            .iter()
            .map(|envelope| OutboxMessage {
                envelope: envelope.clone(),
                sent: false,
            })
            .collect();
        let state = self.state.clone();
        memory_tx(tx)?.stage_checked(move || {
            match state.lock().unwrap().entry(message_id) {
                Entry::Occupied(_) => Err(duplicate_outbox_entry(message_id)),
                Entry::Vacant(slot) => {
                    slot.insert(entries);
                    Ok(())
                }
            }
        });
        Ok(())
    }

    async fn mark_as_sent(
        &self,
        tx: &Tx,
        causation_id: MessageId,
        message_id: MessageId,
    ) -> Result<()> {
        let state = self.state.clone();
        memory_tx(tx)?.stage(move || {
            if let Some(entries) = state.lock().unwrap().get_mut(&causation_id) {
                for entry in entries {
                    if entry.envelope.envelope().message_id() == message_id {
                        entry.sent = true;
                    }
                }
            }
        });
        Ok(())
    }
}

// =============================================================================
// Saga storage
// =============================================================================

type SagaState = Arc<Mutex<HashMap<(String, InstanceId), StoredInstance>>>;

/// In-memory [`SagaRepository`] with optimistic concurrency.
#[derive(Default)]
pub struct MemorySagaRepository {
    state: SagaState,
}

impl MemorySagaRepository {
    /// An empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SagaRepository for MemorySagaRepository {
    async fn load(&self, saga_name: &str, id: &InstanceId) -> Result<Option<StoredInstance>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .get(&(saga_name.to_string(), id.clone()))
            .cloned())
    }

    async fn save(
        &self,
        tx: &Tx,
        saga_name: &str,
        instance: &StoredInstance,
        expected: Revision,
    ) -> Result<()> {
        let key = (saga_name.to_string(), instance.id.clone());
        let current = self
            .state
            .lock()
            .unwrap()
            .get(&key)
            .map(|stored| stored.revision)
            .unwrap_or(Revision::NONE);
        if current != expected {
            return Err(Error::Conflict {
                saga: saga_name.to_string(),
                instance: instance.id.to_string(),
                expected: expected.value(),
                actual: current.value(),
            });
        }
        let state = self.state.clone();
        let stored = instance.clone();
        memory_tx(tx)?.stage(move || {
            state.lock().unwrap().insert(key, stored);
        });
        Ok(())
    }
}

type StreamState = Arc<Mutex<HashMap<(String, InstanceId), Vec<Arc<dyn AnyMessage>>>>>;

/// In-memory [`EventStream`] with offset checking.
#[derive(Default)]
pub struct MemoryEventStream {
    state: StreamState,
}

impl MemoryEventStream {
    /// An empty stream store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStream for MemoryEventStream {
    async fn append(
        &self,
        tx: &Tx,
        saga_name: &str,
        id: &InstanceId,
        expected: Revision,
        events: &[Arc<dyn AnyMessage>],
    ) -> Result<()> {
        let key = (saga_name.to_string(), id.clone());
        let current = self
            .state
            .lock()
            .unwrap()
            .get(&key)
            .map(|stream| stream.len() as u64)
            .unwrap_or(0);
        if current != expected.value() {
            return Err(Error::Conflict {
                saga: saga_name.to_string(),
                instance: id.to_string(),
                expected: expected.value(),
                actual: current,
            });
        }
        let state = self.state.clone();
        let events = events.to_vec();
        memory_tx(tx)?.stage(move || {
            state.lock().unwrap().entry(key).or_default().extend(events);
        });
        Ok(())
    }

    async fn open(
        &self,
        saga_name: &str,
        id: &InstanceId,
        after: Revision,
    ) -> Result<Vec<Arc<dyn AnyMessage>>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .get(&(saga_name.to_string(), id.clone()))
            .map(|stream| {
                stream
                    .iter()
                    .skip(after.value() as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

type SnapshotState = Arc<Mutex<HashMap<InstanceId, Snapshot>>>;

/// In-memory [`SnapshotRepository`], keyed by instance only so tests can
/// exercise cross-saga integrity checks.
#[derive(Default)]
pub struct MemorySnapshotRepository {
    state: SnapshotState,
    saves: Arc<AtomicUsize>,
}

impl MemorySnapshotRepository {
    /// An empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// How many snapshots have been committed.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotRepository for MemorySnapshotRepository {
    async fn load_snapshot(&self, _saga_name: &str, id: &InstanceId) -> Result<Option<Snapshot>> {
        Ok(self.state.lock().unwrap().get(id).cloned())
    }

    async fn save_snapshot(&self, tx: &Tx, snapshot: Snapshot) -> Result<()> {
        let state = self.state.clone();
        let saves = self.saves.clone();
        memory_tx(tx)?.stage(move || {
            let mut state = state.lock().unwrap();
            let keep = state
                .get(&snapshot.instance)
                .map(|existing| existing.revision < snapshot.revision)
                .unwrap_or(true);
            if keep {
                state.insert(snapshot.instance.clone(), snapshot);
            }
            saves.fetch_add(1, Ordering::SeqCst);
        });
        Ok(())
    }
}

// =============================================================================
// Key sets
// =============================================================================

#[derive(Default)]
struct KeySetState {
    // key -> owning instance, per saga
    owners: HashMap<String, HashMap<String, InstanceId>>,
    // instance -> its current keys, per saga
    keys: HashMap<(String, InstanceId), BTreeSet<String>>,
}

/// In-memory [`KeySetRepository`] enforcing disjointness at write time.
#[derive(Default)]
pub struct MemoryKeySetRepository {
    state: Arc<Mutex<KeySetState>>,
}

impl MemoryKeySetRepository {
    /// An empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeySetRepository for MemoryKeySetRepository {
    async fn find_by_key(&self, saga_name: &str, key: &str) -> Result<Option<InstanceId>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .owners
            .get(saga_name)
            .and_then(|owners| owners.get(key))
            .cloned())
    }

    async fn save_keys(
        &self,
        tx: &Tx,
        saga_name: &str,
        instance: &InstanceId,
        keys: &BTreeSet<String>,
    ) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if let Some(owners) = state.owners.get(saga_name) {
                for key in keys {
                    if let Some(owner) = owners.get(key) {
                        if owner != instance {
                            return Err(Error::integrity(format!(
                                "saga {saga_name} key {key:?} already belongs to instance {owner}"
                            )));
                        }
                    }
                }
            }
        }
        let state = self.state.clone();
        let saga_name = saga_name.to_string();
        let instance = instance.clone();
        let keys = keys.clone();
        memory_tx(tx)?.stage(move || {
            let mut state = state.lock().unwrap();
            let previous = state
                .keys
                .insert((saga_name.clone(), instance.clone()), keys.clone());
            let owners = state.owners.entry(saga_name).or_default();
            for old_key in previous.unwrap_or_default() {
                if !keys.contains(&old_key) {
                    owners.remove(&old_key);
                }
            }
            for key in keys {
                owners.insert(key, instance.clone());
            }
        });
        Ok(())
    }
}

// =============================================================================
// Transport
// =============================================================================

/// In-memory [`Transport`] backed by an unbounded queue.
pub struct MemoryTransport {
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundEnvelope>>,
    pusher: Mutex<Option<mpsc::UnboundedSender<InboundEnvelope>>>,
    sent: Mutex<Vec<OutboundEnvelope>>,
    subscriptions: Mutex<Vec<(Operation, Vec<String>)>>,
    initialized: Mutex<Option<String>>,
}

impl MemoryTransport {
    /// An empty transport.
    pub fn new() -> Self {
        let (pusher, receiver) = mpsc::unbounded_channel();
        Self {
            receiver: tokio::sync::Mutex::new(receiver),
            pusher: Mutex::new(Some(pusher)),
            sent: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            initialized: Mutex::new(None),
        }
    }

    /// Enqueue one delivery.
    pub fn push(
        &self,
        envelope: Envelope,
        source_endpoint: &str,
        delivery_count: Option<u32>,
        receipt: Box<dyn Receipt>,
    ) {
        if let Some(pusher) = self.pusher.lock().unwrap().as_ref() {
            let _ = pusher.send(InboundEnvelope::new(
                envelope,
                source_endpoint,
                delivery_count,
                receipt,
            ));
        }
    }

    /// Shut the transport down; `receive` drains the queue then reports
    /// `None`.
    pub fn close(&self) {
        self.pusher.lock().unwrap().take();
    }

    /// Everything sent so far.
    pub fn sent(&self) -> Vec<OutboundEnvelope> {
        self.sent.lock().unwrap().clone()
    }

    /// Drain everything sent so far.
    pub fn take_sent(&self) -> Vec<OutboundEnvelope> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }

    /// Recorded subscriptions, in subscription order.
    pub fn subscriptions(&self) -> Vec<(Operation, Vec<String>)> {
        self.subscriptions.lock().unwrap().clone()
    }

    /// The endpoint name this transport was initialized for.
    pub fn initialized(&self) -> Option<String> {
        self.initialized.lock().unwrap().clone()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn initialize(&self, endpoint_name: &str) -> Result<()> {
        *self.initialized.lock().unwrap() = Some(endpoint_name.to_string());
        Ok(())
    }

    async fn subscribe(&self, operation: Operation, message_types: &[&str]) -> Result<()> {
        self.subscriptions.lock().unwrap().push((
            operation,
            message_types.iter().map(|ty| ty.to_string()).collect(),
        ));
        Ok(())
    }

    async fn send(&self, outbound: OutboundEnvelope) -> Result<()> {
        self.sent.lock().unwrap().push(outbound);
        Ok(())
    }

    async fn receive(&self) -> Result<Option<InboundEnvelope>> {
        Ok(self.receiver.lock().await.recv().await)
    }
}
