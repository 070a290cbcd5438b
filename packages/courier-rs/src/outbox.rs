//! Transactional outbox: effectively-once handler execution.
//!
//! # Overview
//!
//! Transports deliver at-least-once; handlers must not run their side
//! effects twice for one message. The Deduplicate stage closes that gap
//! with the outbox pattern, keyed by the inbound message's ID:
//!
//! 1. Look up the outbox entry for the inbound message ID. If one exists,
//!    this is a redelivery: skip the handler entirely and just resend
//!    whatever captured messages are not yet marked sent.
//! 2. Otherwise open a transaction, put it on the context, and swap the
//!    context's sender for a buffer. The handler's state changes and its
//!    captured outgoing messages then commit in one atomic unit.
//! 3. After commit, send the captured messages for real, marking each one
//!    sent in its own small transaction.
//!
//! A crash between commit and send leaves unsent entries behind; the next
//! redelivery of the same message replays exactly those. A crash before
//! commit leaves nothing, and the redelivery runs the handler again against
//! unchanged state.
//!
//! Two workers racing on the same redelivered message may both miss the
//! lookup and both run the handler, but the outbox entry is unique per
//! message ID: exactly one commit wins, and the loser's delivery fails with
//! a retryable error and replays the winner's entry on its retry.
//!
//! # Failure ordering
//!
//! A send that succeeds but whose confirmation write fails will be sent
//! again on replay. Downstream endpoints run their own Deduplicate stage,
//! so the duplicate is absorbed there.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::envelope::{InboundEnvelope, MessageId, OutboundEnvelope};
use crate::error::Result;
use crate::pipeline::{DeliveryContext, InboundNext, InboundStage, Sender};
use crate::storage::Tx;

// =============================================================================
// Repository
// =============================================================================

/// One captured outgoing message, with its send status.
#[derive(Debug, Clone)]
pub struct OutboxMessage {
    /// The captured envelope, exactly as the handler sent it.
    pub envelope: OutboundEnvelope,
    /// Whether the envelope has been handed to the transport and confirmed.
    pub sent: bool,
}

/// Storage for outbox entries, keyed by the inbound message ID that caused
/// them.
///
/// `save_outbox` and `mark_as_sent` participate in the caller's transaction;
/// `load_outbox` reads committed state.
#[async_trait]
pub trait OutboxRepository: Send + Sync + 'static {
    /// The outbox entry for an inbound message, or `None` if that message
    /// has never been handled to completion.
    ///
    /// `Some(vec![])` is meaningful: the message was handled and sent
    /// nothing.
    async fn load_outbox(&self, message_id: MessageId) -> Result<Option<Vec<OutboxMessage>>>;

    /// Record the captured messages for an inbound message, all unsent.
    ///
    /// The entry is keyed uniquely by `message_id`: saving when an entry
    /// already exists must fail with a retryable error, and the uniqueness
    /// must hold against concurrent transactions (a unique key checked at
    /// write, not a read-then-insert). This is what stops two workers
    /// racing on the same redelivered message from both committing their
    /// handler's side effects; the loser retries and replays the winner's
    /// entry.
    async fn save_outbox(
        &self,
        tx: &Tx,
        message_id: MessageId,
        messages: &[OutboundEnvelope],
    ) -> Result<()>;

    /// Mark one captured message as sent. `message_id` is the ID of the
    /// captured message itself; `causation_id` keys the outbox entry.
    async fn mark_as_sent(&self, tx: &Tx, causation_id: MessageId, message_id: MessageId)
        -> Result<()>;
}

// =============================================================================
// Buffering sender
// =============================================================================

/// Sender that captures instead of sending, used while a handler runs.
#[derive(Default)]
pub struct BufferingSender {
    captured: Mutex<Vec<OutboundEnvelope>>,
}

impl BufferingSender {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the captured envelopes in send order.
    pub fn take(&self) -> Vec<OutboundEnvelope> {
        std::mem::take(&mut self.captured.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[async_trait]
impl Sender for BufferingSender {
    async fn send_message(&self, outbound: OutboundEnvelope) -> Result<()> {
        self.captured
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(outbound);
        Ok(())
    }
}

// =============================================================================
// Deduplicate stage
// =============================================================================

/// Inbound stage implementing the transactional outbox.
pub struct Deduplicate {
    repository: Arc<dyn OutboxRepository>,
}

impl Deduplicate {
    /// Wrap an outbox repository.
    pub fn new(repository: Arc<dyn OutboxRepository>) -> Self {
        Self { repository }
    }

    /// Send every unsent message, confirming each in its own transaction.
    async fn send_and_confirm(
        &self,
        ctx: &DeliveryContext,
        causation_id: MessageId,
        messages: Vec<OutboxMessage>,
    ) -> Result<()> {
        let sender = ctx.sender();
        for entry in messages {
            if entry.sent {
                continue;
            }
            let message_id = entry.envelope.envelope().message_id();
            sender.send_message(entry.envelope).await?;

            let tx = ctx.data_store()?.begin().await?;
            self.repository
                .mark_as_sent(&tx, causation_id, message_id)
                .await?;
            tx.commit().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl InboundStage for Deduplicate {
    async fn deliver(
        &self,
        ctx: &mut DeliveryContext,
        inbound: InboundEnvelope,
        next: InboundNext<'_>,
    ) -> Result<()> {
        let message_id = inbound.envelope().message_id();

        if let Some(messages) = self.repository.load_outbox(message_id).await? {
            info!(
                %message_id,
                message_type = inbound.envelope().message_type(),
                pending = messages.iter().filter(|m| !m.sent).count(),
                "duplicate delivery, replaying outbox"
            );
            return self.send_and_confirm(ctx, message_id, messages).await;
        }

        let tx = ctx.data_store()?.begin().await?;
        ctx.set_tx(tx.clone());
        let buffer = Arc::new(BufferingSender::new());
        let real_sender = ctx.replace_sender(buffer.clone());

        let result = next.deliver(ctx, inbound).await;
        ctx.replace_sender(real_sender);

        match result {
            Ok(()) => {
                let captured = buffer.take();
                if let Err(err) = self.repository.save_outbox(&tx, message_id, &captured).await {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(%message_id, %rollback_err, "rollback failed after outbox save failure");
                    }
                    ctx.clear_tx();
                    return Err(err);
                }
                let committed = tx.commit().await;
                ctx.clear_tx();
                committed?;
                debug!(%message_id, captured = captured.len(), "outbox committed");

                let messages = captured
                    .into_iter()
                    .map(|envelope| OutboxMessage {
                        envelope,
                        sent: false,
                    })
                    .collect();
                self.send_and_confirm(ctx, message_id, messages).await
            }
            Err(err) => {
                // The handler's error is the one worth reporting; a failed
                // rollback must not shadow it.
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(%message_id, %rollback_err, "rollback failed after handler error");
                }
                ctx.clear_tx();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::error::Error;
    use crate::message::{Message, MessageKind};
    use crate::testing::{
        CapturingSender, MemoryDataStore, MemoryOutboxRepository, NullReceipt,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone)]
    struct Provision;

    impl Message for Provision {
        const TYPE: &'static str = "infra.Provision";
        const KIND: MessageKind = MessageKind::Command;
    }

    #[derive(Debug, Clone)]
    struct Provisioned;

    impl Message for Provisioned {
        const TYPE: &'static str = "infra.Provisioned";
        const KIND: MessageKind = MessageKind::Event;
    }

    /// Terminal stage standing in for the dispatcher: publishes one event
    /// per delivery and counts invocations.
    struct Handler {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl InboundStage for Arc<Handler> {
        async fn deliver(
            &self,
            ctx: &mut DeliveryContext,
            inbound: InboundEnvelope,
            _next: InboundNext<'_>,
        ) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            ctx.set_parent(inbound.envelope().clone());
            ctx.publish_event(Provisioned).await?;
            if self.fail {
                return Err(Error::handler(anyhow::anyhow!("boom")));
            }
            Ok(())
        }
    }

    struct Fixture {
        stage: Deduplicate,
        handler: Arc<Handler>,
        stages: Vec<Arc<dyn InboundStage>>,
        repository: Arc<MemoryOutboxRepository>,
        store: Arc<MemoryDataStore>,
        sender: Arc<CapturingSender>,
    }

    fn fixture(fail: bool) -> Fixture {
        let repository = Arc::new(MemoryOutboxRepository::new());
        let handler = Arc::new(Handler {
            runs: AtomicUsize::new(0),
            fail,
        });
        Fixture {
            stage: Deduplicate::new(repository.clone()),
            handler: handler.clone(),
            stages: vec![Arc::new(handler)],
            repository,
            store: Arc::new(MemoryDataStore::new()),
            sender: Arc::new(CapturingSender::new()),
        }
    }

    impl Fixture {
        async fn deliver(&self, envelope: Envelope) -> Result<()> {
            let mut ctx =
                DeliveryContext::new(Some(self.store.clone()), self.sender.clone());
            let inbound = InboundEnvelope::new(envelope, "test", Some(0), Box::new(NullReceipt));
            self.stage
                .deliver(&mut ctx, inbound, InboundNext::over(&self.stages))
                .await
        }
    }

    #[tokio::test]
    async fn first_delivery_runs_the_handler_and_sends() {
        let f = fixture(false);
        let envelope = Envelope::new(Provision);
        f.deliver(envelope.clone()).await.unwrap();

        assert_eq!(f.handler.runs.load(Ordering::SeqCst), 1);
        let sent = f.sender.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].envelope().message_type(), Provisioned::TYPE);

        let entry = f
            .repository
            .load_outbox(envelope.message_id())
            .await
            .unwrap()
            .unwrap();
        assert!(entry.iter().all(|m| m.sent));
    }

    #[tokio::test]
    async fn redelivery_skips_the_handler() {
        let f = fixture(false);
        let envelope = Envelope::new(Provision);
        f.deliver(envelope.clone()).await.unwrap();
        f.sender.take();

        f.deliver(envelope).await.unwrap();
        assert_eq!(f.handler.runs.load(Ordering::SeqCst), 1);
        // Everything was already sent, so the replay sends nothing.
        assert!(f.sender.take().is_empty());
    }

    #[tokio::test]
    async fn handler_failure_rolls_back_and_sends_nothing() {
        let f = fixture(true);
        let envelope = Envelope::new(Provision);
        let err = f.deliver(envelope.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Handler(_)));

        assert!(f.sender.take().is_empty());
        assert!(f
            .repository
            .load_outbox(envelope.message_id())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn handler_error_is_kept_when_rollback_fails() {
        struct CommitsThenFails;

        #[async_trait]
        impl InboundStage for CommitsThenFails {
            async fn deliver(
                &self,
                ctx: &mut DeliveryContext,
                _inbound: InboundEnvelope,
                _next: InboundNext<'_>,
            ) -> Result<()> {
                // Close the ambient transaction out from under the outbox
                // stage, so its rollback attempt fails too.
                ctx.require_tx()?.commit().await?;
                Err(Error::handler(anyhow::anyhow!("downstream broke")))
            }
        }

        let stage = Deduplicate::new(Arc::new(MemoryOutboxRepository::new()));
        let stages: Vec<Arc<dyn InboundStage>> = vec![Arc::new(CommitsThenFails)];
        let mut ctx = DeliveryContext::new(
            Some(Arc::new(MemoryDataStore::new())),
            Arc::new(CapturingSender::new()),
        );
        let inbound =
            InboundEnvelope::new(Envelope::new(Provision), "test", Some(0), Box::new(NullReceipt));
        let err = stage
            .deliver(&mut ctx, inbound, InboundNext::over(&stages))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handler(_)));
    }

    #[tokio::test]
    async fn failed_delivery_retries_the_handler() {
        let f = fixture(true);
        let envelope = Envelope::new(Provision);
        f.deliver(envelope.clone()).await.unwrap_err();
        f.deliver(envelope).await.unwrap_err();
        assert_eq!(f.handler.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn replay_resends_only_unsent_messages() {
        let f = fixture(false);
        let envelope = Envelope::new(Provision);
        f.deliver(envelope.clone()).await.unwrap();
        f.sender.take();

        // Simulate a crash between commit and confirm: flip one entry back
        // to unsent.
        f.repository.force_unsent(envelope.message_id());

        f.deliver(envelope.clone()).await.unwrap();
        assert_eq!(f.handler.runs.load(Ordering::SeqCst), 1);
        assert_eq!(f.sender.take().len(), 1);

        let entry = f
            .repository
            .load_outbox(envelope.message_id())
            .await
            .unwrap()
            .unwrap();
        assert!(entry.iter().all(|m| m.sent));
    }

    #[tokio::test]
    async fn racing_saves_for_one_message_commit_exactly_once() {
        use crate::storage::DataStore;

        let repository = MemoryOutboxRepository::new();
        let store = MemoryDataStore::new();
        let message_id = Envelope::new(Provision).message_id();
        let captured = [crate::envelope::OutboundEnvelope::multicast(Envelope::new(
            Provisioned,
        ))];

        // Both transactions save before either commits, so both pass the
        // committed-state lookup.
        let tx_a = store.begin().await.unwrap();
        let tx_b = store.begin().await.unwrap();
        repository
            .save_outbox(&tx_a, message_id, &captured)
            .await
            .unwrap();
        repository
            .save_outbox(&tx_b, message_id, &captured)
            .await
            .unwrap();

        tx_a.commit().await.unwrap();
        let err = tx_b.commit().await.unwrap_err();
        assert!(err.is_retryable());

        let entry = repository.load_outbox(message_id).await.unwrap().unwrap();
        assert_eq!(entry.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_first_deliveries_run_the_handler_once_past_commit() {
        use tokio::sync::Barrier;

        /// Holds every delivery at a barrier so all of them pass the outbox
        /// lookup before any commits.
        struct Rendezvous {
            runs: AtomicUsize,
            barrier: Barrier,
        }

        #[async_trait]
        impl InboundStage for Arc<Rendezvous> {
            async fn deliver(
                &self,
                ctx: &mut DeliveryContext,
                inbound: InboundEnvelope,
                _next: InboundNext<'_>,
            ) -> Result<()> {
                self.runs.fetch_add(1, Ordering::SeqCst);
                self.barrier.wait().await;
                ctx.set_parent(inbound.envelope().clone());
                ctx.publish_event(Provisioned).await
            }
        }

        let repository = Arc::new(MemoryOutboxRepository::new());
        let stage = Deduplicate::new(repository.clone());
        let handler = Arc::new(Rendezvous {
            runs: AtomicUsize::new(0),
            barrier: Barrier::new(2),
        });
        let stages: Vec<Arc<dyn InboundStage>> = vec![Arc::new(handler.clone())];
        let store = Arc::new(MemoryDataStore::new());
        let sender = Arc::new(CapturingSender::new());
        let envelope = Envelope::new(Provision);

        let deliver = |envelope: Envelope| {
            let stage = &stage;
            let stages = &stages;
            let store = store.clone();
            let sender = sender.clone();
            async move {
                let mut ctx = DeliveryContext::new(Some(store), sender);
                let inbound =
                    InboundEnvelope::new(envelope, "test", Some(0), Box::new(NullReceipt));
                stage
                    .deliver(&mut ctx, inbound, InboundNext::over(stages))
                    .await
            }
        };

        let (a, b) = tokio::join!(deliver(envelope.clone()), deliver(envelope.clone()));
        assert_eq!(handler.runs.load(Ordering::SeqCst), 2);

        // Exactly one delivery commits; the loser surfaces a retryable
        // error so the transport redelivers it.
        let loser = match (a, b) {
            (Ok(()), Err(err)) | (Err(err), Ok(())) => err,
            other => panic!("expected one winner and one loser, got {other:?}"),
        };
        assert!(loser.is_retryable());
        assert_eq!(sender.take().len(), 1);

        // The loser's retry is a pure replay of the winner's entry.
        deliver(envelope).await.unwrap();
        assert_eq!(handler.runs.load(Ordering::SeqCst), 2);
        assert!(sender.take().is_empty());
    }

    #[tokio::test]
    async fn handled_message_with_no_output_still_dedupes() {
        struct Quiet(AtomicUsize);

        #[async_trait]
        impl InboundStage for Arc<Quiet> {
            async fn deliver(
                &self,
                _ctx: &mut DeliveryContext,
                _inbound: InboundEnvelope,
                _next: InboundNext<'_>,
            ) -> Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let repository = Arc::new(MemoryOutboxRepository::new());
        let stage = Deduplicate::new(repository.clone());
        let quiet = Arc::new(Quiet(AtomicUsize::new(0)));
        let stages: Vec<Arc<dyn InboundStage>> = vec![Arc::new(quiet.clone())];
        let store = Arc::new(MemoryDataStore::new());
        let sender = Arc::new(CapturingSender::new());
        let envelope = Envelope::new(Provision);

        for _ in 0..2 {
            let mut ctx = DeliveryContext::new(Some(store.clone()), sender.clone());
            let inbound =
                InboundEnvelope::new(envelope.clone(), "test", Some(0), Box::new(NullReceipt));
            stage
                .deliver(&mut ctx, inbound, InboundNext::over(&stages))
                .await
                .unwrap();
        }
        assert_eq!(quiet.0.load(Ordering::SeqCst), 1);
    }
}
