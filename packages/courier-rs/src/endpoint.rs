//! Endpoint assembly and the worker loop.
//!
//! # Overview
//!
//! An [`EndpointBuilder`] wires the whole machine together: transport, data
//! store, outbox, routing table, dispatch table, retry policy. Build-time
//! validation catches configuration mistakes (duplicate command handlers,
//! duplicate routing prefixes, an outbox without a data store) before a
//! single message moves.
//!
//! # Example
//!
//! ```ignore
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
//!
//! [`Endpoint::run`] spawns a fixed pool of workers, each looping on
//! `transport.receive()`. One slow delivery therefore never stalls the
//! endpoint, and the pool size caps concurrent handler executions. Workers
//! exit when the transport reports shutdown.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{error, info};

use crate::dispatch::{Dispatch, DispatchTableBuilder, MessageHandler};
use crate::envelope::Operation;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::outbox::{Deduplicate, OutboxRepository};
use crate::pipeline::{
    DeliveryContext, InboundPipeline, InboundStage, InitializeContext, OutboundPipeline,
    OutboundStage, PipelineSender, Sender, TimeLimiter, TransportStage, DEFAULT_DELIVERY_TIMEOUT,
};
use crate::retry::{Acknowledge, ExponentialBackoff, RetryPolicy};
use crate::route::{Router, RoutingTable};
use crate::storage::DataStore;
use crate::transport::Transport;

const DEFAULT_WORKERS: usize = 4;

/// Assembles an [`Endpoint`].
pub struct EndpointBuilder {
    name: String,
    transport: Option<Arc<dyn Transport>>,
    data_store: Option<Arc<dyn DataStore>>,
    outbox: Option<Arc<dyn OutboxRepository>>,
    routes: RoutingTable,
    handlers: DispatchTableBuilder,
    retry_policy: Arc<dyn RetryPolicy>,
    delivery_timeout: Duration,
    workers: usize,
}

impl EndpointBuilder {
    /// Start building an endpoint with the given name. The name is the
    /// endpoint's address for unicast routing.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: None,
            data_store: None,
            outbox: None,
            routes: RoutingTable::new(),
            handlers: DispatchTableBuilder::new(),
            retry_policy: Arc::new(ExponentialBackoff::new()),
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            workers: DEFAULT_WORKERS,
        }
    }

    /// Set the transport. Required.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the data store used by the outbox and persisters.
    pub fn with_data_store(mut self, data_store: Arc<dyn DataStore>) -> Self {
        self.data_store = Some(data_store);
        self
    }

    /// Enable the transactional outbox. Requires a data store.
    pub fn with_outbox(mut self, outbox: Arc<dyn OutboxRepository>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Add a unicast routing rule.
    pub fn route(mut self, prefix: impl Into<String>, endpoint: impl Into<String>) -> Self {
        self.routes = self.routes.route(prefix, endpoint);
        self
    }

    /// Register a message handler.
    pub fn register(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers = self.handlers.register(handler);
        self
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the per-delivery time budget.
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Set the worker pool size. Values below 1 are treated as 1.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Validate the configuration, initialize the stages, and connect the
    /// transport.
    pub async fn build(self) -> Result<Endpoint> {
        let transport = self
            .transport
            .ok_or_else(|| Error::config("endpoint has no transport"))?;
        if self.outbox.is_some() && self.data_store.is_none() {
            return Err(Error::config("outbox requires a data store"));
        }

        let routes = self.routes.validate()?;
        let dispatch = Dispatch::new(self.handlers.build()?);

        let outbound = Arc::new(OutboundPipeline::new(vec![
            Arc::new(Router::new(routes)) as Arc<dyn OutboundStage>,
            Arc::new(TransportStage::new(transport.clone())),
        ]));
        let sender: Arc<dyn Sender> = Arc::new(PipelineSender::new(outbound.clone()));

        let mut inbound_stages: Vec<Arc<dyn InboundStage>> = vec![
            Arc::new(Acknowledge::new(self.retry_policy)),
            Arc::new(TimeLimiter::new(self.delivery_timeout)),
        ];
        if let Some(outbox) = self.outbox {
            inbound_stages.push(Arc::new(Deduplicate::new(outbox)));
        }
        inbound_stages.push(Arc::new(dispatch));
        let inbound = Arc::new(InboundPipeline::new(inbound_stages));

        let mut init = InitializeContext::new(self.name.clone());
        outbound.initialize(&mut init).await?;
        inbound.initialize(&mut init).await?;

        transport.initialize(&self.name).await?;
        let subscriptions = init.take_subscriptions();
        for operation in [Operation::Unicast, Operation::Multicast] {
            let types: Vec<&str> = subscriptions
                .iter()
                .filter(|(op, _)| *op == operation)
                .map(|(_, ty)| *ty)
                .collect();
            if !types.is_empty() {
                transport.subscribe(operation, &types).await?;
            }
        }

        info!(
            endpoint = %self.name,
            subscriptions = subscriptions.len(),
            workers = self.workers,
            "endpoint ready"
        );
        Ok(Endpoint {
            name: self.name,
            transport,
            data_store: self.data_store,
            sender,
            inbound,
            workers: self.workers,
        })
    }
}

/// A running messaging endpoint.
pub struct Endpoint {
    name: String,
    transport: Arc<dyn Transport>,
    data_store: Option<Arc<dyn DataStore>>,
    sender: Arc<dyn Sender>,
    inbound: Arc<InboundPipeline>,
    workers: usize,
}

impl Endpoint {
    /// The endpoint's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a command from outside any delivery (an edge send). The
    /// resulting envelope is a conversation root.
    pub async fn execute_command(&self, command: impl Message) -> Result<()> {
        self.edge_context().execute_command(command).await
    }

    /// Publish an event from outside any delivery.
    pub async fn publish_event(&self, event: impl Message) -> Result<()> {
        self.edge_context().publish_event(event).await
    }

    fn edge_context(&self) -> DeliveryContext {
        DeliveryContext::new(self.data_store.clone(), self.sender.clone())
    }

    /// Run the worker pool until the transport shuts down.
    pub async fn run(&self) {
        let workers = (0..self.workers).map(|worker| {
            let transport = self.transport.clone();
            let inbound = self.inbound.clone();
            let data_store = self.data_store.clone();
            let sender = self.sender.clone();
            let endpoint = self.name.clone();
            tokio::spawn(async move {
                loop {
                    match transport.receive().await {
                        Ok(Some(inbound_envelope)) => {
                            let mut ctx =
                                DeliveryContext::new(data_store.clone(), sender.clone());
                            if let Err(err) = inbound.deliver(&mut ctx, inbound_envelope).await {
                                // The Acknowledge stage signals delivery
                                // outcomes; an error surfacing here means
                                // the receipt itself could not be consumed.
                                error!(%endpoint, worker, %err, "delivery not signaled");
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            error!(%endpoint, worker, %err, "transport receive failed, stopping");
                            break;
                        }
                    }
                }
            })
        });
        join_all(workers).await;
        info!(endpoint = %self.name, "endpoint stopped");
    }
}
