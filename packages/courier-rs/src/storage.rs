//! The data-store seam: transactions without a database.
//!
//! Courier never talks SQL. Everything it needs from storage is expressed
//! through repository traits (outbox, saga instances, event streams, key
//! sets) that take an explicit transaction handle, plus this module's two
//! primitives:
//!
//! - [`DataStore`] opens transactions.
//! - [`Tx`] is a cloneable handle to one open transaction.
//!
//! # Participate, don't commit
//!
//! A `Tx` travels explicitly on the
//! [`DeliveryContext`](crate::pipeline::DeliveryContext). Commit authority
//! belongs to whoever called [`DataStore::begin`]. In the normal inbound
//! chain that is the outbox stage. Everything downstream (saga persisters,
//! mapping repositories) *participates*: it reads the ambient handle, stages
//! its writes, and never commits. This is what makes "state change + outbox
//! entry in one atomic unit" possible without double-commit bugs.
//!
//! # Errors
//!
//! Backend failures are `anyhow`-wrapped into
//! [`Error::Store`](crate::Error::Store); adapters never invent their own
//! error enum at this seam.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// Opens transactions against the application's store.
#[async_trait]
pub trait DataStore: Send + Sync + 'static {
    /// Begin a new transaction.
    async fn begin(&self) -> Result<Tx>;
}

/// Backend-specific transaction state behind a [`Tx`] handle.
///
/// Implementations must tolerate commit/rollback being called at most once;
/// a second call is a backend error, not a panic.
#[async_trait]
pub trait TxHandle: Send + Sync {
    /// Make all staged writes durable.
    async fn commit(&self) -> Result<()>;

    /// Discard all staged writes.
    async fn rollback(&self) -> Result<()>;

    /// Downcast support for repository implementations, which need their
    /// own backend's transaction type back.
    fn as_any(&self) -> &dyn Any;
}

/// A cloneable handle to one open transaction.
///
/// Cloning shares the same underlying transaction; it does not open a new
/// one. Only the opener commits.
#[derive(Clone)]
pub struct Tx {
    inner: Arc<dyn TxHandle>,
}

impl Tx {
    /// Wrap a backend transaction.
    pub fn new(inner: Arc<dyn TxHandle>) -> Self {
        Self { inner }
    }

    /// Make all staged writes durable.
    pub async fn commit(&self) -> Result<()> {
        self.inner.commit().await
    }

    /// Discard all staged writes.
    pub async fn rollback(&self) -> Result<()> {
        self.inner.rollback().await
    }

    /// Downcast to a backend transaction type.
    pub fn downcast_ref<T: TxHandle + 'static>(&self) -> Option<&T> {
        self.inner.as_any().downcast_ref()
    }
}

impl fmt::Debug for Tx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tx").finish_non_exhaustive()
    }
}
