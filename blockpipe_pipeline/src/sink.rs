use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use blockpipe_id::BlockId;

use crate::DynError;

/// The downstream store that sealed blocks are written to.
///
/// A call either stores every unit of the block or fails as a whole; there is no partial success.
/// The same block may be offered more than once when a previous attempt failed.
#[async_trait]
pub trait BlockSink<O>: Send + Sync + Debug
where
    O: Send + Sync + 'static,
{
    async fn store(&self, block_id: BlockId, units: &[O]) -> Result<(), DynError>;
}

#[async_trait]
impl<O, T> BlockSink<O> for Arc<T>
where
    O: Send + Sync + 'static,
    T: BlockSink<O>,
{
    async fn store(&self, block_id: BlockId, units: &[O]) -> Result<(), DynError> {
        (**self).store(block_id, units).await
    }
}

type ProjectFn<T, O> = dyn Fn(&T) -> O + Send + Sync;

/// Transforms a record payload into the unit handed to the [`BlockSink`].
pub struct Projection<T, O>(Arc<ProjectFn<T, O>>);

impl<T, O> Projection<T, O> {
    pub fn new(f: impl Fn(&T) -> O + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn project(&self, payload: &T) -> O {
        (self.0)(payload)
    }
}

impl<T> Projection<T, T>
where
    T: Clone + 'static,
{
    /// A projection that hands each payload to the sink unchanged.
    pub fn identity() -> Self {
        Self::new(T::clone)
    }
}

impl<T, O> Clone for Projection<T, O> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T, O> Debug for Projection<T, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projection").finish_non_exhaustive()
    }
}
