//! Records and their acknowledgment capability.

use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use blockpipe_id::RecordKey;
use thiserror::Error;

use crate::DynError;

/// Tells the source that a record has been durably processed and may be discarded.
#[async_trait]
pub trait Acknowledge: Send + Sync + Debug {
    async fn acknowledge(&self, key: &RecordKey) -> Result<(), DynError>;
}

#[async_trait]
impl<T> Acknowledge for Arc<T>
where
    T: Acknowledge,
{
    async fn acknowledge(&self, key: &RecordKey) -> Result<(), DynError> {
        (**self).acknowledge(key).await
    }
}

#[derive(Debug, Error)]
#[error("failed to acknowledge record {key}: {source}")]
pub struct AckError {
    key: RecordKey,
    #[source]
    source: DynError,
}

impl AckError {
    pub fn key(&self) -> &RecordKey {
        &self.key
    }
}

/// A single change-log entry staged for persistence.
///
/// The acknowledgment capability latches: only the first call to [`Record::acknowledge`] reaches
/// the source.
#[derive(Debug)]
pub struct Record<T> {
    key: RecordKey,
    payload: T,
    acker: Arc<dyn Acknowledge>,
    acknowledged: AtomicBool,
}

impl<T> Record<T> {
    pub fn new(key: impl Into<RecordKey>, payload: T, acker: Arc<dyn Acknowledge>) -> Self {
        Self {
            key: key.into(),
            payload,
            acker,
            acknowledged: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &RecordKey {
        &self.key
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Whether the acknowledgment capability has been used, successfully or not.
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::Acquire)
    }
}

impl<T> Record<T>
where
    T: Send + Sync,
{
    /// Acknowledge this record at the source.
    ///
    /// Returns `Ok(false)` without contacting the source if the record was already acknowledged.
    /// A failed acknowledgment still consumes the capability.
    pub(crate) async fn acknowledge(&self) -> Result<bool, AckError> {
        if self.acknowledged.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        self.acker
            .acknowledge(&self.key)
            .await
            .map(|_| true)
            .map_err(|source| AckError {
                key: self.key.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_util::MockAcknowledger;

    #[tokio::test]
    async fn acknowledge_reaches_source_once() {
        let acker = Arc::new(MockAcknowledger::default());
        let record = Record::new("k1", 42_u64, Arc::clone(&acker) as _);
        assert!(!record.is_acknowledged());

        assert!(record.acknowledge().await.unwrap());
        assert!(!record.acknowledge().await.unwrap());
        assert!(record.is_acknowledged());
        assert_eq!(acker.acked(), vec![RecordKey::from("k1")]);
        assert_eq!(acker.n_calls(), 1);
    }

    #[tokio::test]
    async fn failed_acknowledge_is_not_repeated() {
        let acker = Arc::new(MockAcknowledger::default());
        acker.fail_for("k1");
        let record = Record::new("k1", (), Arc::clone(&acker) as _);

        let err = record.acknowledge().await.unwrap_err();
        assert_eq!(err.key(), &RecordKey::from("k1"));
        assert!(!record.acknowledge().await.unwrap());
        assert_eq!(acker.n_calls(), 1);
        assert!(acker.acked().is_empty());
    }
}
