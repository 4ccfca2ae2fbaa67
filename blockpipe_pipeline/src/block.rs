use blockpipe_id::{BlockId, RecordKey};
use iox_time::Time;

use crate::Record;

/// An immutable, ordered batch of records sealed at one trigger firing.
#[derive(Debug)]
pub struct Block<T> {
    id: BlockId,
    records: Vec<Record<T>>,
    sealed_at: Time,
}

impl<T> Block<T> {
    pub fn new(id: BlockId, records: Vec<Record<T>>, sealed_at: Time) -> Self {
        Self {
            id,
            records,
            sealed_at,
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    /// The records of this block, in the order they were appended.
    pub fn records(&self) -> &[Record<T>] {
        &self.records
    }

    pub fn keys(&self) -> impl Iterator<Item = &RecordKey> {
        self.records.iter().map(Record::key)
    }

    pub fn sealed_at(&self) -> Time {
        self.sealed_at
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
