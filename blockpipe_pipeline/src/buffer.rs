use parking_lot::Mutex;

use crate::Record;

/// The accumulator for the block currently being filled.
///
/// Appends from any number of delivery contexts are serialised by a short critical section.
/// [`seal`][Self::seal] swaps the accumulated records out for an empty buffer in the same
/// critical section, so a record lands either in the sealed batch or in the next one, never in
/// both and never in neither.
#[derive(Debug)]
pub struct RecordBuffer<T> {
    records: Mutex<Vec<Record<T>>>,
}

impl<T> RecordBuffer<T> {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    /// Add `record` to the tail of the accumulator, returning the number of records now buffered.
    pub fn append(&self, record: Record<T>) -> usize {
        let mut records = self.records.lock();
        records.push(record);
        records.len()
    }

    /// Take every buffered record, in append order, leaving the accumulator empty.
    pub fn seal(&self) -> Vec<Record<T>> {
        std::mem::take(&mut *self.records.lock())
    }

    /// Drop every buffered record without acknowledging it, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let dropped = self.seal();
        dropped.len()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl<T> Default for RecordBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}
