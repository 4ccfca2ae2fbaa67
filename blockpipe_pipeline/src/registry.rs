use std::sync::Arc;

use blockpipe_id::BlockId;
use hashbrown::{HashMap, hash_map::Entry};
use parking_lot::Mutex;
use thiserror::Error;

use crate::Block;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("block {0} is already registered")]
    Duplicate(BlockId),

    #[error("block {0} is not registered")]
    NotFound(BlockId),
}

/// Sealed blocks that are waiting to be persisted, or are being persisted.
///
/// An entry lives from the moment its block is sealed until the block is persisted and every
/// record acknowledged, at which point the persist worker evicts it. Blocks that fail to persist
/// are left in place until the pipeline is stopped and [`clear`][Self::clear] discards them.
#[derive(Debug)]
pub struct BlockRegistry<T> {
    blocks: Mutex<HashMap<BlockId, Arc<Block<T>>>>,
}

impl<T> BlockRegistry<T> {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
        }
    }

    /// Store `block` under its id.
    ///
    /// Fails if a block with the same id is already registered; the existing entry is kept.
    pub fn register(&self, block: Block<T>) -> Result<Arc<Block<T>>, RegistryError> {
        match self.blocks.lock().entry(block.id()) {
            Entry::Occupied(e) => Err(RegistryError::Duplicate(*e.key())),
            Entry::Vacant(e) => {
                let block = Arc::new(block);
                e.insert(Arc::clone(&block));
                Ok(block)
            }
        }
    }

    pub fn lookup(&self, id: BlockId) -> Result<Arc<Block<T>>, RegistryError> {
        self.blocks
            .lock()
            .get(&id)
            .map(Arc::clone)
            .ok_or(RegistryError::NotFound(id))
    }

    /// Remove the entry for `id`, returning it if it was present.
    pub fn evict(&self, id: BlockId) -> Option<Arc<Block<T>>> {
        self.blocks.lock().remove(&id)
    }

    /// Discard every entry without acknowledging any record, returning how many were discarded.
    pub fn clear(&self) -> usize {
        let mut blocks = self.blocks.lock();
        let n = blocks.len();
        blocks.clear();
        n
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.blocks.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }
}

impl<T> Default for BlockRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use iox_time::Time;

    use super::*;
    use crate::{Record, test_util::MockAcknowledger};

    fn block(id: u64, keys: &[&str]) -> Block<()> {
        let acker = Arc::new(MockAcknowledger::default());
        let records = keys
            .iter()
            .map(|k| Record::new(*k, (), Arc::clone(&acker) as _))
            .collect();
        Block::new(BlockId::from(id), records, Time::from_timestamp_nanos(0))
    }

    #[test]
    fn register_lookup_evict() {
        let registry = BlockRegistry::new();
        registry.register(block(1, &["a", "b"])).unwrap();
        registry.register(block(2, &["c"])).unwrap();
        assert_eq!(registry.len(), 2);

        let found = registry.lookup(BlockId::from(1)).unwrap();
        let keys: Vec<_> = found.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, ["a", "b"]);

        assert!(registry.evict(BlockId::from(1)).is_some());
        assert!(registry.evict(BlockId::from(1)).is_none());
        assert_eq!(
            registry.lookup(BlockId::from(1)).unwrap_err(),
            RegistryError::NotFound(BlockId::from(1))
        );
        assert!(registry.contains(BlockId::from(2)));
    }

    #[test]
    fn duplicate_registration_keeps_the_first() {
        let registry = BlockRegistry::new();
        registry.register(block(9, &["first"])).unwrap();

        let err = registry.register(block(9, &["imposter"])).unwrap_err();
        assert_eq!(err, RegistryError::Duplicate(BlockId::from(9)));

        let kept = registry.lookup(BlockId::from(9)).unwrap();
        assert_eq!(kept.keys().next().unwrap().as_str(), "first");
    }

    #[test]
    fn clear_discards_everything() {
        let registry = BlockRegistry::new();
        registry.register(block(1, &["a"])).unwrap();
        registry.register(block(2, &["b"])).unwrap();
        assert_eq!(registry.clear(), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.clear(), 0);
    }

    #[test]
    fn concurrent_register_and_evict() {
        let registry = Arc::new(BlockRegistry::new());
        let handles: Vec<_> = (0..8_u64)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let id = t * 1_000 + i;
                        registry.register(block(id, &["k"])).unwrap();
                        assert!(registry.lookup(BlockId::from(id)).is_ok());
                        if i % 2 == 0 {
                            registry.evict(BlockId::from(id));
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.len(), 8 * 50);
    }
}
