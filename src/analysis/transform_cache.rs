use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
};

use parking_lot::RwLock;

use crate::analysis::block_features::BlockTransform;

/// The part of a detector configuration a [`BlockTransform`] depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransformKey {
    pub block_size: u32,
    pub descriptor_len: usize,
}

impl TransformKey {
    pub fn hash_value(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Shared, read-mostly store of prepared block transforms keyed by a hash of
/// their configuration. Entries live until the owner calls
/// [`TransformCache::invalidate`] or [`TransformCache::clear`].
#[derive(Debug, Default)]
pub struct TransformCache {
    entries: RwLock<HashMap<u64, Arc<BlockTransform>>>,
}

impl TransformCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build(&self, key: TransformKey) -> Arc<BlockTransform> {
        let hash = key.hash_value();

        if let Some(transform) = self.entries.read().get(&hash) {
            return Arc::clone(transform);
        }

        let mut entries = self.entries.write();
        let transform = entries.entry(hash).or_insert_with(|| {
            log::debug!(
                "Building block transform for {}px blocks, {} coefficients",
                key.block_size,
                key.descriptor_len
            );
            Arc::new(BlockTransform::new(key.block_size as usize, key.descriptor_len))
        });
        Arc::clone(transform)
    }

    /// Drops one entry. Callers holding the `Arc` keep using their copy.
    pub fn invalidate(&self, key: TransformKey) -> bool {
        self.entries.write().remove(&key.hash_value()).is_some()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
