use std::{
    collections::HashMap,
    hash::Hash,
    time::{SystemTime, UNIX_EPOCH},
};

/// Set whose entries expire once the chain moved a given number of blocks past them.
pub(crate) struct SeenSet<K>
where
    K: Hash + Eq,
{
    entries: HashMap<K, u64>,
    retention_blocks: u64,
}

impl<K> SeenSet<K>
where
    K: Hash + Eq,
{
    /// Create a new SeenSet keeping entries for `retention_blocks` blocks.
    pub fn new(retention_blocks: u64) -> Self {
        Self {
            entries: HashMap::new(),
            retention_blocks,
        }
    }

    /// Insert a key seen at `block_number`. Returns `false` if it was already present.
    pub fn insert(&mut self, key: K, block_number: u64) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, block_number);
        true
    }

    /// Returns `true` if the key is present.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Drop entries more than `retention_blocks` below `head`.
    pub fn prune(&mut self, head: u64) {
        let Some(floor) = head.checked_sub(self.retention_blocks) else {
            return;
        };
        self.entries.retain(|_, block| *block >= floor);
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
