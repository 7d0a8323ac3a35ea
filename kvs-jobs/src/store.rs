//! In-memory key-value storage shared by every job worker.
//!
//! The table is a fixed array of buckets, each holding a short chain of
//! entries. All access goes through a single `RwLock`: read batches and
//! snapshots share it, write and delete batches take it exclusively, so no
//! caller ever observes half of a batch.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::StoreError;

/// Number of buckets in the table.
pub const TABLE_SIZE: usize = 26;

#[derive(Debug, Clone)]
struct Entry {
    key: String,
    value: String,
}

type Buckets = Vec<Vec<Entry>>;

/// Thread-safe key-value store used by every job worker.
///
/// Share it behind an `Arc`; all methods take `&self` and lock internally.
/// After [`KvStore::terminate`] every operation fails with
/// [`StoreError::NotInitialized`].
///
/// # Why one RwLock instead of a lock per bucket?
///
/// A `WRITE` or `DELETE` batch can touch many buckets, and other jobs must
/// see either all of it or none of it. Per-bucket locks would need a fixed
/// acquisition order across the batch to get the same guarantee.
///
/// `READ`, `SHOW` and backup snapshots only take the read side, so jobs that
/// mostly read, and the backup consumers, run side by side. Only mutating
/// batches serialize.
///
/// # Why `Option` around the table?
///
/// Teardown is explicit: after the engine has joined every worker and drained
/// the backups it calls [`KvStore::terminate`]. A stray caller after that
/// point gets an error instead of silently recreating state.
pub struct KvStore {
    table: RwLock<Option<Buckets>>,
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore {
    /// Creates an empty, initialized store.
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Some(vec![Vec::new(); TABLE_SIZE])),
        }
    }

    /// Upserts every pair in order. A key repeated within the batch ends up
    /// holding the value of its last occurrence.
    pub fn write<K, V>(&self, pairs: &[(K, V)]) -> Result<(), StoreError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut guard = self.write_lock();
        let buckets = guard.as_mut().ok_or(StoreError::NotInitialized)?;
        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref());
            let chain = &mut buckets[bucket_index(key)];
            match chain.iter_mut().find(|entry| entry.key == key) {
                Some(entry) => entry.value = value.to_string(),
                None => chain.push(Entry {
                    key: key.to_string(),
                    value: value.to_string(),
                }),
            }
        }
        Ok(())
    }

    /// Looks up every key, returning results in lexicographic key order.
    ///
    /// Duplicate keys are not collapsed; each occurrence gets its own result.
    pub fn read<K: AsRef<str>>(
        &self,
        keys: &[K],
    ) -> Result<Vec<(String, Option<String>)>, StoreError> {
        let mut sorted: Vec<&str> = keys.iter().map(AsRef::as_ref).collect();
        sorted.sort_unstable();

        let guard = self.read_lock();
        let buckets = guard.as_ref().ok_or(StoreError::NotInitialized)?;
        Ok(sorted
            .into_iter()
            .map(|key| (key.to_string(), lookup(buckets, key).map(str::to_string)))
            .collect())
    }

    /// Removes every key in request order. The flag is `false` for keys
    /// that were not present.
    pub fn delete<K: AsRef<str>>(&self, keys: &[K]) -> Result<Vec<(String, bool)>, StoreError> {
        let mut guard = self.write_lock();
        let buckets = guard.as_mut().ok_or(StoreError::NotInitialized)?;
        Ok(keys
            .iter()
            .map(|key| {
                let key = key.as_ref();
                let chain = &mut buckets[bucket_index(key)];
                let removed = match chain.iter().position(|entry| entry.key == key) {
                    Some(pos) => {
                        chain.remove(pos);
                        true
                    }
                    None => false,
                };
                (key.to_string(), removed)
            })
            .collect())
    }

    /// Copies out every live entry at one instant, in bucket then chain order.
    pub fn snapshot(&self) -> Result<Vec<(String, String)>, StoreError> {
        let guard = self.read_lock();
        let buckets = guard.as_ref().ok_or(StoreError::NotInitialized)?;
        Ok(buckets
            .iter()
            .flatten()
            .map(|entry| (entry.key.clone(), entry.value.clone()))
            .collect())
    }

    /// Number of live entries.
    pub fn len(&self) -> Result<usize, StoreError> {
        let guard = self.read_lock();
        let buckets = guard.as_ref().ok_or(StoreError::NotInitialized)?;
        Ok(buckets.iter().map(Vec::len).sum())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Drops the table. Fails if the store was already terminated.
    pub fn terminate(&self) -> Result<(), StoreError> {
        self.write_lock()
            .take()
            .map(drop)
            .ok_or(StoreError::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.read_lock().is_some()
    }

    // Entries are replaced whole, so a poisoned table is still consistent.
    fn read_lock(&self) -> RwLockReadGuard<'_, Option<Buckets>> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, Option<Buckets>> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lookup<'a>(buckets: &'a Buckets, key: &str) -> Option<&'a str> {
    buckets[bucket_index(key)]
        .iter()
        .find(|entry| entry.key == key)
        .map(|entry| entry.value.as_str())
}

/// Maps a key to its bucket by its first character: letters to `0..26`,
/// digits to `0..10`, anything else by byte sum.
fn bucket_index(key: &str) -> usize {
    match key.bytes().next() {
        Some(b) if b.is_ascii_alphabetic() => (b.to_ascii_lowercase() - b'a') as usize,
        Some(b) if b.is_ascii_digit() => (b - b'0') as usize,
        _ => key.bytes().map(usize::from).sum::<usize>() % TABLE_SIZE,
    }
}
