use crate::errors::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

/// A state check evaluated atomically with a transaction's mutations.
/// Preconditions let callers detect lost races at commit time instead of
/// locking.
#[derive(Debug, Clone)]
pub enum Precondition {
    Absent(Bytes),
    ValueEquals(Bytes, Bytes),
}

impl Precondition {
    pub fn key(&self) -> &Bytes {
        match self {
            Precondition::Absent(k) | Precondition::ValueEquals(k, _) => k,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Mutation {
    Put(Bytes, Bytes),
    Delete(Bytes),
}

/// Preconditions plus mutations, committed atomically within one entity
/// group (the backing store may span a small number of groups, as the
/// compaction swap requires).
#[derive(Debug, Default)]
pub struct Transaction {
    pub checks: Vec<Precondition>,
    pub ops: Vec<Mutation>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_absent(&mut self, key: Bytes) -> &mut Self {
        self.checks.push(Precondition::Absent(key));
        self
    }

    pub fn check_equals(&mut self, key: Bytes, expected: Bytes) -> &mut Self {
        self.checks.push(Precondition::ValueEquals(key, expected));
        self
    }

    pub fn put(&mut self, key: Bytes, value: Bytes) -> &mut Self {
        self.ops.push(Mutation::Put(key, value));
        self
    }

    pub fn delete(&mut self, key: Bytes) -> &mut Self {
        self.ops.push(Mutation::Delete(key));
        self
    }
}

#[derive(Debug)]
pub enum TxnOutcome {
    Committed,
    /// A precondition failed; nothing was written. `current` is the value
    /// observed at the failing key, for callers that can recover from it
    /// (e.g. a name reservation finding the existing holder).
    Contended {
        failed: Bytes,
        current: Option<Bytes>,
    },
}

#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    async fn get(&self, key: &Bytes) -> Result<Option<Bytes>, StoreError>;

    async fn get_multi(&self, keys: &[Bytes]) -> Result<Vec<Option<Bytes>>, StoreError>;

    async fn put(&self, key: Bytes, value: Bytes) -> Result<(), StoreError>;

    async fn put_multi(&self, pairs: Vec<(Bytes, Bytes)>) -> Result<(), StoreError>;

    async fn delete(&self, key: &Bytes) -> Result<(), StoreError>;

    async fn delete_multi(&self, keys: &[Bytes]) -> Result<(), StoreError>;

    /// Ordered scan over `[start, end)`, up to `limit` pairs. May be
    /// eventually consistent with respect to concurrent transactions.
    async fn scan(
        &self,
        start: Bytes,
        end: Bytes,
        limit: usize,
    ) -> Result<Vec<(Bytes, Bytes)>, StoreError>;

    async fn transact(&self, txn: Transaction) -> Result<TxnOutcome, StoreError>;
}

#[derive(Debug)]
pub enum InsertOutcome {
    Inserted,
    Existing(Bytes),
}

const INSERT_ATTEMPTS: usize = 16;

/// Reserve a key: write it only if absent, otherwise report the current
/// value. Loops on the narrow race where the key is deleted between the
/// failed commit and the follow-up read.
pub async fn insert_if_absent(
    store: &dyn KeyValueStore,
    key: Bytes,
    value: Bytes,
) -> Result<InsertOutcome, StoreError> {
    for _ in 0..INSERT_ATTEMPTS {
        let mut txn = Transaction::new();
        txn.check_absent(key.clone());
        txn.put(key.clone(), value.clone());
        match store.transact(txn).await? {
            TxnOutcome::Committed => return Ok(InsertOutcome::Inserted),
            TxnOutcome::Contended {
                current: Some(v), ..
            } => return Ok(InsertOutcome::Existing(v)),
            TxnOutcome::Contended { current: None, .. } => continue,
        }
    }
    Err(StoreError::Unavailable(
        "insert contention did not resolve".into(),
    ))
}

/// In-memory store with globally atomic transactions. The test double for
/// every component in this crate; production deployments supply their own
/// backend.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<BTreeMap<Bytes, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &Bytes) -> Result<Option<Bytes>, StoreError> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    async fn get_multi(&self, keys: &[Bytes]) -> Result<Vec<Option<Bytes>>, StoreError> {
        let map = self.map.lock().unwrap();
        Ok(keys.iter().map(|k| map.get(k).cloned()).collect())
    }

    async fn put(&self, key: Bytes, value: Bytes) -> Result<(), StoreError> {
        self.map.lock().unwrap().insert(key, value);
        Ok(())
    }

    async fn put_multi(&self, pairs: Vec<(Bytes, Bytes)>) -> Result<(), StoreError> {
        let mut map = self.map.lock().unwrap();
        for (k, v) in pairs {
            map.insert(k, v);
        }
        Ok(())
    }

    async fn delete(&self, key: &Bytes) -> Result<(), StoreError> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }

    async fn delete_multi(&self, keys: &[Bytes]) -> Result<(), StoreError> {
        let mut map = self.map.lock().unwrap();
        for k in keys {
            map.remove(k);
        }
        Ok(())
    }

    async fn scan(
        &self,
        start: Bytes,
        end: Bytes,
        limit: usize,
    ) -> Result<Vec<(Bytes, Bytes)>, StoreError> {
        let map = self.map.lock().unwrap();
        Ok(map
            .range((Bound::Included(start), Bound::Excluded(end)))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn transact(&self, txn: Transaction) -> Result<TxnOutcome, StoreError> {
        let mut map = self.map.lock().unwrap();
        for check in &txn.checks {
            let current = map.get(check.key()).cloned();
            let ok = match check {
                Precondition::Absent(_) => current.is_none(),
                Precondition::ValueEquals(_, expected) => current.as_ref() == Some(expected),
            };
            if !ok {
                return Ok(TxnOutcome::Contended {
                    failed: check.key().clone(),
                    current,
                });
            }
        }
        for op in txn.ops {
            match op {
                Mutation::Put(k, v) => {
                    map.insert(k, v);
                }
                Mutation::Delete(k) => {
                    map.remove(&k);
                }
            }
        }
        Ok(TxnOutcome::Committed)
    }
}
