use crate::cache::MetaCache;
use crate::errors::MetaError;
use crate::keys::KeyCodec;
use crate::kv::{KeyValueStore, Transaction, TxnOutcome};
use crate::types::{FileId, VolumeId};
use bytes::Bytes;
use rand::Rng;
use std::sync::Arc;
use tracing::debug;

const ADD_ATTEMPTS: u32 = 32;

/// Approximately-consistent counter spread over N shard keys so concurrent
/// increments do not contend on one hot key. Exact once writers drain;
/// advisory in between.
pub struct ShardedCounter {
    store: Arc<dyn KeyValueStore>,
    cache: Arc<MetaCache>,
    shards: u32,
}

impl ShardedCounter {
    pub fn new(store: Arc<dyn KeyValueStore>, cache: Arc<MetaCache>, shards: u32) -> Self {
        Self {
            store,
            cache,
            shards: shards.max(1),
        }
    }

    /// Apply `delta` to one randomly chosen shard via CAS.
    pub async fn add(
        &self,
        volume_id: VolumeId,
        parent_id: FileId,
        delta: i64,
    ) -> Result<(), MetaError> {
        let shard = rand::thread_rng().gen_range(0..self.shards);
        let key = KeyCodec::counter_shard_key(volume_id, parent_id, shard);

        for _ in 0..ADD_ATTEMPTS {
            let current = self.store.get(&key).await?;
            let value = match &current {
                Some(raw) => decode_i64(raw)?,
                None => 0,
            };
            let next = value + delta;

            let mut txn = Transaction::new();
            match current {
                Some(raw) => txn.check_equals(key.clone(), raw),
                None => txn.check_absent(key.clone()),
            };
            txn.put(key.clone(), encode_i64(next));

            match self.store.transact(txn).await? {
                TxnOutcome::Committed => {
                    self.cache
                        .delete(&KeyCodec::child_count_cache_key(volume_id, parent_id));
                    return Ok(());
                }
                TxnOutcome::Contended { .. } => {
                    debug!(volume_id, parent_id, shard, "counter shard contended, retrying");
                }
            }
        }
        Err(MetaError::Conflict)
    }

    /// Sum all shards. Negative transients (a decrement landing before the
    /// matching increment is visible) clamp to zero.
    pub async fn get(&self, volume_id: VolumeId, parent_id: FileId) -> Result<u64, MetaError> {
        let cache_key = KeyCodec::child_count_cache_key(volume_id, parent_id);
        if let Some(count) = self.cache.get_count(&cache_key) {
            return Ok(count);
        }

        let keys = KeyCodec::counter_shard_keys(volume_id, parent_id, self.shards);
        let values = self.store.get_multi(&keys).await?;
        let mut sum: i64 = 0;
        for value in values.into_iter().flatten() {
            sum += decode_i64(&value)?;
        }
        let count = sum.max(0) as u64;
        self.cache.set_count(cache_key, count);
        Ok(count)
    }

    /// Remove all shards; used when the owning directory is purged.
    pub async fn clear(&self, volume_id: VolumeId, parent_id: FileId) -> Result<(), MetaError> {
        let keys = KeyCodec::counter_shard_keys(volume_id, parent_id, self.shards);
        self.store.delete_multi(&keys).await?;
        self.cache
            .delete(&KeyCodec::child_count_cache_key(volume_id, parent_id));
        Ok(())
    }
}

fn encode_i64(value: i64) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

fn decode_i64(raw: &[u8]) -> Result<i64, MetaError> {
    let arr: [u8; 8] = raw
        .try_into()
        .map_err(|_| MetaError::Serialization("counter shard is not 8 bytes".to_string()))?;
    Ok(i64::from_be_bytes(arr))
}
