use crate::counter::ShardedCounter;
use crate::errors::MetaError;
use crate::keys::KeyCodec;
use crate::kv::{KeyValueStore, Transaction, TxnOutcome};
use crate::types::{FileId, Timestamp, VolumeId};
use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Payload shared by both sides of the directory index. The DirEntIndex
/// side is keyed by (volume, parent, dir_index), the EntDirIndex side by
/// (volume, file_id); for an allocated child the two payloads agree.
/// Transient disagreement means an in-flight swap and must be treated as
/// a retryable race, never as ground truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexNode {
    pub volume_id: VolumeId,
    pub parent_id: FileId,
    pub file_id: FileId,
    pub dir_index: u64,
    pub generation: u64,
    pub alloced: bool,
    pub nonce: u64,
}

impl IndexNode {
    fn new(volume_id: VolumeId, parent_id: FileId, file_id: FileId, dir_index: u64) -> Self {
        IndexNode {
            volume_id,
            parent_id,
            file_id,
            dir_index,
            generation: Timestamp::now().sec,
            alloced: true,
            nonce: rand::thread_rng().gen(),
        }
    }

    fn dirent_key(&self) -> Bytes {
        KeyCodec::dirent_index_key(self.volume_id, self.parent_id, self.dir_index)
    }

    fn entdir_key(&self) -> Bytes {
        KeyCodec::entdir_index_key(self.volume_id, self.file_id)
    }

    pub fn to_bytes(&self) -> Result<Bytes, MetaError> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| MetaError::Serialization(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, MetaError> {
        bincode::deserialize(data).map_err(|e| MetaError::Serialization(e.to_string()))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum TryInsertOutcome {
    Inserted { dir_index: u64 },
    /// The candidate slot is held by another child. The caller retries
    /// with `suggested`; the ladder keeps insert-only workloads dense.
    Busy { suggested: u64 },
}

#[derive(Debug, PartialEq, Eq)]
pub enum FreeOutcome {
    Freed(u64),
    /// The slot was already free or absent; treated as a no-op upstream.
    AlreadyFree,
}

#[derive(Debug)]
pub struct IndexPage {
    pub nodes: Vec<IndexNode>,
    pub next_index: u64,
    pub have_more: bool,
}

/// The two-sided slot index of a directory, with the compaction that keeps
/// allocated slots inside `[0, child_count)` under concurrent churn.
pub struct DirectoryIndex {
    store: Arc<dyn KeyValueStore>,
    counters: Arc<ShardedCounter>,
    scan_limit: usize,
    max_rounds: u32,
}

impl DirectoryIndex {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        counters: Arc<ShardedCounter>,
        scan_limit: usize,
        max_rounds: u32,
    ) -> Self {
        Self {
            store,
            counters,
            scan_limit: scan_limit.max(2),
            max_rounds: max_rounds.max(1),
        }
    }

    /// Claim `candidate` for `file_id`, creating the node pair. Never
    /// blocks: either the slot (or a better one) is claimed, or the caller
    /// learns a new candidate to try.
    pub async fn try_insert(
        &self,
        volume_id: VolumeId,
        parent_id: FileId,
        file_id: FileId,
        candidate: u64,
    ) -> Result<TryInsertOutcome, MetaError> {
        // A re-run of a deferred insert may find the child already placed.
        let entdir_key = KeyCodec::entdir_index_key(volume_id, file_id);
        if let Some(raw) = self.store.get(&entdir_key).await? {
            let existing = IndexNode::from_bytes(&raw)?;
            if existing.alloced && existing.parent_id == parent_id {
                return Ok(TryInsertOutcome::Inserted {
                    dir_index: existing.dir_index,
                });
            }
        }

        let node = IndexNode::new(volume_id, parent_id, file_id, candidate);
        let dirent_key = node.dirent_key();
        let payload = node.to_bytes()?;

        let mut txn = Transaction::new();
        match self.store.get(&dirent_key).await? {
            Some(raw) => {
                let current = IndexNode::from_bytes(&raw)?;
                if current.alloced {
                    if current.file_id == file_id {
                        return Ok(TryInsertOutcome::Inserted {
                            dir_index: candidate,
                        });
                    }
                    return Ok(TryInsertOutcome::Busy {
                        suggested: candidate + 1,
                    });
                }
                // Reclaim an explicitly freed gap, reaping the freed
                // child's EntDirIndex record along with it.
                txn.check_equals(dirent_key.clone(), raw);
                if current.file_id != file_id {
                    self.reap_gap_entdir(&current, &mut txn).await?;
                }
            }
            None => {
                txn.check_absent(dirent_key.clone());
            }
        }
        txn.put(dirent_key, payload.clone());
        txn.put(entdir_key, payload);

        match self.store.transact(txn).await? {
            TxnOutcome::Committed => {}
            TxnOutcome::Contended { .. } => {
                return Ok(TryInsertOutcome::Busy {
                    suggested: candidate + 1,
                });
            }
        }

        // Slot claimed; opportunistically move toward the front if an
        // earlier gap exists. Losing this race keeps the claimed slot.
        match self.improve_position(&node).await {
            Ok(Some(dir_index)) => Ok(TryInsertOutcome::Inserted { dir_index }),
            Ok(None) => Ok(TryInsertOutcome::Inserted {
                dir_index: candidate,
            }),
            Err(e) if e.is_retryable() => Ok(TryInsertOutcome::Inserted {
                dir_index: candidate,
            }),
            Err(e) => Err(e),
        }
    }

    /// Find the lowest explicit gap below the node's slot and swap into it.
    async fn improve_position(&self, node: &IndexNode) -> Result<Option<u64>, MetaError> {
        if node.dir_index == 0 {
            return Ok(None);
        }
        let start = KeyCodec::dirent_index_key(node.volume_id, node.parent_id, 0);
        let end = node.dirent_key();
        let rows = self.store.scan(start, end, self.scan_limit).await?;
        for (_, raw) in rows {
            let gap = IndexNode::from_bytes(&raw)?;
            if gap.alloced {
                continue;
            }
            let moved = self
                .swap_into_gap(&gap, raw, node, node.to_bytes()?)
                .await?;
            if moved {
                return Ok(Some(gap.dir_index));
            }
            break;
        }
        Ok(None)
    }

    /// The compaction swap: verify both slots still hold their expected
    /// state, write `moving`'s child into the gap (both index sides), drop
    /// the vacated slot and the freed child's EntDirIndex record. Returns
    /// false when a precondition went stale, which is always benign.
    async fn swap_into_gap(
        &self,
        gap: &IndexNode,
        gap_raw: Bytes,
        moving: &IndexNode,
        moving_raw: Bytes,
    ) -> Result<bool, MetaError> {
        let mut relocated = moving.clone();
        relocated.dir_index = gap.dir_index;
        relocated.generation = Timestamp::now().sec;
        relocated.nonce = rand::thread_rng().gen();
        let payload = relocated.to_bytes()?;

        let mut txn = Transaction::new();
        txn.check_equals(gap.dirent_key(), gap_raw);
        txn.check_equals(moving.dirent_key(), moving_raw);
        self.reap_gap_entdir(gap, &mut txn).await?;
        txn.put(relocated.dirent_key(), payload.clone());
        txn.put(relocated.entdir_key(), payload);
        txn.delete(moving.dirent_key());

        match self.store.transact(txn).await? {
            TxnOutcome::Committed => Ok(true),
            TxnOutcome::Contended { failed, .. } => {
                debug!(
                    parent_id = gap.parent_id,
                    gap = gap.dir_index,
                    moving = moving.dir_index,
                    ?failed,
                    "compaction swap lost a race"
                );
                Ok(false)
            }
        }
    }

    /// Flip the child's slot to free on both index sides. Compaction is a
    /// separate step so it can run as deferred work.
    pub async fn free(
        &self,
        volume_id: VolumeId,
        parent_id: FileId,
        file_id: FileId,
    ) -> Result<FreeOutcome, MetaError> {
        let entdir_key = KeyCodec::entdir_index_key(volume_id, file_id);
        for _ in 0..self.max_rounds {
            let Some(ent_raw) = self.store.get(&entdir_key).await? else {
                return Ok(FreeOutcome::AlreadyFree);
            };
            let ent = IndexNode::from_bytes(&ent_raw)?;
            if !ent.alloced || ent.parent_id != parent_id {
                return Ok(FreeOutcome::AlreadyFree);
            }

            let dirent_key = KeyCodec::dirent_index_key(volume_id, parent_id, ent.dir_index);
            let Some(dir_raw) = self.store.get(&dirent_key).await? else {
                // Pair out of sync: a swap is in flight.
                continue;
            };
            let dir_node = IndexNode::from_bytes(&dir_raw)?;
            if dir_node.file_id != file_id || !dir_node.alloced {
                continue;
            }

            let mut freed = dir_node.clone();
            freed.alloced = false;
            freed.generation = Timestamp::now().sec;
            freed.nonce = rand::thread_rng().gen();
            let payload = freed.to_bytes()?;

            let mut txn = Transaction::new();
            txn.check_equals(dirent_key.clone(), dir_raw);
            txn.check_equals(entdir_key.clone(), ent_raw);
            txn.put(dirent_key, payload.clone());
            txn.put(entdir_key.clone(), payload);
            match self.store.transact(txn).await? {
                TxnOutcome::Committed => return Ok(FreeOutcome::Freed(dir_node.dir_index)),
                TxnOutcome::Contended { .. } => continue,
            }
        }
        Err(MetaError::Conflict)
    }

    /// Free a child's slot and densify. The usual entry point for deletes.
    pub async fn delete(
        &self,
        volume_id: VolumeId,
        parent_id: FileId,
        file_id: FileId,
    ) -> Result<(), MetaError> {
        match self.free(volume_id, parent_id, file_id).await? {
            FreeOutcome::Freed(index) => self.compactify(volume_id, parent_id, index).await,
            FreeOutcome::AlreadyFree => Ok(()),
        }
    }

    /// Ensure no occupied slot survives at or beyond the child count by
    /// pulling one into the gap at `freed_index`, or dropping the gap
    /// outright when it sits at the boundary. Stateless between rounds:
    /// safe to re-run with stale arguments, converges or reports
    /// `Exhausted` when no candidate is available.
    pub async fn compactify(
        &self,
        volume_id: VolumeId,
        parent_id: FileId,
        freed_index: u64,
    ) -> Result<(), MetaError> {
        let mut cutoff = u64::MAX;
        for _ in 0..self.max_rounds {
            // The counter is advisory; taking the min over rounds keeps the
            // target range from growing while we race other compactions.
            let count = self.counters.get(volume_id, parent_id).await?;
            cutoff = cutoff.min(count);

            let free_key = KeyCodec::dirent_index_key(volume_id, parent_id, freed_index);
            let Some(free_raw) = self.store.get(&free_key).await? else {
                return Ok(());
            };
            let free_node = IndexNode::from_bytes(&free_raw)?;
            if free_node.alloced {
                // An insert reclaimed the gap.
                return Ok(());
            }

            if freed_index >= cutoff {
                if self.remove_gap(&free_node, free_raw).await? {
                    return Ok(());
                }
                continue;
            }

            let (start, end) = KeyCodec::dirent_index_range(volume_id, parent_id, cutoff);
            let rows = self.store.scan(start, end, self.scan_limit).await?;
            let mut candidates = Vec::new();
            for (_, raw) in rows {
                let node = IndexNode::from_bytes(&raw)?;
                if node.alloced {
                    candidates.push((node, raw));
                }
            }
            if candidates.is_empty() {
                // Concurrent deletes may still be draining their
                // decrements; a shrinking counter re-opens the range.
                let fresh = self.counters.get(volume_id, parent_id).await?;
                if fresh < cutoff {
                    cutoff = fresh;
                    continue;
                }
                debug!(volume_id, parent_id, freed_index, "no compaction candidate");
                return Err(MetaError::Exhausted);
            }
            // Random pick spreads concurrent compactions across candidates.
            let (node, raw) = {
                let i = rand::thread_rng().gen_range(0..candidates.len());
                candidates.swap_remove(i)
            };
            if self.swap_into_gap(&free_node, free_raw, &node, raw).await? {
                return Ok(());
            }
        }
        Err(MetaError::Conflict)
    }

    /// Drop a free node that sits at or beyond the live boundary, along
    /// with the freed child's EntDirIndex record when it still matches.
    async fn remove_gap(&self, gap: &IndexNode, gap_raw: Bytes) -> Result<bool, MetaError> {
        let mut txn = Transaction::new();
        txn.check_equals(gap.dirent_key(), gap_raw);
        txn.delete(gap.dirent_key());
        self.reap_gap_entdir(gap, &mut txn).await?;
        match self.store.transact(txn).await? {
            TxnOutcome::Committed => Ok(true),
            TxnOutcome::Contended { .. } => Ok(false),
        }
    }

    /// When the freed child's EntDirIndex record still describes `gap`,
    /// fold its removal into `txn`. The child may already be indexed under
    /// a new parent (rename); a mismatched record is left alone.
    async fn reap_gap_entdir(
        &self,
        gap: &IndexNode,
        txn: &mut Transaction,
    ) -> Result<(), MetaError> {
        let entdir_key = gap.entdir_key();
        if let Some(ent_raw) = self.store.get(&entdir_key).await? {
            let ent = IndexNode::from_bytes(&ent_raw)?;
            if !ent.alloced && ent.parent_id == gap.parent_id && ent.dir_index == gap.dir_index {
                txn.check_equals(entdir_key.clone(), ent_raw);
                txn.delete(entdir_key);
            }
        }
        Ok(())
    }

    /// Remove all index nodes of a directory without compaction; only for
    /// destroying the directory wholesale.
    pub async fn purge(&self, volume_id: VolumeId, parent_id: FileId) -> Result<(), MetaError> {
        loop {
            let (start, end) = KeyCodec::dirent_index_range(volume_id, parent_id, 0);
            let rows = self.store.scan(start, end, self.scan_limit).await?;
            if rows.is_empty() {
                return Ok(());
            }
            let mut keys = Vec::with_capacity(rows.len() * 2);
            for (key, raw) in &rows {
                keys.push(key.clone());
                let node = IndexNode::from_bytes(raw)?;
                keys.push(KeyCodec::entdir_index_key(volume_id, node.file_id));
            }
            self.store.delete_multi(&keys).await?;
        }
    }

    /// The child's slot record, if any.
    pub async fn read(
        &self,
        volume_id: VolumeId,
        file_id: FileId,
    ) -> Result<Option<IndexNode>, MetaError> {
        let key = KeyCodec::entdir_index_key(volume_id, file_id);
        match self.store.get(&key).await? {
            Some(raw) => Ok(Some(IndexNode::from_bytes(&raw)?)),
            None => Ok(None),
        }
    }

    /// Allocated slots from `start_index` onward, in slot order.
    pub async fn page(
        &self,
        volume_id: VolumeId,
        parent_id: FileId,
        start_index: u64,
        page_size: usize,
    ) -> Result<IndexPage, MetaError> {
        let mut nodes: Vec<IndexNode> = Vec::new();
        let mut from = start_index;
        let mut have_more = false;
        'outer: loop {
            let (start, end) = KeyCodec::dirent_index_range(volume_id, parent_id, from);
            let rows = self.store.scan(start, end, self.scan_limit).await?;
            let exhausted = rows.len() < self.scan_limit;
            for (_, raw) in &rows {
                let node = IndexNode::from_bytes(raw)?;
                from = node.dir_index + 1;
                if !node.alloced {
                    continue;
                }
                if nodes.len() == page_size {
                    have_more = true;
                    break 'outer;
                }
                nodes.push(node);
            }
            if exhausted {
                break;
            }
        }
        let next_index = nodes.last().map(|n| n.dir_index + 1).unwrap_or(start_index);
        Ok(IndexPage {
            nodes,
            next_index,
            have_more,
        })
    }

    /// True when the directory has at least one allocated slot.
    pub async fn has_allocated_children(
        &self,
        volume_id: VolumeId,
        parent_id: FileId,
    ) -> Result<bool, MetaError> {
        let page = self.page(volume_id, parent_id, 0, 1).await?;
        Ok(!page.nodes.is_empty())
    }
}
