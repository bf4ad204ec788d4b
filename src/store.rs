use crate::cache::MetaCache;
use crate::counter::ShardedCounter;
use crate::deferred::{DeferredTask, DeferredTaskRunner};
use crate::entry::{aggregate_shards, AggregatedAttrs, Entry, EntryShard, EntryView};
use crate::errors::MetaError;
use crate::index::{DirectoryIndex, TryInsertOutcome};
use crate::keys::KeyCodec;
use crate::kv::{insert_if_absent, InsertOutcome, KeyValueStore, Transaction, TxnOutcome};
use crate::name_holder::{NameHolder, NameHolderStore, ReserveOutcome};
use crate::permissions::{check_readable, check_writable};
use crate::types::{
    Caller, ChcoordOutcome, CreateRequest, DirPage, EntryState, EntryType, FileId, GatewayId,
    PageToken, RenameRequest, SetMode, SetOwner, SetSize, SetTime, SetUmount, Timestamp,
    UpdateRequest, VersionedPage, VolumeInfo, ROOT_FILE_ID,
};
use crate::Config;
use bytes::Bytes;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, warn};

const MAX_ANCESTOR_DEPTH: u32 = 4096;

/// The public façade over the namespace metadata: entries, shards, name
/// reservations, directory indexing and child counters, composed under
/// permission checks. Cheap to clone; background tasks hold clones.
#[derive(Clone)]
pub struct EntryStore {
    pub store: Arc<dyn KeyValueStore>,
    pub cache: Arc<MetaCache>,
    pub counters: Arc<ShardedCounter>,
    pub index: Arc<DirectoryIndex>,
    pub names: Arc<NameHolderStore>,
    pub runner: Arc<dyn DeferredTaskRunner>,
    pub volume: VolumeInfo,
    config: Config,
}

impl EntryStore {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        runner: Arc<dyn DeferredTaskRunner>,
        volume: VolumeInfo,
        config: Config,
    ) -> Self {
        let cache = Arc::new(MetaCache::new(config.cache_capacity));
        let counters = Arc::new(ShardedCounter::new(
            store.clone(),
            cache.clone(),
            config.counter_shards,
        ));
        let index = Arc::new(DirectoryIndex::new(
            store.clone(),
            counters.clone(),
            config.scan_limit,
            config.compaction_rounds,
        ));
        let names = Arc::new(NameHolderStore::new(store.clone()));
        Self {
            store,
            cache,
            counters,
            index,
            names,
            runner,
            volume,
            config,
        }
    }

    fn vol(&self) -> u64 {
        self.volume.volume_id
    }

    /// Bootstrap the volume root. Idempotent: a second call returns the
    /// existing root. The root never gets a name reservation.
    pub async fn create_root(&self, coordinator_id: GatewayId) -> Result<Entry, MetaError> {
        let now = Timestamp::now();
        let entry = Entry {
            volume_id: self.vol(),
            file_id: ROOT_FILE_ID,
            parent_id: ROOT_FILE_ID,
            ftype: EntryType::Dir,
            name: String::new(),
            owner_id: self.volume.owner_id,
            coordinator_id,
            mode: 0o755,
            version: 1,
            state: EntryState::Live,
            ctime: now,
            umount_id: 0,
        };
        let key = KeyCodec::entry_key(self.vol(), ROOT_FILE_ID);
        match insert_if_absent(self.store.as_ref(), key, entry.to_bytes()?).await? {
            InsertOutcome::Inserted => {
                let shard = EntryShard::new_for(&entry, now, 0);
                self.put_shard(&shard).await?;
                debug!(volume_id = self.vol(), "volume root created");
                Ok(entry)
            }
            InsertOutcome::Existing(raw) => Entry::from_bytes(&raw),
        }
    }

    pub async fn create(&self, caller: Caller, req: CreateRequest) -> Result<EntryView, MetaError> {
        debug!(
            file_id = req.file_id,
            parent_id = req.parent_id,
            name = %req.name,
            "create"
        );
        if req.name.is_empty() {
            return Err(MetaError::InvalidArgument("name must not be empty"));
        }
        if req.file_id == ROOT_FILE_ID {
            return Err(MetaError::InvalidArgument("file id 0 is the volume root"));
        }

        let holder = NameHolder {
            volume_id: self.vol(),
            parent_id: req.parent_id,
            file_id: req.file_id,
            name: req.name.clone(),
        };
        let (parent_res, reserve_res) =
            tokio::join!(self.read_base(req.parent_id), self.names.reserve(&holder));

        // A reservation we just made is ours to roll back on any failure
        // below. A colliding one is not.
        let reserved = match reserve_res? {
            ReserveOutcome::Reserved => true,
            ReserveOutcome::Held(existing) if existing.file_id == req.file_id => false,
            ReserveOutcome::Held(_) => return Err(MetaError::AlreadyExists),
        };

        let parent = match parent_res {
            Ok(p) => p,
            Err(e) => {
                if reserved {
                    self.schedule_release_name(req.parent_id, req.name.clone(), req.file_id);
                }
                return Err(e);
            }
        };
        if let Err(e) = self.check_parent_writable(caller, &parent) {
            if reserved {
                self.schedule_release_name(req.parent_id, req.name.clone(), req.file_id);
            }
            return Err(e);
        }

        let now = Timestamp::now();
        let entry = Entry {
            volume_id: self.vol(),
            file_id: req.file_id,
            parent_id: req.parent_id,
            ftype: req.ftype,
            name: req.name.clone(),
            owner_id: req.owner_id,
            coordinator_id: req.coordinator_id,
            mode: req.mode,
            version: 1,
            state: EntryState::Live,
            ctime: now,
            umount_id: 0,
        };
        let shard = EntryShard::new_for(&entry, now, 0);

        let write = async {
            // Child entry, its first shard, and a parent shard touch (new
            // write nonce) so cached listings of the parent go stale.
            let parent_attrs = self.read_attrs(&parent).await?;
            let touch = EntryShard::new_for(
                &parent,
                Timestamp::after(parent_attrs.mtime),
                parent_attrs.size,
            );
            self.store
                .put_multi(vec![
                    (
                        KeyCodec::entry_key(self.vol(), entry.file_id),
                        entry.to_bytes()?,
                    ),
                    (self.shard_slot_key(entry.file_id), shard.to_bytes()?),
                    (self.shard_slot_key(parent.file_id), touch.to_bytes()?),
                ])
                .await?;

            // The parent may have been tombstoned while we wrote; detect
            // the lost race and compensate rather than lock.
            let fresh = self.read_base_uncached(req.parent_id).await;
            match fresh {
                Ok(p) if p.is_live() => {}
                _ => return Err(MetaError::NotFound),
            }

            let mut candidate = self.counters.get(self.vol(), req.parent_id).await?;
            let mut dir_index = None;
            for _ in 0..self.config.insert_attempts {
                match self
                    .index
                    .try_insert(self.vol(), req.parent_id, req.file_id, candidate)
                    .await?
                {
                    TryInsertOutcome::Inserted { dir_index: idx } => {
                        dir_index = Some(idx);
                        break;
                    }
                    TryInsertOutcome::Busy { suggested } => candidate = suggested,
                }
            }
            if dir_index.is_none() {
                return Err(MetaError::Conflict);
            }
            Ok(())
        };

        if let Err(e) = write.await {
            self.schedule_create_rollback(req.parent_id, req.file_id, req.name.clone());
            return Err(e);
        }

        self.schedule_counter_add(req.parent_id, 1);
        self.cache
            .delete(&KeyCodec::child_count_cache_key(self.vol(), req.parent_id));

        Ok(EntryView {
            entry,
            attrs: AggregatedAttrs {
                mtime: shard.mtime,
                size: shard.size,
                write_nonce: shard.write_nonce,
            },
        })
    }

    /// Last-writer-wins attribute update. A whitelisted non-shard change
    /// rewrites the base record; otherwise only a fresh shard is written.
    pub async fn update(&self, caller: Caller, req: UpdateRequest) -> Result<EntryView, MetaError> {
        debug!(file_id = req.file_id, "update");
        let mut entry = self.read_base(req.file_id).await?;
        if !entry.is_live() {
            return Err(MetaError::NotFound);
        }
        check_writable(
            caller.user_id,
            entry.owner_id,
            self.volume.owner_id,
            entry.mode,
        )?;
        // Mode and ownership changes need ownership, not just write access.
        if (req.mode != SetMode::NoChange || req.owner_id != SetOwner::NoChange)
            && caller.user_id != entry.owner_id
            && caller.user_id != self.volume.owner_id
        {
            return Err(MetaError::PermissionDenied);
        }

        let attrs = self.read_attrs(&entry).await?;
        let mtime = match req.mtime {
            SetTime::SetToClientTime(t) => t,
            SetTime::SetToServerTime => Timestamp::after(attrs.mtime),
            SetTime::NoChange => attrs.mtime,
        };
        let size = match req.size {
            SetSize::Set(s) => s,
            SetSize::NoChange => attrs.size,
        };

        let entry_key = KeyCodec::entry_key(self.vol(), entry.file_id);
        if req.needs_write_base() {
            if let SetMode::Set(mode) = req.mode {
                entry.mode = mode & 0o777;
            }
            if let SetOwner::Set(owner) = req.owner_id {
                entry.owner_id = owner;
            }
            if let SetUmount::Set(umount) = req.umount_id {
                entry.umount_id = umount;
            }
            if req.bump_version {
                entry.version += 1;
            }
            let shard = EntryShard::new_for(&entry, mtime, size);
            self.store
                .put_multi(vec![
                    (entry_key.clone(), entry.to_bytes()?),
                    (self.shard_slot_key(entry.file_id), shard.to_bytes()?),
                ])
                .await?;
            self.cache.delete(&entry_key);
            return Ok(EntryView {
                entry,
                attrs: AggregatedAttrs {
                    mtime: shard.mtime,
                    size: shard.size,
                    write_nonce: shard.write_nonce,
                },
            });
        }

        let shard = EntryShard::new_for(&entry, mtime, size);
        self.put_shard(&shard).await?;
        self.cache.delete(&entry_key);
        let attrs = self.read_attrs(&entry).await?;
        Ok(EntryView { entry, attrs })
    }

    /// Compare-and-swap of the coordinator. A stale expectation returns
    /// the actual coordinator so the caller can retry with fresh state;
    /// this is a CAS, not a lock.
    pub async fn chcoord(
        &self,
        caller: Caller,
        file_id: FileId,
        expected: GatewayId,
        new: GatewayId,
    ) -> Result<ChcoordOutcome, MetaError> {
        debug!(file_id, expected, new, "chcoord");
        let key = KeyCodec::entry_key(self.vol(), file_id);
        for _ in 0..self.config.txn_attempts {
            let raw = self.store.get(&key).await?.ok_or(MetaError::NotFound)?;
            let mut entry = Entry::from_bytes(&raw)?;
            if !entry.is_live() {
                return Err(MetaError::NotFound);
            }
            check_writable(
                caller.user_id,
                entry.owner_id,
                self.volume.owner_id,
                entry.mode,
            )?;
            if entry.coordinator_id != expected {
                return Ok(ChcoordOutcome::Rejected {
                    current_coordinator: entry.coordinator_id,
                });
            }
            entry.coordinator_id = new;
            let mut txn = Transaction::new();
            txn.check_equals(key.clone(), raw);
            txn.put(key.clone(), entry.to_bytes()?);
            match self.store.transact(txn).await? {
                TxnOutcome::Committed => {
                    self.cache.delete(&key);
                    return Ok(ChcoordOutcome::Changed(entry));
                }
                TxnOutcome::Contended { .. } => continue,
            }
        }
        Err(MetaError::Conflict)
    }

    /// Two-phase delete: tombstone (with an emptiness check for
    /// directories), then deferred physical reclamation. A failed
    /// emptiness check rolls the tombstone back.
    pub async fn delete(&self, caller: Caller, file_id: FileId) -> Result<(), MetaError> {
        debug!(file_id, "delete");
        if file_id == ROOT_FILE_ID {
            return Err(MetaError::InvalidArgument("cannot delete the volume root"));
        }
        let key = KeyCodec::entry_key(self.vol(), file_id);
        let raw = self.store.get(&key).await?.ok_or(MetaError::NotFound)?;
        let entry = Entry::from_bytes(&raw)?;
        if !entry.is_live() {
            return Err(MetaError::NotFound);
        }
        check_writable(
            caller.user_id,
            entry.owner_id,
            self.volume.owner_id,
            entry.mode,
        )?;

        let (live_raw, tomb_raw) = self.tombstone(&key, raw).await?;
        self.cache.delete(&key);

        if entry.is_dir() {
            let occupied = match self.index.has_allocated_children(self.vol(), file_id).await {
                Ok(occupied) => occupied,
                Err(e) => {
                    self.untombstone(&key, tomb_raw, live_raw).await;
                    return Err(e);
                }
            };
            if occupied {
                self.untombstone(&key, tomb_raw, live_raw).await;
                return Err(MetaError::NotEmpty);
            }
        }

        self.schedule_delete_finish(entry);
        Ok(())
    }

    /// Four-entity move with no cross-group transaction: load, check,
    /// tombstone any overwritten destination while walking the ancestor
    /// chain for cycles, then rebind names and rewrite the base record.
    /// Lost races surface through the checks, not through locks.
    pub async fn rename(&self, caller: Caller, req: RenameRequest) -> Result<EntryView, MetaError> {
        debug!(
            src_parent = req.src_parent_id,
            src = %req.src_name,
            dst_parent = req.dst_parent_id,
            dst = %req.dst_name,
            "rename"
        );
        if req.src_name.is_empty() || req.dst_name.is_empty() {
            return Err(MetaError::InvalidArgument("name must not be empty"));
        }

        let src_holder = self
            .names
            .get(self.vol(), req.src_parent_id, &req.src_name)
            .await?
            .ok_or(MetaError::NotFound)?;
        let src_id = src_holder.file_id;
        if req.src_parent_id == req.dst_parent_id && req.src_name == req.dst_name {
            return self.read(caller, src_id).await;
        }
        let dst_holder = self
            .names
            .get(self.vol(), req.dst_parent_id, &req.dst_name)
            .await?;

        let (src_res, src_parent_res, dst_parent_res) = tokio::join!(
            self.read_base(src_id),
            self.read_base(req.src_parent_id),
            self.read_base(req.dst_parent_id)
        );
        let src = src_res?;
        let src_parent = src_parent_res?;
        let dst_parent = dst_parent_res?;
        if !src.is_live() || !src_parent.is_live() || !dst_parent.is_live() {
            return Err(MetaError::NotFound);
        }
        if !src_parent.is_dir() || !dst_parent.is_dir() {
            return Err(MetaError::NotADirectory);
        }

        let dst = match dst_holder {
            Some(h) if h.file_id != src_id => {
                let dst = self.read_base(h.file_id).await?;
                if !dst.is_live() {
                    // Mid-reclamation; let the caller retry once it clears.
                    return Err(MetaError::Conflict);
                }
                Some(dst)
            }
            // The destination name already binds src: a replayed rename.
            _ => None,
        };

        check_readable(
            caller.user_id,
            src.owner_id,
            self.volume.owner_id,
            src.mode,
        )?;
        self.check_parent_writable(caller, &src_parent)?;
        self.check_parent_writable(caller, &dst_parent)?;
        if let Some(dst) = &dst {
            check_writable(
                caller.user_id,
                dst.owner_id,
                self.volume.owner_id,
                dst.mode,
            )?;
            if src.is_dir() && !dst.is_dir() {
                return Err(MetaError::NotADirectory);
            }
            if !src.is_dir() && dst.is_dir() {
                return Err(MetaError::IsADirectory);
            }
        }
        if src.is_dir() && req.dst_parent_id == src.file_id {
            return Err(MetaError::InvalidArgument(
                "cannot move a directory into itself",
            ));
        }

        // Tombstone the overwritten destination (with emptiness check for
        // directories) while the cycle walk runs.
        let (cycle_res, dst_tomb_res) = tokio::join!(
            async {
                if src.is_dir() {
                    self.check_no_cycle(src.file_id, &dst_parent).await
                } else {
                    Ok(())
                }
            },
            async {
                match &dst {
                    Some(dst) => self.begin_delete_overwritten(dst).await.map(Some),
                    None => Ok(None),
                }
            }
        );
        let dst_tomb = match dst_tomb_res {
            Ok(t) => t,
            Err(e) => return Err(e),
        };
        if let Err(e) = cycle_res {
            if let Some((key, live_raw, tomb_raw)) = dst_tomb {
                self.untombstone(&key, tomb_raw, live_raw).await;
            }
            return Err(e);
        }

        // Commit: bind the destination name, rewrite the base record with
        // a fresh shard, release the old name. A failure after the rebind
        // can leave a dangling reservation; deferred reclamation and
        // retries keep the namespace convergent.
        if let Err(e) = self
            .names
            .rebind(&NameHolder {
                volume_id: self.vol(),
                parent_id: req.dst_parent_id,
                file_id: src_id,
                name: req.dst_name.clone(),
            })
            .await
        {
            if let Some((key, live_raw, tomb_raw)) = dst_tomb {
                self.untombstone(&key, tomb_raw, live_raw).await;
            }
            return Err(e);
        }

        let mut moved = src.clone();
        moved.parent_id = req.dst_parent_id;
        moved.name = req.dst_name.clone();
        let attrs = self.read_attrs(&src).await?;
        let mtime = Timestamp::after(attrs.mtime);
        let shard = EntryShard::new_for(&moved, mtime, attrs.size);
        self.store
            .put_multi(vec![
                (
                    KeyCodec::entry_key(self.vol(), moved.file_id),
                    moved.to_bytes()?,
                ),
                (self.shard_slot_key(moved.file_id), shard.to_bytes()?),
            ])
            .await?;
        self.names
            .release(self.vol(), req.src_parent_id, &req.src_name)
            .await?;

        self.cache
            .delete(&KeyCodec::entry_key(self.vol(), moved.file_id));
        if let Some(dst) = &dst {
            self.cache
                .delete(&KeyCodec::entry_key(self.vol(), dst.file_id));
        }

        self.schedule_rename_finish(src.parent_id, moved.clone(), dst.clone());

        Ok(EntryView {
            entry: moved,
            attrs: AggregatedAttrs {
                mtime: shard.mtime,
                size: shard.size,
                write_nonce: shard.write_nonce,
            },
        })
    }

    /// One listing page. Pages are cached against the directory's write
    /// nonce and discarded once any child mutation touches the parent.
    pub async fn list(
        &self,
        caller: Caller,
        parent_id: FileId,
        token: Option<PageToken>,
    ) -> Result<DirPage, MetaError> {
        let parent = self.read_base(parent_id).await?;
        if !parent.is_live() {
            return Err(MetaError::NotFound);
        }
        if !parent.is_dir() {
            return Err(MetaError::NotADirectory);
        }
        check_readable(
            caller.user_id,
            parent.owner_id,
            self.volume.owner_id,
            parent.mode,
        )?;
        let parent_attrs = self.read_attrs(&parent).await?;

        let start = token.map(|t| t.0).unwrap_or(0);
        let cache_key = KeyCodec::listing_page_cache_key(self.vol(), parent_id, start);
        let page = match self.cache.get_page(&cache_key) {
            Some(p) if p.write_nonce == parent_attrs.write_nonce => (*p).clone(),
            _ => {
                let ipage = self
                    .index
                    .page(self.vol(), parent_id, start, self.config.page_size)
                    .await?;
                let page = VersionedPage {
                    write_nonce: parent_attrs.write_nonce,
                    file_ids: ipage.nodes.iter().map(|n| n.file_id).collect(),
                    next_index: ipage.next_index,
                    have_more: ipage.have_more,
                };
                self.cache.set_page(cache_key, page.clone());
                page
            }
        };

        let entry_keys: Vec<Bytes> = page
            .file_ids
            .iter()
            .map(|&id| KeyCodec::entry_key(self.vol(), id))
            .collect();
        let raws = self.store.get_multi(&entry_keys).await?;
        let mut live = Vec::with_capacity(raws.len());
        for raw in raws.into_iter().flatten() {
            let entry = Entry::from_bytes(&raw)?;
            // Children mid-deletion drop out of the listing.
            if entry.is_live() {
                live.push(entry);
            }
        }

        let shards_per_entry = self.config.entry_shards as usize;
        let mut shard_keys = Vec::with_capacity(live.len() * shards_per_entry);
        for entry in &live {
            shard_keys.extend(KeyCodec::shard_keys(
                self.vol(),
                entry.file_id,
                self.config.entry_shards,
            ));
        }
        let shard_raws = self.store.get_multi(&shard_keys).await?;

        let mut entries = Vec::with_capacity(live.len());
        for (i, entry) in live.into_iter().enumerate() {
            let mut shards = Vec::with_capacity(shards_per_entry);
            for raw in shard_raws[i * shards_per_entry..(i + 1) * shards_per_entry]
                .iter()
                .flatten()
            {
                shards.push(EntryShard::from_bytes(raw)?);
            }
            let attrs = aggregate_shards(&entry, shards.iter());
            entries.push(EntryView { entry, attrs });
        }

        let next = page.have_more.then_some(PageToken(page.next_index));
        Ok(DirPage { entries, next })
    }

    /// Advisory child count; exact once writers drain.
    pub async fn get_num_children(&self, parent_id: FileId) -> Result<u64, MetaError> {
        self.counters.get(self.vol(), parent_id).await
    }

    /// The base record plus aggregated shard attributes.
    pub async fn read(&self, caller: Caller, file_id: FileId) -> Result<EntryView, MetaError> {
        let entry = self.read_base(file_id).await?;
        if !entry.is_live() {
            return Err(MetaError::NotFound);
        }
        check_readable(
            caller.user_id,
            entry.owner_id,
            self.volume.owner_id,
            entry.mode,
        )?;
        let attrs = self.read_attrs(&entry).await?;
        Ok(EntryView { entry, attrs })
    }

    /// Cache-first fetch of the base record, tombstones included.
    pub async fn read_base(&self, file_id: FileId) -> Result<Entry, MetaError> {
        let key = KeyCodec::entry_key(self.vol(), file_id);
        if let Some(entry) = self.cache.get_entry(&key) {
            return Ok((*entry).clone());
        }
        let raw = self.store.get(&key).await?.ok_or(MetaError::NotFound)?;
        let entry = Entry::from_bytes(&raw)?;
        self.cache.set_entry(key, entry.clone());
        Ok(entry)
    }

    async fn read_base_uncached(&self, file_id: FileId) -> Result<Entry, MetaError> {
        let key = KeyCodec::entry_key(self.vol(), file_id);
        let raw = self.store.get(&key).await?.ok_or(MetaError::NotFound)?;
        Entry::from_bytes(&raw)
    }

    async fn read_attrs(&self, entry: &Entry) -> Result<AggregatedAttrs, MetaError> {
        let keys = KeyCodec::shard_keys(self.vol(), entry.file_id, self.config.entry_shards);
        let raws = self.store.get_multi(&keys).await?;
        let mut shards = Vec::with_capacity(raws.len());
        for raw in raws.into_iter().flatten() {
            shards.push(EntryShard::from_bytes(&raw)?);
        }
        Ok(aggregate_shards(entry, shards.iter()))
    }

    fn shard_slot_key(&self, file_id: FileId) -> Bytes {
        let slot = rand::thread_rng().gen_range(0..self.config.entry_shards);
        KeyCodec::shard_key(self.vol(), file_id, slot)
    }

    async fn put_shard(&self, shard: &EntryShard) -> Result<(), MetaError> {
        self.store
            .put(self.shard_slot_key(shard.file_id), shard.to_bytes()?)
            .await?;
        Ok(())
    }

    /// Fresh shard for a directory whose membership changed: new mtime and
    /// write nonce invalidate cached listing pages.
    async fn touch(&self, entry: &Entry) -> Result<(), MetaError> {
        let attrs = self.read_attrs(entry).await?;
        let shard = EntryShard::new_for(entry, Timestamp::after(attrs.mtime), attrs.size);
        self.put_shard(&shard).await
    }

    fn check_parent_writable(&self, caller: Caller, parent: &Entry) -> Result<(), MetaError> {
        if !parent.is_live() {
            return Err(MetaError::NotFound);
        }
        if !parent.is_dir() {
            return Err(MetaError::NotADirectory);
        }
        check_writable(
            caller.user_id,
            parent.owner_id,
            self.volume.owner_id,
            parent.mode,
        )
    }

    /// Walk the ancestor chain of `start` up to the root, rejecting the
    /// move when `src_id` appears: a directory must not land inside its
    /// own subtree.
    async fn check_no_cycle(&self, src_id: FileId, start: &Entry) -> Result<(), MetaError> {
        let mut cur = start.clone();
        for _ in 0..MAX_ANCESTOR_DEPTH {
            if cur.file_id == src_id {
                return Err(MetaError::InvalidArgument(
                    "destination is inside the moved directory",
                ));
            }
            if cur.file_id == ROOT_FILE_ID {
                return Ok(());
            }
            cur = self.read_base(cur.parent_id).await?;
        }
        // The chain did not terminate: concurrent moves are reshaping it.
        Err(MetaError::Conflict)
    }

    async fn tombstone(&self, key: &Bytes, live_raw: Bytes) -> Result<(Bytes, Bytes), MetaError> {
        let mut entry = Entry::from_bytes(&live_raw)?;
        entry.state = EntryState::Tombstoned;
        let tomb_raw = entry.to_bytes()?;
        let mut txn = Transaction::new();
        txn.check_equals(key.clone(), live_raw.clone());
        txn.put(key.clone(), tomb_raw.clone());
        match self.store.transact(txn).await? {
            TxnOutcome::Committed => Ok((live_raw, tomb_raw)),
            TxnOutcome::Contended { .. } => Err(MetaError::Conflict),
        }
    }

    /// Best-effort rollback of a tombstone. Losing this CAS means another
    /// actor already advanced the entry; the original failure still stands.
    async fn untombstone(&self, key: &Bytes, tomb_raw: Bytes, live_raw: Bytes) {
        let mut txn = Transaction::new();
        txn.check_equals(key.clone(), tomb_raw);
        txn.put(key.clone(), live_raw);
        match self.store.transact(txn).await {
            Ok(TxnOutcome::Committed) => {}
            Ok(TxnOutcome::Contended { .. }) => {
                warn!(?key, "tombstone rollback lost a race");
            }
            Err(e) => {
                warn!(?key, error = %e, "tombstone rollback failed");
            }
        }
        self.cache.delete(key);
    }

    /// Phase one of deleting a rename destination: tombstone it and, for
    /// directories, verify emptiness, undoing the tombstone on failure.
    async fn begin_delete_overwritten(
        &self,
        dst: &Entry,
    ) -> Result<(Bytes, Bytes, Bytes), MetaError> {
        let key = KeyCodec::entry_key(self.vol(), dst.file_id);
        let raw = self.store.get(&key).await?.ok_or(MetaError::Conflict)?;
        let current = Entry::from_bytes(&raw)?;
        if !current.is_live() {
            return Err(MetaError::Conflict);
        }
        let (live_raw, tomb_raw) = self.tombstone(&key, raw).await?;
        self.cache.delete(&key);
        if current.is_dir() {
            let occupied = self
                .index
                .has_allocated_children(self.vol(), dst.file_id)
                .await;
            match occupied {
                Ok(false) => {}
                Ok(true) => {
                    self.untombstone(&key, tomb_raw, live_raw).await;
                    return Err(MetaError::NotEmpty);
                }
                Err(e) => {
                    self.untombstone(&key, tomb_raw, live_raw).await;
                    return Err(e);
                }
            }
        }
        Ok((key, live_raw, tomb_raw))
    }

    fn schedule_counter_add(&self, parent_id: FileId, delta: i64) {
        let es = self.clone();
        self.runner.schedule(DeferredTask::new("counter_add", move || {
            let es = es.clone();
            async move { es.counters.add(es.vol(), parent_id, delta).await }
        }));
    }

    fn schedule_release_name(&self, parent_id: FileId, name: String, file_id: FileId) {
        let es = self.clone();
        self.runner
            .schedule(DeferredTask::new("release_name", move || {
                let es = es.clone();
                let name = name.clone();
                async move {
                    // Only release while the reservation is still ours.
                    match es.names.get(es.vol(), parent_id, &name).await? {
                        Some(holder) if holder.file_id == file_id => {
                            es.names.release(es.vol(), parent_id, &name).await
                        }
                        _ => Ok(()),
                    }
                }
            }));
    }

    /// Compensation for a create whose post-checks failed: remove the
    /// half-written child, its index nodes and its reservation.
    fn schedule_create_rollback(&self, parent_id: FileId, file_id: FileId, name: String) {
        let es = self.clone();
        self.runner
            .schedule(DeferredTask::new("create_rollback", move || {
                let es = es.clone();
                let name = name.clone();
                async move {
                    let vol = es.vol();
                    ignore_exhausted(es.index.delete(vol, parent_id, file_id).await)?;
                    let mut keys = vec![KeyCodec::entry_key(vol, file_id)];
                    keys.extend(KeyCodec::shard_keys(vol, file_id, es.config.entry_shards));
                    es.store.delete_multi(&keys).await?;
                    es.cache.delete(&KeyCodec::entry_key(vol, file_id));
                    match es.names.get(vol, parent_id, &name).await? {
                        Some(holder) if holder.file_id == file_id => {
                            es.names.release(vol, parent_id, &name).await
                        }
                        _ => Ok(()),
                    }
                }
            }));
    }

    /// Phase two of delete: decrement the parent's count, free and compact
    /// the slot, reclaim records, and touch the parent. Idempotent except
    /// for the advisory counter, which re-runs may skew.
    fn schedule_delete_finish(&self, entry: Entry) {
        let es = self.clone();
        self.runner
            .schedule(DeferredTask::new("delete_finish", move || {
                let es = es.clone();
                let entry = entry.clone();
                async move {
                    let vol = es.vol();
                    es.counters.add(vol, entry.parent_id, -1).await?;
                    ignore_exhausted(es.index.delete(vol, entry.parent_id, entry.file_id).await)?;
                    if entry.is_dir() {
                        es.index.purge(vol, entry.file_id).await?;
                        es.counters.clear(vol, entry.file_id).await?;
                    }

                    let mut keys = vec![KeyCodec::entry_key(vol, entry.file_id)];
                    keys.extend(KeyCodec::shard_keys(vol, entry.file_id, es.config.entry_shards));
                    es.store.delete_multi(&keys).await?;
                    es.cache.delete(&KeyCodec::entry_key(vol, entry.file_id));

                    // The reservation may have been rebound by a concurrent
                    // create once the tombstone landed; only reap our own.
                    match es.names.get(vol, entry.parent_id, &entry.name).await? {
                        Some(holder) if holder.file_id == entry.file_id => {
                            es.names.release(vol, entry.parent_id, &entry.name).await?;
                        }
                        _ => {}
                    }

                    if let Ok(parent) = es.read_base_uncached(entry.parent_id).await {
                        if parent.is_live() {
                            es.touch(&parent).await?;
                        }
                    }
                    Ok(())
                }
            }));
    }

    /// Deferred tail of a rename: move the index membership, adjust child
    /// counts, reclaim an overwritten destination, and touch both parents.
    fn schedule_rename_finish(&self, old_parent_id: FileId, moved: Entry, dst: Option<Entry>) {
        let es = self.clone();
        self.runner
            .schedule(DeferredTask::new("rename_finish", move || {
                let es = es.clone();
                let moved = moved.clone();
                let dst = dst.clone();
                async move {
                    let vol = es.vol();
                    if let Some(dst) = &dst {
                        es.counters.add(vol, moved.parent_id, -1).await?;
                        ignore_exhausted(es.index.delete(vol, moved.parent_id, dst.file_id).await)?;
                        if dst.is_dir() {
                            es.index.purge(vol, dst.file_id).await?;
                            es.counters.clear(vol, dst.file_id).await?;
                        }
                        let mut keys = vec![KeyCodec::entry_key(vol, dst.file_id)];
                        keys.extend(KeyCodec::shard_keys(vol, dst.file_id, es.config.entry_shards));
                        es.store.delete_multi(&keys).await?;
                        es.cache.delete(&KeyCodec::entry_key(vol, dst.file_id));
                    }

                    if old_parent_id != moved.parent_id {
                        es.counters.add(vol, old_parent_id, -1).await?;
                        ignore_exhausted(es.index.delete(vol, old_parent_id, moved.file_id).await)?;

                        let mut candidate = es.counters.get(vol, moved.parent_id).await?;
                        let mut placed = false;
                        for _ in 0..es.config.insert_attempts {
                            match es
                                .index
                                .try_insert(vol, moved.parent_id, moved.file_id, candidate)
                                .await?
                            {
                                TryInsertOutcome::Inserted { .. } => {
                                    placed = true;
                                    break;
                                }
                                TryInsertOutcome::Busy { suggested } => candidate = suggested,
                            }
                        }
                        if !placed {
                            return Err(MetaError::Conflict);
                        }
                        es.counters.add(vol, moved.parent_id, 1).await?;

                        if let Ok(parent) = es.read_base_uncached(old_parent_id).await {
                            if parent.is_live() {
                                es.touch(&parent).await?;
                            }
                        }
                    }
                    if let Ok(parent) = es.read_base_uncached(moved.parent_id).await {
                        if parent.is_live() {
                            es.touch(&parent).await?;
                        }
                    }
                    Ok(())
                }
            }));
    }
}

fn ignore_exhausted(result: Result<(), MetaError>) -> Result<(), MetaError> {
    match result {
        Err(MetaError::Exhausted) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::TokioTaskRunner;
    use crate::kv::MemoryStore;
    use tokio_util::sync::CancellationToken;

    const OWNER: u64 = 100;
    const OTHER: u64 = 300;
    const COORD: GatewayId = 7;

    struct Fixture {
        es: EntryStore,
        runner: Arc<TokioTaskRunner>,
    }

    impl Fixture {
        fn caller(&self) -> Caller {
            Caller { user_id: OWNER }
        }

        async fn quiesce(&self) {
            self.runner.quiesce().await;
        }

        async fn create(&self, file_id: FileId, parent_id: FileId, name: &str, ftype: EntryType) {
            self.es
                .create(
                    self.caller(),
                    CreateRequest {
                        file_id,
                        parent_id,
                        name: name.to_string(),
                        ftype,
                        mode: 0o644,
                        owner_id: OWNER,
                        coordinator_id: COORD,
                    },
                )
                .await
                .unwrap();
        }

        async fn mkfile(&self, file_id: FileId, parent_id: FileId, name: &str) {
            self.create(file_id, parent_id, name, EntryType::File).await;
        }

        async fn mkdir(&self, file_id: FileId, parent_id: FileId, name: &str) {
            self.create(file_id, parent_id, name, EntryType::Dir).await;
        }

        async fn slot_of(&self, file_id: FileId) -> u64 {
            self.es
                .index
                .read(self.es.vol(), file_id)
                .await
                .unwrap()
                .unwrap()
                .dir_index
        }

        async fn allocated_indices(&self, parent_id: FileId) -> Vec<u64> {
            let page = self
                .es
                .index
                .page(self.es.vol(), parent_id, 0, 10_000)
                .await
                .unwrap();
            page.nodes.iter().map(|n| n.dir_index).collect()
        }
    }

    async fn fixture_with_config(config: Config) -> Fixture {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let runner = TokioTaskRunner::new(CancellationToken::new());
        let volume = VolumeInfo {
            volume_id: 1,
            owner_id: OWNER,
        };
        let es = EntryStore::new(store, runner.clone(), volume, config);
        es.create_root(COORD).await.unwrap();
        Fixture { es, runner }
    }

    async fn fixture() -> Fixture {
        fixture_with_config(Config::default()).await
    }

    #[tokio::test]
    async fn test_create_root_is_idempotent() {
        let f = fixture().await;
        let again = f.es.create_root(99).await.unwrap();
        assert_eq!(again.coordinator_id, COORD, "bootstrap must not overwrite");
        assert!(f
            .es
            .names
            .get(f.es.vol(), ROOT_FILE_ID, "")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_create_and_read() {
        let f = fixture().await;
        f.mkfile(10, ROOT_FILE_ID, "a").await;
        let view = f.es.read(f.caller(), 10).await.unwrap();
        assert_eq!(view.entry.name, "a");
        assert_eq!(view.entry.parent_id, ROOT_FILE_ID);
        assert_eq!(view.attrs.size, 0);
        assert_ne!(view.attrs.write_nonce, 0);
    }

    #[tokio::test]
    async fn test_duplicate_name_is_rejected() {
        // Scenario: create "a" twice under the root.
        let f = fixture().await;
        f.mkfile(10, ROOT_FILE_ID, "a").await;
        let err = f
            .es
            .create(
                f.caller(),
                CreateRequest {
                    file_id: 11,
                    parent_id: ROOT_FILE_ID,
                    name: "a".to_string(),
                    ftype: EntryType::File,
                    mode: 0o644,
                    owner_id: OWNER,
                    coordinator_id: COORD,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::AlreadyExists));

        f.quiesce().await;
        let page = f.es.list(f.caller(), ROOT_FILE_ID, None).await.unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].entry.name, "a");
        assert_eq!(page.entries[0].entry.file_id, 10);
    }

    #[tokio::test]
    async fn test_create_under_missing_parent() {
        let f = fixture().await;
        let err = f
            .es
            .create(
                f.caller(),
                CreateRequest {
                    file_id: 10,
                    parent_id: 999,
                    name: "a".to_string(),
                    ftype: EntryType::File,
                    mode: 0o644,
                    owner_id: OWNER,
                    coordinator_id: COORD,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::NotFound));
        f.quiesce().await;
        // The orphaned reservation was rolled back.
        assert!(f.es.names.get(f.es.vol(), 999, "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_under_file_is_rejected() {
        let f = fixture().await;
        f.mkfile(10, ROOT_FILE_ID, "f").await;
        let err = f
            .es
            .create(
                f.caller(),
                CreateRequest {
                    file_id: 11,
                    parent_id: 10,
                    name: "x".to_string(),
                    ftype: EntryType::File,
                    mode: 0o644,
                    owner_id: OWNER,
                    coordinator_id: COORD,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::NotADirectory));
    }

    #[tokio::test]
    async fn test_create_requires_write_permission_on_parent() {
        let f = fixture().await;
        f.mkdir(10, ROOT_FILE_ID, "d").await;
        let err = f
            .es
            .create(
                Caller { user_id: OTHER },
                CreateRequest {
                    file_id: 11,
                    parent_id: 10,
                    name: "x".to_string(),
                    ftype: EntryType::File,
                    mode: 0o644,
                    owner_id: OTHER,
                    coordinator_id: COORD,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::PermissionDenied));
        f.quiesce().await;
        assert!(f.es.names.get(f.es.vol(), 10, "x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_shard_only_bumps_nonce_and_mtime() {
        let f = fixture().await;
        f.mkfile(10, ROOT_FILE_ID, "a").await;
        let before = f.es.read(f.caller(), 10).await.unwrap();

        let after = f
            .es
            .update(
                f.caller(),
                UpdateRequest {
                    file_id: 10,
                    size: SetSize::Set(4096),
                    mtime: SetTime::SetToServerTime,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(after.attrs.size, 4096);
        assert!(after.attrs.mtime > before.attrs.mtime);
        assert_ne!(after.attrs.write_nonce, before.attrs.write_nonce);
        // Shard-only write leaves the base record untouched.
        assert_eq!(after.entry.version, before.entry.version);
    }

    #[tokio::test]
    async fn test_update_write_base_changes_mode() {
        let f = fixture().await;
        f.mkfile(10, ROOT_FILE_ID, "a").await;
        let view = f
            .es
            .update(
                f.caller(),
                UpdateRequest {
                    file_id: 10,
                    mode: SetMode::Set(0o600),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(view.entry.mode, 0o600);
        assert_eq!(f.es.read_base(10).await.unwrap().mode, 0o600);
    }

    #[tokio::test]
    async fn test_version_bump_hides_stale_shards() {
        let f = fixture().await;
        f.mkfile(10, ROOT_FILE_ID, "a").await;
        f.es.update(
            f.caller(),
            UpdateRequest {
                file_id: 10,
                size: SetSize::Set(4096),
                mtime: SetTime::SetToServerTime,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // Truncate: bump the version and write size 0 under it.
        let view = f
            .es
            .update(
                f.caller(),
                UpdateRequest {
                    file_id: 10,
                    bump_version: true,
                    size: SetSize::Set(0),
                    mtime: SetTime::SetToServerTime,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(view.entry.version, 2);
        assert_eq!(view.attrs.size, 0, "pre-truncate shards must not count");
        let reread = f.es.read(f.caller(), 10).await.unwrap();
        assert_eq!(reread.attrs.size, 0);
    }

    #[tokio::test]
    async fn test_update_mode_by_non_owner_is_denied() {
        let f = fixture().await;
        f.create(10, ROOT_FILE_ID, "a", EntryType::File).await;
        // World-writable, so plain updates are allowed...
        f.es.update(
            f.caller(),
            UpdateRequest {
                file_id: 10,
                mode: SetMode::Set(0o666),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        f.es.update(
            Caller { user_id: OTHER },
            UpdateRequest {
                file_id: 10,
                size: SetSize::Set(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        // ...but chmod by a stranger is not.
        let err = f
            .es
            .update(
                Caller { user_id: OTHER },
                UpdateRequest {
                    file_id: 10,
                    mode: SetMode::Set(0o777),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::PermissionDenied));
    }

    #[tokio::test]
    async fn test_chcoord_with_stale_expectation() {
        // Scenario: a stale expected coordinator returns the actual one
        // and changes nothing.
        let f = fixture().await;
        f.mkfile(10, ROOT_FILE_ID, "a").await;
        match f.es.chcoord(f.caller(), 10, 999, 42).await.unwrap() {
            ChcoordOutcome::Rejected {
                current_coordinator,
            } => assert_eq!(current_coordinator, COORD),
            ChcoordOutcome::Changed(_) => panic!("stale CAS must not change the coordinator"),
        }
        assert_eq!(f.es.read_base(10).await.unwrap().coordinator_id, COORD);

        match f.es.chcoord(f.caller(), 10, COORD, 42).await.unwrap() {
            ChcoordOutcome::Changed(entry) => assert_eq!(entry.coordinator_id, 42),
            ChcoordOutcome::Rejected { .. } => panic!("matching CAS must succeed"),
        }
        assert_eq!(f.es.read_base(10).await.unwrap().coordinator_id, 42);
    }

    #[tokio::test]
    async fn test_delete_nonempty_directory_rolls_back_tombstone() {
        // Scenario: deleting a non-empty directory fails with NotEmpty and
        // leaves the directory live.
        let f = fixture().await;
        f.mkdir(10, ROOT_FILE_ID, "d").await;
        f.mkfile(11, 10, "child").await;
        f.quiesce().await;

        let err = f.es.delete(f.caller(), 10).await.unwrap_err();
        assert!(matches!(err, MetaError::NotEmpty));
        let dir = f.es.read_base(10).await.unwrap();
        assert!(dir.is_live(), "tombstone must be rolled back");
        assert_eq!(
            f.es.list(f.caller(), 10, None).await.unwrap().entries.len(),
            1
        );
    }

    #[tokio::test]
    async fn test_delete_file_reclaims_everything() {
        let f = fixture().await;
        f.mkfile(10, ROOT_FILE_ID, "a").await;
        f.quiesce().await;
        assert_eq!(f.es.get_num_children(ROOT_FILE_ID).await.unwrap(), 1);

        f.es.delete(f.caller(), 10).await.unwrap();
        assert!(matches!(
            f.es.read(f.caller(), 10).await.unwrap_err(),
            MetaError::NotFound
        ));
        f.quiesce().await;

        assert_eq!(f.es.get_num_children(ROOT_FILE_ID).await.unwrap(), 0);
        assert!(f.allocated_indices(ROOT_FILE_ID).await.is_empty());
        assert!(f
            .es
            .names
            .get(f.es.vol(), ROOT_FILE_ID, "a")
            .await
            .unwrap()
            .is_none());
        // The name is reusable.
        f.mkfile(12, ROOT_FILE_ID, "a").await;
    }

    #[tokio::test]
    async fn test_delete_empty_directory() {
        let f = fixture().await;
        f.mkdir(10, ROOT_FILE_ID, "d").await;
        f.mkfile(11, 10, "child").await;
        f.quiesce().await;
        f.es.delete(f.caller(), 11).await.unwrap();
        f.quiesce().await;
        f.es.delete(f.caller(), 10).await.unwrap();
        f.quiesce().await;
        assert_eq!(f.es.get_num_children(ROOT_FILE_ID).await.unwrap(), 0);
        assert!(matches!(
            f.es.read(f.caller(), 10).await.unwrap_err(),
            MetaError::NotFound
        ));
    }

    #[tokio::test]
    async fn test_delete_root_is_rejected() {
        let f = fixture().await;
        assert!(matches!(
            f.es.delete(f.caller(), ROOT_FILE_ID).await.unwrap_err(),
            MetaError::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn test_churn_keeps_index_dense() {
        // Scenario: 50 creates, then delete the 10 children holding the
        // lowest slots; the survivors end up exactly at [0, 40).
        let f = Arc::new(fixture().await);

        let mut handles = Vec::new();
        for i in 0..50u64 {
            let f = f.clone();
            handles.push(tokio::spawn(async move {
                f.create(100 + i, ROOT_FILE_ID, &format!("c{i}"), EntryType::File)
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        f.quiesce().await;
        assert_eq!(f.es.get_num_children(ROOT_FILE_ID).await.unwrap(), 50);
        assert_eq!(
            f.allocated_indices(ROOT_FILE_ID).await,
            (0..50).collect::<Vec<_>>()
        );

        let mut by_slot = Vec::new();
        for i in 0..50u64 {
            by_slot.push((f.slot_of(100 + i).await, 100 + i));
        }
        by_slot.sort_unstable();
        for &(_, file_id) in by_slot.iter().take(10) {
            f.es.delete(f.caller(), file_id).await.unwrap();
            f.quiesce().await;
        }

        assert_eq!(f.es.get_num_children(ROOT_FILE_ID).await.unwrap(), 40);
        assert_eq!(
            f.allocated_indices(ROOT_FILE_ID).await,
            (0..40).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_rename_within_directory() {
        let f = fixture().await;
        f.mkfile(10, ROOT_FILE_ID, "old").await;
        f.quiesce().await;

        let view = f
            .es
            .rename(
                f.caller(),
                RenameRequest {
                    src_parent_id: ROOT_FILE_ID,
                    src_name: "old".to_string(),
                    dst_parent_id: ROOT_FILE_ID,
                    dst_name: "new".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(view.entry.name, "new");
        f.quiesce().await;

        assert!(f
            .es
            .names
            .get(f.es.vol(), ROOT_FILE_ID, "old")
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            f.es.names
                .get(f.es.vol(), ROOT_FILE_ID, "new")
                .await
                .unwrap()
                .unwrap()
                .file_id,
            10
        );
        assert_eq!(f.es.get_num_children(ROOT_FILE_ID).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rename_across_directories_moves_index_membership() {
        let f = fixture().await;
        f.mkdir(10, ROOT_FILE_ID, "src").await;
        f.mkdir(20, ROOT_FILE_ID, "dst").await;
        f.mkfile(30, 10, "f").await;
        f.quiesce().await;

        let view = f
            .es
            .rename(
                f.caller(),
                RenameRequest {
                    src_parent_id: 10,
                    src_name: "f".to_string(),
                    dst_parent_id: 20,
                    dst_name: "g".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(view.entry.parent_id, 20);
        f.quiesce().await;

        assert_eq!(f.es.get_num_children(10).await.unwrap(), 0);
        assert_eq!(f.es.get_num_children(20).await.unwrap(), 1);
        assert!(f.allocated_indices(10).await.is_empty());
        assert_eq!(f.allocated_indices(20).await, vec![0]);
        let listed = f.es.list(f.caller(), 20, None).await.unwrap();
        assert_eq!(listed.entries.len(), 1);
        assert_eq!(listed.entries[0].entry.name, "g");
    }

    #[tokio::test]
    async fn test_rename_into_own_subtree_is_rejected() {
        // Scenario: moving a directory under its own descendant fails and
        // changes nothing.
        let f = fixture().await;
        f.mkdir(10, ROOT_FILE_ID, "a").await;
        f.mkdir(11, 10, "b").await;
        f.mkdir(12, 11, "c").await;
        f.quiesce().await;

        let err = f
            .es
            .rename(
                f.caller(),
                RenameRequest {
                    src_parent_id: ROOT_FILE_ID,
                    src_name: "a".to_string(),
                    dst_parent_id: 12,
                    dst_name: "moved".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::InvalidArgument(_)));
        f.quiesce().await;

        let a = f.es.read_base(10).await.unwrap();
        assert_eq!(a.parent_id, ROOT_FILE_ID);
        assert_eq!(a.name, "a");
        assert!(f.es.names.get(f.es.vol(), 12, "moved").await.unwrap().is_none());
        assert_eq!(
            f.es.names
                .get(f.es.vol(), ROOT_FILE_ID, "a")
                .await
                .unwrap()
                .unwrap()
                .file_id,
            10
        );
    }

    #[tokio::test]
    async fn test_rename_over_existing_file_replaces_it() {
        let f = fixture().await;
        f.mkfile(10, ROOT_FILE_ID, "a").await;
        f.mkfile(11, ROOT_FILE_ID, "b").await;
        f.quiesce().await;

        f.es.rename(
            f.caller(),
            RenameRequest {
                src_parent_id: ROOT_FILE_ID,
                src_name: "a".to_string(),
                dst_parent_id: ROOT_FILE_ID,
                dst_name: "b".to_string(),
            },
        )
        .await
        .unwrap();
        f.quiesce().await;

        assert!(matches!(
            f.es.read(f.caller(), 11).await.unwrap_err(),
            MetaError::NotFound
        ));
        assert_eq!(
            f.es.names
                .get(f.es.vol(), ROOT_FILE_ID, "b")
                .await
                .unwrap()
                .unwrap()
                .file_id,
            10
        );
        assert_eq!(f.es.get_num_children(ROOT_FILE_ID).await.unwrap(), 1);
        let page = f.es.list(f.caller(), ROOT_FILE_ID, None).await.unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].entry.file_id, 10);
    }

    #[tokio::test]
    async fn test_rename_directory_over_file_type_mismatch() {
        let f = fixture().await;
        f.mkdir(10, ROOT_FILE_ID, "d").await;
        f.mkfile(11, ROOT_FILE_ID, "f").await;
        f.quiesce().await;

        let err = f
            .es
            .rename(
                f.caller(),
                RenameRequest {
                    src_parent_id: ROOT_FILE_ID,
                    src_name: "d".to_string(),
                    dst_parent_id: ROOT_FILE_ID,
                    dst_name: "f".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::NotADirectory));

        let err = f
            .es
            .rename(
                f.caller(),
                RenameRequest {
                    src_parent_id: ROOT_FILE_ID,
                    src_name: "f".to_string(),
                    dst_parent_id: ROOT_FILE_ID,
                    dst_name: "d".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::IsADirectory));
    }

    #[tokio::test]
    async fn test_rename_missing_source() {
        let f = fixture().await;
        let err = f
            .es
            .rename(
                f.caller(),
                RenameRequest {
                    src_parent_id: ROOT_FILE_ID,
                    src_name: "ghost".to_string(),
                    dst_parent_id: ROOT_FILE_ID,
                    dst_name: "x".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::NotFound));
    }

    #[tokio::test]
    async fn test_listing_pagination_covers_all_children() {
        let config = Config {
            page_size: 10,
            ..Default::default()
        };
        let f = fixture_with_config(config).await;
        for i in 0..25u64 {
            f.mkfile(100 + i, ROOT_FILE_ID, &format!("c{i:02}")).await;
        }
        f.quiesce().await;

        let mut seen = Vec::new();
        let mut token = None;
        let mut pages = 0;
        loop {
            let page = f.es.list(f.caller(), ROOT_FILE_ID, token).await.unwrap();
            seen.extend(page.entries.iter().map(|v| v.entry.file_id));
            pages += 1;
            match page.next {
                Some(t) => token = Some(t),
                None => break,
            }
            assert!(pages < 10, "pagination must terminate");
        }
        seen.sort_unstable();
        assert_eq!(seen, (100..125).collect::<Vec<_>>());
        assert!(pages >= 3);
    }

    #[tokio::test]
    async fn test_listing_cache_invalidated_by_membership_change() {
        let f = fixture().await;
        f.mkfile(10, ROOT_FILE_ID, "a").await;
        f.quiesce().await;
        let first = f.es.list(f.caller(), ROOT_FILE_ID, None).await.unwrap();
        assert_eq!(first.entries.len(), 1);

        // The create touches the parent's write nonce, so the cached page
        // is discarded rather than served stale.
        f.mkfile(11, ROOT_FILE_ID, "b").await;
        f.quiesce().await;
        let second = f.es.list(f.caller(), ROOT_FILE_ID, None).await.unwrap();
        assert_eq!(second.entries.len(), 2);
    }

    #[tokio::test]
    async fn test_read_by_stranger_requires_mode_bits() {
        let f = fixture().await;
        f.create(10, ROOT_FILE_ID, "secret", EntryType::File).await;
        f.es.update(
            f.caller(),
            UpdateRequest {
                file_id: 10,
                mode: SetMode::Set(0o600),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let err = f
            .es
            .read(Caller { user_id: OTHER }, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::PermissionDenied));
        assert!(f.es.read(f.caller(), 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_index_round_trip_at_quiescence() {
        let f = fixture().await;
        for i in 0..8u64 {
            f.mkfile(100 + i, ROOT_FILE_ID, &format!("c{i}")).await;
        }
        f.quiesce().await;
        let page = f
            .es
            .index
            .page(f.es.vol(), ROOT_FILE_ID, 0, 100)
            .await
            .unwrap();
        for node in page.nodes {
            let back = f
                .es
                .index
                .read(f.es.vol(), node.file_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(back.dir_index, node.dir_index);
            assert_eq!(back.file_id, node.file_id);
            assert_eq!(back.generation, node.generation);
        }
    }
}
