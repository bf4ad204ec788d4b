use crate::errors::MetaError;
use crate::types::{EntryState, EntryType, FileId, GatewayId, Timestamp, UserId, VolumeId};
use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// The base record of a filesystem object: identity, ownership, mode and
/// placement. High-churn attributes (mtime, size, write nonce) live in
/// shards and are aggregated on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub volume_id: VolumeId,
    pub file_id: FileId,
    pub parent_id: FileId,
    pub ftype: EntryType,
    pub name: String,
    pub owner_id: UserId,
    pub coordinator_id: GatewayId,
    pub mode: u32,
    /// Bumped on content-replacing operations; shards carrying an older
    /// version are ignored by aggregation.
    pub version: u64,
    pub state: EntryState,
    pub ctime: Timestamp,
    /// Nonzero when this directory is the mount point of another namespace.
    pub umount_id: u64,
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        self.ftype == EntryType::Dir
    }

    pub fn is_live(&self) -> bool {
        self.state == EntryState::Live
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

/// One of N shard records spreading attribute writes across independent
/// keys. `entry_version` records which base version the values belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryShard {
    pub volume_id: VolumeId,
    pub file_id: FileId,
    pub entry_version: u64,
    pub mtime: Timestamp,
    pub size: u64,
    pub write_nonce: u64,
}

impl EntryShard {
    /// A fresh shard for `entry` with a new random write nonce.
    pub fn new_for(entry: &Entry, mtime: Timestamp, size: u64) -> Self {
        EntryShard {
            volume_id: entry.volume_id,
            file_id: entry.file_id,
            entry_version: entry.version,
            mtime,
            size,
            write_nonce: rand::thread_rng().gen(),
        }
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

/// Logical attributes computed from the participating shards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatedAttrs {
    pub mtime: Timestamp,
    pub size: u64,
    pub write_nonce: u64,
}

/// Fold the shards that match the entry's current version: mtime is the
/// latest (seconds, then nanoseconds), size is the max, and the write
/// nonce comes from the shard holding the latest mtime.
pub fn aggregate_shards<'a>(
    entry: &Entry,
    shards: impl IntoIterator<Item = &'a EntryShard>,
) -> AggregatedAttrs {
    let mut attrs = AggregatedAttrs::default();
    let mut seen = false;
    for shard in shards {
        if shard.entry_version != entry.version || shard.volume_id != entry.volume_id {
            continue;
        }
        if !seen || shard.mtime > attrs.mtime {
            attrs.mtime = shard.mtime;
            attrs.write_nonce = shard.write_nonce;
        }
        attrs.size = attrs.size.max(shard.size);
        seen = true;
    }
    attrs
}

/// An entry together with its aggregated attributes, as returned by reads
/// and listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryView {
    pub entry: Entry,
    pub attrs: AggregatedAttrs,
}
