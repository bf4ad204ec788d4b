use crate::types::{FileId, VolumeId};
use bytes::Bytes;

const PREFIX_ENTRY: u8 = 0x01;
const PREFIX_ENTRY_SHARD: u8 = 0x02;
const PREFIX_NAME_HOLDER: u8 = 0x03;
const PREFIX_DIRENT_INDEX: u8 = 0x04;
const PREFIX_ENTDIR_INDEX: u8 = 0x05;
const PREFIX_COUNTER_SHARD: u8 = 0x06;

// Cache-only key spaces; never persisted.
const PREFIX_LISTING_PAGE: u8 = 0x80;
const PREFIX_CHILD_COUNT: u8 = 0x81;

const U64_SIZE: usize = 8;
const KEY_ENTRY_SIZE: usize = 1 + 2 * U64_SIZE;
const KEY_SHARD_SIZE: usize = KEY_ENTRY_SIZE + 4;
const KEY_INDEX_SIZE: usize = 1 + 3 * U64_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyPrefix {
    Entry,
    EntryShard,
    NameHolder,
    DirEntIndex,
    EntDirIndex,
    CounterShard,
}

impl TryFrom<u8> for KeyPrefix {
    type Error = ();

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            PREFIX_ENTRY => Ok(Self::Entry),
            PREFIX_ENTRY_SHARD => Ok(Self::EntryShard),
            PREFIX_NAME_HOLDER => Ok(Self::NameHolder),
            PREFIX_DIRENT_INDEX => Ok(Self::DirEntIndex),
            PREFIX_ENTDIR_INDEX => Ok(Self::EntDirIndex),
            PREFIX_COUNTER_SHARD => Ok(Self::CounterShard),
            _ => Err(()),
        }
    }
}

impl From<KeyPrefix> for u8 {
    fn from(prefix: KeyPrefix) -> Self {
        match prefix {
            KeyPrefix::Entry => PREFIX_ENTRY,
            KeyPrefix::EntryShard => PREFIX_ENTRY_SHARD,
            KeyPrefix::NameHolder => PREFIX_NAME_HOLDER,
            KeyPrefix::DirEntIndex => PREFIX_DIRENT_INDEX,
            KeyPrefix::EntDirIndex => PREFIX_ENTDIR_INDEX,
            KeyPrefix::CounterShard => PREFIX_COUNTER_SHARD,
        }
    }
}

pub struct KeyCodec;

impl KeyCodec {
    pub fn entry_key(volume_id: VolumeId, file_id: FileId) -> Bytes {
        let mut key = Vec::with_capacity(KEY_ENTRY_SIZE);
        key.push(PREFIX_ENTRY);
        key.extend_from_slice(&volume_id.to_be_bytes());
        key.extend_from_slice(&file_id.to_be_bytes());
        Bytes::from(key)
    }

    pub fn shard_key(volume_id: VolumeId, file_id: FileId, shard: u32) -> Bytes {
        let mut key = Vec::with_capacity(KEY_SHARD_SIZE);
        key.push(PREFIX_ENTRY_SHARD);
        key.extend_from_slice(&volume_id.to_be_bytes());
        key.extend_from_slice(&file_id.to_be_bytes());
        key.extend_from_slice(&shard.to_be_bytes());
        Bytes::from(key)
    }

    /// All shard keys for one entry, in shard order.
    pub fn shard_keys(volume_id: VolumeId, file_id: FileId, shards: u32) -> Vec<Bytes> {
        (0..shards)
            .map(|s| Self::shard_key(volume_id, file_id, s))
            .collect()
    }

    pub fn name_holder_key(volume_id: VolumeId, parent_id: FileId, name: &str) -> Bytes {
        let mut key = Vec::with_capacity(KEY_ENTRY_SIZE + name.len());
        key.push(PREFIX_NAME_HOLDER);
        key.extend_from_slice(&volume_id.to_be_bytes());
        key.extend_from_slice(&parent_id.to_be_bytes());
        key.extend_from_slice(name.as_bytes());
        Bytes::from(key)
    }

    pub fn dirent_index_key(volume_id: VolumeId, parent_id: FileId, dir_index: u64) -> Bytes {
        let mut key = Vec::with_capacity(KEY_INDEX_SIZE);
        key.push(PREFIX_DIRENT_INDEX);
        key.extend_from_slice(&volume_id.to_be_bytes());
        key.extend_from_slice(&parent_id.to_be_bytes());
        key.extend_from_slice(&dir_index.to_be_bytes());
        Bytes::from(key)
    }

    /// Scan range covering slots `[from, ..)` of one directory. Big-endian
    /// index components make the range order match slot order.
    pub fn dirent_index_range(
        volume_id: VolumeId,
        parent_id: FileId,
        from_index: u64,
    ) -> (Bytes, Bytes) {
        let start = Self::dirent_index_key(volume_id, parent_id, from_index);
        let mut end = Vec::with_capacity(KEY_INDEX_SIZE + 1);
        end.push(PREFIX_DIRENT_INDEX);
        end.extend_from_slice(&volume_id.to_be_bytes());
        match parent_id.checked_add(1) {
            Some(next) => end.extend_from_slice(&next.to_be_bytes()),
            // No successor id: close the range just past the longest key
            // this directory can have.
            None => {
                end.extend_from_slice(&parent_id.to_be_bytes());
                end.extend_from_slice(&[0xff; U64_SIZE + 1]);
            }
        }
        (start, Bytes::from(end))
    }

    pub fn entdir_index_key(volume_id: VolumeId, file_id: FileId) -> Bytes {
        let mut key = Vec::with_capacity(KEY_ENTRY_SIZE);
        key.push(PREFIX_ENTDIR_INDEX);
        key.extend_from_slice(&volume_id.to_be_bytes());
        key.extend_from_slice(&file_id.to_be_bytes());
        Bytes::from(key)
    }

    pub fn counter_shard_key(volume_id: VolumeId, parent_id: FileId, shard: u32) -> Bytes {
        let mut key = Vec::with_capacity(KEY_SHARD_SIZE);
        key.push(PREFIX_COUNTER_SHARD);
        key.extend_from_slice(&volume_id.to_be_bytes());
        key.extend_from_slice(&parent_id.to_be_bytes());
        key.extend_from_slice(&shard.to_be_bytes());
        Bytes::from(key)
    }

    pub fn counter_shard_keys(volume_id: VolumeId, parent_id: FileId, shards: u32) -> Vec<Bytes> {
        (0..shards)
            .map(|s| Self::counter_shard_key(volume_id, parent_id, s))
            .collect()
    }

    pub fn listing_page_cache_key(volume_id: VolumeId, parent_id: FileId, start: u64) -> Bytes {
        let mut key = Vec::with_capacity(KEY_INDEX_SIZE);
        key.push(PREFIX_LISTING_PAGE);
        key.extend_from_slice(&volume_id.to_be_bytes());
        key.extend_from_slice(&parent_id.to_be_bytes());
        key.extend_from_slice(&start.to_be_bytes());
        Bytes::from(key)
    }

    pub fn child_count_cache_key(volume_id: VolumeId, parent_id: FileId) -> Bytes {
        let mut key = Vec::with_capacity(KEY_ENTRY_SIZE);
        key.push(PREFIX_CHILD_COUNT);
        key.extend_from_slice(&volume_id.to_be_bytes());
        key.extend_from_slice(&parent_id.to_be_bytes());
        Bytes::from(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_key_layout() {
        let key = KeyCodec::entry_key(3, 42);
        assert_eq!(key.len(), KEY_ENTRY_SIZE);
        assert_eq!(key[0], PREFIX_ENTRY);
        assert_eq!(&key[1..9], &3u64.to_be_bytes());
        assert_eq!(&key[9..17], &42u64.to_be_bytes());
    }

    #[test]
    fn test_dirent_keys_order_by_slot() {
        let a = KeyCodec::dirent_index_key(1, 7, 0);
        let b = KeyCodec::dirent_index_key(1, 7, 1);
        let c = KeyCodec::dirent_index_key(1, 7, 300);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_dirent_range_covers_only_one_directory() {
        let (start, end) = KeyCodec::dirent_index_range(1, 7, 5);
        let inside = KeyCodec::dirent_index_key(1, 7, u64::MAX);
        let below = KeyCodec::dirent_index_key(1, 7, 4);
        let other_dir = KeyCodec::dirent_index_key(1, 8, 0);
        assert!(start <= inside && inside < end);
        assert!(below < start);
        assert!(other_dir >= end);
    }

    #[test]
    fn test_dirent_range_for_maximum_parent_id() {
        let (start, end) = KeyCodec::dirent_index_range(1, u64::MAX, 0);
        let first = KeyCodec::dirent_index_key(1, u64::MAX, 0);
        let last = KeyCodec::dirent_index_key(1, u64::MAX, u64::MAX);
        assert!(start <= first && first < end);
        assert!(last < end);
        let next_volume = KeyCodec::dirent_index_key(2, 0, 0);
        assert!(next_volume >= end);
    }

    #[test]
    fn test_prefix_round_trip() {
        for p in [
            KeyPrefix::Entry,
            KeyPrefix::EntryShard,
            KeyPrefix::NameHolder,
            KeyPrefix::DirEntIndex,
            KeyPrefix::EntDirIndex,
            KeyPrefix::CounterShard,
        ] {
            assert_eq!(KeyPrefix::try_from(u8::from(p)), Ok(p));
        }
        assert!(KeyPrefix::try_from(0x7f).is_err());
    }

    #[test]
    fn test_cache_keys_disjoint_from_persisted_keys() {
        let cache = KeyCodec::listing_page_cache_key(1, 2, 0);
        assert!(KeyPrefix::try_from(cache[0]).is_err());
        let count = KeyCodec::child_count_cache_key(1, 2);
        assert!(KeyPrefix::try_from(count[0]).is_err());
    }
}
