use crate::errors::MetaError;
use crate::keys::KeyCodec;
use crate::kv::{insert_if_absent, InsertOutcome, KeyValueStore};
use crate::types::{FileId, VolumeId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Uniqueness reservation binding (volume, parent, name) to a child.
/// Its existence is the sole source of truth for "this name exists in
/// this directory".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameHolder {
    pub volume_id: VolumeId,
    pub parent_id: FileId,
    pub file_id: FileId,
    pub name: String,
}

impl NameHolder {
    pub fn key(&self) -> Bytes {
        KeyCodec::name_holder_key(self.volume_id, self.parent_id, &self.name)
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

#[derive(Debug)]
pub enum ReserveOutcome {
    /// The reservation is new and owned by this caller.
    Reserved,
    /// Another holder already binds this name. A holder with a different
    /// file_id is a name collision, not a stale read.
    Held(NameHolder),
}

pub struct NameHolderStore {
    store: Arc<dyn KeyValueStore>,
}

impl NameHolderStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn reserve(&self, holder: &NameHolder) -> Result<ReserveOutcome, MetaError> {
        let value = holder.to_bytes()?;
        match insert_if_absent(self.store.as_ref(), holder.key(), value).await? {
            InsertOutcome::Inserted => Ok(ReserveOutcome::Reserved),
            InsertOutcome::Existing(raw) => Ok(ReserveOutcome::Held(NameHolder::from_bytes(&raw)?)),
        }
    }

    pub async fn get(
        &self,
        volume_id: VolumeId,
        parent_id: FileId,
        name: &str,
    ) -> Result<Option<NameHolder>, MetaError> {
        let key = KeyCodec::name_holder_key(volume_id, parent_id, name);
        match self.store.get(&key).await? {
            Some(raw) => Ok(Some(NameHolder::from_bytes(&raw)?)),
            None => Ok(None),
        }
    }

    /// Point the reservation at a different child, overwriting any holder
    /// already there (the rename-over-existing path).
    pub async fn rebind(&self, holder: &NameHolder) -> Result<(), MetaError> {
        let value = holder.to_bytes()?;
        self.store.put(holder.key(), value).await?;
        Ok(())
    }

    pub async fn release(
        &self,
        volume_id: VolumeId,
        parent_id: FileId,
        name: &str,
    ) -> Result<(), MetaError> {
        let key = KeyCodec::name_holder_key(volume_id, parent_id, name);
        self.store.delete(&key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    fn holder(file_id: FileId, name: &str) -> NameHolder {
        NameHolder {
            volume_id: 1,
            parent_id: 0,
            file_id,
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_reserve_then_collide() {
        let names = NameHolderStore::new(Arc::new(MemoryStore::new()));

        assert!(matches!(
            names.reserve(&holder(5, "a")).await.unwrap(),
            ReserveOutcome::Reserved
        ));
        match names.reserve(&holder(6, "a")).await.unwrap() {
            ReserveOutcome::Held(existing) => assert_eq!(existing.file_id, 5),
            ReserveOutcome::Reserved => panic!("colliding reservation must report the holder"),
        }
    }

    #[tokio::test]
    async fn test_release_frees_the_name() {
        let names = NameHolderStore::new(Arc::new(MemoryStore::new()));
        names.reserve(&holder(5, "a")).await.unwrap();
        names.release(1, 0, "a").await.unwrap();
        assert!(names.get(1, 0, "a").await.unwrap().is_none());
        assert!(matches!(
            names.reserve(&holder(7, "a")).await.unwrap(),
            ReserveOutcome::Reserved
        ));
    }

    #[tokio::test]
    async fn test_rebind_overwrites() {
        let names = NameHolderStore::new(Arc::new(MemoryStore::new()));
        names.reserve(&holder(5, "a")).await.unwrap();
        names.rebind(&holder(9, "a")).await.unwrap();
        assert_eq!(names.get(1, 0, "a").await.unwrap().unwrap().file_id, 9);
    }
}
