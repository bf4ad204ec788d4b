use crate::entry::Entry;
use crate::types::VersionedPage;
use bytes::Bytes;
use moka::sync::Cache;
use std::sync::Arc;

/// One cached value per key space: entry bases, listing pages, child
/// counts. Values are `Arc`'d so hits are cheap clones.
#[derive(Clone)]
pub enum CacheValue {
    Entry(Arc<Entry>),
    Page(Arc<VersionedPage>),
    Count(u64),
}

/// Write-invalidated read cache. Mutators delete keys, they never update
/// values in place: an in-place update could overwrite a concurrent
/// writer's fresher state.
pub struct MetaCache {
    inner: Cache<Bytes, CacheValue>,
}

impl MetaCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Cache::new(capacity),
        }
    }

    pub fn get_entry(&self, key: &Bytes) -> Option<Arc<Entry>> {
        match self.inner.get(key) {
            Some(CacheValue::Entry(e)) => Some(e),
            _ => None,
        }
    }

    pub fn get_page(&self, key: &Bytes) -> Option<Arc<VersionedPage>> {
        match self.inner.get(key) {
            Some(CacheValue::Page(p)) => Some(p),
            _ => None,
        }
    }

    pub fn get_count(&self, key: &Bytes) -> Option<u64> {
        match self.inner.get(key) {
            Some(CacheValue::Count(n)) => Some(n),
            _ => None,
        }
    }

    pub fn set_entry(&self, key: Bytes, entry: Entry) {
        self.inner.insert(key, CacheValue::Entry(Arc::new(entry)));
    }

    pub fn set_page(&self, key: Bytes, page: VersionedPage) {
        self.inner.insert(key, CacheValue::Page(Arc::new(page)));
    }

    pub fn set_count(&self, key: Bytes, count: u64) {
        self.inner.insert(key, CacheValue::Count(count));
    }

    pub fn delete(&self, key: &Bytes) {
        self.inner.invalidate(key);
    }

    pub fn delete_multi<'a>(&self, keys: impl IntoIterator<Item = &'a Bytes>) {
        for key in keys {
            self.inner.invalidate(key);
        }
    }
}
