use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub type VolumeId = u64;
pub type FileId = u64;
pub type UserId = u64;
pub type GatewayId = u64;

/// The volume root. It always exists once the volume is bootstrapped and
/// never has a name reservation.
pub const ROOT_FILE_ID: FileId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    File,
    Dir,
}

/// Lifecycle of an entry: live, then tombstoned by the first delete phase,
/// then physically absent once deferred reclamation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    Live,
    Tombstoned,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash,
)]
pub struct Timestamp {
    pub sec: u64,
    pub nsec: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp {
            sec: now.as_secs(),
            nsec: now.subsec_nanos(),
        }
    }

    /// One nanosecond later.
    pub fn tick(self) -> Self {
        if self.nsec >= 999_999_999 {
            Timestamp {
                sec: self.sec + 1,
                nsec: 0,
            }
        } else {
            Timestamp {
                sec: self.sec,
                nsec: self.nsec + 1,
            }
        }
    }

    /// Wall clock, but strictly after `floor`. When the clock has not
    /// advanced past a previously stored time, the result is bumped by one
    /// tick so every write remains observably distinguishable.
    pub fn after(floor: Timestamp) -> Self {
        let now = Self::now();
        if now > floor { now } else { floor.tick() }
    }
}

/// Identity of the caller as established by the API layer. Authorization
/// here reduces to owner / volume-owner / mode-bit checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeInfo {
    pub volume_id: VolumeId,
    pub owner_id: UserId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SetMode {
    Set(u32),
    #[default]
    NoChange,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SetOwner {
    Set(UserId),
    #[default]
    NoChange,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SetSize {
    Set(u64),
    #[default]
    NoChange,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SetTime {
    SetToClientTime(Timestamp),
    SetToServerTime,
    #[default]
    NoChange,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SetUmount {
    Set(u64),
    #[default]
    NoChange,
}

#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub file_id: FileId,
    pub parent_id: FileId,
    pub name: String,
    pub ftype: EntryType,
    pub mode: u32,
    pub owner_id: UserId,
    pub coordinator_id: GatewayId,
}

/// Whitelisted writable fields. Name and parent are deliberately absent:
/// only Rename may move an entry, keeping NameHolders in sync.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub file_id: FileId,
    pub mode: SetMode,
    pub owner_id: SetOwner,
    pub umount_id: SetUmount,
    /// Bumped on content-replacing operations such as truncate; shards
    /// written against the old version stop participating in aggregation.
    pub bump_version: bool,
    pub size: SetSize,
    pub mtime: SetTime,
}

impl UpdateRequest {
    /// True when a non-shard field changes and the base entry record must
    /// be rewritten rather than just a fresh shard.
    pub fn needs_write_base(&self) -> bool {
        self.mode != SetMode::NoChange
            || self.owner_id != SetOwner::NoChange
            || self.umount_id != SetUmount::NoChange
            || self.bump_version
    }
}

#[derive(Debug, Clone)]
pub struct RenameRequest {
    pub src_parent_id: FileId,
    pub src_name: String,
    pub dst_parent_id: FileId,
    pub dst_name: String,
}

/// Result of a coordinator compare-and-swap. A stale expectation is not an
/// error; the caller learns the actual coordinator and retries with fresh
/// state.
#[derive(Debug, Clone)]
pub enum ChcoordOutcome {
    Changed(crate::entry::Entry),
    Rejected { current_coordinator: GatewayId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageToken(pub u64);

#[derive(Debug, Clone)]
pub struct DirPage {
    pub entries: Vec<crate::entry::EntryView>,
    pub next: Option<PageToken>,
}

/// A cached directory listing page, valid only while the directory's
/// write nonce is unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedPage {
    pub write_nonce: u64,
    pub file_ids: Vec<FileId>,
    pub next_index: u64,
    pub have_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_ordering() {
        let a = Timestamp { sec: 5, nsec: 10 };
        let b = Timestamp { sec: 5, nsec: 11 };
        let c = Timestamp { sec: 6, nsec: 0 };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_timestamp_tick_carries_into_seconds() {
        let t = Timestamp {
            sec: 7,
            nsec: 999_999_999,
        };
        assert_eq!(t.tick(), Timestamp { sec: 8, nsec: 0 });
        let t = Timestamp { sec: 7, nsec: 3 };
        assert_eq!(t.tick(), Timestamp { sec: 7, nsec: 4 });
    }

    #[test]
    fn test_timestamp_after_is_strictly_later() {
        let far_future = Timestamp {
            sec: u64::MAX - 1,
            nsec: 0,
        };
        let bumped = Timestamp::after(far_future);
        assert!(bumped > far_future);
        assert_eq!(bumped, far_future.tick());

        let past = Timestamp { sec: 0, nsec: 0 };
        assert!(Timestamp::after(past) > past);
    }

    #[test]
    fn test_update_request_write_base_detection() {
        let req = UpdateRequest {
            file_id: 1,
            size: SetSize::Set(100),
            mtime: SetTime::SetToServerTime,
            ..Default::default()
        };
        assert!(!req.needs_write_base());

        let req = UpdateRequest {
            file_id: 1,
            mode: SetMode::Set(0o644),
            ..Default::default()
        };
        assert!(req.needs_write_base());

        let req = UpdateRequest {
            file_id: 1,
            bump_version: true,
            ..Default::default()
        };
        assert!(req.needs_write_base());
    }
}
