use crate::errors::MetaError;
use crate::types::UserId;

const S_IRGRP: u32 = 0o040;
const S_IWGRP: u32 = 0o020;
const S_IROTH: u32 = 0o004;
const S_IWOTH: u32 = 0o002;

/// Readable when the caller owns the entry, owns the volume, or the mode
/// grants group/other read.
pub fn is_readable(caller: UserId, owner: UserId, volume_owner: UserId, mode: u32) -> bool {
    caller == owner || caller == volume_owner || mode & (S_IRGRP | S_IROTH) != 0
}

pub fn is_writable(caller: UserId, owner: UserId, volume_owner: UserId, mode: u32) -> bool {
    caller == owner || caller == volume_owner || mode & (S_IWGRP | S_IWOTH) != 0
}

pub fn check_readable(
    caller: UserId,
    owner: UserId,
    volume_owner: UserId,
    mode: u32,
) -> Result<(), MetaError> {
    if is_readable(caller, owner, volume_owner, mode) {
        Ok(())
    } else {
        Err(MetaError::PermissionDenied)
    }
}

pub fn check_writable(
    caller: UserId,
    owner: UserId,
    volume_owner: UserId,
    mode: u32,
) -> Result<(), MetaError> {
    if is_writable(caller, owner, volume_owner, mode) {
        Ok(())
    } else {
        Err(MetaError::PermissionDenied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: UserId = 100;
    const VOLUME_OWNER: UserId = 200;
    const OTHER: UserId = 300;

    #[test]
    fn test_owner_always_allowed() {
        assert!(is_readable(OWNER, OWNER, VOLUME_OWNER, 0o600));
        assert!(is_writable(OWNER, OWNER, VOLUME_OWNER, 0o600));
    }

    #[test]
    fn test_volume_owner_always_allowed() {
        assert!(is_readable(VOLUME_OWNER, OWNER, VOLUME_OWNER, 0o600));
        assert!(is_writable(VOLUME_OWNER, OWNER, VOLUME_OWNER, 0o600));
    }

    #[test]
    fn test_mode_bits_for_strangers() {
        assert!(!is_readable(OTHER, OWNER, VOLUME_OWNER, 0o600));
        assert!(is_readable(OTHER, OWNER, VOLUME_OWNER, 0o644));
        assert!(!is_writable(OTHER, OWNER, VOLUME_OWNER, 0o644));
        assert!(is_writable(OTHER, OWNER, VOLUME_OWNER, 0o666));
        assert!(is_readable(OTHER, OWNER, VOLUME_OWNER, 0o040));
        assert!(is_writable(OTHER, OWNER, VOLUME_OWNER, 0o020));
    }

    #[test]
    fn test_check_variants_map_to_permission_denied() {
        assert!(check_writable(OTHER, OWNER, VOLUME_OWNER, 0o644).is_err());
        assert!(check_readable(OTHER, OWNER, VOLUME_OWNER, 0o600).is_err());
        assert!(check_readable(OTHER, OWNER, VOLUME_OWNER, 0o644).is_ok());
    }
}
