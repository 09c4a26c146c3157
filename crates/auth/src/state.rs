//! Registration state flags. The low half is system-controlled; only the
//! bits in [`STATE_MASK_FUNCTIONS`] may be changed by external callers.

pub const STATE_READONLY: u32 = 0x0000_0001;
pub const STATE_BLOCKED: u32 = 0x0000_0002;
pub const STATE_SYSTEM: u32 = 0x0000_0004;
pub const STATE_DELETED: u32 = 0x0000_0008;

pub const STATE_HIDDEN: u32 = 0x0001_0000;
pub const STATE_PINNED: u32 = 0x0002_0000;

pub const STATE_MASK_SYSTEM: u32 = 0x0000_FFFF;
pub const STATE_MASK_FUNCTIONS: u32 = 0xFFFF_0000;

/// Admin-settable lock bits on an organization's store relation.
pub const STATE_MASK_STORE_LOCKS: u32 = STATE_READONLY | STATE_BLOCKED;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("state bits {0:#010x} are outside the permitted mask")]
    OutsideMask(u32),
}

#[must_use]
pub fn has(state: u32, flag: u32) -> bool {
    state & flag == flag
}

/// Inactive registrations cannot act at all.
#[must_use]
pub fn is_inactive(state: u32) -> bool {
    state & (STATE_BLOCKED | STATE_DELETED) != 0
}

/// Sets then clears bits, rejecting any bit outside `mask`.
pub fn apply_masked(current: u32, set: u32, clear: u32, mask: u32) -> Result<u32, StateError> {
    let outside = (set | clear) & !mask;
    if outside != 0 {
        return Err(StateError::OutsideMask(outside));
    }
    Ok((current | set) & !clear)
}

pub fn apply_external(current: u32, set: u32, clear: u32) -> Result<u32, StateError> {
    apply_masked(current, set, clear, STATE_MASK_FUNCTIONS)
}
