//! Keys and raw block buffers
//!
//! A [`Key`] is the 64-bit handle every persisted entry is addressed by:
//! the high half names the owning page (the "radical"), the low half the
//! entry index inside that page. Entries never hold language references to
//! each other, only keys; everything above the block cache chases these
//! integer handles through page payloads.

use std::cell::UnsafeCell;
use std::fmt;

/// Block size in bytes (8 KiB)
pub const BLOCK_SIZE: usize = 8192;

/// Radical value marking an unassigned cache slot
pub(crate) const NO_RADICAL: u32 = u32::MAX;

/// 64-bit handle identifying a persisted entry: page radical | entry index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(u64);

impl Key {
    /// Reserved "absent" marker. Entry 0 of page 0 is a reserved dummy in
    /// every file set, so no live entry ever decodes to 0.
    pub const NULL: Key = Key(0);

    /// Compose a key from a page radical and an in-page entry index
    pub fn new(radical: u32, local: u32) -> Self {
        Key(((radical as u64) << 32) | local as u64)
    }

    /// Rebuild a key from its raw 64-bit representation
    pub fn from_raw(raw: u64) -> Self {
        Key(raw)
    }

    /// Raw 64-bit representation (what gets persisted)
    pub fn raw(self) -> u64 {
        self.0
    }

    /// High 32 bits: the owning page
    pub fn radical(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Low 32 bits: the entry index within the page
    pub fn local(self) -> u32 {
        self.0 as u32
    }

    /// True for the reserved absent marker
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "key(null)")
        } else {
            write!(f, "key({}:{})", self.radical(), self.local())
        }
    }
}

/// Fixed-size byte buffer owned by exactly one cache slot at a time.
///
/// The cell is only ever accessed through the block cache's state machine:
/// the loading thread owns it exclusively between RESERVED and READY, and
/// after READY all byte-level access is mediated by arbiter leases, which
/// guarantee no two conflicting views of the same span exist.
pub(crate) struct RawBlock {
    bytes: UnsafeCell<Box<[u8; BLOCK_SIZE]>>,
}

// Safety: concurrent access is serialized by the slot state machine and
// the access arbiter's writer-exclusivity rule; see module docs.
unsafe impl Sync for RawBlock {}

impl RawBlock {
    pub(crate) fn new() -> Self {
        RawBlock {
            bytes: UnsafeCell::new(Box::new([0u8; BLOCK_SIZE])),
        }
    }

    /// Raw pointer to the buffer. Callers must honor the lease discipline.
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        // Box<[u8; N]> derefs to a stable heap allocation
        unsafe { (*self.bytes.get()).as_mut_ptr() }
    }

    /// Exclusive whole-buffer access. Only the slot owner (RESERVED load or
    /// EXCLUSIVE write-back) may call this.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn buf_mut(&self) -> &mut [u8; BLOCK_SIZE] {
        &mut *self.bytes.get()
    }

    /// Shared whole-buffer view for write-back under EXCLUSIVE use.
    pub(crate) unsafe fn buf(&self) -> &[u8; BLOCK_SIZE] {
        &*self.bytes.get()
    }
}
