use super::Address;

/// No access to the committed region.
pub const PAGE_NOACCESS: u32 = 0x01;
/// Read-only access.
pub const PAGE_READONLY: u32 = 0x02;
/// Read/write access.
pub const PAGE_READWRITE: u32 = 0x04;
/// Copy-on-write access.
pub const PAGE_WRITECOPY: u32 = 0x08;
/// Execute access.
pub const PAGE_EXECUTE: u32 = 0x10;
/// Execute and read access.
pub const PAGE_EXECUTE_READ: u32 = 0x20;
/// Execute, read and write access.
pub const PAGE_EXECUTE_READWRITE: u32 = 0x40;
/// Execute and copy-on-write access.
pub const PAGE_EXECUTE_WRITECOPY: u32 = 0x80;
/// One-shot access trap modifier.
pub const PAGE_GUARD: u32 = 0x100;

/// Committed memory state.
pub const MEM_COMMIT: u32 = 0x1000;
/// Reserved memory state.
pub const MEM_RESERVE: u32 = 0x2000;
/// Free memory state.
pub const MEM_FREE: u32 = 0x10000;

const READABLE: u32 = PAGE_READONLY
    | PAGE_READWRITE
    | PAGE_WRITECOPY
    | PAGE_EXECUTE_READ
    | PAGE_EXECUTE_READWRITE
    | PAGE_EXECUTE_WRITECOPY;

const WRITABLE: u32 =
    PAGE_READWRITE | PAGE_WRITECOPY | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY;

const EXECUTABLE: u32 =
    PAGE_EXECUTE | PAGE_EXECUTE_READ | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY;

/// Region of a debuggee's address space sharing the same state and
/// protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// First address of the region.
    pub base: Address,
    /// Size of the region, in bytes.
    pub size: u64,
    /// Memory state (`MEM_*`).
    pub state: u32,
    /// Page protection (`PAGE_*`).
    pub protect: u32,
}

impl MemoryRegion {
    /// Returns whether `address` lies within this region.
    pub const fn contains(&self, address: Address) -> bool {
        address >= self.base && address - self.base < self.size
    }

    /// Returns whether the region is committed.
    pub const fn is_committed(&self) -> bool {
        self.state == MEM_COMMIT
    }

    /// Returns whether the region can be read.
    pub const fn is_readable(&self) -> bool {
        self.is_committed() && self.protect & READABLE != 0
    }

    /// Returns whether the region can be written.
    pub const fn is_writable(&self) -> bool {
        self.is_committed() && self.protect & WRITABLE != 0
    }

    /// Returns whether the region can be executed.
    pub const fn is_executable(&self) -> bool {
        self.is_committed() && self.protect & EXECUTABLE != 0
    }

    /// Returns whether the region carries the guard modifier.
    pub const fn is_guard(&self) -> bool {
        self.protect & PAGE_GUARD != 0
    }
}

/// Rounds `address` down to a page boundary.
pub const fn align_down(address: Address, page_size: u64) -> Address {
    address - address % page_size
}

/// Rounds `address` up to a page boundary.
pub const fn align_up(address: Address, page_size: u64) -> Address {
    match address % page_size {
        0 => address,
        rem => address + (page_size - rem),
    }
}

/// Returns the base address of every page touched by `[address, address+size)`.
pub fn pages_spanned(
    address: Address,
    size: u64,
    page_size: u64,
) -> impl Iterator<Item = Address> {
    let first = align_down(address, page_size);
    let last = align_up(address.saturating_add(size), page_size);

    (first..last).step_by(page_size.max(1) as usize)
}
