use std::cmp::{PartialEq, PartialOrd};

pub mod heap;
pub mod mem_map;
pub mod space;

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Width of a heap reference slot inside an object or class layout.
pub const HEAP_REFERENCE_SIZE: usize = 4;

pub const OBJECT_ALIGNMENT: usize = 8;

/// A raw location in a managed space. Stored as an integer so that
/// structures holding addresses stay `Send` and `Sync`.
#[derive(PartialOrd, PartialEq, Eq, Hash, Clone, Copy, Debug, Default)]
pub struct Address(usize);

impl Address {
    #[inline(always)]
    pub fn new(ptr: *const u8) -> Self {
        Address(ptr as usize)
    }

    #[inline(always)]
    pub const fn from_usize(addr: usize) -> Self {
        Address(addr)
    }

    #[inline(always)]
    pub const fn null() -> Self {
        Address(0)
    }

    #[inline(always)]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub const fn is_not_null(&self) -> bool {
        self.0 != 0
    }

    #[inline(always)]
    pub const fn uoffset(&self, size: usize) -> Address {
        Address(self.0 + size)
    }

    #[inline(always)]
    pub const fn offset(&self, size: isize) -> Address {
        Address(self.0.wrapping_add_signed(size))
    }

    #[inline(always)]
    pub const fn raw_ptr(&self) -> *const u8 {
        self.0 as _
    }

    #[inline(always)]
    pub const fn as_mut_raw_ptr(&self) -> *mut u8 {
        self.0 as _
    }

    #[inline(always)]
    pub const fn as_usize(&self) -> usize {
        return self.0;
    }
}

#[inline(always)]
pub const fn align_of(size: usize, align: usize) -> usize {
    debug_assert!(is_power_of_2(align));
    return (size + align - 1) & (!(align - 1));
}

#[inline(always)]
pub fn is_align_of(size: usize, align: usize) -> bool {
    (size & (align - 1)) == 0
}

#[inline(always)]
const fn is_power_of_2(val: usize) -> bool {
    (val & (val - 1)) == 0
}

/// Storage for managed objects. A null address signals that the request
/// could not be satisfied; callers turn that into an out-of-memory failure.
pub trait Allocator: Send + Sync {
    fn alloc_object(&self, size: usize) -> Address;

    /// Allocates storage that is never relocated. Class objects live here
    /// because they are referenced by address before they are fully linked.
    fn alloc_non_movable_object(&self, size: usize) -> Address;
}
