use parking_lot::Mutex;

use super::{align_of, is_align_of, Address, OBJECT_ALIGNMENT};
use crate::os;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceType {
    Movable,
    NonMovable,
}

/// A bump-pointer region backed by an anonymous mapping.
pub struct Space {
    space_type: SpaceType,
    start: Address,
    end: Address,
    free: Mutex<Address>,
}

impl Space {
    pub fn new(space_type: SpaceType, size: usize) -> Option<Self> {
        let size = align_of(size, os::page_size());
        debug_assert!(is_align_of(size, os::page_size()));
        let start = os::reserve_memory(size);
        if start.is_null() {
            log::warn!("cannot reserve {} bytes for {:?} space: {}", size, space_type, os::last_os_error());
            return None;
        }
        return Some(Space {
            space_type,
            start,
            end: start.uoffset(size),
            free: Mutex::new(start),
        });
    }

    pub fn alloc(&self, size: usize) -> Address {
        let size = align_of(size, OBJECT_ALIGNMENT);
        let mut free = self.free.lock();
        if free.uoffset(size) <= self.end {
            let result = *free;
            *free = result.uoffset(size);
            unsafe {
                libc::memset(result.as_mut_raw_ptr() as _, 0, size);
            }
            debug_assert!(result.uoffset(size) <= self.end);
            debug_assert!(result >= self.start);
            return result;
        } else {
            log::trace!("space {:?} overflow allocating {} bytes", self.space_type, size);
            return Address::null();
        }
    }

    pub fn contains(&self, addr: Address) -> bool {
        return addr >= self.start && addr < self.end;
    }

    pub fn space_type(&self) -> SpaceType {
        self.space_type
    }

    pub fn size(&self) -> usize {
        return self.end.as_usize() - self.start.as_usize();
    }

    pub fn used(&self) -> usize {
        return self.free.lock().as_usize() - self.start.as_usize();
    }

    pub fn reset(&self) {
        *self.free.lock() = self.start;
    }
}

impl Drop for Space {
    fn drop(&mut self) {
        let ret = os::release_memory(self.start, self.size());
        if ret != 0 {
            log::error!("release {:?} space failed: {}", self.space_type, os::last_os_error());
        }
    }
}
