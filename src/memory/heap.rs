use std::sync::atomic::{AtomicUsize, Ordering};

use super::space::{Space, SpaceType};
use super::{Address, Allocator};

/// Two bump spaces: one for ordinary objects and one for objects that must
/// keep their address (class objects).
pub struct Heap {
    movable_space: Space,
    non_moving_space: Space,
    failed_allocations: AtomicUsize,
}

impl Heap {
    pub fn new(capacity: usize, non_moving_capacity: usize) -> Option<Heap> {
        return Some(Heap {
            movable_space: Space::new(SpaceType::Movable, capacity)?,
            non_moving_space: Space::new(SpaceType::NonMovable, non_moving_capacity)?,
            failed_allocations: AtomicUsize::new(0),
        });
    }

    pub fn bytes_allocated(&self) -> usize {
        return self.movable_space.used() + self.non_moving_space.used();
    }

    pub fn failed_allocations(&self) -> usize {
        return self.failed_allocations.load(Ordering::Relaxed);
    }

    pub fn contains(&self, addr: Address) -> bool {
        return self.movable_space.contains(addr) || self.non_moving_space.contains(addr);
    }

    fn record(&self, result: Address, size: usize) -> Address {
        if result.is_null() {
            log::warn!("heap allocation of {} bytes failed", size);
            self.failed_allocations.fetch_add(1, Ordering::Relaxed);
        }
        return result;
    }
}

impl Allocator for Heap {
    fn alloc_object(&self, size: usize) -> Address {
        return self.record(self.movable_space.alloc(size), size);
    }

    fn alloc_non_movable_object(&self, size: usize) -> Address {
        return self.record(self.non_moving_space.alloc(size), size);
    }
}

#[cfg(test)]
mod tests {
    use super::Heap;
    use crate::memory::{Allocator, KB};

    #[test]
    fn exhausted_space_reports_null() {
        let heap = Heap::new(4 * KB, 4 * KB).unwrap();
        let obj = heap.alloc_object(64);
        let class = heap.alloc_non_movable_object(128);
        assert!(heap.contains(obj));
        assert!(heap.contains(class));
        assert_eq!(heap.bytes_allocated(), 192);
        assert!(heap.alloc_object(1024 * KB).is_null());
        assert_eq!(heap.failed_allocations(), 1);
    }
}
