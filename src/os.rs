use std::sync::OnceLock;

use crate::memory::Address;

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

pub fn page_size() -> usize {
    return *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize });
}

pub fn reserve_memory(size: usize) -> Address {
    let res = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if res == libc::MAP_FAILED {
        return Address::null();
    } else {
        return Address::new(res.cast());
    }
}

pub fn release_memory(addr: Address, size: usize) -> i32 {
    return unsafe { libc::munmap(addr.as_mut_raw_ptr() as _, size) };
}

/// Maps `size` bytes of `fd` read-only (and executable when asked).
pub fn map_file(fd: i32, size: usize, exec: bool) -> Address {
    let mut prot = libc::PROT_READ;
    if exec {
        prot |= libc::PROT_EXEC;
    }
    let res = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, libc::MAP_PRIVATE, fd, 0) };
    if res == libc::MAP_FAILED {
        return Address::null();
    } else {
        return Address::new(res.cast());
    }
}

pub fn last_os_error() -> String {
    return std::io::Error::last_os_error().to_string();
}

#[cfg(test)]
mod tests {
    use super::{page_size, release_memory, reserve_memory};

    #[test]
    fn reserve_and_release() {
        let size = page_size() * 4;
        let addr = reserve_memory(size);
        assert!(addr.is_not_null());
        assert_eq!(release_memory(addr, size), 0);
    }
}
