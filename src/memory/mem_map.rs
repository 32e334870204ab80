use std::{fs::File, os::fd::AsRawFd};

use super::Address;
use crate::os;

/// A read-only mapping of a file, unmapped on drop.
pub struct MemMap {
    begin: Address,
    size: usize,
}

// The mapping is private and never written through.
unsafe impl Send for MemMap {}
unsafe impl Sync for MemMap {}

impl MemMap {
    pub fn map_file(file: &File, exec: bool) -> Result<MemMap, String> {
        let size = file
            .metadata()
            .map_err(|e| format!("failed to stat mapped file: {}", e))?
            .len() as usize;
        if size == 0 {
            return Err("cannot map an empty file".to_string());
        }
        let begin = os::map_file(file.as_raw_fd(), size, exec);
        if begin.is_null() {
            return Err(format!("mmap of {} bytes failed: {}", size, os::last_os_error()));
        }
        return Ok(MemMap { begin, size });
    }

    pub fn begin(&self) -> Address {
        self.begin
    }

    pub fn end(&self) -> Address {
        self.begin.uoffset(self.size)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_slice(&self) -> &[u8] {
        return unsafe { std::slice::from_raw_parts(self.begin.raw_ptr(), self.size) };
    }
}

impl Drop for MemMap {
    fn drop(&mut self) {
        if os::release_memory(self.begin, self.size) != 0 {
            log::error!("munmap of {} bytes failed: {}", self.size, os::last_os_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::MemMap;

    #[test]
    fn maps_file_contents() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"oat\n007\0").unwrap();
        let map = MemMap::map_file(&file, false).unwrap();
        assert_eq!(map.size(), 8);
        assert_eq!(&map.as_slice()[..4], b"oat\n");
        assert_eq!(map.end().as_usize() - map.begin().as_usize(), 8);
    }

    #[test]
    fn empty_file_is_rejected() {
        let file = tempfile::tempfile().unwrap();
        assert!(MemMap::map_file(&file, false).is_err());
    }
}
