use std::{
    fs::{File, OpenOptions},
    io,
    os::{fd::AsRawFd, unix::fs::MetadataExt},
    path::{Path, PathBuf},
};

use crate::dex::ClassLoadErr;

/// An exclusive advisory lock on a file, held until drop.
///
/// Locking retries when the path was replaced between open and lock, so
/// the holder always owns the file currently at the path.
pub struct ScopedFlock {
    file: File,
    path: PathBuf,
}

fn flock(file: &File, operation: i32) -> io::Result<()> {
    loop {
        let ret = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

impl ScopedFlock {
    pub fn init(path: &Path) -> Result<ScopedFlock, ClassLoadErr> {
        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .map_err(|e| {
                    ClassLoadErr::ArtifactOpen(format!(
                        "Failed to open file '{}': {}",
                        path.display(),
                        e
                    ))
                })?;
            flock(&file, libc::LOCK_EX).map_err(|e| {
                ClassLoadErr::ArtifactOpen(format!("Failed to lock file '{}': {}", path.display(), e))
            })?;
            let fstat = file.metadata().map_err(|e| {
                ClassLoadErr::ArtifactOpen(format!("Failed to fstat file '{}': {}", path.display(), e))
            })?;
            let stat = match std::fs::metadata(path) {
                Ok(stat) => stat,
                Err(e) => {
                    log::warn!("Failed to stat, will retry: {}: {}", path.display(), e);
                    continue;
                }
            };
            if fstat.dev() != stat.dev() || fstat.ino() != stat.ino() {
                log::warn!("File changed while locking, will retry: {}", path.display());
                continue;
            }
            return Ok(ScopedFlock {
                file,
                path: path.to_path_buf(),
            });
        }
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopedFlock {
    fn drop(&mut self) {
        if let Err(e) = flock(&self.file, libc::LOCK_UN) {
            log::warn!("Unable to unlock file {}: {}", self.path.display(), e);
        }
    }
}
