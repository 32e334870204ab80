use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};

use super::{compiler::OatCompiler, flock::ScopedFlock, InstructionSet, OatClass, OatDexFile, OatFile};
use crate::{
    dex::{ClassLoadErr, DexFile},
    image::ImageHeader,
};

/// An entry of a registered artifact that matched a dex location.
#[derive(Clone)]
pub struct OatDexFileRef {
    oat_file: Arc<OatFile>,
    index: usize,
}

impl OatDexFileRef {
    fn find(oat_file: &Arc<OatFile>, dex_location: &str, checksum: Option<u32>) -> Option<Self> {
        let entry = oat_file.get_oat_dex_file(dex_location, checksum)?;
        let index = oat_file
            .oat_dex_files()
            .iter()
            .position(|e| std::ptr::eq(e, entry))?;
        return Some(OatDexFileRef {
            oat_file: oat_file.clone(),
            index,
        });
    }

    pub fn oat_file(&self) -> &Arc<OatFile> {
        &self.oat_file
    }

    pub fn oat_dex_file(&self) -> &OatDexFile {
        &self.oat_file.oat_dex_files()[self.index]
    }
}

impl fmt::Debug for OatDexFileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OatDexFileRef({} in {})",
            self.oat_dex_file().dex_file_location(),
            self.oat_file.location()
        )
    }
}

/// Tracks opened compiled artifacts and finds, validates or regenerates the
/// artifact for a dex location.
pub struct OatFileManager {
    oat_files: RwLock<Vec<Arc<OatFile>>>,
    generation_lock: Mutex<()>,
    dalvik_cache: PathBuf,
    instruction_set: InstructionSet,
    image_header: ImageHeader,
    compiler: Arc<dyn OatCompiler>,
    executable: bool,
}

impl OatFileManager {
    pub fn new(
        dalvik_cache: PathBuf,
        instruction_set: InstructionSet,
        image_header: ImageHeader,
        compiler: Arc<dyn OatCompiler>,
        executable: bool,
    ) -> Self {
        return OatFileManager {
            oat_files: RwLock::new(vec![]),
            generation_lock: Mutex::new(()),
            dalvik_cache,
            instruction_set,
            image_header,
            compiler,
            executable,
        };
    }

    pub fn image_header(&self) -> &ImageHeader {
        &self.image_header
    }

    pub fn num_oat_files(&self) -> usize {
        self.oat_files.read().len()
    }

    /// Registers `oat_file`; if an artifact with the same location is
    /// already registered that one is kept and returned.
    pub fn register_oat_file(&self, oat_file: Arc<OatFile>) -> Arc<OatFile> {
        let mut oat_files = self.oat_files.write();
        if let Some(existing) = oat_files.iter().find(|o| o.location() == oat_file.location()) {
            return existing.clone();
        }
        log::debug!("Registering {}", oat_file.location());
        oat_files.push(oat_file.clone());
        return oat_file;
    }

    pub fn find_opened_oat_file_for_dex_file(&self, dex_file: &DexFile) -> Option<Arc<OatFile>> {
        return self.find_opened_oat_file_from_dex_location(
            dex_file.location(),
            Some(dex_file.location_checksum()),
        );
    }

    pub fn find_opened_oat_file_from_dex_location(
        &self,
        dex_location: &str,
        dex_location_checksum: Option<u32>,
    ) -> Option<Arc<OatFile>> {
        return self
            .oat_files
            .read()
            .iter()
            .find(|o| o.get_oat_dex_file(dex_location, dex_location_checksum).is_some())
            .cloned();
    }

    pub fn find_opened_oat_file_from_oat_location(&self, oat_location: &str) -> Option<Arc<OatFile>> {
        return self
            .oat_files
            .read()
            .iter()
            .find(|o| o.location() == oat_location)
            .cloned();
    }

    /// Compile-time record for a class of a dex file with a registered
    /// artifact.
    pub fn find_oat_class(&self, dex_file: &DexFile, class_def_idx: u16) -> Option<OatClass> {
        let oat_file = self.find_opened_oat_file_for_dex_file(dex_file)?;
        let oat_dex_file =
            oat_file.get_oat_dex_file(dex_file.location(), Some(dex_file.location_checksum()))?;
        return oat_dex_file.oat_class(class_def_idx).cloned();
    }

    /// Artifact already registered under `oat_location`, or freshly opened
    /// from disk (not registered).
    pub fn find_oat_file_from_oat_location(&self, oat_location: &str) -> Result<Arc<OatFile>, ClassLoadErr> {
        if let Some(oat_file) = self.find_opened_oat_file_from_oat_location(oat_location) {
            return Ok(oat_file);
        }
        let oat_file = OatFile::open(Path::new(oat_location), oat_location, self.executable)?;
        return Ok(Arc::new(oat_file));
    }

    /// Path inside the dalvik cache for artifacts compiled from `location`.
    pub fn dalvik_cache_filename(&self, location: &str) -> Result<PathBuf, ClassLoadErr> {
        let relative = location.strip_prefix('/').ok_or_else(|| {
            ClassLoadErr::ArtifactOpen(format!("Expected path in location to be absolute: {}", location))
        })?;
        let mut cache_file = relative.to_string();
        if !location.ends_with(".dex") && !location.ends_with(".art") {
            cache_file.push_str("/classes.dex");
        }
        return Ok(self.dalvik_cache.join(cache_file.replace('/', "@")));
    }

    pub fn verify_oat_file_checksums(
        &self,
        oat_file: &OatFile,
        dex_location: &str,
        dex_location_checksum: u32,
    ) -> Result<(), ClassLoadErr> {
        let header = oat_file.header();
        if header.instruction_set != self.instruction_set {
            return Err(ClassLoadErr::ArtifactChecksumMismatch(format!(
                "oat file '{}' compiled for {} but runtime uses {}",
                oat_file.location(),
                header.instruction_set,
                self.instruction_set
            )));
        }
        let image_check = header.image_file_location_oat_checksum == self.image_header.oat_checksum()
            && header.image_file_location_oat_data_begin == self.image_header.oat_data_begin();

        let oat_dex_file = match oat_file.get_oat_dex_file(dex_location, None) {
            Some(entry) => entry,
            None => {
                let mut msg = format!(
                    "oat file '{}' does not contain contents for '{}' with checksum 0x{:x}",
                    oat_file.location(),
                    dex_location,
                    dex_location_checksum
                );
                for entry in oat_file.oat_dex_files() {
                    msg.push_str(&format!(
                        " with contents '{}' with checksum 0x{:x}",
                        entry.dex_file_location(),
                        entry.dex_file_location_checksum()
                    ));
                }
                return Err(ClassLoadErr::ArtifactChecksumMismatch(msg));
            }
        };
        let dex_check = dex_location_checksum == oat_dex_file.dex_file_location_checksum();
        if image_check && dex_check {
            return Ok(());
        }
        if !image_check {
            return Err(ClassLoadErr::ArtifactChecksumMismatch(format!(
                "oat file '{}' mismatch (0x{:x}, {}) with image (0x{:x}, {})",
                oat_file.location(),
                header.image_file_location_oat_checksum,
                header.image_file_location_oat_data_begin,
                self.image_header.oat_checksum(),
                self.image_header.oat_data_begin()
            )));
        }
        return Err(ClassLoadErr::ArtifactChecksumMismatch(format!(
            "oat file '{}' mismatch (0x{:x}) with '{}' (0x{:x})",
            oat_file.location(),
            oat_dex_file.dex_file_location_checksum(),
            dex_location,
            dex_location_checksum
        )));
    }

    /// Opens an existing artifact at `oat_location` and checks it against
    /// the image and the dex checksum. Without a checksum (the dex file was
    /// stripped) the artifact is trusted. The second element of the error
    /// tells whether the artifact could be opened at all.
    pub fn verify_and_open_dex_file_from_oat_file(
        &self,
        oat_location: &str,
        dex_location: &str,
        dex_location_checksum: Option<u32>,
    ) -> Result<OatDexFileRef, (ClassLoadErr, bool)> {
        let oat_file = self
            .find_oat_file_from_oat_location(oat_location)
            .map_err(|e| (e, true))?;
        let found = match dex_location_checksum {
            None => OatDexFileRef::find(&oat_file, dex_location, None).ok_or_else(|| {
                ClassLoadErr::ArtifactOpen(format!(
                    "Dex checksum mismatch for location '{}' and failed to find oat dex file '{}'",
                    oat_location, dex_location
                ))
            }),
            Some(checksum) => self
                .verify_oat_file_checksums(&oat_file, dex_location, checksum)
                .and_then(|_| {
                    OatDexFileRef::find(&oat_file, dex_location, Some(checksum)).ok_or_else(|| {
                        ClassLoadErr::ArtifactOpen(format!(
                            "Failed to find '{}' in oat file '{}'",
                            dex_location, oat_location
                        ))
                    })
                }),
        };
        let found = found.map_err(|e| (e, false))?;
        let registered = self.register_oat_file(found.oat_file.clone());
        return Ok(OatDexFileRef {
            oat_file: registered,
            index: found.index,
        });
    }

    /// Opens an existing artifact and checks it is current; does not
    /// generate anything.
    pub fn find_dex_file_in_oat_location(
        &self,
        dex_location: &str,
        dex_location_checksum: u32,
        oat_location: &str,
    ) -> Result<OatDexFileRef, ClassLoadErr> {
        let oat_file = OatFile::open(Path::new(oat_location), oat_location, self.executable)
            .map_err(|e| {
                ClassLoadErr::ArtifactOpen(format!(
                    "Failed to find existing oat file at {}: {}",
                    oat_location,
                    e.message()
                ))
            })?;
        let header = oat_file.header();
        let expected_image_oat_checksum = self.image_header.oat_checksum();
        if header.image_file_location_oat_checksum != expected_image_oat_checksum {
            return Err(ClassLoadErr::ArtifactChecksumMismatch(format!(
                "Failed to find oat file at '{}' with expected image oat checksum of 0x{:x}, found 0x{:x}",
                oat_location, expected_image_oat_checksum, header.image_file_location_oat_checksum
            )));
        }
        let expected_image_oat_offset = self.image_header.oat_data_begin();
        if header.image_file_location_oat_data_begin != expected_image_oat_offset {
            return Err(ClassLoadErr::ArtifactChecksumMismatch(format!(
                "Failed to find oat file at '{}' with expected image oat offset {}, found {}",
                oat_location, expected_image_oat_offset, header.image_file_location_oat_data_begin
            )));
        }
        let actual_dex_checksum = match oat_file.get_oat_dex_file(dex_location, None) {
            Some(entry) => entry.dex_file_location_checksum(),
            None => {
                return Err(ClassLoadErr::ArtifactOpen(format!(
                    "Failed to find oat file at '{}' containing '{}'",
                    oat_location, dex_location
                )))
            }
        };
        if dex_location_checksum != actual_dex_checksum {
            return Err(ClassLoadErr::ArtifactChecksumMismatch(format!(
                "Failed to find oat file at '{}' with expected dex checksum of 0x{:x}, found 0x{:x}",
                oat_location, dex_location_checksum, actual_dex_checksum
            )));
        }
        let oat_file = self.register_oat_file(Arc::new(oat_file));
        return OatDexFileRef::find(&oat_file, dex_location, Some(dex_location_checksum)).ok_or_else(
            || ClassLoadErr::ArtifactOpen(format!("Failed to find '{}' in '{}'", dex_location, oat_location)),
        );
    }

    /// Uses the artifact at `oat_location` if it is current, otherwise
    /// regenerates it under an exclusive file lock.
    pub fn find_or_create_oat_file_for_dex_location(
        &self,
        dex_location: &str,
        dex_location_checksum: u32,
        oat_location: &str,
    ) -> Result<OatDexFileRef, ClassLoadErr> {
        let _generation = self.generation_lock.lock();
        let scoped_flock = ScopedFlock::init(Path::new(oat_location))?;

        let mut error_msgs = vec![];
        match self.find_dex_file_in_oat_location(dex_location, dex_location_checksum, oat_location) {
            Ok(found) => return Ok(found),
            Err(e) => error_msgs.push(e.message().to_string()),
        }
        log::debug!(
            "Failed to find dex file {} in oat location {}: {}",
            dex_location,
            oat_location,
            error_msgs.join("\n")
        );

        log::info!("Generating oat file {} for {}", oat_location, dex_location);
        scoped_flock
            .file()
            .set_len(0)
            .map_err(|e| ClassLoadErr::ArtifactOpen(format!("Failed to truncate '{}': {}", oat_location, e)))?;
        self.compiler
            .generate_oat_file(dex_location, scoped_flock.file(), oat_location)
            .map_err(|e| {
                error_msgs.push(format!("Failed to generate oat file: {}", e));
                ClassLoadErr::ArtifactOpen(error_msgs.join("\n"))
            })?;

        let oat_file = OatFile::open(Path::new(oat_location), oat_location, self.executable)
            .map_err(|e| {
                ClassLoadErr::ArtifactOpen(format!(
                    "Failed to open generated oat file '{}': {}",
                    oat_location,
                    e.message()
                ))
            })?;
        self.verify_oat_file_checksums(&oat_file, dex_location, dex_location_checksum)
            .map_err(|e| {
                ClassLoadErr::ArtifactChecksumMismatch(format!(
                    "Failed to verify generated oat file '{}': {}",
                    oat_location,
                    e.message()
                ))
            })?;
        let oat_file = self.register_oat_file(Arc::new(oat_file));
        return OatDexFileRef::find(&oat_file, dex_location, Some(dex_location_checksum)).ok_or_else(
            || {
                ClassLoadErr::ArtifactOpen(format!(
                    "Failed to find dex file '{}' (checksum 0x{:x}) in generated out file '{}'",
                    dex_location, dex_location_checksum, oat_location
                ))
            },
        );
    }

    /// Reads the checksum from the dex file at `dex_location` and finds or
    /// regenerates the artifact for it. A location without a readable dex
    /// header is treated as stripped and matched without a checksum.
    pub fn open_oat_file_from_dex_location(
        &self,
        dex_location: &str,
    ) -> Result<OatDexFileRef, ClassLoadErr> {
        let dex_location_checksum = match DexFile::read_location_checksum(Path::new(dex_location)) {
            Ok(checksum) => Some(checksum),
            Err(e) => {
                log::debug!("No dex checksum for {}: {}", dex_location, e);
                None
            }
        };
        return self.find_dex_file_in_oat_file_from_dex_location(dex_location, dex_location_checksum);
    }

    /// Full lookup for a dex location: already-open artifacts, then an
    /// `.odex` next to the dex file, then the dalvik cache, regenerating the
    /// cached artifact when it is missing or stale.
    pub fn find_dex_file_in_oat_file_from_dex_location(
        &self,
        dex_location: &str,
        dex_location_checksum: Option<u32>,
    ) -> Result<OatDexFileRef, ClassLoadErr> {
        if let Some(open_oat_file) =
            self.find_opened_oat_file_from_dex_location(dex_location, dex_location_checksum)
        {
            return OatDexFileRef::find(&open_oat_file, dex_location, dex_location_checksum)
                .ok_or_else(|| {
                    ClassLoadErr::ArtifactOpen(format!(
                        "Failed to find '{}' in opened oat file '{}'",
                        dex_location,
                        open_oat_file.location()
                    ))
                });
        }

        let mut error_msgs = vec![];
        if let Some(odex_filename) = OatFile::dex_filename_to_odex_filename(dex_location) {
            match self.verify_and_open_dex_file_from_oat_file(
                &odex_filename,
                dex_location,
                dex_location_checksum,
            ) {
                Ok(found) => return Ok(found),
                Err((e, _)) => error_msgs.push(e.message().to_string()),
            }
        }

        let dex_location_checksum = match dex_location_checksum {
            Some(checksum) => checksum,
            None => {
                return Err(ClassLoadErr::ArtifactOpen(format!(
                    "Failed to open oat file from {} and no classes.dex found in {}: {}",
                    dex_location,
                    dex_location,
                    error_msgs.join("\n")
                )))
            }
        };

        let cache_location = self.dalvik_cache_filename(dex_location)?;
        let cache_location_str = cache_location.display().to_string();
        match self.verify_and_open_dex_file_from_oat_file(
            &cache_location_str,
            dex_location,
            Some(dex_location_checksum),
        ) {
            Ok(found) => return Ok(found),
            Err((e, open_failed)) => {
                error_msgs.push(e.message().to_string());
                if !open_failed {
                    std::fs::remove_file(&cache_location).map_err(|e| {
                        ClassLoadErr::ArtifactOpen(format!(
                            "Failed to remove obsolete oat file from {}: {}",
                            cache_location_str, e
                        ))
                    })?;
                }
            }
        }
        log::debug!(
            "Failed to open oat file from {} (error '{}') or {}. Attempting to generate",
            dex_location,
            error_msgs.join("\n"),
            cache_location_str
        );
        return self.find_or_create_oat_file_for_dex_location(
            dex_location,
            dex_location_checksum,
            &cache_location_str,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, path::Path, sync::Arc};

    use super::OatFileManager;
    use crate::{
        dex::ClassLoadErr,
        image::ImageHeader,
        oat::{writer::OatWriter, InstructionSet},
        object::ClassStatus,
        test::FakeCompiler,
    };

    fn write_dex_header(path: &Path, checksum: u32) {
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(b"dex\n035\0").unwrap();
        file.write_all(&checksum.to_le_bytes()).unwrap();
    }

    fn write_artifact(path: &Path, image: &ImageHeader, dex_location: &str, checksum: u32) {
        let mut writer = OatWriter::new(InstructionSet::X86_64, image, "/system/framework/boot.art");
        writer.add_dex_file_entry(dex_location, checksum, vec![(ClassStatus::Verified, vec![])]);
        let mut file = std::fs::File::create(path).unwrap();
        writer.write_to(&mut file).unwrap();
    }

    fn manager(cache: &Path, image: ImageHeader, compiler: Arc<FakeCompiler>) -> OatFileManager {
        return OatFileManager::new(cache.to_path_buf(), InstructionSet::X86_64, image, compiler, false);
    }

    #[test]
    fn cache_file_names() {
        let image = ImageHeader::new(0xCAFE, 0x7000_0000);
        let manager = manager(Path::new("/data/dalvik-cache"), image, FakeCompiler::new(image, 0));
        assert_eq!(
            manager.dalvik_cache_filename("/data/app/foo.apk").unwrap(),
            Path::new("/data/dalvik-cache/data@app@foo.apk@classes.dex")
        );
        assert_eq!(
            manager.dalvik_cache_filename("/system/framework/boot.art").unwrap(),
            Path::new("/data/dalvik-cache/system@framework@boot.art")
        );
        assert!(manager.dalvik_cache_filename("relative.dex").is_err());
    }

    #[test]
    fn stale_artifact_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("dalvik-cache");
        std::fs::create_dir(&cache).unwrap();
        let dex_path = dir.path().join("app.dex");
        let dex_location = dex_path.display().to_string();
        write_dex_header(&dex_path, 0x1122_3344);

        let image = ImageHeader::new(0xCAFE, 0x7000_0000);
        let compiler = FakeCompiler::new(image, 0x1122_3344);
        let manager = manager(&cache, image, compiler.clone());
        let cache_file = manager.dalvik_cache_filename(&dex_location).unwrap();
        write_artifact(&cache_file, &image, &dex_location, 0xAABB_CCDD);

        let found = manager.open_oat_file_from_dex_location(&dex_location).unwrap();
        assert_eq!(compiler.runs(), 1);
        assert_eq!(found.oat_dex_file().dex_file_location_checksum(), 0x1122_3344);
        assert_eq!(found.oat_file().location(), cache_file.display().to_string());

        let again = manager.open_oat_file_from_dex_location(&dex_location).unwrap();
        assert_eq!(compiler.runs(), 1);
        assert!(Arc::ptr_eq(again.oat_file(), found.oat_file()));
        assert_eq!(manager.num_oat_files(), 1);
    }

    #[test]
    fn current_artifact_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("dalvik-cache");
        std::fs::create_dir(&cache).unwrap();
        let dex_path = dir.path().join("lib.dex");
        let dex_location = dex_path.display().to_string();
        write_dex_header(&dex_path, 0x0BAD_F00D);

        let image = ImageHeader::new(0xCAFE, 0x7000_0000);
        let compiler = FakeCompiler::new(image, 0x0BAD_F00D);
        let manager = manager(&cache, image, compiler.clone());
        let cache_file = manager.dalvik_cache_filename(&dex_location).unwrap();
        write_artifact(&cache_file, &image, &dex_location, 0x0BAD_F00D);

        let found = manager.open_oat_file_from_dex_location(&dex_location).unwrap();
        assert_eq!(compiler.runs(), 0);
        assert_eq!(found.oat_dex_file().oat_class(0).unwrap().status(), ClassStatus::Verified);
    }

    #[test]
    fn image_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let oat_path = dir.path().join("other.oat");
        let stale_image = ImageHeader::new(0x1111, 0x7000_0000);
        write_artifact(&oat_path, &stale_image, "/data/app/x.dex", 5);

        let image = ImageHeader::new(0xCAFE, 0x7000_0000);
        let manager = manager(dir.path(), image, FakeCompiler::new(image, 5));
        let err = manager
            .find_dex_file_in_oat_location("/data/app/x.dex", 5, &oat_path.display().to_string())
            .unwrap_err();
        assert!(err.message().contains("expected image oat checksum"));
        assert_eq!(manager.num_oat_files(), 0);
    }

    #[test]
    fn generated_artifact_must_match_the_image() {
        let dir = tempfile::tempdir().unwrap();
        let oat_path = dir.path().join("app.oat");
        let oat_location = oat_path.display().to_string();

        let image = ImageHeader::new(0xCAFE, 0x7000_0000);
        let other_image = ImageHeader::new(0xCAFE, 0x6000_0000);
        let compiler = FakeCompiler::new(other_image, 9);
        let manager = manager(dir.path(), image, compiler.clone());
        let err = manager
            .find_or_create_oat_file_for_dex_location("/data/app/app.dex", 9, &oat_location)
            .unwrap_err();
        assert_eq!(compiler.runs(), 1);
        assert!(matches!(err, ClassLoadErr::ArtifactChecksumMismatch(_)), "{}", err);
        assert!(err.message().starts_with("Failed to verify generated oat file"));
        assert_eq!(manager.num_oat_files(), 0);
    }
}
