//! Compiled artifacts ("oat files"): a header tying the artifact to a boot
//! image, then one entry per dex file recording its location, checksum, the
//! compile-time status of every class and the code offsets of its methods.

pub mod compiler;
pub mod flock;
pub mod manager;
pub mod reader;
pub mod writer;

use std::{fmt, fs::File, path::Path, str::FromStr};

use crate::{
    dex::ClassLoadErr,
    memory::{mem_map::MemMap, Address},
    object::ClassStatus,
};
use reader::{OatReader, SliceOatReader};

pub const OAT_MAGIC: &[u8; 4] = b"oat\n";
pub const OAT_VERSION: &[u8; 4] = b"007\0";
/// Bytes covered by the checksum start after magic, version and checksum.
pub const CHECKSUM_START: usize = 12;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionSet {
    None = 0,
    Arm = 1,
    Thumb2 = 2,
    X86 = 3,
    Mips = 4,
    X86_64 = 5,
    Arm64 = 6,
}

impl InstructionSet {
    pub fn from_u32(value: u32) -> InstructionSet {
        match value {
            1 => InstructionSet::Arm,
            2 => InstructionSet::Thumb2,
            3 => InstructionSet::X86,
            4 => InstructionSet::Mips,
            5 => InstructionSet::X86_64,
            6 => InstructionSet::Arm64,
            _ => InstructionSet::None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            InstructionSet::None => "none",
            InstructionSet::Arm => "arm",
            InstructionSet::Thumb2 => "thumb2",
            InstructionSet::X86 => "x86",
            InstructionSet::Mips => "mips",
            InstructionSet::X86_64 => "x86_64",
            InstructionSet::Arm64 => "arm64",
        }
    }

    pub fn runtime_isa() -> InstructionSet {
        if cfg!(target_arch = "x86_64") {
            InstructionSet::X86_64
        } else if cfg!(target_arch = "x86") {
            InstructionSet::X86
        } else if cfg!(target_arch = "aarch64") {
            InstructionSet::Arm64
        } else if cfg!(target_arch = "arm") {
            InstructionSet::Thumb2
        } else if cfg!(target_arch = "mips") {
            InstructionSet::Mips
        } else {
            InstructionSet::None
        }
    }
}

impl FromStr for InstructionSet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "arm" => Ok(InstructionSet::Arm),
            "thumb2" => Ok(InstructionSet::Thumb2),
            "x86" => Ok(InstructionSet::X86),
            "mips" => Ok(InstructionSet::Mips),
            "x86_64" => Ok(InstructionSet::X86_64),
            "arm64" => Ok(InstructionSet::Arm64),
            _ => Err(format!("unknown instruction set '{}'", s)),
        }
    }
}

impl fmt::Display for InstructionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub fn adler32(data: &[u8]) -> u32 {
    const MOD_ADLER: u32 = 65521;
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for chunk in data.chunks(5552) {
        for byte in chunk {
            a += *byte as u32;
            b += a;
        }
        a %= MOD_ADLER;
        b %= MOD_ADLER;
    }
    return (b << 16) | a;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OatHeader {
    pub checksum: u32,
    pub instruction_set: InstructionSet,
    pub dex_file_count: u32,
    pub image_file_location_oat_checksum: u32,
    pub image_file_location_oat_data_begin: u32,
    pub image_file_location: String,
}

/// Code offsets for one method, relative to the start of the artifact.
/// Zero means the method has no compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OatMethod {
    begin: Address,
    quick_code_offset: u32,
    portable_code_offset: u32,
}

impl OatMethod {
    pub fn quick_code_offset(&self) -> u32 {
        self.quick_code_offset
    }

    pub fn portable_code_offset(&self) -> u32 {
        self.portable_code_offset
    }

    pub fn quick_code(&self) -> Option<Address> {
        if self.quick_code_offset == 0 {
            return None;
        }
        return Some(self.begin.uoffset(self.quick_code_offset as usize));
    }

    pub fn portable_code(&self) -> Option<Address> {
        if self.portable_code_offset == 0 {
            return None;
        }
        return Some(self.begin.uoffset(self.portable_code_offset as usize));
    }
}

#[derive(Debug, Clone)]
pub struct OatClass {
    status: ClassStatus,
    methods: Vec<OatMethod>,
}

impl OatClass {
    pub fn status(&self) -> ClassStatus {
        self.status
    }

    pub fn num_methods(&self) -> usize {
        self.methods.len()
    }

    /// Method by its position in the class definition: direct methods first,
    /// then virtual methods.
    pub fn oat_method(&self, method_index: usize) -> Option<OatMethod> {
        self.methods.get(method_index).copied()
    }
}

#[derive(Debug, Clone)]
pub struct OatDexFile {
    dex_file_location: String,
    dex_file_location_checksum: u32,
    classes: Vec<OatClass>,
}

impl OatDexFile {
    pub fn dex_file_location(&self) -> &str {
        &self.dex_file_location
    }

    pub fn dex_file_location_checksum(&self) -> u32 {
        self.dex_file_location_checksum
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn oat_class(&self, class_def_idx: u16) -> Option<&OatClass> {
        self.classes.get(class_def_idx as usize)
    }
}

/// A validated, memory-mapped compiled artifact.
pub struct OatFile {
    location: String,
    map: MemMap,
    header: OatHeader,
    oat_dex_files: Vec<OatDexFile>,
}

impl fmt::Debug for OatFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OatFile")
            .field("location", &self.location)
            .field("dex_files", &self.oat_dex_files.len())
            .finish()
    }
}

impl OatFile {
    pub fn open(filename: &Path, location: &str, executable: bool) -> Result<OatFile, ClassLoadErr> {
        let file = File::open(filename).map_err(|e| {
            ClassLoadErr::ArtifactOpen(format!("Failed to open oat file '{}': {}", filename.display(), e))
        })?;
        return Self::open_file(&file, location, executable);
    }

    pub fn open_file(file: &File, location: &str, executable: bool) -> Result<OatFile, ClassLoadErr> {
        let map = MemMap::map_file(file, executable).map_err(|e| {
            ClassLoadErr::ArtifactOpen(format!("Failed to map oat file '{}': {}", location, e))
        })?;
        let (header, oat_dex_files) = Self::parse(map.as_slice(), map.begin()).map_err(|e| {
            ClassLoadErr::ArtifactOpen(format!("Invalid oat file '{}': {}", location, e.message()))
        })?;
        log::debug!(
            "opened oat file {} with {} dex files",
            location,
            oat_dex_files.len()
        );
        return Ok(OatFile {
            location: location.to_string(),
            map,
            header,
            oat_dex_files,
        });
    }

    fn parse(bytes: &[u8], begin: Address) -> Result<(OatHeader, Vec<OatDexFile>), ClassLoadErr> {
        let mut reader = SliceOatReader::new(bytes);
        if reader.read_bytes(4)? != OAT_MAGIC {
            return Err(ClassLoadErr::ArtifactOpen("bad magic".to_string()));
        }
        if reader.read_bytes(4)? != OAT_VERSION {
            return Err(ClassLoadErr::ArtifactOpen("unsupported version".to_string()));
        }
        let checksum = reader.read_u32()?;
        let actual = adler32(&bytes[CHECKSUM_START..]);
        if checksum != actual {
            return Err(ClassLoadErr::ArtifactOpen(format!(
                "header checksum 0x{:08x} does not match contents 0x{:08x}",
                checksum, actual
            )));
        }
        let instruction_set = InstructionSet::from_u32(reader.read_u32()?);
        let dex_file_count = reader.read_u32()?;
        let image_file_location_oat_checksum = reader.read_u32()?;
        let image_file_location_oat_data_begin = reader.read_u32()?;
        let image_file_location = reader.read_string()?;
        let header = OatHeader {
            checksum,
            instruction_set,
            dex_file_count,
            image_file_location_oat_checksum,
            image_file_location_oat_data_begin,
            image_file_location,
        };

        let mut oat_dex_files = Vec::with_capacity(dex_file_count as usize);
        for _ in 0..dex_file_count {
            let dex_file_location = reader.read_string()?;
            let dex_file_location_checksum = reader.read_u32()?;
            let class_count = reader.read_u32()?;
            let mut classes = Vec::with_capacity(class_count as usize);
            for _ in 0..class_count {
                let status = ClassStatus::from_i8(reader.read_u32()? as i32 as i8);
                let method_count = reader.read_u32()?;
                let mut methods = Vec::with_capacity(method_count as usize);
                for _ in 0..method_count {
                    let quick_code_offset = reader.read_u32()?;
                    let portable_code_offset = reader.read_u32()?;
                    for offset in [quick_code_offset, portable_code_offset] {
                        if offset as usize >= bytes.len() {
                            return Err(ClassLoadErr::ArtifactOpen(format!(
                                "code offset {} outside of file",
                                offset
                            )));
                        }
                    }
                    methods.push(OatMethod {
                        begin,
                        quick_code_offset,
                        portable_code_offset,
                    });
                }
                classes.push(OatClass { status, methods });
            }
            oat_dex_files.push(OatDexFile {
                dex_file_location,
                dex_file_location_checksum,
                classes,
            });
        }
        return Ok((header, oat_dex_files));
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn header(&self) -> &OatHeader {
        &self.header
    }

    pub fn begin(&self) -> Address {
        self.map.begin()
    }

    pub fn size(&self) -> usize {
        self.map.size()
    }

    pub fn oat_dex_files(&self) -> &[OatDexFile] {
        &self.oat_dex_files
    }

    /// Entry for `dex_location`, ignoring it when a checksum is given and
    /// does not match.
    pub fn get_oat_dex_file(
        &self,
        dex_location: &str,
        dex_location_checksum: Option<u32>,
    ) -> Option<&OatDexFile> {
        return self.oat_dex_files.iter().find(|entry| {
            entry.dex_file_location == dex_location
                && dex_location_checksum.map_or(true, |c| c == entry.dex_file_location_checksum)
        });
    }

    /// `/foo/bar/baz.jar` -> `/foo/bar/baz.odex`.
    pub fn dex_filename_to_odex_filename(location: &str) -> Option<String> {
        let dot = location.rfind('.')?;
        let slash = location.rfind('/').map_or(0, |s| s + 1);
        if dot < slash || location.len() - dot != 4 {
            return None;
        }
        return Some(format!("{}.odex", &location[..dot]));
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Seek, SeekFrom, Write};

    use super::{adler32, writer::OatWriter, InstructionSet, OatFile};
    use crate::{image::ImageHeader, object::ClassStatus};

    #[test]
    fn adler32_reference_values() {
        assert_eq!(adler32(b""), 1);
        assert_eq!(adler32(b"Wikipedia"), 0x11E6_0398);
    }

    #[test]
    fn odex_names() {
        assert_eq!(
            OatFile::dex_filename_to_odex_filename("/system/framework/core.jar").as_deref(),
            Some("/system/framework/core.odex")
        );
        assert_eq!(OatFile::dex_filename_to_odex_filename("/data/app.d/classes"), None);
        assert_eq!(OatFile::dex_filename_to_odex_filename("/data/foo.dexx"), None);
    }

    #[test]
    fn open_rejects_corruption() {
        let image = ImageHeader::new(0xCAFE, 0x7000_0000);
        let mut writer = OatWriter::new(InstructionSet::X86_64, &image, "/system/framework/boot.art");
        writer.add_dex_file_entry("/data/app/a.dex", 0x1122_3344, vec![(ClassStatus::Verified, vec![])]);
        let mut file = tempfile::tempfile().unwrap();
        writer.write_to(&mut file).unwrap();

        let oat = OatFile::open_file(&file, "a.oat", false).unwrap();
        assert_eq!(oat.header().image_file_location_oat_checksum, 0xCAFE);
        assert_eq!(oat.header().instruction_set, InstructionSet::X86_64);
        let entry = oat.get_oat_dex_file("/data/app/a.dex", None).unwrap();
        assert_eq!(entry.oat_class(0).unwrap().status(), ClassStatus::Verified);
        assert!(oat.get_oat_dex_file("/data/app/a.dex", Some(0xAABB_CCDD)).is_none());

        let len = file.metadata().unwrap().len();
        file.seek(SeekFrom::Start(len - 1)).unwrap();
        file.write_all(&[0xFF]).unwrap();
        assert!(OatFile::open_file(&file, "a.oat", false).is_err());
    }
}
