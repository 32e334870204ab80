use std::io::{self, Write};

use super::{adler32, InstructionSet, CHECKSUM_START, OAT_MAGIC, OAT_VERSION};
use crate::{dex::DexFile, image::ImageHeader, object::ClassStatus};

/// Code offsets of one method, relative to the start of the code area.
pub type MethodCode = (Option<u32>, Option<u32>);

struct DexEntry {
    location: String,
    location_checksum: u32,
    classes: Vec<(ClassStatus, Vec<MethodCode>)>,
}

/// Serializes a compiled artifact in the layout [`super::OatFile`] reads.
pub struct OatWriter {
    instruction_set: InstructionSet,
    image_file_location_oat_checksum: u32,
    image_file_location_oat_data_begin: u32,
    image_file_location: String,
    dex_files: Vec<DexEntry>,
    code: Vec<u8>,
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_str(out: &mut Vec<u8>, value: &str) {
    push_u32(out, value.len() as u32);
    out.extend_from_slice(value.as_bytes());
}

impl OatWriter {
    pub fn new(instruction_set: InstructionSet, image: &ImageHeader, image_location: &str) -> Self {
        return OatWriter {
            instruction_set,
            image_file_location_oat_checksum: image.oat_checksum(),
            image_file_location_oat_data_begin: image.oat_data_begin(),
            image_file_location: image_location.to_string(),
            dex_files: vec![],
            code: vec![],
        };
    }

    /// Appends a code blob and returns its offset inside the code area.
    pub fn add_code(&mut self, code: &[u8]) -> u32 {
        let offset = self.code.len() as u32;
        self.code.extend_from_slice(code);
        return offset;
    }

    pub fn add_dex_file_entry(
        &mut self,
        location: &str,
        location_checksum: u32,
        classes: Vec<(ClassStatus, Vec<MethodCode>)>,
    ) {
        self.dex_files.push(DexEntry {
            location: location.to_string(),
            location_checksum,
            classes,
        });
    }

    /// Records every class of `dex_file` with `status` and no compiled code.
    pub fn add_dex_file(&mut self, dex_file: &DexFile, status: ClassStatus) {
        let classes = dex_file
            .class_defs()
            .iter()
            .map(|def| {
                let num_methods = def.class_data.as_ref().map_or(0, |d| d.num_methods());
                (status, vec![(None, None); num_methods])
            })
            .collect();
        self.add_dex_file_entry(dex_file.location(), dex_file.location_checksum(), classes);
    }

    fn tables_size(&self) -> usize {
        let mut size = 32 + self.image_file_location.len();
        for dex in self.dex_files.iter() {
            size += 4 + dex.location.len() + 8;
            for (_, methods) in dex.classes.iter() {
                size += 8 + methods.len() * 8;
            }
        }
        return size;
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let code_start = self.tables_size() as u32;
        let relocate = |offset: Option<u32>| offset.map_or(0, |o| code_start + o);

        let mut out = Vec::with_capacity(code_start as usize + self.code.len());
        out.extend_from_slice(OAT_MAGIC);
        out.extend_from_slice(OAT_VERSION);
        push_u32(&mut out, 0);
        push_u32(&mut out, self.instruction_set as u32);
        push_u32(&mut out, self.dex_files.len() as u32);
        push_u32(&mut out, self.image_file_location_oat_checksum);
        push_u32(&mut out, self.image_file_location_oat_data_begin);
        push_str(&mut out, &self.image_file_location);
        for dex in self.dex_files.iter() {
            push_str(&mut out, &dex.location);
            push_u32(&mut out, dex.location_checksum);
            push_u32(&mut out, dex.classes.len() as u32);
            for (status, methods) in dex.classes.iter() {
                push_u32(&mut out, *status as i8 as i32 as u32);
                push_u32(&mut out, methods.len() as u32);
                for (quick, portable) in methods.iter() {
                    push_u32(&mut out, relocate(*quick));
                    push_u32(&mut out, relocate(*portable));
                }
            }
        }
        debug_assert_eq!(out.len(), code_start as usize);
        out.extend_from_slice(&self.code);

        let checksum = adler32(&out[CHECKSUM_START..]);
        out[8..12].copy_from_slice(&checksum.to_le_bytes());
        return out;
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(&self.to_bytes())?;
        return out.flush();
    }
}
