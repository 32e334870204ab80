use std::convert::TryInto;

use crate::dex::ClassLoadErr;

/// Little-endian cursor over artifact bytes.
pub trait OatReader {
    fn read_u8(&mut self) -> Result<u8, ClassLoadErr> {
        if self.offset() + 1 > self.bytes().len() {
            return Err(ClassLoadErr::ArtifactOpen(
                "out of range, expected 1 byte".to_string(),
            ));
        }
        let result = self.bytes()[self.offset()];
        self.skip(1);
        Ok(result)
    }

    fn read_u32(&mut self) -> Result<u32, ClassLoadErr> {
        let bytes: [u8; 4] = self
            .read_bytes(4)?
            .try_into()
            .map_err(|_| ClassLoadErr::ArtifactOpen("cannot read 4 bytes".to_string()))?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_bytes(&mut self, n: usize) -> Result<&[u8], ClassLoadErr> {
        let start = self.offset();
        if start + n > self.bytes().len() {
            return Err(ClassLoadErr::ArtifactOpen(format!(
                "out of range at offset {}, expected {} bytes",
                start, n
            )));
        }
        self.skip(n);
        return Ok(&self.bytes()[start..start + n]);
    }

    /// A `u32` length followed by that many UTF-8 bytes.
    fn read_string(&mut self) -> Result<String, ClassLoadErr> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        return String::from_utf8(bytes.to_vec())
            .map_err(|e| ClassLoadErr::ArtifactOpen(format!("invalid utf-8 string: {}", e)));
    }

    fn offset(&self) -> usize;

    fn skip(&mut self, size: usize);

    fn bytes(&self) -> &[u8];
}

pub struct SliceOatReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> SliceOatReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        SliceOatReader { bytes, offset: 0 }
    }
}

impl<'a> OatReader for SliceOatReader<'a> {
    fn offset(&self) -> usize {
        self.offset
    }

    fn skip(&mut self, size: usize) {
        self.offset += size;
    }

    fn bytes(&self) -> &[u8] {
        self.bytes
    }
}
