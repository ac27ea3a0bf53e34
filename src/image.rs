//! An executable held in memory as one byte buffer.
//!
//! All header reads and writes go through `read_field` and `write_field`,
//! which check bounds against the buffer and use the fixed little-endian
//! encoding of the format. Nothing here ever grows, shrinks, or moves bytes;
//! the buffer keeps the length it was loaded with.

use std::convert::TryInto;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use crate::pe::FormatError;
use crate::schema::Field;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    data: Vec<u8>,
}

impl Image {
    pub fn new(data: Vec<u8>) -> Self {
        Image { data }
    }

    /// Reads the whole file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        fs::read(path).map(Image::new)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Returns the bytes of `field` in the region starting at `base`.
    pub fn bytes(&self, base: usize, field: Field) -> Result<&[u8], FormatError> {
        let range = self.range(base, field)?;
        Ok(&self.data[range])
    }

    /// Reads the integer `field` in the region starting at `base`.
    pub fn read_field(&self, base: usize, field: Field) -> Result<u32, FormatError> {
        let buf = self.bytes(base, field)?;
        Ok(match field.width {
            2 => u16::from_le_bytes([buf[0], buf[1]]) as u32,
            4 => u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            width => panic!("{} has unsupported integer width {}", field, width),
        })
    }

    /// Stores `value` into the integer `field` in the region starting at
    /// `base`. Fails without modifying the buffer if the field lies outside
    /// the buffer or `value` does not fit in the field.
    pub fn write_field(&mut self, base: usize, field: Field, value: u32) -> Result<(), FormatError> {
        let range = self.range(base, field)?;
        match field.width {
            2 => {
                let v: u16 = value.try_into()
                    .or(Err(FormatError::Overflow(field.name)))?;
                self.data[range].copy_from_slice(&v.to_le_bytes());
            }
            4 => self.data[range].copy_from_slice(&value.to_le_bytes()),
            width => panic!("{} has unsupported integer width {}", field, width),
        }
        Ok(())
    }

    fn range(&self, base: usize, field: Field) -> Result<std::ops::Range<usize>, FormatError> {
        let too_short = || FormatError::TooShort {
            field: field.name,
            offset: base.saturating_add(field.offset),
            len: self.data.len(),
        };
        let start = field.at(base).ok_or_else(too_short)?;
        let end = start.checked_add(field.width).ok_or_else(too_short)?;
        if end > self.data.len() {
            return Err(too_short());
        }
        Ok(start..end)
    }

    /// Writes the buffer to a new temporary file in `dir`. The file is
    /// deleted when the returned handle is dropped, unless it is persisted.
    pub fn write_temp_in<P: AsRef<Path>>(&self, dir: P) -> io::Result<tempfile::NamedTempFile> {
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(&self.data)?;
        file.flush()?;
        Ok(file)
    }

    /// Replaces the file at `path` with the contents of the buffer. The data
    /// is first written to a temporary file in the same directory and then
    /// renamed over `path`, so `path` either keeps its old contents or gets
    /// the complete new contents.
    pub fn persist<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();
        let file = self.write_temp_in(parent_dir(path))?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|err| err.error)?;
        Ok(())
    }
}

/// The directory containing `path`, for placing temporary files next to it.
pub fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
