//! Reading the PE headers and section table of an executable.

use std::fmt;

use thiserror::Error;

use crate::image::Image;
use crate::schema::{self, coff, dos, optional, section, signature};

/// Something in the executable is not as the transform requires.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("file of {len} bytes is too short to contain {field} at offset 0x{offset:x}")]
    TooShort { field: &'static str, offset: usize, len: usize },
    #[error("bad DOS magic 0x{0:04x}; expected 0x5a4d")]
    BadMagic(u16),
    #[error("bad PE signature 0x{0:08x} at offset 0x{1:x}")]
    BadSignature(u32, usize),
    #[error("COFF header has no sections")]
    NoSections,
    #[error("unknown optional header magic 0x{0:04x}")]
    BadOptionalMagic(u16),
    #[error("{field} of 0x{value:x} is not a nonzero power of two")]
    BadAlignment { field: &'static str, value: u32 },
    #[error("FileAlignment 0x{file:x} is larger than SectionAlignment 0x{section:x}")]
    AlignmentOrder { file: u32, section: u32 },
    #[error("SizeOfOptionalHeader is {stated} but {dirs} data directories need {expected}")]
    OptionalHeaderSize { stated: u32, dirs: u32, expected: usize },
    #[error("no section named {0}")]
    MissingSection(SectionName),
    #[error("section {first} (index {first_index}) must come before {second} (index {second_index})")]
    SectionOrder {
        first: SectionName,
        first_index: usize,
        second: SectionName,
        second_index: usize,
    },
    #[error("{0} does not fit in its field")]
    Overflow(&'static str),
    #[error("section name {0:?} must be 1 to 8 bytes")]
    BadSectionName(String),
}

/// An 8-byte section name, NUL-padded when shorter. Names are compared
/// byte for byte; there is no case folding and no trimming.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct SectionName([u8; 8]);

impl SectionName {
    pub const DATA: SectionName = SectionName(*b".data\0\0\0");
    pub const LINUX: SectionName = SectionName(*b".linux\0\0");
    pub const INITRD: SectionName = SectionName(*b".initrd\0");

    pub fn new(name: &str) -> Result<Self, FormatError> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > 8 {
            return Err(FormatError::BadSectionName(name.to_owned()));
        }
        let mut raw = [0; 8];
        raw[..bytes.len()].copy_from_slice(bytes);
        Ok(SectionName(raw))
    }

    pub fn from_raw(raw: [u8; 8]) -> Self {
        SectionName(raw)
    }

    pub fn as_raw(&self) -> &[u8; 8] {
        &self.0
    }

    /// The name up to its first NUL.
    pub fn trimmed(&self) -> &[u8] {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(8);
        &self.0[..len]
    }

    /// Returns true if `self` is not `other` but plausibly was meant to be:
    /// the same name in a different case, or `other` followed by more bytes.
    pub fn resembles(&self, other: &SectionName) -> bool {
        if self == other {
            return false;
        }
        let (a, b) = (self.trimmed(), other.trimmed());
        a.eq_ignore_ascii_case(b) || a.starts_with(b)
    }
}

impl fmt::Display for SectionName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for &b in self.trimmed() {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for SectionName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "\"{}\"", self)
    }
}

/// Which optional header layout the image uses.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OptionalKind {
    Pe32,
    Pe32Plus,
}

impl OptionalKind {
    fn from_magic(magic: u16) -> Result<Self, FormatError> {
        match magic {
            schema::PE32_MAGIC => Ok(OptionalKind::Pe32),
            schema::PE32_PLUS_MAGIC => Ok(OptionalKind::Pe32Plus),
            _ => Err(FormatError::BadOptionalMagic(magic)),
        }
    }

    /// Size of the optional header before the data directories.
    pub fn fixed_size(self) -> usize {
        match self {
            OptionalKind::Pe32 => optional::PE32_SIZE,
            OptionalKind::Pe32Plus => optional::PE32_PLUS_SIZE,
        }
    }

    pub fn number_of_rva_and_sizes(self) -> schema::Field {
        match self {
            OptionalKind::Pe32 => optional::PE32_NUMBER_OF_RVA_AND_SIZES,
            OptionalKind::Pe32Plus => optional::PE32_PLUS_NUMBER_OF_RVA_AND_SIZES,
        }
    }
}

/// One entry of the section table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeader {
    /// Position in the section table.
    pub index: usize,
    /// File offset of this entry.
    pub offset: usize,
    pub name: SectionName,
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
}

impl SectionHeader {
    fn read(image: &Image, index: usize, offset: usize) -> Result<Self, FormatError> {
        let mut name = [0; 8];
        name.copy_from_slice(image.bytes(offset, section::NAME)?);
        Ok(SectionHeader {
            index,
            offset,
            name: SectionName(name),
            virtual_size: image.read_field(offset, section::VIRTUAL_SIZE)?,
            virtual_address: image.read_field(offset, section::VIRTUAL_ADDRESS)?,
            size_of_raw_data: image.read_field(offset, section::SIZE_OF_RAW_DATA)?,
            pointer_to_raw_data: image.read_field(offset, section::POINTER_TO_RAW_DATA)?,
        })
    }
}

/// The parts of the PE headers that the layout and patch steps need, with
/// the absolute offsets of the regions that hold them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Headers {
    /// File offset of the PE signature.
    pub pe_offset: usize,
    /// File offset of the COFF file header.
    pub coff_offset: usize,
    /// File offset of the optional header.
    pub optional_offset: usize,
    /// File offset of the first section table entry.
    pub section_table_offset: usize,

    pub machine: u16,
    pub number_of_sections: u16,
    pub number_of_symbols: u32,
    pub optional_kind: OptionalKind,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub size_of_initialized_data: u32,
    pub size_of_image: u32,
    pub number_of_rva_and_sizes: u32,

    /// Section table entries in file order.
    pub sections: Vec<SectionHeader>,
}

impl Headers {
    /// Parses the headers of `image`, checking each structure before any
    /// offset derived from it is used.
    pub fn parse(image: &Image) -> Result<Self, FormatError> {
        let e_magic = image.read_field(0, dos::E_MAGIC)? as u16;
        if e_magic != schema::DOS_MAGIC {
            return Err(FormatError::BadMagic(e_magic));
        }

        let pe_offset = image.read_field(0, dos::E_LFANEW)? as usize;
        let sig = image.read_field(pe_offset, signature::SIGNATURE)?;
        if sig != schema::PE_SIGNATURE {
            return Err(FormatError::BadSignature(sig, pe_offset));
        }

        let coff_offset = pe_offset + signature::SIZE;
        let machine = image.read_field(coff_offset, coff::MACHINE)? as u16;
        let number_of_sections = image.read_field(coff_offset, coff::NUMBER_OF_SECTIONS)? as u16;
        if number_of_sections == 0 {
            return Err(FormatError::NoSections);
        }
        let number_of_symbols = image.read_field(coff_offset, coff::NUMBER_OF_SYMBOLS)?;
        let size_of_optional_header = image.read_field(coff_offset, coff::SIZE_OF_OPTIONAL_HEADER)?;

        let optional_offset = coff_offset + coff::SIZE;
        let optional_kind = OptionalKind::from_magic(image.read_field(optional_offset, optional::MAGIC)? as u16)?;
        let section_alignment = read_alignment(image, optional_offset, optional::SECTION_ALIGNMENT)?;
        let file_alignment = read_alignment(image, optional_offset, optional::FILE_ALIGNMENT)?;
        if file_alignment > section_alignment {
            return Err(FormatError::AlignmentOrder { file: file_alignment, section: section_alignment });
        }
        let size_of_initialized_data = image.read_field(optional_offset, optional::SIZE_OF_INITIALIZED_DATA)?;
        let size_of_image = image.read_field(optional_offset, optional::SIZE_OF_IMAGE)?;
        let number_of_rva_and_sizes = image.read_field(optional_offset, optional_kind.number_of_rva_and_sizes())?;

        let optional_size = (number_of_rva_and_sizes as usize)
            .checked_mul(optional::DATA_DIRECTORY_SIZE)
            .and_then(|dirs| dirs.checked_add(optional_kind.fixed_size()))
            .ok_or(FormatError::Overflow("NumberOfRvaAndSizes"))?;
        if optional_size != size_of_optional_header as usize {
            return Err(FormatError::OptionalHeaderSize {
                stated: size_of_optional_header,
                dirs: number_of_rva_and_sizes,
                expected: optional_size,
            });
        }
        let section_table_offset = optional_offset + optional_size;

        let sections = (0..number_of_sections as usize)
            .map(|i| SectionHeader::read(image, i, section_table_offset + i * section::SIZE))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Headers {
            pe_offset,
            coff_offset,
            optional_offset,
            section_table_offset,
            machine,
            number_of_sections,
            number_of_symbols,
            optional_kind,
            section_alignment,
            file_alignment,
            size_of_initialized_data,
            size_of_image,
            number_of_rva_and_sizes,
            sections,
        })
    }

    /// File offset just past the last section table entry.
    pub fn header_region_size(&self) -> usize {
        self.section_table_offset + self.sections.len() * section::SIZE
    }

    /// Finds the first section named exactly `name`.
    pub fn find_section(&self, name: &SectionName) -> Result<&SectionHeader, FormatError> {
        self.sections.iter()
            .find(|s| &s.name == name)
            .ok_or(FormatError::MissingSection(*name))
    }
}

/// A listing of the header fields and the section table.
impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "PE header at 0x{:x}, machine 0x{:04x}, {:?}", self.pe_offset, self.machine, self.optional_kind)?;
        writeln!(f, "NumberOfSymbols        {}", self.number_of_symbols)?;
        writeln!(f, "SectionAlignment       0x{:x}", self.section_alignment)?;
        writeln!(f, "FileAlignment          0x{:x}", self.file_alignment)?;
        writeln!(f, "SizeOfInitializedData  0x{:x}", self.size_of_initialized_data)?;
        writeln!(f, "SizeOfImage            0x{:x}", self.size_of_image)?;
        writeln!(f, "NumberOfRvaAndSizes    {}", self.number_of_rva_and_sizes)?;
        writeln!(f, "{:>3} {:<8} {:>10} {:>10} {:>10} {:>10}",
            "#", "Name", "VirtAddr", "VirtSize", "RawSize", "RawPtr")?;
        for s in self.sections.iter() {
            writeln!(f, "{:>3} {:<8} 0x{:08x} 0x{:08x} 0x{:08x} 0x{:08x}",
                s.index, s.name.to_string(), s.virtual_address, s.virtual_size,
                s.size_of_raw_data, s.pointer_to_raw_data)?;
        }
        Ok(())
    }
}

fn read_alignment(image: &Image, base: usize, field: schema::Field) -> Result<u32, FormatError> {
    let value = image.read_field(base, field)?;
    if !value.is_power_of_two() {
        return Err(FormatError::BadAlignment { field: field.name, value });
    }
    Ok(value)
}
