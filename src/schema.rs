//! Fixed byte layout of the PE/COFF structures this crate reads and writes.
//!
//! Every field the transform touches is described here once, as an offset
//! and width relative to the start of the region that contains it. The rest
//! of the crate refers to fields only through these tables, so reads and
//! writes within one run always agree on where a field lives.
//!
//! References:
//! * <https://learn.microsoft.com/en-us/windows/win32/debug/pe-format>

use std::fmt;

/// A little-endian integer field at a fixed offset from a region base.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub offset: usize,
    pub width: usize,
}

impl Field {
    const fn new(name: &'static str, offset: usize, width: usize) -> Self {
        Field { name, offset, width }
    }

    /// Absolute offset of this field when its region starts at `base`.
    pub fn at(&self, base: usize) -> Option<usize> {
        base.checked_add(self.offset)
    }

    /// Offset of the first byte past this field, relative to its region.
    pub fn end(&self) -> usize {
        self.offset + self.width
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name)
    }
}

pub const DOS_MAGIC: u16 = 0x5a4d; // "MZ"
pub const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
pub const PE32_MAGIC: u16 = 0x10b;
pub const PE32_PLUS_MAGIC: u16 = 0x20b;

/// Fields of the DOS header. Offsets are from the start of the file.
pub mod dos {
    use super::Field;

    pub const E_MAGIC: Field = Field::new("e_magic", 0x00, 2);
    /// File offset of the PE signature.
    pub const E_LFANEW: Field = Field::new("e_lfanew", 0x3c, 4);
}

/// The 4-byte signature preceding the COFF file header.
pub mod signature {
    use super::Field;

    pub const SIGNATURE: Field = Field::new("Signature", 0, 4);
    pub const SIZE: usize = 4;
}

/// Fields of the COFF file header. Offsets are from the end of the signature.
pub mod coff {
    use super::Field;

    pub const MACHINE: Field = Field::new("Machine", 0, 2);
    pub const NUMBER_OF_SECTIONS: Field = Field::new("NumberOfSections", 2, 2);
    pub const NUMBER_OF_SYMBOLS: Field = Field::new("NumberOfSymbols", 12, 4);
    pub const SIZE_OF_OPTIONAL_HEADER: Field = Field::new("SizeOfOptionalHeader", 16, 2);
    pub const SIZE: usize = 20;
}

/// Fields of the optional header. Offsets are from the start of the optional
/// header. The fields up to `SizeOfImage` sit at the same offsets in PE32 and
/// PE32+; only the position of `NumberOfRvaAndSizes` differs.
pub mod optional {
    use super::Field;

    pub const MAGIC: Field = Field::new("Magic", 0, 2);
    pub const SIZE_OF_INITIALIZED_DATA: Field = Field::new("SizeOfInitializedData", 8, 4);
    pub const SECTION_ALIGNMENT: Field = Field::new("SectionAlignment", 32, 4);
    pub const FILE_ALIGNMENT: Field = Field::new("FileAlignment", 36, 4);
    pub const SIZE_OF_IMAGE: Field = Field::new("SizeOfImage", 56, 4);

    pub const PE32_NUMBER_OF_RVA_AND_SIZES: Field = Field::new("NumberOfRvaAndSizes", 92, 4);
    pub const PE32_SIZE: usize = 96;

    pub const PE32_PLUS_NUMBER_OF_RVA_AND_SIZES: Field = Field::new("NumberOfRvaAndSizes", 108, 4);
    pub const PE32_PLUS_SIZE: usize = 112;

    /// Size of one data directory entry following the fixed optional header.
    pub const DATA_DIRECTORY_SIZE: usize = 8;
}

/// Fields of one section table entry. Offsets are from the start of the entry.
pub mod section {
    use super::Field;

    pub const NAME: Field = Field::new("Name", 0, 8);
    pub const VIRTUAL_SIZE: Field = Field::new("VirtualSize", 8, 4);
    pub const VIRTUAL_ADDRESS: Field = Field::new("VirtualAddress", 12, 4);
    pub const SIZE_OF_RAW_DATA: Field = Field::new("SizeOfRawData", 16, 4);
    pub const POINTER_TO_RAW_DATA: Field = Field::new("PointerToRawData", 20, 4);
    pub const SIZE: usize = 40;
}

#[test]
fn test_regions_contain_their_fields() {
    assert!(signature::SIGNATURE.end() <= signature::SIZE);
    for field in &[coff::MACHINE, coff::NUMBER_OF_SECTIONS, coff::NUMBER_OF_SYMBOLS, coff::SIZE_OF_OPTIONAL_HEADER] {
        assert!(field.end() <= coff::SIZE, "{}", field);
    }
    for field in &[optional::MAGIC, optional::SIZE_OF_INITIALIZED_DATA, optional::SECTION_ALIGNMENT,
                   optional::FILE_ALIGNMENT, optional::SIZE_OF_IMAGE,
                   optional::PE32_NUMBER_OF_RVA_AND_SIZES] {
        assert!(field.end() <= optional::PE32_SIZE, "{}", field);
    }
    assert_eq!(optional::PE32_PLUS_NUMBER_OF_RVA_AND_SIZES.end(), optional::PE32_PLUS_SIZE);
    assert_eq!(optional::PE32_NUMBER_OF_RVA_AND_SIZES.end(), optional::PE32_SIZE);
    for field in &[section::NAME, section::VIRTUAL_SIZE, section::VIRTUAL_ADDRESS,
                   section::SIZE_OF_RAW_DATA, section::POINTER_TO_RAW_DATA] {
        assert!(field.end() <= section::SIZE, "{}", field);
    }
}

#[test]
fn test_field_at() {
    assert_eq!(coff::NUMBER_OF_SYMBOLS.at(0x84), Some(0x90));
    assert_eq!(section::NAME.at(usize::MAX), Some(usize::MAX));
    assert_eq!(section::VIRTUAL_SIZE.at(usize::MAX), None);
}
