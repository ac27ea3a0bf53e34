#![allow(dead_code)]

use std::fs;
use std::io;
use std::path::Path;

use stubcompose::schema::{self, coff, dos, optional, section, signature, Field};
use stubcompose::{Assembler, AssemblerError, Headers, Image, SectionName};

pub const PE_OFFSET: usize = 0x80;
pub const NUM_DIRS: usize = 16;
/// Unused section table entries left in the header for appended sections.
pub const SPARE_ENTRIES: usize = 4;
/// The placeholder symbol count some toolchains leave in the COFF header.
pub const BOGUS_SYMBOLS: u32 = 0x0bad;

pub fn round_up(n: usize, m: usize) -> usize {
    (n + m - 1) / m * m
}

pub fn store(buf: &mut [u8], base: usize, field: Field, v: u32) {
    let i = base + field.offset;
    match field.width {
        2 => buf[i..i+2].copy_from_slice(&(v as u16).to_le_bytes()),
        4 => buf[i..i+4].copy_from_slice(&v.to_le_bytes()),
        _ => panic!("{}", field),
    }
}

pub fn fetch(buf: &[u8], base: usize, field: Field) -> u32 {
    Image::new(buf.to_vec()).read_field(base, field).unwrap()
}

#[derive(Debug, Clone)]
pub struct Section {
    pub name: &'static str,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub raw_len: u32,
}

impl Section {
    pub fn new(name: &'static str, virtual_address: u32, virtual_size: u32, raw_len: u32) -> Self {
        Section { name, virtual_address, virtual_size, raw_len }
    }
}

/// Builds small synthetic EFI stubs.
#[derive(Debug, Clone)]
pub struct StubBuilder {
    pub pe32: bool,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub number_of_symbols: u32,
    pub sections: Vec<Section>,
}

impl StubBuilder {
    /// A PE32+ stub with `.text` at 0x1000 and `.data` at 0x2000.
    pub fn new() -> Self {
        StubBuilder {
            pe32: false,
            section_alignment: 0x1000,
            file_alignment: 0x200,
            number_of_symbols: BOGUS_SYMBOLS,
            sections: vec![
                Section::new(".text", 0x1000, 0x800, 0x800),
                Section::new(".data", 0x2000, 0x50, 0x50),
            ],
        }
    }

    pub fn optional_size(&self) -> usize {
        let fixed = if self.pe32 { optional::PE32_SIZE } else { optional::PE32_PLUS_SIZE };
        fixed + NUM_DIRS * optional::DATA_DIRECTORY_SIZE
    }

    pub fn coff_offset(&self) -> usize {
        PE_OFFSET + signature::SIZE
    }

    pub fn optional_offset(&self) -> usize {
        self.coff_offset() + coff::SIZE
    }

    pub fn section_table_offset(&self) -> usize {
        self.optional_offset() + self.optional_size()
    }

    pub fn build(&self) -> Vec<u8> {
        let fa = self.file_alignment as usize;
        let table = self.section_table_offset();
        let size_of_headers = round_up(table + section::SIZE * (self.sections.len() + SPARE_ENTRIES), fa);
        let mut buf = vec![0; size_of_headers];

        store(&mut buf, 0, dos::E_MAGIC, schema::DOS_MAGIC as u32);
        store(&mut buf, 0, dos::E_LFANEW, PE_OFFSET as u32);
        store(&mut buf, PE_OFFSET, signature::SIGNATURE, schema::PE_SIGNATURE);

        let coff_offset = self.coff_offset();
        store(&mut buf, coff_offset, coff::MACHINE, 0xaa64);
        store(&mut buf, coff_offset, coff::NUMBER_OF_SECTIONS, self.sections.len() as u32);
        store(&mut buf, coff_offset, coff::NUMBER_OF_SYMBOLS, self.number_of_symbols);
        store(&mut buf, coff_offset, coff::SIZE_OF_OPTIONAL_HEADER, self.optional_size() as u32);

        let opt = self.optional_offset();
        if self.pe32 {
            store(&mut buf, opt, optional::MAGIC, schema::PE32_MAGIC as u32);
            store(&mut buf, opt, optional::PE32_NUMBER_OF_RVA_AND_SIZES, NUM_DIRS as u32);
        } else {
            store(&mut buf, opt, optional::MAGIC, schema::PE32_PLUS_MAGIC as u32);
            store(&mut buf, opt, optional::PE32_PLUS_NUMBER_OF_RVA_AND_SIZES, NUM_DIRS as u32);
        }
        store(&mut buf, opt, optional::SECTION_ALIGNMENT, self.section_alignment);
        store(&mut buf, opt, optional::FILE_ALIGNMENT, self.file_alignment);

        let mut body = Vec::new();
        let mut initialized = 0u32;
        let mut image_end = 0u32;
        for (i, s) in self.sections.iter().enumerate() {
            let entry = table + i * section::SIZE;
            let raw_size = round_up(s.raw_len as usize, fa);
            buf[entry..entry+8].copy_from_slice(SectionName::new(s.name).unwrap().as_raw());
            store(&mut buf, entry, section::VIRTUAL_SIZE, s.virtual_size);
            store(&mut buf, entry, section::VIRTUAL_ADDRESS, s.virtual_address);
            store(&mut buf, entry, section::SIZE_OF_RAW_DATA, raw_size as u32);
            store(&mut buf, entry, section::POINTER_TO_RAW_DATA, (size_of_headers + body.len()) as u32);
            body.extend((0..raw_size).map(|j| if j < s.raw_len as usize { (i + 1) as u8 } else { 0 }));
            initialized += raw_size as u32;
            image_end = image_end.max(s.virtual_address + s.virtual_size);
        }
        store(&mut buf, opt, optional::SIZE_OF_INITIALIZED_DATA, initialized);
        store(&mut buf, opt, optional::SIZE_OF_IMAGE,
            round_up(image_end as usize, self.section_alignment as usize) as u32);

        buf.extend(body);
        buf
    }
}

/// Appends each payload to `stub` as a new section the way a plain object
/// copy does: raw data at the end of the file, padded to `FileAlignment`,
/// with a zero `VirtualAddress` and an unpadded `SizeOfRawData`.
pub fn append_sections(stub: &[u8], sections: &[(SectionName, &[u8])]) -> Vec<u8> {
    let headers = Headers::parse(&Image::new(stub.to_vec())).unwrap();
    let fa = headers.file_alignment as usize;
    let mut buf = stub.to_vec();
    let mut n = headers.sections.len();
    for (name, payload) in sections {
        let pointer = buf.len();
        buf.extend_from_slice(payload);
        buf.resize(round_up(buf.len(), fa), 0);
        let entry = headers.section_table_offset + n * section::SIZE;
        buf[entry..entry+8].copy_from_slice(name.as_raw());
        store(&mut buf, entry, section::VIRTUAL_SIZE, payload.len() as u32);
        store(&mut buf, entry, section::VIRTUAL_ADDRESS, 0);
        store(&mut buf, entry, section::SIZE_OF_RAW_DATA, payload.len() as u32);
        store(&mut buf, entry, section::POINTER_TO_RAW_DATA, pointer as u32);
        n += 1;
    }
    store(&mut buf, headers.coff_offset, coff::NUMBER_OF_SECTIONS, n as u32);
    buf
}

/// Generates a payload of `len` bytes with a recognizable pattern.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Builds the default stub with `.linux` and `.initrd` appended.
pub fn assembled_sample(kernel_len: usize, initrd_len: usize) -> Vec<u8> {
    let stub = StubBuilder::new().build();
    append_sections(&stub, &[
        (SectionName::LINUX, &payload(kernel_len, 0x11)[..]),
        (SectionName::INITRD, &payload(initrd_len, 0x22)[..]),
    ])
}

/// An in-process `Assembler` that uses `append_sections`.
pub struct AppendSections;

impl Assembler for AppendSections {
    fn assemble(&self, stub: &Path, sections: &[(SectionName, &Path)], output: &Path) -> Result<(), AssemblerError> {
        let spawn_err = |source: io::Error| AssemblerError::Spawn { program: "append-sections".to_owned(), source };
        let stub = fs::read(stub).map_err(spawn_err)?;
        let mut payloads = Vec::new();
        for (name, path) in sections {
            payloads.push((*name, fs::read(path).map_err(spawn_err)?));
        }
        let payloads: Vec<(SectionName, &[u8])> = payloads.iter()
            .map(|(name, data)| (*name, data.as_slice()))
            .collect();
        fs::write(output, append_sections(&stub, &payloads)).map_err(spawn_err)
    }
}

/// Writes an executable shell script into `dir` that exits with `code`, for
/// use as a failing objcopy.
#[cfg(unix)]
pub fn exit_script(dir: &Path, code: i32) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(format!("exit-{}", code));
    fs::write(&path, format!("#!/bin/sh\nexit {}\n", code)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}
