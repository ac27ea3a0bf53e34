extern crate stubcompose;

use stubcompose::schema::{coff, optional, section};
use stubcompose::{patch, patch_image, FormatError, Headers, Image, Layout, Payloads, SectionName, Targets};

pub mod common;
use common::{assembled_sample, fetch, payload, Section, StubBuilder, BOGUS_SYMBOLS};

fn entry(headers: &Headers, name: &SectionName) -> usize {
    headers.find_section(name).unwrap().offset
}

#[test]
fn test_zero_symbol_count() {
    for n in 1..=6 {
        let mut builder = StubBuilder::new();
        builder.sections = (0..n)
            .map(|i| Section::new(".text", 0x1000 * (i + 1), 0x100, 0x100))
            .collect();
        let mut image = Image::new(builder.build());
        let headers = Headers::parse(&image).unwrap();
        assert_eq!(headers.number_of_symbols, BOGUS_SYMBOLS);
        let before = image.clone();

        patch::zero_symbol_count(&mut image, &headers).unwrap();
        assert_eq!(Headers::parse(&image).unwrap().number_of_symbols, 0);
        // Nothing but the four bytes of NumberOfSymbols changed.
        let changed: Vec<usize> = (0..image.len())
            .filter(|&i| image.as_bytes()[i] != before.as_bytes()[i])
            .collect();
        assert!(changed.iter().all(|&i| (0x90..0x94).contains(&i)), "{} {:?}", n, changed);
    }
}

#[test]
fn test_apply() {
    let sample = assembled_sample(0x12345, 0x800);
    let mut image = Image::new(sample.clone());
    let layout = patch_image(&mut image, &Targets::default(), &Payloads { kernel: 0x12345, initrd: 0x800 }).unwrap();
    let buf = image.as_bytes();
    assert_eq!(buf.len(), sample.len());

    let headers = Headers::parse(&image).unwrap();
    assert_eq!(headers.number_of_symbols, 0);
    assert_eq!(headers.size_of_initialized_data, 0x12e00);
    assert_eq!(headers.size_of_image, 0x17000);
    assert_eq!(layout.size_of_image, headers.size_of_image);

    let kernel = headers.find_section(&SectionName::LINUX).unwrap();
    assert_eq!((kernel.virtual_address, kernel.virtual_size, kernel.size_of_raw_data), (0x3000, 0x12345, 0x12400));
    let initrd = headers.find_section(&SectionName::INITRD).unwrap();
    assert_eq!((initrd.virtual_address, initrd.virtual_size, initrd.size_of_raw_data), (0x16000, 0x800, 0x800));

    // The stub's own sections and the payload bytes are untouched.
    let original = Headers::parse(&Image::new(sample.clone())).unwrap();
    assert_eq!(headers.sections[..2], original.sections[..2]);
    assert_eq!(kernel.pointer_to_raw_data, original.sections[2].pointer_to_raw_data);
    let start = kernel.pointer_to_raw_data as usize;
    assert_eq!(&buf[start..start + 0x12345], &payload(0x12345, 0x11)[..]);
    assert_eq!(&buf[headers.header_region_size()..], &sample[headers.header_region_size()..]);
}

#[test]
fn test_apply_idempotent() {
    let payloads = Payloads { kernel: 0x4321, initrd: 0x1234 };
    let mut image = Image::new(assembled_sample(0x4321, 0x1234));
    let first = patch_image(&mut image, &Targets::default(), &payloads).unwrap();
    let once = image.clone();
    let second = patch_image(&mut image, &Targets::default(), &payloads).unwrap();
    assert_eq!(first, second);
    assert_eq!(image, once);
}

#[test]
fn test_apply_writes_only_owned_fields() {
    let sample = assembled_sample(0x999, 0x333);
    let mut image = Image::new(sample.clone());
    let headers = Headers::parse(&image).unwrap();
    let layout = Layout::compute(&headers, &Targets::default(), &Payloads { kernel: 0x999, initrd: 0x333 }).unwrap();
    patch::apply(&mut image, &headers, &layout).unwrap();

    let mut owned = Vec::new();
    let mut own = |base: usize, field: stubcompose::schema::Field| owned.extend(base + field.offset..base + field.end());
    own(headers.coff_offset, coff::NUMBER_OF_SYMBOLS);
    own(headers.optional_offset, optional::SIZE_OF_INITIALIZED_DATA);
    own(headers.optional_offset, optional::SIZE_OF_IMAGE);
    for name in &[SectionName::LINUX, SectionName::INITRD] {
        let base = entry(&headers, name);
        own(base, section::VIRTUAL_SIZE);
        own(base, section::VIRTUAL_ADDRESS);
        own(base, section::SIZE_OF_RAW_DATA);
    }
    for (i, (a, b)) in sample.iter().zip(image.as_bytes()).enumerate() {
        if a != b {
            assert!(owned.contains(&i), "byte 0x{:x} changed", i);
        }
    }

    let kernel = entry(&headers, &SectionName::LINUX);
    assert_eq!(fetch(image.as_bytes(), kernel, section::VIRTUAL_ADDRESS), 0x3000);
    assert_eq!(fetch(image.as_bytes(), kernel, section::SIZE_OF_RAW_DATA), 0xa00);
    assert_eq!(fetch(image.as_bytes(), kernel, section::POINTER_TO_RAW_DATA),
        fetch(&sample, kernel, section::POINTER_TO_RAW_DATA));
}

#[test]
fn test_apply_pe32() {
    let mut builder = StubBuilder::new();
    builder.pe32 = true;
    let stub = builder.build();
    let sample = common::append_sections(&stub, &[
        (SectionName::LINUX, &payload(0x2001, 1)[..]),
        (SectionName::INITRD, &payload(0x10, 2)[..]),
    ]);
    let mut image = Image::new(sample);
    patch_image(&mut image, &Targets::default(), &Payloads { kernel: 0x2001, initrd: 0x10 }).unwrap();
    let headers = Headers::parse(&image).unwrap();
    let initrd = headers.find_section(&SectionName::INITRD).unwrap();
    assert_eq!(initrd.virtual_address, 0x3000 + 0x3000);
    assert_eq!(headers.size_of_initialized_data, 0x200 + 0x2200 + 0x200);
}

#[test]
fn test_apply_failure_leaves_image() {
    // Missing initrd: nothing is written, not even NumberOfSymbols.
    let stub = StubBuilder::new().build();
    let sample = common::append_sections(&stub, &[(SectionName::LINUX, &payload(0x10, 1)[..])]);
    let mut image = Image::new(sample.clone());
    match patch_image(&mut image, &Targets::default(), &Payloads { kernel: 0x10, initrd: 0x10 }) {
        Err(FormatError::MissingSection(name)) if name == SectionName::INITRD => (),
        x => panic!("{:?}", x),
    }
    assert_eq!(image.as_bytes(), &sample[..]);
}
