//! Computing where the kernel and initrd sections go.
//!
//! The object-copy step that appends the payload sections leaves their
//! addresses and sizes wrong. Starting from the `.data` section, each
//! payload is placed at the next `SectionAlignment` boundary, and its
//! on-disk size is rounded up to `FileAlignment`. The aggregate
//! `SizeOfInitializedData` and `SizeOfImage` follow from those placements.

use std::convert::TryFrom;

use log::{debug, warn};

use crate::pe::{FormatError, Headers, SectionHeader, SectionName};

/// Rounds `n` up to the next multiple of `m`. Returns `None` on overflow or
/// if `m` is zero.
pub fn round_up(n: u32, m: u32) -> Option<u32> {
    n.checked_rem(m).and_then(|r| n.checked_add((m - r) % m))
}

/// The names of the sections the layout is computed from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Targets {
    pub data: SectionName,
    pub kernel: SectionName,
    pub initrd: SectionName,
}

impl Default for Targets {
    fn default() -> Self {
        Targets {
            data: SectionName::DATA,
            kernel: SectionName::LINUX,
            initrd: SectionName::INITRD,
        }
    }
}

impl Targets {
    fn all(&self) -> [&SectionName; 3] {
        [&self.data, &self.kernel, &self.initrd]
    }
}

/// The true (unpadded) lengths of the kernel and initrd payloads.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Payloads {
    pub kernel: u32,
    pub initrd: u32,
}

impl Payloads {
    /// Converts file lengths, failing if either does not fit a 32-bit size.
    pub fn from_lengths(kernel: u64, initrd: u64) -> Result<Self, FormatError> {
        Ok(Payloads {
            kernel: u32::try_from(kernel).or(Err(FormatError::Overflow("kernel length")))?,
            initrd: u32::try_from(initrd).or(Err(FormatError::Overflow("initrd length")))?,
        })
    }
}

/// Computed header values for one appended section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Position in the section table.
    pub index: usize,
    /// File offset of the section table entry.
    pub offset: usize,
    pub name: SectionName,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub size_of_raw_data: u32,
    /// Not changed by the layout; kept to check the raw extent.
    pub pointer_to_raw_data: u32,
}

/// Everything the patcher writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub kernel: Placement,
    pub initrd: Placement,
    pub size_of_initialized_data: u32,
    pub size_of_image: u32,
}

impl Layout {
    /// Computes the layout of the kernel and initrd sections named in
    /// `targets`, given their true lengths.
    ///
    /// Fails if any of the three target sections is missing, if they are not
    /// in the order data, kernel, initrd, if an alignment is not a power of
    /// two, or if any value overflows 32 bits.
    pub fn compute(headers: &Headers, targets: &Targets, payloads: &Payloads) -> Result<Self, FormatError> {
        for &(field, value) in &[("SectionAlignment", headers.section_alignment),
                                 ("FileAlignment", headers.file_alignment)] {
            if !value.is_power_of_two() {
                return Err(FormatError::BadAlignment { field, value });
            }
        }
        let first = headers.sections.first().ok_or(FormatError::NoSections)?;
        let data = headers.find_section(&targets.data)?;
        let kernel = headers.find_section(&targets.kernel)?;
        let initrd = headers.find_section(&targets.initrd)?;
        check_order(data, kernel)?;
        check_order(kernel, initrd)?;
        report_untouched(headers, targets);

        let section_alignment = headers.section_alignment;
        let file_alignment = headers.file_alignment;

        let mut next_virtual_address = round_up(data.virtual_size, section_alignment)
            .and_then(|size| data.virtual_address.checked_add(size))
            .ok_or(FormatError::Overflow("end of data section"))?;
        let mut disk_data_total = data.size_of_raw_data;
        debug!("{}: VirtualAddress 0x{:x}, VirtualSize 0x{:x}, SizeOfRawData 0x{:x}",
            data.name, data.virtual_address, data.virtual_size, data.size_of_raw_data);

        let mut place = |section: &SectionHeader, len: u32| -> Result<Placement, FormatError> {
            let size_of_raw_data = round_up(len, file_alignment)
                .ok_or(FormatError::Overflow("SizeOfRawData"))?;
            let virtual_extent = round_up(len, section_alignment)
                .ok_or(FormatError::Overflow("VirtualSize"))?;
            let placement = Placement {
                index: section.index,
                offset: section.offset,
                name: section.name,
                virtual_address: next_virtual_address,
                virtual_size: len,
                size_of_raw_data,
                pointer_to_raw_data: section.pointer_to_raw_data,
            };
            disk_data_total = disk_data_total.checked_add(size_of_raw_data)
                .ok_or(FormatError::Overflow("SizeOfInitializedData"))?;
            next_virtual_address = next_virtual_address.checked_add(virtual_extent)
                .ok_or(FormatError::Overflow("VirtualAddress"))?;
            debug!("{}: VirtualAddress 0x{:x}, VirtualSize 0x{:x}, SizeOfRawData 0x{:x}",
                placement.name, placement.virtual_address, placement.virtual_size, placement.size_of_raw_data);
            Ok(placement)
        };
        let kernel = place(kernel, payloads.kernel)?;
        let initrd = place(initrd, payloads.initrd)?;

        let header_region_size = u32::try_from(headers.header_region_size())
            .or(Err(FormatError::Overflow("header region size")))?;
        let size_of_image = next_virtual_address.checked_sub(first.virtual_address)
            .and_then(|span| span.checked_add(header_region_size))
            .and_then(|size| round_up(size, section_alignment))
            .ok_or(FormatError::Overflow("SizeOfImage"))?;
        debug!("SizeOfInitializedData 0x{:x}, SizeOfImage 0x{:x}", disk_data_total, size_of_image);

        Ok(Layout {
            kernel,
            initrd,
            size_of_initialized_data: disk_data_total,
            size_of_image,
        })
    }
}

fn check_order(first: &SectionHeader, second: &SectionHeader) -> Result<(), FormatError> {
    if first.index < second.index {
        Ok(())
    } else {
        Err(FormatError::SectionOrder {
            first: first.name,
            first_index: first.index,
            second: second.name,
            second_index: second.index,
        })
    }
}

/// Logs the sections the layout leaves alone, warning about names that look
/// like a misspelled target and about repeated target names.
fn report_untouched(headers: &Headers, targets: &Targets) {
    for section in headers.sections.iter() {
        if targets.all().iter().any(|&name| *name == section.name) {
            if let Ok(used) = headers.find_section(&section.name) {
                if used.index != section.index {
                    warn!("duplicate section {} at index {}; using index {} and leaving it untouched",
                        section.name, section.index, used.index);
                }
            }
            continue;
        }
        match targets.all().iter().find(|&&name| section.name.resembles(name)) {
            Some(target) => warn!("section {} at index {} is not {}; leaving it untouched",
                section.name, section.index, target),
            None => debug!("{}: untouched", section.name),
        }
    }
}

#[test]
fn test_round_up() {
    assert_eq!(round_up(0, 0x200), Some(0));
    assert_eq!(round_up(1, 0x200), Some(0x200));
    assert_eq!(round_up(0x200, 0x200), Some(0x200));
    assert_eq!(round_up(0x12345, 0x200), Some(0x12400));
    assert_eq!(round_up(0x12345, 0x1000), Some(0x13000));
    assert_eq!(round_up(0xffff_f000, 0x1000), Some(0xffff_f000));
    assert_eq!(round_up(0xffff_f001, 0x1000), None);
    assert_eq!(round_up(5, 0), None);
}

#[test]
fn test_payloads_from_lengths() {
    assert_eq!(Payloads::from_lengths(1, 0xffff_ffff).unwrap(), Payloads { kernel: 1, initrd: 0xffff_ffff });
    match Payloads::from_lengths(0x1_0000_0000, 0) {
        Err(FormatError::Overflow("kernel length")) => (),
        x => panic!("{:?}", x),
    }
}
