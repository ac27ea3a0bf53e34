//! Writing computed values back into the headers.
//!
//! The patcher only overwrites header fields in place. It never changes the
//! length of the image or touches section contents.

use log::{debug, warn};

use crate::image::Image;
use crate::layout::{Layout, Placement};
use crate::pe::{FormatError, Headers};
use crate::schema::{coff, optional, section, Field};

/// Sets the COFF `NumberOfSymbols` to zero. Some toolchains leave a nonzero
/// placeholder there, which firmware validators reject for images without a
/// symbol table.
pub fn zero_symbol_count(image: &mut Image, headers: &Headers) -> Result<(), FormatError> {
    if headers.number_of_symbols != 0 {
        debug!("NumberOfSymbols: {} -> 0", headers.number_of_symbols);
    }
    image.write_field(headers.coff_offset, coff::NUMBER_OF_SYMBOLS, 0)
}

/// Writes `layout` into the section table and optional header of `image`,
/// and zeroes `NumberOfSymbols`.
///
/// Every target offset is checked before the first write, so on error the
/// image is left unmodified.
pub fn apply(image: &mut Image, headers: &Headers, layout: &Layout) -> Result<(), FormatError> {
    let writes = planned_writes(headers, layout);
    for &(base, field, _) in writes.iter() {
        image.bytes(base, field)?;
    }

    for placement in &[&layout.kernel, &layout.initrd] {
        check_raw_extent(image, placement);
    }

    for (base, field, value) in writes {
        image.write_field(base, field, value)?;
    }
    Ok(())
}

fn planned_writes(headers: &Headers, layout: &Layout) -> Vec<(usize, Field, u32)> {
    let mut writes = vec![(headers.coff_offset, coff::NUMBER_OF_SYMBOLS, 0)];
    for placement in &[&layout.kernel, &layout.initrd] {
        writes.push((placement.offset, section::VIRTUAL_SIZE, placement.virtual_size));
        writes.push((placement.offset, section::VIRTUAL_ADDRESS, placement.virtual_address));
        writes.push((placement.offset, section::SIZE_OF_RAW_DATA, placement.size_of_raw_data));
    }
    writes.push((headers.optional_offset, optional::SIZE_OF_INITIALIZED_DATA, layout.size_of_initialized_data));
    writes.push((headers.optional_offset, optional::SIZE_OF_IMAGE, layout.size_of_image));
    writes
}

/// Warns if the padded section would extend past the end of the file. The
/// padding bytes are supposed to be present already.
fn check_raw_extent(image: &Image, placement: &Placement) {
    let end = placement.pointer_to_raw_data as u64 + placement.size_of_raw_data as u64;
    if end > image.len() as u64 {
        warn!("section {} raw data ends at 0x{:x}, past the end of the {}-byte file",
            placement.name, end, image.len());
    }
}
