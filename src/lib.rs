//! Combines a UEFI boot stub, a Linux kernel, and an initrd into one
//! bootable PE/COFF executable.
//!
//! The kernel and initrd are appended to the stub as the sections `.linux`
//! and `.initrd` by an external tool (objcopy). That tool gives the new
//! sections addresses and sizes the firmware loader will not accept, so
//! afterwards this crate recomputes them from the stub's `.data` section and
//! the image alignments and writes them back into the headers.
//!
//! # Layout
//!
//! Each payload section gets a `VirtualAddress` on the next
//! `SectionAlignment` boundary after the section before it, starting from
//! the end of `.data`, a `VirtualSize` equal to the payload length, and a
//! `SizeOfRawData` equal to the payload length rounded up to
//! `FileAlignment`. `SizeOfInitializedData` and `SizeOfImage` in the
//! optional header are recomputed to match. See the `layout` module.
//!
//! # Patching
//!
//! The `patch` module writes the computed values into an in-memory `Image`.
//! It also zeroes the COFF `NumberOfSymbols`, which some toolchains leave
//! with a nonzero placeholder.
//!
//! # Composition
//!
//! The `compose` module runs the whole sequence against files, with the
//! section-appending tool behind the `assembler::Assembler` trait. The
//! output file is replaced in one rename once everything has succeeded.

use std::io;

use thiserror::Error;

pub mod assembler;
pub mod compose;
pub mod image;
pub mod layout;
pub mod patch;
pub mod pe;
pub mod schema;

pub use assembler::{Assembler, AssemblerError, Objcopy};
pub use compose::{compose, patch_file, Inputs, Stage, StageError};
pub use image::Image;
pub use layout::{Layout, Payloads, Targets};
pub use pe::{FormatError, Headers, SectionName};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Assembler(#[from] AssemblerError),
}

/// Parses the headers of an image whose payload sections have been appended,
/// computes the layout for payloads of the given lengths, and writes it into
/// the image. Also zeroes `NumberOfSymbols`.
///
/// Running this again on its own output with the same `payloads` changes
/// nothing.
pub fn patch_image(image: &mut Image, targets: &Targets, payloads: &Payloads) -> Result<Layout, FormatError> {
    let headers = Headers::parse(image)?;
    let layout = Layout::compute(&headers, targets, payloads)?;
    patch::apply(image, &headers, &layout)?;
    Ok(layout)
}
