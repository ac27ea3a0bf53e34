//! The whole transform: fix the stub, have the assembler append the
//! payloads, repair the result, and replace the output file.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::assembler::Assembler;
use crate::image::Image;
use crate::layout::{Layout, Payloads, Targets};
use crate::pe::Headers;
use crate::{patch, Error};

/// A step of the transform, for error messages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Stage {
    ReadPayload,
    ReadStub,
    FixStub,
    Assemble,
    ReadAssembled,
    Patch,
    Persist,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Stage::ReadPayload => "reading payload",
            Stage::ReadStub => "reading stub",
            Stage::FixStub => "fixing stub",
            Stage::Assemble => "appending sections",
            Stage::ReadAssembled => "reading assembled image",
            Stage::Patch => "patching headers",
            Stage::Persist => "writing output",
        })
    }
}

/// An `Error` annotated with the `Stage` it happened in and the file
/// involved.
#[derive(Debug)]
pub struct StageError {
    pub stage: Stage,
    pub path: Option<PathBuf>,
    pub err: Error,
}

impl StageError {
    fn new<P: AsRef<Path>, E: Into<Error>>(stage: Stage, path: P, err: E) -> Self {
        let path = path.as_ref().to_owned();
        StageError { stage, path: Some(path), err: err.into() }
    }

    fn without_path<E: Into<Error>>(stage: Stage, err: E) -> Self {
        StageError { stage, path: None, err: err.into() }
    }

    /// The exit status the process should report for this error: the
    /// assembler's own exit code when that is what failed, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match &self.err {
            Error::Assembler(err) => err.exit_code().filter(|&code| code != 0).unwrap_or(1),
            _ => 1,
        }
    }
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.err)
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StageError { stage, path: None, err } => write!(f, "{}: {}", stage, err),
            StageError { stage, path: Some(path), err } => write!(f, "{}: {}: {}", stage, path.display(), err),
        }
    }
}

/// The input files of a composition.
#[derive(Debug, Copy, Clone)]
pub struct Inputs<'a> {
    pub stub: &'a Path,
    pub kernel: &'a Path,
    pub initrd: &'a Path,
}

impl<'a> Inputs<'a> {
    /// The true lengths of the kernel and initrd files.
    fn payloads(&self) -> Result<Payloads, StageError> {
        let len = |path: &Path| fs::metadata(path)
            .map(|m| m.len())
            .map_err(|err| StageError::new(Stage::ReadPayload, path, err));
        let kernel = len(self.kernel)?;
        let initrd = len(self.initrd)?;
        Payloads::from_lengths(kernel, initrd)
            .map_err(|err| StageError::without_path(Stage::ReadPayload, err))
    }
}

/// Builds `output` from the stub, kernel, and initrd named in `inputs`,
/// using `assembler` to append the payload sections.
///
/// Intermediate files live in a temporary directory that is removed on
/// every exit path. `output` is replaced only after every field has been
/// computed and written; on error it is left as it was.
pub fn compose<A: Assembler + ?Sized>(
    assembler: &A, inputs: &Inputs, targets: &Targets, output: &Path,
) -> Result<Layout, StageError> {
    let payloads = inputs.payloads()?;

    let mut stub = Image::open(inputs.stub)
        .map_err(|err| StageError::new(Stage::ReadStub, inputs.stub, err))?;
    let headers = Headers::parse(&stub)
        .map_err(|err| StageError::new(Stage::ReadStub, inputs.stub, err))?;
    patch::zero_symbol_count(&mut stub, &headers)
        .map_err(|err| StageError::new(Stage::FixStub, inputs.stub, err))?;

    let scratch = tempfile::Builder::new()
        .prefix("stubcompose")
        .tempdir()
        .map_err(|err| StageError::without_path(Stage::FixStub, err))?;
    let fixed_stub = scratch.path().join("stub.efi");
    fs::write(&fixed_stub, stub.as_bytes())
        .map_err(|err| StageError::new(Stage::FixStub, &fixed_stub, err))?;

    let assembled = scratch.path().join("assembled.efi");
    assembler.assemble(&fixed_stub, &[(targets.kernel, inputs.kernel), (targets.initrd, inputs.initrd)], &assembled)
        .map_err(|err| StageError::new(Stage::Assemble, inputs.stub, err))?;

    let mut image = Image::open(&assembled)
        .map_err(|err| StageError::new(Stage::ReadAssembled, &assembled, err))?;
    let layout = crate::patch_image(&mut image, targets, &payloads)
        .map_err(|err| StageError::new(Stage::Patch, &assembled, err))?;

    image.persist(output)
        .map_err(|err| StageError::new(Stage::Persist, output, err))?;
    Ok(layout)
}

/// Repairs an image whose payload sections were already appended. Here
/// `inputs.stub` names that assembled image; the kernel and initrd files
/// are only used for their lengths. The result is written to `output`,
/// which may be the same file as `inputs.stub`.
pub fn patch_file(inputs: &Inputs, targets: &Targets, output: &Path) -> Result<Layout, StageError> {
    let payloads = inputs.payloads()?;
    let mut image = Image::open(inputs.stub)
        .map_err(|err| StageError::new(Stage::ReadStub, inputs.stub, err))?;
    let layout = crate::patch_image(&mut image, targets, &payloads)
        .map_err(|err| StageError::new(Stage::Patch, inputs.stub, err))?;
    image.persist(output)
        .map_err(|err| StageError::new(Stage::Persist, output, err))?;
    Ok(layout)
}

/// Reads the headers of `path` for listing.
pub fn describe(path: &Path) -> Result<Headers, StageError> {
    let image = Image::open(path)
        .map_err(|err| StageError::new(Stage::ReadStub, path, err))?;
    Headers::parse(&image)
        .map_err(|err| StageError::new(Stage::ReadStub, path, err))
}
