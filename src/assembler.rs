//! Appending payload files to the stub as new sections.
//!
//! This step is done by an external tool. The `Assembler` trait is the only
//! thing the rest of the crate knows about it, so the tool can be replaced
//! without touching the layout or patch code.

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};

use log::debug;
use thiserror::Error;

use crate::pe::SectionName;

/// The environment variable naming the objcopy program to run.
pub const OBJCOPY_ENV: &str = "OBJCOPY";

#[derive(Debug, Error)]
pub enum AssemblerError {
    #[error("cannot run {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("{program} failed: {status}")]
    Failed { program: String, status: ExitStatus },
}

impl AssemblerError {
    /// The exit code of the tool, if it ran and exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            AssemblerError::Failed { status, .. } => status.code(),
            AssemblerError::Spawn { .. } => None,
        }
    }
}

/// Something that can write a copy of `stub` to `output` with each
/// `(name, path)` in `sections` appended as a new section holding the
/// contents of `path`.
///
/// The new sections' addresses and sizes need not be correct; they are
/// fixed up afterwards.
pub trait Assembler {
    fn assemble(&self, stub: &Path, sections: &[(SectionName, &Path)], output: &Path) -> Result<(), AssemblerError>;
}

/// Runs GNU objcopy (or a compatible program) to add the sections.
#[derive(Debug, Clone)]
pub struct Objcopy {
    program: OsString,
}

impl Objcopy {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Objcopy { program: program.as_ref().to_owned() }
    }

    /// Uses `$OBJCOPY` if set, otherwise `objcopy` from `PATH`.
    pub fn from_env() -> Self {
        Objcopy::new(std::env::var_os(OBJCOPY_ENV).unwrap_or_else(|| "objcopy".into()))
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    fn command(&self, stub: &Path, sections: &[(SectionName, &Path)], output: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        for (name, path) in sections {
            let mut add = OsString::from(format!("{}=", name));
            add.push(path.as_os_str());
            cmd.arg("--add-section").arg(add);
            cmd.arg("--set-section-flags").arg(format!("{}=alloc,load,readonly,data", name));
        }
        cmd.arg(stub).arg(output);
        cmd
    }
}

impl Assembler for Objcopy {
    fn assemble(&self, stub: &Path, sections: &[(SectionName, &Path)], output: &Path) -> Result<(), AssemblerError> {
        let program = self.program.to_string_lossy().into_owned();
        let mut cmd = self.command(stub, sections, output);
        debug!("running {:?}", cmd);
        let status = cmd
            .stdin(Stdio::null())
            .status()
            .map_err(|source| AssemblerError::Spawn { program: program.clone(), source })?;
        if status.success() {
            Ok(())
        } else {
            Err(AssemblerError::Failed { program, status })
        }
    }
}
