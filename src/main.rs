//! stubcompose combines a UEFI boot stub, a kernel, and an initrd into one
//! bootable EFI executable.
//!
//! ```sh
//! stubcompose linuxaa64.efi.stub vmlinuz initrd.img linux.efi
//! ```
//!
//! The kernel and initrd are appended as the sections `.linux` and
//! `.initrd` by running objcopy (`$OBJCOPY`, or `--objcopy PROGRAM`), and
//! the section table and optional header are then fixed up so the firmware
//! loader accepts the result.
//!
//! With `--patch-only`, STUB is an image whose sections were already
//! appended, and only the fix-up runs. With `--list FILE`, the headers and
//! section table of FILE are printed.
//!
//! # Exit status
//!
//! Exit status is 0 if there was no error. If objcopy fails, its exit status
//! is passed through. Any other error (I/O error, PE format error) gives 1.

use std::env;
use std::ffi::OsString;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;

use log::LevelFilter;

use stubcompose::{compose, Inputs, Objcopy, SectionName, Targets};

/// What the command line asks for.
enum Mode {
    Help,
    Version,
    List(PathBuf),
    Compose { patch_only: bool, paths: [PathBuf; 4] },
}

struct Options {
    mode: Mode,
    targets: Targets,
    objcopy: Option<OsString>,
    verbose: bool,
}

fn bin_name() -> String {
    env::args_os().next()
        .map(|arg| arg.to_string_lossy().into_owned())
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_owned())
}

/// Prints a usage message to `w`.
fn print_usage<W: Write + ?Sized>(w: &mut W) -> io::Result<()> {
    write!(w, "\
Usage: {0} [OPTION]... STUB KERNEL INITRD OUTPUT
       {0} --list FILE
Append KERNEL and INITRD to the EFI boot stub STUB as new sections and fix
up the PE headers, writing the result to OUTPUT.

Options:
      --kernel-section NAME  name of the kernel section (default .linux)
      --initrd-section NAME  name of the initrd section (default .initrd)
      --objcopy PROGRAM      objcopy to run (default $OBJCOPY or objcopy)
      --patch-only           STUB already has the sections; only fix headers
  -l, --list                 print the headers and sections of FILE
  -v, --verbose              show what is being done
  -h, --help                 show this help
  -V, --version              show the version
", bin_name())
}

fn section_name(value: OsString) -> Result<SectionName, Box<dyn std::error::Error>> {
    let value = value.into_string().map_err(|v| format!("invalid section name {:?}", v))?;
    Ok(SectionName::new(&value)?)
}

fn parse_args() -> Result<Options, Box<dyn std::error::Error>> {
    use lexopt::prelude::*;

    let mut targets = Targets::default();
    let mut objcopy = None;
    let mut verbose = false;
    let mut patch_only = false;
    let mut list = false;
    let mut free = Vec::new();

    let mut parser = lexopt::Parser::from_env();
    while let Some(arg) = parser.next()? {
        match arg {
            Short('h') | Long("help") => return Ok(Options { mode: Mode::Help, targets, objcopy, verbose }),
            Short('V') | Long("version") => return Ok(Options { mode: Mode::Version, targets, objcopy, verbose }),
            Short('v') | Long("verbose") => verbose = true,
            Short('l') | Long("list") => list = true,
            Long("patch-only") => patch_only = true,
            Long("kernel-section") => targets.kernel = section_name(parser.value()?)?,
            Long("initrd-section") => targets.initrd = section_name(parser.value()?)?,
            Long("objcopy") => objcopy = Some(parser.value()?),
            Value(value) => free.push(PathBuf::from(value)),
            _ => return Err(arg.unexpected().into()),
        }
    }

    let mode = if list {
        match free.len() {
            1 => Mode::List(free.remove(0)),
            _ => return Err("--list needs exactly one FILE argument".into()),
        }
    } else {
        if free.len() != 4 {
            return Err("need STUB, KERNEL, INITRD, and OUTPUT arguments".into());
        }
        let mut free = free.into_iter();
        let mut next = || free.next().unwrap_or_default();
        Mode::Compose { patch_only, paths: [next(), next(), next(), next()] }
    };
    Ok(Options { mode, targets, objcopy, verbose })
}

fn main() {
    let options = match parse_args() {
        Ok(options) => options,
        Err(err) => {
            print_usage(&mut io::stderr()).ok();
            eprintln!("\n{}", err);
            process::exit(1);
        }
    };

    env_logger::Builder::new()
        .filter_level(if options.verbose { LevelFilter::Debug } else { LevelFilter::Warn })
        .parse_default_env()
        .format_timestamp(None)
        .format_target(false)
        .init();

    let result = match &options.mode {
        Mode::Help => {
            print_usage(&mut io::stdout()).ok();
            return;
        }
        Mode::Version => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            return;
        }
        Mode::List(path) => stubcompose::compose::describe(path).map(|headers| print!("{}", headers)),
        Mode::Compose { patch_only, paths: [stub, kernel, initrd, output] } => {
            let inputs = Inputs { stub, kernel, initrd };
            if *patch_only {
                stubcompose::patch_file(&inputs, &options.targets, output).map(drop)
            } else {
                let objcopy = match &options.objcopy {
                    Some(program) => Objcopy::new(program),
                    None => Objcopy::from_env(),
                };
                compose(&objcopy, &inputs, &options.targets, output).map(drop)
            }
        }
    };

    if let Err(err) = result {
        eprintln!("{}", err);
        process::exit(err.exit_code());
    }
}
