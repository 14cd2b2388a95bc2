//! A handwritten parser for our arguments.
//!
//! The option surface is deliberately close to the classic Mac OS linkers
//! that this tool replaces: positional object files, `-l`/`--weak-l` shared
//! libraries resolved against `-L` search paths, and a required entry-point
//! symbol. We don't pull in a CLI crate for this; the whole grammar is a
//! dozen flags and linkers traditionally accept joined forms like `-lFoo`
//! that are awkward to express in derive-style parsers.

use crate::error::Result;
use anyhow::bail;
use std::path::PathBuf;

#[derive(Debug)]
pub struct Args {
    /// Name of the entry-point symbol. Its section and offset become the
    /// loader's main entry. There is no default; callers must choose.
    pub entry: String,

    pub output: PathBuf,

    /// Object files, processed in command-line order.
    pub inputs: Vec<PathBuf>,

    /// Shared libraries searched during import resolution, in order.
    pub libraries: Vec<String>,

    /// Shared libraries whose missing exports are non-fatal.
    pub weak_libraries: Vec<String>,

    /// Directories searched when resolving `-l` names.
    pub lib_search_path: Vec<PathBuf>,

    /// Default virtual base address of the code output.
    pub base_code: u64,

    /// Default virtual base address of the data output.
    pub base_data: u64,

    /// Name of an optional initialisation symbol for the loader header.
    pub init: Option<String>,

    /// Name of an optional termination symbol for the loader header.
    pub term: Option<String>,

    /// Downgrade unresolved symbols (and duplicate definitions) to warnings.
    pub allow_undefined: bool,

    /// Re-read the written container and check its structure.
    pub validate_output: bool,

    pub verbose: bool,

    /// Stop reporting input-file errors after this many.
    pub error_limit: usize,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            entry: String::new(),
            output: PathBuf::from("a.out"),
            inputs: Vec::new(),
            libraries: Vec::new(),
            weak_libraries: Vec::new(),
            lib_search_path: Vec::new(),
            base_code: 0,
            base_data: 0,
            init: None,
            term: None,
            allow_undefined: false,
            validate_output: false,
            verbose: false,
            error_limit: 20,
        }
    }
}

impl Args {
    pub fn parse<S: AsRef<str>, I: Iterator<Item = S>>(input: I) -> Result<Args> {
        parse(input)
    }
}

pub(crate) fn parse<S: AsRef<str>, I: Iterator<Item = S>>(mut input: I) -> Result<Args> {
    let mut args = Args::default();
    let mut entry = None;

    while let Some(arg) = input.next() {
        let arg = arg.as_ref();

        let mut take_value = |name: &str| -> Result<String> {
            if let Some((_, value)) = arg.split_once('=') {
                return Ok(value.to_owned());
            }
            match input.next() {
                Some(value) => Ok(value.as_ref().to_owned()),
                None => bail!("{name}: missing argument"),
            }
        };

        let flag = arg.split_once('=').map_or(arg, |(flag, _)| flag);
        match flag {
            "-o" | "--output" => args.output = PathBuf::from(take_value("-o")?),
            "-e" | "--entry" => entry = Some(take_value("-e")?),
            "--init" => args.init = Some(take_value("--init")?),
            "--term" => args.term = Some(take_value("--term")?),
            "--base-code" => args.base_code = parse_number(&take_value("--base-code")?)?,
            "--base-data" => args.base_data = parse_number(&take_value("--base-data")?)?,
            "--error-limit" => {
                args.error_limit = parse_number(&take_value("--error-limit")?)? as usize;
            }
            "-L" => args.lib_search_path.push(PathBuf::from(take_value("-L")?)),
            "-l" => args.libraries.push(take_value("-l")?),
            "--weak-l" => args.weak_libraries.push(take_value("--weak-l")?),
            "--allow-undefined" => args.allow_undefined = true,
            "--validate-output" => args.validate_output = true,
            "--verbose" | "-v" => args.verbose = true,
            "--help" => bail!("{USAGE}"),
            other => {
                if let Some(rest) = other.strip_prefix("-L") {
                    args.lib_search_path.push(PathBuf::from(rest));
                } else if let Some(rest) = other.strip_prefix("-l") {
                    args.libraries.push(rest.to_owned());
                } else if other.starts_with('-') {
                    bail!("unknown argument '{other}'");
                } else {
                    args.inputs.push(PathBuf::from(other));
                }
            }
        }
    }

    match entry {
        Some(entry) => args.entry = entry,
        None => bail!("no entry point specified; pass -e SYMBOL"),
    }

    Ok(args)
}

fn parse_number(s: &str) -> Result<u64> {
    if let Some(s) = s.strip_prefix("0x") {
        Ok(u64::from_str_radix(s, 16)?)
    } else {
        Ok(s.parse::<u64>()?)
    }
}

const USAGE: &str = "usage: pefld [options] <inputs>
  -o, --output FILE     write the linked container to FILE (default a.out)
  -e, --entry SYMBOL    entry-point symbol (required)
      --init SYMBOL     initialisation symbol
      --term SYMBOL     termination symbol
  -L DIR                add DIR to the library search path
  -l NAME               link against shared library NAME
      --weak-l NAME     link against NAME; missing exports are non-fatal
      --base-code ADDR  default virtual base of the code section
      --base-data ADDR  default virtual base of the data section
      --allow-undefined downgrade unresolved symbols to warnings
      --validate-output re-read the output and check its structure
      --error-limit N   stop after N input errors
  -v, --verbose         report progress while linking";
