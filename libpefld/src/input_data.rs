//! Code for figuring out which input files we need to read then mapping them
//! into memory. All file I/O happens here, once, up front; everything after
//! this point borrows from the maps.

use crate::args::Args;
use crate::error::LinkError;
use crate::error::Result;
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;
use std::path::PathBuf;

#[derive(Debug)]
pub(crate) struct InputData {
    /// Object files, in command-line order.
    pub(crate) objects: Vec<InputFile>,

    /// Shared libraries, strong ones first, each list in command-line order.
    pub(crate) libraries: Vec<InputFile>,
}

#[derive(Debug)]
pub(crate) struct InputFile {
    pub(crate) filename: PathBuf,

    /// For libraries: whether missing exports are non-fatal.
    pub(crate) weak: bool,

    data: Option<Mmap>,
}

/// Identifies an input object by its position on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct FileId(pub(crate) u32);

impl InputFile {
    pub(crate) fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn for_tests(name: &str) -> InputFile {
        InputFile {
            filename: PathBuf::from(name),
            weak: false,
            data: None,
        }
    }

    fn open(path: &Path, weak: bool) -> Result<InputFile> {
        let io_error = |source| LinkError::Io {
            path: path.to_owned(),
            source,
        };
        let file = File::open(path).map_err(io_error)?;
        // Zero-length files can't be mapped; an empty map means an empty file
        // and the parser will reject it with a proper diagnostic.
        let len = file.metadata().map_err(io_error)?.len();
        let data = if len == 0 {
            None
        } else {
            Some(unsafe { Mmap::map(&file) }.map_err(io_error)?)
        };
        Ok(InputFile {
            filename: path.to_owned(),
            weak,
            data,
        })
    }
}

impl InputData {
    #[tracing::instrument(skip_all, name = "Open input files")]
    pub(crate) fn from_args(args: &Args) -> Result<InputData> {
        let objects = args
            .inputs
            .iter()
            .map(|path| InputFile::open(path, false))
            .collect::<Result<Vec<_>>>()?;

        let mut libraries = Vec::new();
        for name in &args.libraries {
            let Some(path) = search_for_library(&args.lib_search_path, name) else {
                return Err(LinkError::LibraryNotFound(name.clone()).into());
            };
            libraries.push(InputFile::open(&path, false)?);
        }
        for name in &args.weak_libraries {
            let Some(path) = search_for_library(&args.lib_search_path, name) else {
                crate::error::warning(&format!("weak library not found: {name}"));
                continue;
            };
            libraries.push(InputFile::open(&path, true)?);
        }

        Ok(InputData { objects, libraries })
    }
}

/// Resolves a `-l` style library reference. Names that are already paths are
/// used as-is; bare names are tried in each search directory, plain then with
/// a `.pef` suffix.
fn search_for_library(search_path: &[PathBuf], name: &str) -> Option<PathBuf> {
    let direct = Path::new(name);
    if direct.components().count() > 1 || direct.exists() {
        return direct.exists().then(|| direct.to_owned());
    }
    for dir in search_path {
        for candidate in [dir.join(name), dir.join(format!("{name}.pef"))] {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }
    None
}
