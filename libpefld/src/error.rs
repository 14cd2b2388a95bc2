pub(crate) use anyhow::Context;
pub(crate) use anyhow::Error;
use std::path::PathBuf;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// The kinds of failure that a link can produce. Phases generally propagate
/// `anyhow::Error`; errors that callers might want to classify are created as
/// one of these variants so that they can be recovered with `downcast_ref`
/// anywhere along the context chain.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("cannot open `{}`: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed PEF file: {0}")]
    MalformedFile(String),

    #[error("unknown architecture 0x{0:08x}")]
    UnknownArchitecture(u32),

    #[error(
        "duplicate symbol: {}\n>>> defined in {}\n>>> defined in {}",
        .name,
        .first.display(),
        .second.display()
    )]
    DuplicateDefinition {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("undefined symbol: {0}")]
    UndefinedSymbol(String),

    #[error("library not found: {0}")]
    LibraryNotFound(String),

    #[error("relocation overflow: {0}")]
    RelocationOverflow(String),
}

impl LinkError {
    pub(crate) fn malformed(message: impl Into<String>) -> Error {
        LinkError::MalformedFile(message.into()).into()
    }

    pub(crate) fn reloc_overflow(message: impl Into<String>) -> Error {
        LinkError::RelocationOverflow(message.into()).into()
    }
}

/// Returns the `LinkError` at the root of `error`, if there is one.
pub fn link_error(error: &Error) -> Option<&LinkError> {
    error.downcast_ref::<LinkError>()
}

/// Prints a warning. By using our own function for this, it'll be easier to
/// find places that issue warnings if we want to say have a flag to suppress
/// them.
pub(crate) fn warning(message: &str) {
    eprintln!("pefld: warning: {message}");
}

/// Collapses accumulated errors into one result. A single error is returned
/// as-is so callers keep its kind; with several, each is reported and a
/// summary error is returned.
pub(crate) fn into_single_error(mut errors: Vec<Error>) -> Result {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.pop().expect("len checked")),
        n => {
            for error in &errors {
                eprintln!("pefld: error: {error:#}");
            }
            Err(anyhow::anyhow!("{n} errors emitted"))
        }
    }
}

pub fn report_error_and_exit(error: &Error) -> ! {
    eprintln!("pefld: error: {error:#}");
    std::process::exit(1);
}
