//! A linker for PEF (Preferred Executable Format), the container format of
//! Classic Mac OS PowerPC code fragments. Relocatable PEF objects are merged
//! into a single executable container: symbols are resolved across objects
//! and against PEF shared libraries, sections are laid out, the relocation
//! bytecode is regenerated, and a fresh loader section is emitted for the
//! Code Fragment Manager.

use crate::error::LinkError;
use crate::pef::Architecture;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub(crate) mod alignment;
pub mod args;
pub mod error;
pub mod export_hash;
pub(crate) mod file_kind;
pub(crate) mod file_writer;
pub(crate) mod hash;
pub(crate) mod input_data;
pub(crate) mod layout;
pub(crate) mod loader_section;
pub(crate) mod parsing;
pub(crate) mod pattern_data;
pub mod pef;
pub(crate) mod pef_writer;
pub(crate) mod reloc_writer;
pub(crate) mod relocations;
pub(crate) mod resolution;
pub(crate) mod shared_library;
pub(crate) mod symbol;
pub(crate) mod symbol_db;
pub(crate) mod validation;

pub use args::Args;

pub struct Linker {
    args: Args,
}

impl Linker {
    pub fn from_args<S: AsRef<str>, I: Iterator<Item = S>>(input: I) -> error::Result<Linker> {
        Ok(Linker {
            args: args::parse(input)?,
        })
    }

    pub fn from_parsed_args(args: Args) -> Linker {
        Linker { args }
    }

    pub fn run(&self) -> error::Result {
        let default_filter = if self.args.verbose { "debug" } else { "warn" };
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .try_init();
        link(&self.args)
    }
}

/// Runs a whole link against an already-validated configuration.
#[tracing::instrument(skip_all, name = "Link")]
pub fn link(args: &Args) -> error::Result {
    if args.inputs.is_empty() {
        return Err(LinkError::UndefinedSymbol("no input files".to_owned()).into());
    }

    let input_data = input_data::InputData::from_args(args)?;
    let (mut objects, mut errors) = parsing::parse_objects(&input_data, args);
    let (libraries, library_errors) = shared_library::parse_libraries(&input_data);
    errors.extend(library_errors);

    let mut symbol_table = symbol_db::SymbolTable::new();
    errors.extend(resolution::register_objects(
        &objects,
        &mut symbol_table,
        args,
    ));
    // Reading inputs accumulates errors so one bad file doesn't mask the
    // next; past this point the first error stops the link.
    error::into_single_error(errors)?;
    tracing::debug!(symbols = symbol_table.len(), "symbol table built");

    resolution::resolve_imports(&mut symbol_table, &libraries, &objects, args)?;

    let mut layout = layout::compute(&mut objects, &mut symbol_table, args)?;
    let collation = loader_section::collate_imports(&mut symbol_table);
    let reloc = reloc_writer::generate(&objects, &layout, &symbol_table)?;
    let loader_bytes = loader_section::build(
        &symbol_table,
        &objects,
        &layout,
        &libraries,
        &collation,
        &reloc,
        args,
    )?;

    let architecture = objects
        .first()
        .map_or(Architecture::PowerPC, |object| object.architecture);
    pef_writer::write(
        args,
        &objects,
        &mut layout,
        architecture,
        &loader_bytes,
        &reloc.fixups,
    )?;

    if args.validate_output {
        validation::validate_output(args, &layout)?;
    }
    Ok(())
}
