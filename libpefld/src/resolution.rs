//! Symbol registration and import resolution: every object's exported
//! symbols enter the table first, relocation scanning registers the names
//! each object needs, and whatever is still undefined afterwards is looked
//! up in the shared libraries, in command-line order.

use crate::args::Args;
use crate::error::Context as _;
use crate::error::Error;
use crate::error::LinkError;
use crate::error::Result;
use crate::parsing::InputObject;
use crate::relocations;
use crate::shared_library::SharedLibraryFile;
use crate::symbol_db::AddDefinedOutcome;
use crate::symbol_db::LibraryId;
use crate::symbol_db::Symbol;
use crate::symbol_db::SymbolTable;

/// Registers every object's definitions, then scans relocation streams to
/// register undefined symbols for referenced imports. Errors (duplicate
/// definitions, malformed streams) are accumulated, not fatal, so that one
/// bad input doesn't hide problems in the others.
#[tracing::instrument(skip_all, name = "Build symbol table")]
pub(crate) fn register_objects<'data>(
    objects: &[InputObject<'data>],
    symbol_table: &mut SymbolTable<'data>,
    args: &Args,
) -> Vec<Error> {
    let mut errors = Vec::new();

    for object in objects {
        for export in &object.exports {
            let outcome = symbol_table.add_defined(
                export.name,
                object.file_id,
                export.value,
                export.section_index,
                export.class,
            );
            if let AddDefinedOutcome::Duplicate { prior, .. } = outcome {
                // With allow_undefined the first definition silently wins.
                if !args.allow_undefined {
                    let first = objects
                        .iter()
                        .find(|o| o.file_id == prior)
                        .map(|o| o.input.filename.clone())
                        .unwrap_or_default();
                    errors.push(
                        LinkError::DuplicateDefinition {
                            name: String::from_utf8_lossy(export.name).into_owned(),
                            first,
                            second: object.input.filename.clone(),
                        }
                        .into(),
                    );
                }
            }
        }
    }

    for object in objects {
        if let Err(error) = scan_object_imports(object, symbol_table) {
            errors.push(error);
        }
        if errors.len() >= args.error_limit {
            break;
        }
    }

    errors
}

/// Walks one object's relocation streams and registers an undefined symbol
/// for every import the streams reference.
fn scan_object_imports<'data>(
    object: &InputObject<'data>,
    symbol_table: &mut SymbolTable<'data>,
) -> Result {
    for section in &object.sections {
        if section.relocations.is_empty() {
            continue;
        }
        let instructions = relocations::decode_stream(section.relocations)
            .with_context(|| format!("in {}", object.filename()))?;
        for index in relocations::referenced_import_indices(&instructions) {
            let import = object.imports.get(index as usize).ok_or_else(|| {
                LinkError::malformed(format!(
                    "relocation references import {index} but only {} imports exist in {}",
                    object.imports.len(),
                    object.filename(),
                ))
            })?;
            symbol_table.add_undefined(import.name, object.file_id, import.class);
            tracing::trace!(name = %String::from_utf8_lossy(import.name), "import reference");
        }
    }
    Ok(())
}

/// Resolves undefined symbols against the shared libraries: strong
/// libraries first, then weak, each in command-line order. The first
/// library exporting a name wins. Remaining undefined symbols fail the link
/// unless they were consulted against a weak library or the configuration
/// allows undefined symbols.
#[tracing::instrument(skip_all, name = "Resolve imports")]
pub(crate) fn resolve_imports<'data>(
    symbol_table: &mut SymbolTable<'data>,
    libraries: &[SharedLibraryFile<'data>],
    objects: &[InputObject<'data>],
    args: &Args,
) -> Result {
    let ids: Vec<_> = symbol_table.ids().collect();

    for id in &ids {
        let Symbol::Undefined(_) = symbol_table.symbol(*id) else {
            continue;
        };
        let name = symbol_table.name(*id);
        let mut touched_weak = false;
        for (library_index, library) in libraries.iter().enumerate() {
            touched_weak |= library.weak;
            if let Some(export) = library.find_export(name.bytes())? {
                tracing::debug!(symbol = %name, library = %library.name, "resolved import");
                symbol_table.add_imported(
                    name.bytes(),
                    LibraryId(library_index),
                    export.class,
                    library.weak,
                );
                break;
            }
        }
        if touched_weak {
            if let Symbol::Undefined(undefined) = symbol_table.symbol_mut(*id) {
                undefined.weak_touched = true;
            }
        }
    }

    let mut errors = Vec::new();
    for id in &ids {
        let Symbol::Undefined(undefined) = symbol_table.symbol(*id) else {
            continue;
        };
        let name = symbol_table.name(*id);
        if undefined.weak_touched {
            tracing::debug!(symbol = %name, class = ?undefined.class, "weak import unresolved");
            crate::error::warning(&format!("weak import unresolved: {name}"));
        } else if args.allow_undefined {
            let referenced_from = objects
                .iter()
                .find(|object| object.file_id == undefined.file_id)
                .map(|object| object.filename().to_string())
                .unwrap_or_default();
            crate::error::warning(&format!(
                "undefined symbol: {name} (first referenced from {referenced_from})"
            ));
        } else {
            errors.push(LinkError::UndefinedSymbol(name.to_string()).into());
        }
    }
    crate::error::into_single_error(errors)
}
