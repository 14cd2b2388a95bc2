//! Builds the output's loader section: entry points, the imported library
//! and symbol tables, relocation headers and instructions, the string table,
//! and the export hash/key/symbol tables, in their required order.

use crate::alignment;
use crate::args::Args;
use crate::error::LinkError;
use crate::error::Result;
use crate::export_hash;
use crate::layout::Layout;
use crate::parsing::InputObject;
use crate::pef;
use crate::pef::LibraryOptions;
use crate::pef::SymbolClass;
use crate::reloc_writer::RelocOutput;
use crate::shared_library::SharedLibraryFile;
use crate::symbol_db::Symbol;
use crate::symbol_db::SymbolId;
use crate::symbol_db::SymbolTable;
use indexmap::IndexMap;

/// Imported symbols regrouped by their providing library, in first-seen
/// order, with global import indices assigned as contiguous per-library runs.
pub(crate) struct ImportCollation {
    pub(crate) libraries: Vec<CollatedLibrary>,
    pub(crate) total_count: u32,
}

pub(crate) struct CollatedLibrary {
    /// Index into the link's shared library list.
    pub(crate) library_index: usize,
    pub(crate) symbols: Vec<SymbolId>,
    pub(crate) first_import: u32,
}

#[tracing::instrument(skip_all, name = "Collate imports")]
pub(crate) fn collate_imports(symbol_table: &mut SymbolTable) -> ImportCollation {
    let mut groups: IndexMap<usize, Vec<SymbolId>> = IndexMap::new();
    let ids: Vec<_> = symbol_table.ids().collect();
    for id in ids {
        if let Symbol::Imported(imported) = symbol_table.symbol(id) {
            groups.entry(imported.library.0).or_default().push(id);
        }
    }

    let mut libraries = Vec::with_capacity(groups.len());
    let mut next_index = 0u32;
    for (library_index, symbols) in groups {
        let first_import = next_index;
        for &id in &symbols {
            if let Symbol::Imported(imported) = symbol_table.symbol_mut(id) {
                imported.import_index = Some(next_index);
            }
            next_index += 1;
        }
        libraries.push(CollatedLibrary {
            library_index,
            symbols,
            first_import,
        });
    }

    ImportCollation {
        libraries,
        total_count: next_index,
    }
}

struct ExportRecord<'data> {
    name: &'data [u8],
    class: SymbolClass,
    section_index: i16,
    value: u32,
}

#[tracing::instrument(skip_all, name = "Build loader section")]
pub(crate) fn build<'data>(
    symbol_table: &SymbolTable<'data>,
    objects: &[InputObject<'data>],
    layout: &Layout,
    libraries: &[SharedLibraryFile<'data>],
    collation: &ImportCollation,
    reloc: &RelocOutput,
    args: &Args,
) -> Result<Vec<u8>> {
    let (main_section, main_offset) =
        entry_point(symbol_table, objects, layout, &args.entry)?;
    let (init_section, init_offset) = match &args.init {
        Some(name) => entry_point(symbol_table, objects, layout, name)?,
        None => (-1, 0),
    };
    let (term_section, term_offset) = match &args.term {
        Some(name) => entry_point(symbol_table, objects, layout, name)?,
        None => (-1, 0),
    };

    let exports = collect_exports(symbol_table, objects, layout)?;
    let export_names: Vec<&[u8]> = exports.iter().map(|export| export.name).collect();
    let hash_table = export_hash::build_table(&export_names);

    // The string table holds library names, then imported symbol names, then
    // exported symbol names (in hash order, which is the order the export
    // table is written in).
    let mut strings = Vec::new();
    let mut add_string = |bytes: &[u8]| -> u32 {
        let offset = strings.len() as u32;
        strings.extend_from_slice(bytes);
        strings.push(0);
        offset
    };

    let library_name_offsets: Vec<u32> = collation
        .libraries
        .iter()
        .map(|library| add_string(libraries[library.library_index].name.as_bytes()))
        .collect();

    let mut import_words = Vec::with_capacity(collation.total_count as usize);
    for library in &collation.libraries {
        for &id in &library.symbols {
            let Symbol::Imported(imported) = symbol_table.symbol(id) else {
                continue;
            };
            let name_offset = add_string(symbol_table.name(id).bytes());
            import_words.push(pef::compose_imported_symbol(imported.class, name_offset));
        }
    }

    let mut export_name_offsets = Vec::with_capacity(exports.len());
    for &index in &hash_table.order {
        let offset = add_string(exports[index].name);
        if offset > 0x00FF_FFFF {
            return Err(LinkError::reloc_overflow(
                "loader string table too large for export name offsets".to_owned(),
            ));
        }
        export_name_offsets.push(offset);
    }

    // Sub-region offsets within the loader section.
    let libraries_offset = pef::LoaderInfoHeader::SIZE;
    let imports_offset =
        libraries_offset + collation.libraries.len() * pef::ImportedLibrary::SIZE;
    let reloc_headers_offset =
        imports_offset + import_words.len() * pef::IMPORTED_SYMBOL_SIZE;
    let instructions_offset =
        reloc_headers_offset + reloc.headers.len() * pef::LoaderRelocationHeader::SIZE;
    let strings_offset = instructions_offset + reloc.instruction_bytes.len();
    let export_hash_offset =
        alignment::HASH_TABLE.align_up_usize(strings_offset + strings.len());

    let info = pef::LoaderInfoHeader {
        main_section,
        main_offset,
        init_section,
        init_offset,
        term_section,
        term_offset,
        imported_library_count: collation.libraries.len() as u32,
        total_imported_symbol_count: collation.total_count,
        reloc_section_count: reloc.headers.len() as u32,
        reloc_instr_offset: reloc_headers_offset as u32,
        loader_strings_offset: strings_offset as u32,
        export_hash_offset: export_hash_offset as u32,
        export_hash_table_power: hash_table.power,
        exported_symbol_count: exports.len() as u32,
    };

    let mut out = Vec::new();
    info.write(&mut out);

    for (library, name_offset) in collation.libraries.iter().zip(library_name_offsets) {
        let mut options = LibraryOptions::empty();
        let all_weak = library.symbols.iter().all(|&id| {
            matches!(symbol_table.symbol(id), Symbol::Imported(imported) if imported.weak)
        });
        if all_weak {
            options |= LibraryOptions::WEAK_IMPORT;
        }
        pef::ImportedLibrary {
            name_offset,
            old_imp_version: 0,
            current_version: 0,
            imported_symbol_count: library.symbols.len() as u32,
            first_imported_symbol: library.first_import,
            options: options.bits(),
            reserved_a: 0,
            reserved_b: 0,
        }
        .write(&mut out);
    }

    for word in &import_words {
        pef::write_u32(&mut out, *word);
    }

    debug_assert_eq!(out.len(), reloc_headers_offset);
    for header in &reloc.headers {
        header.write(&mut out);
    }
    out.extend_from_slice(&reloc.instruction_bytes);

    debug_assert_eq!(out.len(), strings_offset);
    out.extend_from_slice(&strings);
    out.resize(export_hash_offset, 0);

    for (chain_count, first_index) in &hash_table.slots {
        pef::write_u32(&mut out, pef::compose_hash_slot(*chain_count, *first_index));
    }
    for key in &hash_table.keys {
        pef::write_u32(&mut out, *key);
    }
    for (position, &index) in hash_table.order.iter().enumerate() {
        let export = &exports[index];
        pef::ExportedSymbol {
            class_and_name: pef::compose_exported_symbol(
                export.class,
                export_name_offsets[position],
            ),
            value: export.value,
            section_index: export.section_index,
        }
        .write(&mut out);
    }

    out.resize(alignment::SECTION.align_up_usize(out.len()), 0);
    tracing::debug!(
        bytes = out.len(),
        exports = exports.len(),
        imports = collation.total_count,
        "built loader section"
    );
    Ok(out)
}

/// Every defined symbol is published in the export table, with its value
/// rewritten to be relative to the output section that now holds it.
fn collect_exports<'data>(
    symbol_table: &SymbolTable<'data>,
    objects: &[InputObject<'data>],
    layout: &Layout,
) -> Result<Vec<ExportRecord<'data>>> {
    let mut exports = Vec::new();
    for id in symbol_table.ids() {
        let Symbol::Defined(defined) = *symbol_table.symbol(id) else {
            continue;
        };
        let record = if defined.section_index < 0 {
            ExportRecord {
                name: symbol_table.name(id).bytes(),
                class: defined.class,
                section_index: defined.section_index,
                value: defined.value,
            }
        } else {
            let (output_index, output) = output_of(objects, layout, &defined).ok_or_else(|| {
                LinkError::malformed(format!(
                    "exported symbol {} has no placed section",
                    symbol_table.name(id)
                ))
            })?;
            ExportRecord {
                name: symbol_table.name(id).bytes(),
                class: defined.class,
                section_index: output_index as i16,
                value: defined.virtual_address - output.virtual_address,
            }
        };
        exports.push(record);
    }
    Ok(exports)
}

fn output_of<'a>(
    objects: &[InputObject],
    layout: &'a Layout,
    defined: &crate::symbol_db::Defined,
) -> Option<(usize, &'a crate::layout::OutputSection)> {
    let object = objects
        .iter()
        .find(|object| object.file_id == defined.file_id)?;
    let section = object.section_by_file_index(defined.section_index as usize)?;
    let output_index = section.output_section?;
    Some((output_index, &layout.outputs[output_index]))
}

/// Resolves an entry-point name to `(output section index, offset)`.
fn entry_point(
    symbol_table: &SymbolTable,
    objects: &[InputObject],
    layout: &Layout,
    name: &str,
) -> Result<(i32, u32)> {
    let id = symbol_table
        .find(name.as_bytes())
        .ok_or_else(|| LinkError::UndefinedSymbol(name.to_owned()))?;
    let Symbol::Defined(defined) = *symbol_table.symbol(id) else {
        return Err(LinkError::UndefinedSymbol(name.to_owned()).into());
    };
    let (output_index, output) = output_of(objects, layout, &defined)
        .ok_or_else(|| LinkError::UndefinedSymbol(name.to_owned()))?;
    Ok((
        output_index as i32,
        defined.virtual_address - output.virtual_address,
    ))
}
