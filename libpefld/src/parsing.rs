//! The object reader: turns one mapped PEF container into an `InputObject`
//! with its mergeable sections, its exported symbols and its relocation
//! instruction streams.

use crate::alignment::Alignment;
use crate::args::Args;
use crate::error::Context as _;
use crate::error::Error;
use crate::error::LinkError;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::input_data::FileId;
use crate::input_data::InputData;
use crate::input_data::InputFile;
use crate::pattern_data;
use crate::pef;
use crate::pef::Architecture;
use crate::pef::SectionKind;
use crate::pef::SymbolClass;
use std::borrow::Cow;

pub(crate) struct InputObject<'data> {
    pub(crate) file_id: FileId,
    pub(crate) input: &'data InputFile,
    pub(crate) architecture: Architecture,
    pub(crate) sections: Vec<InputSection<'data>>,
    pub(crate) exports: Vec<ParsedExport<'data>>,
    /// The file's own imported-symbol table, indexed by the import numbers
    /// that appear in its relocation streams.
    pub(crate) imports: Vec<ParsedImport<'data>>,
}

pub(crate) struct InputSection<'data> {
    /// Section index within the originating file.
    pub(crate) file_index: usize,
    pub(crate) kind: SectionKind,
    pub(crate) alignment: Alignment,
    /// In-memory size; may exceed `data.len()`, the rest is zero-filled.
    pub(crate) size: u32,
    /// Unpacked bytes. Owned only when the input was pattern data.
    pub(crate) data: Cow<'data, [u8]>,
    /// Raw relocation instruction bytes for this section, if any.
    pub(crate) relocations: &'data [u8],
    /// Assigned by layout; zero until then.
    pub(crate) virtual_address: u32,
    /// Index of the output section this section was merged into.
    pub(crate) output_section: Option<usize>,
}

pub(crate) struct ParsedExport<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) value: u32,
    pub(crate) section_index: i16,
    pub(crate) class: SymbolClass,
}

pub(crate) struct ParsedImport<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) class: SymbolClass,
}

impl<'data> InputObject<'data> {
    pub(crate) fn filename(&self) -> std::path::Display<'_> {
        self.input.filename.display()
    }

    /// Looks up a section by its index in the originating file.
    pub(crate) fn section_by_file_index(&self, file_index: usize) -> Option<&InputSection<'data>> {
        self.sections
            .iter()
            .find(|section| section.file_index == file_index)
    }
}

/// Parses every object file, accumulating per-file errors rather than
/// stopping at the first bad input.
#[tracing::instrument(skip_all, name = "Parse input files")]
pub(crate) fn parse_objects<'data>(
    input_data: &'data InputData,
    args: &Args,
) -> (Vec<InputObject<'data>>, Vec<Error>) {
    let mut objects = Vec::with_capacity(input_data.objects.len());
    let mut errors = Vec::new();
    let mut architecture = None;

    for (index, input) in input_data.objects.iter().enumerate() {
        if errors.len() >= args.error_limit {
            break;
        }
        match parse_object(FileId(index as u32), input, architecture) {
            Ok(object) => {
                architecture = Some(object.architecture);
                objects.push(object);
            }
            Err(error) => errors.push(error),
        }
    }

    (objects, errors)
}

fn parse_object<'data>(
    file_id: FileId,
    input: &'data InputFile,
    expected_architecture: Option<Architecture>,
) -> Result<InputObject<'data>> {
    parse_object_impl(file_id, input, expected_architecture)
        .with_context(|| format!("in {}", input.filename.display()))
}

fn parse_object_impl<'data>(
    file_id: FileId,
    input: &'data InputFile,
    expected_architecture: Option<Architecture>,
) -> Result<InputObject<'data>> {
    let data = input.data();
    FileKind::identify_bytes(data)?;
    let header = pef::ContainerHeader::parse(data)?;

    if header.format_version != pef::FORMAT_VERSION {
        return Err(LinkError::malformed(format!(
            "unsupported PEF format version {}",
            header.format_version
        )));
    }
    let architecture = Architecture::from_tag(header.architecture)?;
    if let Some(expected) = expected_architecture {
        if architecture != expected {
            return Err(LinkError::malformed(format!(
                "architecture mismatch: expected {expected:?}, found {architecture:?}"
            )));
        }
    }
    if header.section_count == 0 {
        return Err(LinkError::malformed("container has no sections"));
    }

    let mut sections = Vec::new();
    let mut loader: Option<(pef::SectionHeader, &'data [u8])> = None;

    for index in 0..usize::from(header.section_count) {
        let offset = pef::ContainerHeader::SIZE + index * pef::SectionHeader::SIZE;
        let section_header = pef::SectionHeader::parse(
            data.get(offset..)
                .ok_or_else(|| LinkError::malformed("file too small for section headers"))?,
        )?;

        let start = section_header.container_offset as usize;
        let len = section_header.container_length as usize;
        let bytes = data.get(start..start + len).ok_or_else(|| {
            LinkError::malformed(format!("section {index} extends past end of file"))
        })?;

        let kind = SectionKind::from_u8(section_header.kind)?;
        if kind == SectionKind::Loader {
            loader = Some((section_header, bytes));
            continue;
        }

        let section_data = if kind == SectionKind::PatternData {
            Cow::Owned(pattern_data::unpack(
                bytes,
                section_header.unpacked_length as usize,
            )?)
        } else {
            Cow::Borrowed(bytes)
        };

        sections.push(InputSection {
            file_index: index,
            kind,
            alignment: Alignment::from_exponent(section_header.alignment)?,
            size: section_header.total_length.max(section_data.len() as u32),
            data: section_data,
            relocations: &[],
            virtual_address: 0,
            output_section: None,
        });
    }

    let mut object = InputObject {
        file_id,
        input,
        architecture,
        sections,
        exports: Vec::new(),
        imports: Vec::new(),
    };

    if let Some((_, loader_data)) = loader {
        parse_loader(&mut object, loader_data)?;
    }

    Ok(object)
}

/// Reads the pieces of an input's loader section that matter to the link:
/// its exported symbols, its imported-symbol name table, and the relocation
/// stream for each section.
fn parse_loader<'data>(object: &mut InputObject<'data>, loader: &'data [u8]) -> Result {
    let info = pef::LoaderInfoHeader::parse(loader)?;
    let strings_offset = info.loader_strings_offset as usize;

    // Imported symbols sit after the imported library records.
    let import_array_offset =
        pef::LoaderInfoHeader::SIZE + info.imported_library_count as usize * pef::ImportedLibrary::SIZE;
    for index in 0..info.total_imported_symbol_count as usize {
        let word = pef::read_u32(loader, import_array_offset + index * pef::IMPORTED_SYMBOL_SIZE)?;
        let name_offset = pef::imported_symbol_name_offset(word) as usize;
        object.imports.push(ParsedImport {
            name: pef::read_string(loader, strings_offset + name_offset)?,
            class: SymbolClass::from_u8(pef::imported_symbol_class(word))?,
        });
    }

    // Exported symbols: slot table, then key table, then the symbols.
    let slot_table_len = (1usize << info.export_hash_table_power) * 4;
    let key_table_len = info.exported_symbol_count as usize * 4;
    let export_table_offset = info.export_hash_offset as usize + slot_table_len + key_table_len;
    for index in 0..info.exported_symbol_count as usize {
        let record = pef::ExportedSymbol::parse(
            loader
                .get(export_table_offset + index * pef::ExportedSymbol::SIZE..)
                .ok_or_else(|| LinkError::malformed("export table extends past loader section"))?,
        )?;
        let name = pef::read_string(loader, strings_offset + record.name_offset() as usize)?;
        if name.is_empty() {
            continue;
        }
        object.exports.push(ParsedExport {
            name,
            value: record.value,
            section_index: record.section_index,
            class: SymbolClass::from_u8(record.class())?,
        });
    }

    // Relocation headers, then the shared instruction area.
    let headers_offset = info.reloc_instr_offset as usize;
    let instr_offset =
        headers_offset + info.reloc_section_count as usize * pef::LoaderRelocationHeader::SIZE;
    for index in 0..info.reloc_section_count as usize {
        let header = pef::LoaderRelocationHeader::parse(
            loader
                .get(headers_offset + index * pef::LoaderRelocationHeader::SIZE..)
                .ok_or_else(|| LinkError::malformed("relocation headers extend past loader"))?,
        )?;
        let start = instr_offset + header.first_reloc_offset as usize;
        let len = header.reloc_count as usize * 2;
        let instructions = loader.get(start..start + len).ok_or_else(|| {
            LinkError::malformed("relocation instructions extend past loader section")
        })?;

        let section_index = usize::from(header.section_index);
        let section = object
            .sections
            .iter_mut()
            .find(|section| section.file_index == section_index)
            .ok_or_else(|| {
                LinkError::malformed(format!(
                    "relocation header references invalid section index {section_index}"
                ))
            })?;
        section.relocations = instructions;
    }

    Ok(())
}
