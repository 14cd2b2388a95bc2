//! The shared-library reader. A library is a PEF container consulted only
//! for its export hash table; nothing is materialised beyond the loader
//! section, and exports are looked up by name on demand.

use crate::error::Context as _;
use crate::error::Error;
use crate::error::LinkError;
use crate::error::Result;
use crate::export_hash;
use crate::file_kind::FileKind;
use crate::input_data::InputData;
use crate::input_data::InputFile;
use crate::pef;
use crate::pef::SectionKind;
use crate::pef::SymbolClass;

pub(crate) struct SharedLibraryFile<'data> {
    /// The name recorded in the output's imported-library table; taken from
    /// the file name without its extension.
    pub(crate) name: String,

    pub(crate) weak: bool,

    loader: &'data [u8],
    info: pef::LoaderInfoHeader,
}

/// A matching export returned by `find_export`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Export {
    pub(crate) class: SymbolClass,
    #[allow(dead_code)]
    pub(crate) section_index: i16,
    #[allow(dead_code)]
    pub(crate) value: u32,
}

impl<'data> SharedLibraryFile<'data> {
    pub(crate) fn parse(input: &'data InputFile) -> Result<SharedLibraryFile<'data>> {
        Self::parse_impl(input).with_context(|| format!("in {}", input.filename.display()))
    }

    fn parse_impl(input: &'data InputFile) -> Result<SharedLibraryFile<'data>> {
        let data = input.data();
        FileKind::identify_bytes(data)?;
        let header = pef::ContainerHeader::parse(data)?;
        if header.format_version != pef::FORMAT_VERSION {
            return Err(LinkError::malformed(format!(
                "unsupported PEF format version {}",
                header.format_version
            )));
        }

        let mut loader = None;
        for index in 0..usize::from(header.section_count) {
            let offset = pef::ContainerHeader::SIZE + index * pef::SectionHeader::SIZE;
            let section_header = pef::SectionHeader::parse(
                data.get(offset..)
                    .ok_or_else(|| LinkError::malformed("file too small for section headers"))?,
            )?;
            if section_header.kind == SectionKind::Loader.as_u8() {
                let start = section_header.container_offset as usize;
                let len = section_header.container_length as usize;
                loader = Some(data.get(start..start + len).ok_or_else(|| {
                    LinkError::malformed("loader section extends past end of file")
                })?);
                break;
            }
        }
        let loader =
            loader.ok_or_else(|| LinkError::malformed("shared library has no loader section"))?;
        let info = pef::LoaderInfoHeader::parse(loader)?;

        let name = input
            .filename
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(SharedLibraryFile {
            name,
            weak: input.weak,
            loader,
            info,
        })
    }

    /// Looks `name` up in the export hash table. Hash collisions are
    /// disambiguated by comparing the stored name.
    pub(crate) fn find_export(&self, name: &[u8]) -> Result<Option<Export>> {
        if self.info.exported_symbol_count == 0 {
            return Ok(None);
        }

        let hash = export_hash::hash_word(name);
        let slot_count = 1u32 << self.info.export_hash_table_power;
        let slot_index = hash % slot_count;

        let slot_table_offset = self.info.export_hash_offset as usize;
        let key_table_offset = slot_table_offset + slot_count as usize * 4;
        let symbol_table_offset =
            key_table_offset + self.info.exported_symbol_count as usize * 4;

        let slot = pef::read_u32(self.loader, slot_table_offset + slot_index as usize * 4)?;
        let chain_count = pef::hash_slot_chain_count(slot);
        let first_index = pef::hash_slot_first_index(slot);

        for index in first_index..first_index + chain_count {
            if index >= self.info.exported_symbol_count {
                return Err(LinkError::malformed("export hash chain runs off the table"));
            }
            let key = pef::read_u32(self.loader, key_table_offset + index as usize * 4)?;
            if key != hash {
                continue;
            }

            let record = pef::ExportedSymbol::parse(
                self.loader
                    .get(symbol_table_offset + index as usize * pef::ExportedSymbol::SIZE..)
                    .ok_or_else(|| LinkError::malformed("export table extends past loader"))?,
            )?;
            let stored_name = pef::read_string(
                self.loader,
                self.info.loader_strings_offset as usize + record.name_offset() as usize,
            )?;
            if stored_name != name {
                continue;
            }

            return Ok(Some(Export {
                class: SymbolClass::from_u8(record.class())?,
                section_index: record.section_index,
                value: record.value,
            }));
        }

        Ok(None)
    }
}

/// Parses all shared libraries. A weak library that fails to parse is only
/// a warning; strong libraries must be valid.
#[tracing::instrument(skip_all, name = "Parse shared libraries")]
pub(crate) fn parse_libraries<'data>(
    input_data: &'data InputData,
) -> (Vec<SharedLibraryFile<'data>>, Vec<Error>) {
    let mut libraries = Vec::with_capacity(input_data.libraries.len());
    let mut errors = Vec::new();
    for input in &input_data.libraries {
        match SharedLibraryFile::parse(input) {
            Ok(library) => libraries.push(library),
            Err(error) if input.weak => {
                crate::error::warning(&format!("ignoring weak library: {error:#}"));
            }
            Err(error) => errors.push(error),
        }
    }
    (libraries, errors)
}
