//! Optional validation of the file we just wrote. This re-reads the output
//! container and checks the invariants a loader would rely on: header tags
//! and counts, section bounds, the loader section's internal offsets, the
//! contiguous partition of the imported-symbol array, and that every
//! exported symbol can be found again through its own hash table.

use crate::args::Args;
use crate::error::Context as _;
use crate::error::LinkError;
use crate::error::Result;
use crate::export_hash;
use crate::layout::Layout;
use crate::pef;
use crate::pef::SectionKind;

#[tracing::instrument(skip_all, name = "Validate output")]
pub(crate) fn validate_output(args: &Args, layout: &Layout) -> Result {
    validate_bytes(&std::fs::read(&args.output)?, layout)
        .with_context(|| format!("validation of `{}` failed", args.output.display()))
}

fn validate_bytes(bytes: &[u8], layout: &Layout) -> Result {
    let header = pef::ContainerHeader::parse(bytes)?;
    if header.tag1 != pef::TAG1 || header.tag2 != pef::TAG2 {
        return Err(LinkError::malformed("wrote bad container tags"));
    }
    if header.format_version != pef::FORMAT_VERSION {
        return Err(LinkError::malformed("wrote bad format version"));
    }
    let expected_sections = layout.loader_section_index() + 1;
    if usize::from(header.section_count) != expected_sections {
        return Err(LinkError::malformed(format!(
            "wrote {} section headers, expected {expected_sections}",
            header.section_count
        )));
    }

    let mut loader = None;
    for index in 0..usize::from(header.section_count) {
        let offset = pef::ContainerHeader::SIZE + index * pef::SectionHeader::SIZE;
        let section = pef::SectionHeader::parse(bytes.get(offset..).unwrap_or_default())?;
        let end = u64::from(section.container_offset) + u64::from(section.container_length);
        if end > bytes.len() as u64 {
            return Err(LinkError::malformed(format!(
                "section {index} extends past the file"
            )));
        }
        if section.kind == SectionKind::Loader.as_u8() {
            if loader.is_some() {
                return Err(LinkError::malformed("wrote more than one loader section"));
            }
            let start = section.container_offset as usize;
            loader = Some(&bytes[start..start + section.container_length as usize]);
        }
    }
    let loader = loader.ok_or_else(|| LinkError::malformed("wrote no loader section"))?;

    validate_loader(loader)
}

fn validate_loader(loader: &[u8]) -> Result {
    let info = pef::LoaderInfoHeader::parse(loader)?;

    // The imported-library records must partition the imported-symbol array
    // into contiguous runs.
    let mut next_import = 0;
    for index in 0..info.imported_library_count as usize {
        let offset = pef::LoaderInfoHeader::SIZE + index * pef::ImportedLibrary::SIZE;
        let library = pef::ImportedLibrary::parse(loader.get(offset..).unwrap_or_default())?;
        if library.first_imported_symbol != next_import {
            return Err(LinkError::malformed(format!(
                "imported library {index} starts at symbol {} instead of {next_import}",
                library.first_imported_symbol
            )));
        }
        pef::read_string(loader, (info.loader_strings_offset + library.name_offset) as usize)?;
        next_import += library.imported_symbol_count;
    }
    if next_import != info.total_imported_symbol_count {
        return Err(LinkError::malformed(
            "imported libraries don't cover the imported symbol array",
        ));
    }

    // Every export must be reachable through the hash table: its key slot
    // must cover its index, and the stored key must match its name's hash.
    let slot_count = 1u32 << info.export_hash_table_power;
    let slot_table = info.export_hash_offset as usize;
    let key_table = slot_table + slot_count as usize * 4;
    let symbol_table = key_table + info.exported_symbol_count as usize * 4;

    for index in 0..info.exported_symbol_count {
        let record = pef::ExportedSymbol::parse(
            loader
                .get(symbol_table + index as usize * pef::ExportedSymbol::SIZE..)
                .unwrap_or_default(),
        )?;
        let name = pef::read_string(
            loader,
            info.loader_strings_offset as usize + record.name_offset() as usize,
        )?;
        let hash = export_hash::hash_word(name);

        let key = pef::read_u32(loader, key_table + index as usize * 4)?;
        if key != hash {
            return Err(LinkError::malformed(format!(
                "export {} has key 0x{key:08x}, expected 0x{hash:08x}",
                String::from_utf8_lossy(name)
            )));
        }

        let slot = pef::read_u32(loader, slot_table + (hash % slot_count) as usize * 4)?;
        let first = pef::hash_slot_first_index(slot);
        let chain = pef::hash_slot_chain_count(slot);
        if index < first || index >= first + chain {
            return Err(LinkError::malformed(format!(
                "export {} is outside its hash chain",
                String::from_utf8_lossy(name)
            )));
        }
    }

    Ok(())
}
