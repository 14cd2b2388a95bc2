//! Section merging and address assignment. Input sections are grouped by
//! kind into at most three outputs — code, data, read-only — which appear in
//! that fixed order, followed by the loader section. Once every member has
//! its place, defined symbols get their virtual addresses.

use crate::alignment;
use crate::alignment::Alignment;
use crate::args::Args;
use crate::error::LinkError;
use crate::error::Result;
use crate::parsing::InputObject;
use crate::pef::SectionKind;
use crate::pef::ShareKind;
use crate::symbol_db::Symbol;
use crate::symbol_db::SymbolTable;

/// Identifies an input section by position: `objects[object].sections[section]`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SectionRef {
    pub(crate) object: usize,
    pub(crate) section: usize,
}

pub(crate) struct OutputSection {
    pub(crate) kind: SectionKind,
    pub(crate) members: Vec<SectionRef>,
    pub(crate) alignment: Alignment,
    pub(crate) virtual_address: u32,
    pub(crate) size: u32,
    /// Assigned by the writer.
    pub(crate) file_offset: u32,
}

impl OutputSection {
    fn new(kind: SectionKind) -> OutputSection {
        OutputSection {
            kind,
            members: Vec::new(),
            alignment: alignment::SECTION,
            virtual_address: 0,
            size: 0,
            file_offset: 0,
        }
    }

    pub(crate) fn share_kind(&self) -> ShareKind {
        match self.kind {
            SectionKind::Code => ShareKind::Global,
            _ => ShareKind::Process,
        }
    }
}

pub(crate) struct Layout {
    /// The instantiated outputs, in their fixed order. Code and data are
    /// always present; the read-only output only when it has members.
    pub(crate) outputs: Vec<OutputSection>,
}

impl Layout {
    /// Index the loader section will have in the written container.
    pub(crate) fn loader_section_index(&self) -> usize {
        self.outputs.len()
    }
}

/// Groups sections into outputs, assigns addresses and binds symbols.
#[tracing::instrument(skip_all, name = "Layout")]
pub(crate) fn compute<'data>(
    objects: &mut [InputObject<'data>],
    symbol_table: &mut SymbolTable<'data>,
    args: &Args,
) -> Result<Layout> {
    let mut layout = group_sections(objects);
    assign_addresses(&mut layout, objects, args)?;
    bind_symbols(objects, symbol_table)?;
    Ok(layout)
}

fn group_sections(objects: &[InputObject]) -> Layout {
    let mut code = OutputSection::new(SectionKind::Code);
    let mut data = OutputSection::new(SectionKind::UnpackedData);
    let mut rodata = OutputSection::new(SectionKind::Constant);

    for (object_index, object) in objects.iter().enumerate() {
        for (section_index, section) in object.sections.iter().enumerate() {
            if !section.kind.is_mergeable() {
                continue;
            }
            let output = if section.kind.is_code_like() {
                &mut code
            } else if section.kind == SectionKind::Constant {
                &mut rodata
            } else {
                &mut data
            };
            output.members.push(SectionRef {
                object: object_index,
                section: section_index,
            });
            output.alignment = output.alignment.max(section.alignment);
        }
    }

    let mut outputs = vec![code, data];
    if !rodata.members.is_empty() {
        outputs.push(rodata);
    }
    Layout { outputs }
}

fn assign_addresses(layout: &mut Layout, objects: &mut [InputObject], args: &Args) -> Result {
    let mut cursor: u64 = 0;

    for (output_index, output) in layout.outputs.iter_mut().enumerate() {
        let base = match output.kind {
            SectionKind::Code => cursor.max(args.base_code),
            SectionKind::UnpackedData => cursor.max(args.base_data),
            _ => cursor,
        };
        let start = output.alignment.align_up(base);
        if start > u64::from(u32::MAX) {
            return Err(LinkError::reloc_overflow(
                "output image exceeds the 32-bit address space".to_owned(),
            ));
        }

        let mut offset: u64 = 0;
        for member in &output.members {
            let section = &mut objects[member.object].sections[member.section];
            offset = section.alignment.align_up(offset);
            let address = start + offset;
            if address + u64::from(section.size) > u64::from(u32::MAX) {
                return Err(LinkError::reloc_overflow(
                    "output image exceeds the 32-bit address space".to_owned(),
                ));
            }
            section.virtual_address = address as u32;
            section.output_section = Some(output_index);
            offset += u64::from(section.size);
            tracing::debug!(
                kind = ?section.kind,
                address = section.virtual_address,
                size = section.size,
                "placed section"
            );
        }

        output.virtual_address = start as u32;
        output.size = offset as u32;
        cursor = start + offset;
    }

    Ok(())
}

/// Computes the virtual address of every defined symbol now that its section
/// has one. Symbols with a negative section index are absolute and keep
/// their nominal values.
fn bind_symbols<'data>(
    objects: &[InputObject<'data>],
    symbol_table: &mut SymbolTable<'data>,
) -> Result {
    let ids: Vec<_> = symbol_table.ids().collect();
    for id in ids {
        let Symbol::Defined(defined) = *symbol_table.symbol(id) else {
            continue;
        };
        let address = if defined.section_index < 0 {
            defined.value
        } else {
            let object = objects
                .iter()
                .find(|object| object.file_id == defined.file_id)
                .ok_or_else(|| LinkError::malformed("symbol's defining file was not parsed"))?;
            let section = object
                .section_by_file_index(defined.section_index as usize)
                .ok_or_else(|| {
                    LinkError::malformed(format!(
                        "symbol {} defined in invalid section {} of {}",
                        symbol_table.name(id),
                        defined.section_index,
                        object.filename(),
                    ))
                })?;
            section.virtual_address + defined.value
        };
        let Symbol::Defined(defined) = symbol_table.symbol_mut(id) else {
            unreachable!();
        };
        defined.virtual_address = address;
    }
    Ok(())
}
