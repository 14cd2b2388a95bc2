//! The container writer: assigns file offsets, then emits the container
//! header, the section headers, the section bodies (with relocation fixups
//! applied) and the loader section as one big-endian image.

use crate::alignment;
use crate::args::Args;
use crate::error::LinkError;
use crate::error::Result;
use crate::file_writer;
use crate::layout::Layout;
use crate::parsing::InputObject;
use crate::pef;
use crate::pef::Architecture;
use crate::pef::SectionKind;
use crate::pef::ShareKind;
use crate::reloc_writer::WordFixup;

#[tracing::instrument(skip_all, name = "Write output file")]
pub(crate) fn write<'data>(
    args: &Args,
    objects: &[InputObject<'data>],
    layout: &mut Layout,
    architecture: Architecture,
    loader_bytes: &[u8],
    fixups: &[WordFixup],
) -> Result {
    let loader_offset = assign_file_offsets(layout);
    let file_size = loader_offset + loader_bytes.len() as u64;

    let output = file_writer::Output::new(&args.output);
    let mut sized_output = output.create(file_size)?;
    let buffer = &mut *sized_output.out;

    write_headers(buffer, layout, architecture, loader_offset, loader_bytes.len());
    write_section_bodies(buffer, objects, layout);
    apply_fixups(buffer, layout, fixups)?;
    buffer[loader_offset as usize..loader_offset as usize + loader_bytes.len()]
        .copy_from_slice(loader_bytes);

    sized_output.commit()?;
    tracing::debug!(size = file_size, output = %args.output.display(), "wrote container");
    Ok(())
}

/// Lays the file out: container header, section headers, then each section
/// body and finally the loader section, all 16-byte aligned. Returns the
/// loader section's file offset.
fn assign_file_offsets(layout: &mut Layout) -> u64 {
    let header_count = layout.loader_section_index() + 1;
    let mut offset =
        (pef::ContainerHeader::SIZE + header_count * pef::SectionHeader::SIZE) as u64;

    for output in &mut layout.outputs {
        offset = alignment::SECTION.align_up(offset);
        output.file_offset = offset as u32;
        offset += u64::from(output.size);
    }

    alignment::SECTION.align_up(offset)
}

fn write_headers(
    buffer: &mut [u8],
    layout: &Layout,
    architecture: Architecture,
    loader_offset: u64,
    loader_len: usize,
) {
    let mut out = Vec::with_capacity(
        pef::ContainerHeader::SIZE + (layout.outputs.len() + 1) * pef::SectionHeader::SIZE,
    );

    pef::ContainerHeader {
        tag1: pef::TAG1,
        tag2: pef::TAG2,
        architecture: architecture.tag(),
        format_version: pef::FORMAT_VERSION,
        date_time_stamp: 0,
        old_def_version: 0,
        old_imp_version: 0,
        current_version: 0,
        section_count: (layout.outputs.len() + 1) as u16,
        inst_section_count: layout.outputs.len() as u16,
        reserved: 0,
    }
    .write(&mut out);

    for output in &layout.outputs {
        pef::SectionHeader {
            name_offset: -1,
            default_address: output.virtual_address,
            total_length: output.size,
            unpacked_length: output.size,
            container_length: output.size,
            container_offset: output.file_offset,
            kind: output.kind.as_u8(),
            share_kind: output.share_kind().as_u8(),
            alignment: output.alignment.exponent,
            reserved: 0,
        }
        .write(&mut out);
    }

    pef::SectionHeader {
        name_offset: -1,
        default_address: 0,
        total_length: loader_len as u32,
        unpacked_length: loader_len as u32,
        container_length: loader_len as u32,
        container_offset: loader_offset as u32,
        kind: SectionKind::Loader.as_u8(),
        share_kind: ShareKind::Global.as_u8(),
        alignment: alignment::SECTION.exponent,
        reserved: 0,
    }
    .write(&mut out);

    buffer[..out.len()].copy_from_slice(&out);
}

fn write_section_bodies(buffer: &mut [u8], objects: &[InputObject], layout: &Layout) {
    for output in &layout.outputs {
        for member in &output.members {
            let section = &objects[member.object].sections[member.section];
            let start = output.file_offset as usize
                + (section.virtual_address - output.virtual_address) as usize;
            buffer[start..start + section.data.len()].copy_from_slice(&section.data);
        }
    }
}

fn apply_fixups(buffer: &mut [u8], layout: &Layout, fixups: &[WordFixup]) -> Result {
    for fixup in fixups {
        let output = &layout.outputs[fixup.output_section];
        if u64::from(fixup.offset) + 4 > u64::from(output.size) {
            return Err(LinkError::reloc_overflow(format!(
                "fixup at 0x{:x} outside section of 0x{:x} bytes",
                fixup.offset, output.size
            )));
        }
        let start = output.file_offset as usize + fixup.offset as usize;
        buffer[start..start + 4].copy_from_slice(&fixup.value.to_be_bytes());
    }
    Ok(())
}
