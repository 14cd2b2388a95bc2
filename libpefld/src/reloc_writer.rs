//! Regenerates the relocation bytecode for the output container. Each input
//! section's stream is decoded, its positions rebased to the section's place
//! in the merged output, its section references remapped to output section
//! indices, and its import references either renumbered to the global import
//! order or, when the symbol resolved to a local definition, converted into
//! a section-relative fixup plus a patch of the 32-bit word.

use crate::error::LinkError;
use crate::error::Result;
use crate::layout::Layout;
use crate::parsing::InputObject;
use crate::parsing::InputSection;
use crate::pef;
use crate::pef::SectionKind;
use crate::relocations;
use crate::relocations::RelocInstruction;
use crate::symbol_db::Symbol;
use crate::symbol_db::SymbolTable;

/// A 32-bit big-endian store into an output section, applied by the writer
/// after section bodies have been copied.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WordFixup {
    pub(crate) output_section: usize,
    /// Byte offset within the output section.
    pub(crate) offset: u32,
    pub(crate) value: u32,
}

pub(crate) struct RelocOutput {
    pub(crate) headers: Vec<pef::LoaderRelocationHeader>,
    pub(crate) instruction_bytes: Vec<u8>,
    pub(crate) fixups: Vec<WordFixup>,
}

/// Emits instructions for one relocated output section, tracking the state
/// the runtime loader will be in: current position plus the section indices
/// held in the C and D registers. SetPosition and SmSetSect instructions are
/// materialised only when the natural state doesn't already match.
struct Encoder {
    instructions: Vec<RelocInstruction>,
    position: u32,
    sect_c: u16,
    sect_d: u16,
}

impl Encoder {
    fn new() -> Encoder {
        // The loader starts each section's program with the code output in
        // the C register and the data output in the D register; those are
        // always output sections 0 and 1.
        Encoder {
            instructions: Vec::new(),
            position: 0,
            sect_c: 0,
            sect_d: 1,
        }
    }

    fn set_position(&mut self, position: u32) -> Result {
        if self.position != position {
            if position > relocations::MAX_POSITION {
                return Err(LinkError::reloc_overflow(format!(
                    "relocation position 0x{position:x} cannot be encoded"
                )));
            }
            self.instructions
                .push(RelocInstruction::SetPosition { offset: position });
            self.position = position;
        }
        Ok(())
    }

    fn by_section(&mut self, output_index: usize, code_like: bool, run: u16) -> Result {
        let index = u16::try_from(output_index)
            .map_err(|_| LinkError::reloc_overflow("output section index".to_owned()))?;
        if code_like {
            if self.sect_c != index {
                self.instructions
                    .push(RelocInstruction::SmSetSectC { section: index });
                self.sect_c = index;
            }
            self.instructions.push(RelocInstruction::BySectC { run });
        } else {
            if self.sect_d != index {
                self.instructions
                    .push(RelocInstruction::SmSetSectD { section: index });
                self.sect_d = index;
            }
            self.instructions.push(RelocInstruction::BySectD { run });
        }
        self.position += 4 * (u32::from(run) + 1);
        Ok(())
    }

    fn by_import(&mut self, index: u32) {
        if index < 256 {
            self.instructions.push(RelocInstruction::SmByImport {
                index: index as u16,
            });
        } else {
            self.instructions.push(RelocInstruction::LgByImport { index });
        }
        self.position += 4;
    }
}

#[tracing::instrument(skip_all, name = "Generate relocations")]
pub(crate) fn generate<'data>(
    objects: &[InputObject<'data>],
    layout: &Layout,
    symbol_table: &SymbolTable<'data>,
) -> Result<RelocOutput> {
    let mut headers = Vec::new();
    let mut instruction_bytes = Vec::new();
    let mut fixups = Vec::new();

    for (output_index, output) in layout.outputs.iter().enumerate() {
        let mut encoder = Encoder::new();

        for member in &output.members {
            let object = &objects[member.object];
            let section = &object.sections[member.section];
            if section.relocations.is_empty() {
                continue;
            }
            process_section(
                objects,
                layout,
                symbol_table,
                object,
                section,
                output_index,
                &mut encoder,
                &mut fixups,
            )?;
        }

        if encoder.instructions.is_empty() {
            continue;
        }
        let bytes = relocations::encode_stream(&encoder.instructions)?;
        headers.push(pef::LoaderRelocationHeader {
            section_index: output_index as u16,
            reserved: 0,
            reloc_count: (bytes.len() / 2) as u32,
            first_reloc_offset: instruction_bytes.len() as u32,
        });
        instruction_bytes.extend_from_slice(&bytes);
        tracing::debug!(
            section = output_index,
            words = bytes.len() / 2,
            "regenerated relocations"
        );
    }

    Ok(RelocOutput {
        headers,
        instruction_bytes,
        fixups,
    })
}

/// The decoder side of the state machine for one input section's stream.
struct StreamState {
    /// Current byte position within the *output* section being relocated.
    position: u32,
    /// Offset of the input section within its output section.
    base: u32,
    /// Input-file section indices currently in the C and D registers.
    sect_c: Option<usize>,
    sect_d: Option<usize>,
    /// Import index that an ImportRun would continue from.
    import_counter: u32,
}

#[allow(clippy::too_many_arguments)]
fn process_section<'data>(
    objects: &[InputObject<'data>],
    layout: &Layout,
    symbol_table: &SymbolTable<'data>,
    object: &InputObject<'data>,
    section: &InputSection<'data>,
    output_index: usize,
    encoder: &mut Encoder,
    fixups: &mut Vec<WordFixup>,
) -> Result {
    let instructions = relocations::decode_stream(section.relocations)?;
    let base = section.virtual_address - layout.outputs[output_index].virtual_address;

    let mut state = StreamState {
        position: base,
        base,
        sect_c: first_section_of(object, |kind| kind.is_code_like()),
        sect_d: first_section_of(object, |kind| {
            matches!(kind, SectionKind::UnpackedData | SectionKind::PatternData)
        }),
        import_counter: 0,
    };

    for instruction in instructions {
        match instruction {
            RelocInstruction::BySectC { run } => {
                let target = state.sect_c;
                relocate_by_section(
                    layout, object, section, &mut state, encoder, fixups, output_index, target,
                    run,
                )?;
            }
            RelocInstruction::BySectD { run } => {
                let target = state.sect_d;
                relocate_by_section(
                    layout, object, section, &mut state, encoder, fixups, output_index, target,
                    run,
                )?;
            }
            RelocInstruction::TVector12 { run } => {
                for _ in 0..=run {
                    let (c, d) = (state.sect_c, state.sect_d);
                    relocate_by_section(
                        layout, object, section, &mut state, encoder, fixups, output_index, c, 0,
                    )?;
                    relocate_by_section(
                        layout, object, section, &mut state, encoder, fixups, output_index, d, 0,
                    )?;
                    state.position += 4;
                }
            }
            RelocInstruction::TVector8 { run } => {
                for _ in 0..=run {
                    let (c, d) = (state.sect_c, state.sect_d);
                    relocate_by_section(
                        layout, object, section, &mut state, encoder, fixups, output_index, c, 0,
                    )?;
                    relocate_by_section(
                        layout, object, section, &mut state, encoder, fixups, output_index, d, 0,
                    )?;
                }
            }
            RelocInstruction::VTable8 { run } => {
                for _ in 0..=run {
                    let d = state.sect_d;
                    relocate_by_section(
                        layout, object, section, &mut state, encoder, fixups, output_index, d, 0,
                    )?;
                    state.position += 4;
                }
            }
            RelocInstruction::SmByImport { index } => {
                relocate_import(
                    objects, layout, symbol_table, object, section, &mut state, encoder, fixups,
                    output_index, u32::from(index),
                )?;
                state.import_counter = u32::from(index) + 1;
            }
            RelocInstruction::LgByImport { index } => {
                relocate_import(
                    objects, layout, symbol_table, object, section, &mut state, encoder, fixups,
                    output_index, index,
                )?;
                state.import_counter = index + 1;
            }
            RelocInstruction::ImportRun { run } => {
                for _ in 0..=run {
                    let index = state.import_counter;
                    relocate_import(
                        objects, layout, symbol_table, object, section, &mut state, encoder,
                        fixups, output_index, index,
                    )?;
                    state.import_counter += 1;
                }
            }
            RelocInstruction::SmSetSectC { section } => {
                state.sect_c = Some(usize::from(section));
            }
            RelocInstruction::SmSetSectD { section } => {
                state.sect_d = Some(usize::from(section));
            }
            RelocInstruction::SetPosition { offset } => {
                state.position = state.base + offset;
            }
        }
    }
    Ok(())
}

fn first_section_of(object: &InputObject, matches: impl Fn(SectionKind) -> bool) -> Option<usize> {
    object
        .sections
        .iter()
        .find(|section| matches(section.kind))
        .map(|section| section.file_index)
}

/// Reads the 32-bit word a fixup refers to from the input section's bytes.
/// Positions in the zero-filled tail read as zero.
fn original_word(section: &InputSection, local: u32) -> u32 {
    let local = local as usize;
    match section.data.get(local..local + 4) {
        Some(bytes) => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        None => 0,
    }
}

/// Checks that a run of words lies inside the input section, and returns the
/// position of the first word relative to the input section's start.
fn local_position(section: &InputSection, state: &StreamState, words: u32) -> Result<u32> {
    let local = state.position.checked_sub(state.base).ok_or_else(|| {
        LinkError::reloc_overflow("relocation position before section start".to_owned())
    })?;
    if u64::from(local) + u64::from(words) * 4 > u64::from(section.size) {
        return Err(LinkError::reloc_overflow(format!(
            "relocation at 0x{local:x} runs past the section's 0x{:x} bytes",
            section.size
        )));
    }
    Ok(local)
}

#[allow(clippy::too_many_arguments)]
fn relocate_by_section(
    layout: &Layout,
    object: &InputObject,
    section: &InputSection,
    state: &mut StreamState,
    encoder: &mut Encoder,
    fixups: &mut Vec<WordFixup>,
    output_index: usize,
    target_file_index: Option<usize>,
    run: u16,
) -> Result {
    let target_file_index = target_file_index.ok_or_else(|| {
        LinkError::reloc_overflow(format!(
            "section-relative relocation in {} has no target section",
            object.filename()
        ))
    })?;
    let target = object
        .section_by_file_index(target_file_index)
        .and_then(|target| Some((target, target.output_section?)))
        .ok_or_else(|| {
            LinkError::reloc_overflow(format!(
                "relocation references unmapped section {target_file_index} in {}",
                object.filename()
            ))
        })?;
    let (target_section, target_output) = target;
    let delta = target_section.virtual_address - layout.outputs[target_output].virtual_address;

    let local = local_position(section, state, u32::from(run) + 1)?;
    encoder.set_position(state.position)?;
    encoder.by_section(
        target_output,
        layout.outputs[target_output].kind.is_code_like(),
        run,
    )?;

    // Fixup offsets are relative to the output section, which the stream
    // position already is since the member base was folded in.
    if delta != 0 {
        for k in 0..=u32::from(run) {
            fixups.push(WordFixup {
                output_section: output_index,
                offset: state.position + k * 4,
                value: original_word(section, local + k * 4).wrapping_add(delta),
            });
        }
    }
    state.position += 4 * (u32::from(run) + 1);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn relocate_import(
    objects: &[InputObject],
    layout: &Layout,
    symbol_table: &SymbolTable,
    object: &InputObject,
    section: &InputSection,
    state: &mut StreamState,
    encoder: &mut Encoder,
    fixups: &mut Vec<WordFixup>,
    output_index: usize,
    old_index: u32,
) -> Result {
    let import = object.imports.get(old_index as usize).ok_or_else(|| {
        LinkError::malformed(format!(
            "relocation references import {old_index} of {}",
            object.filename()
        ))
    })?;
    let id = symbol_table.find(import.name).ok_or_else(|| {
        LinkError::malformed(format!(
            "import {} was never registered",
            String::from_utf8_lossy(import.name)
        ))
    })?;
    let local = local_position(section, state, 1)?;

    match *symbol_table.symbol(id) {
        Symbol::Imported(imported) => {
            let index = imported.import_index.ok_or_else(|| {
                LinkError::reloc_overflow("import used before collation".to_owned())
            })?;
            encoder.set_position(state.position)?;
            encoder.by_import(index);
            state.position += 4;
        }
        Symbol::Defined(defined) => {
            // The reference resolved locally. Patch the word so it carries
            // the symbol's offset within its output section and emit a
            // section-relative fixup; the runtime loader then rebases it
            // like any other local reference. Absolute symbols are patched
            // in full and need no relocation.
            if defined.section_index >= 0 {
                let target_output = objects
                    .iter()
                    .find(|candidate| candidate.file_id == defined.file_id)
                    .and_then(|candidate| {
                        candidate.section_by_file_index(defined.section_index as usize)
                    })
                    .and_then(|target| target.output_section)
                    .ok_or_else(|| {
                        LinkError::reloc_overflow(format!(
                            "symbol {} resolved to an unmapped section",
                            symbol_table.name(id)
                        ))
                    })?;
                let section_relative =
                    defined.virtual_address - layout.outputs[target_output].virtual_address;
                fixups.push(WordFixup {
                    output_section: output_index,
                    offset: state.position,
                    value: original_word(section, local).wrapping_add(section_relative),
                });
                encoder.set_position(state.position)?;
                encoder.by_section(
                    target_output,
                    layout.outputs[target_output].kind.is_code_like(),
                    0,
                )?;
            } else {
                fixups.push(WordFixup {
                    output_section: output_index,
                    offset: state.position,
                    value: original_word(section, local).wrapping_add(defined.virtual_address),
                });
            }
            state.position += 4;
        }
        // Unresolved weak import: the word is left alone and no relocation
        // is emitted, so it loads as its addend.
        Symbol::Undefined(_) => state.position += 4,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment;
    use crate::args::Args;
    use crate::input_data::FileId;
    use crate::input_data::InputFile;
    use crate::layout;
    use crate::pef::Architecture;
    use std::borrow::Cow;

    fn section<'data>(
        file_index: usize,
        kind: SectionKind,
        data: &'data [u8],
        relocations: &'data [u8],
    ) -> InputSection<'data> {
        InputSection {
            file_index,
            kind,
            alignment: alignment::SECTION,
            size: data.len() as u32,
            data: Cow::Borrowed(data),
            relocations,
            virtual_address: 0,
            output_section: None,
        }
    }

    fn object<'data>(
        input: &'data InputFile,
        sections: Vec<InputSection<'data>>,
    ) -> InputObject<'data> {
        InputObject {
            file_id: FileId(0),
            input,
            architecture: Architecture::PowerPC,
            sections,
            exports: Vec::new(),
            imports: Vec::new(),
        }
    }

    #[test]
    fn stream_at_origin_reencodes_identically() {
        let input = InputFile::for_tests("a.o");
        let code = [0u8; 8];
        let stream =
            relocations::encode_stream(&[RelocInstruction::BySectC { run: 1 }]).unwrap();
        let mut objects = [object(&input, vec![section(0, SectionKind::Code, &code, &stream)])];
        let mut symbols = SymbolTable::new();
        let layout = layout::compute(&mut objects, &mut symbols, &Args::default()).unwrap();

        let out = generate(&objects, &layout, &symbols).unwrap();
        assert_eq!(out.instruction_bytes, stream);
        assert!(out.fixups.is_empty());
        assert_eq!(out.headers.len(), 1);
        assert_eq!(out.headers[0].section_index, 0);
        assert_eq!(out.headers[0].reloc_count, 1);
        assert_eq!(out.headers[0].first_reloc_offset, 0);
    }

    #[test]
    fn merged_members_are_rebased() {
        let input = InputFile::for_tests("a.o");
        let first = 4u32.to_be_bytes().repeat(2);
        let second = [0u8; 8];
        // The first section's word points into the second section, which
        // moves to offset 16 when the two are merged.
        let to_second = relocations::encode_stream(&[
            RelocInstruction::SmSetSectC { section: 1 },
            RelocInstruction::BySectC { run: 0 },
        ])
        .unwrap();
        let at_origin =
            relocations::encode_stream(&[RelocInstruction::BySectC { run: 0 }]).unwrap();
        let mut objects = [object(
            &input,
            vec![
                section(0, SectionKind::Code, &first, &to_second),
                section(1, SectionKind::Code, &second, &at_origin),
            ],
        )];
        let mut symbols = SymbolTable::new();
        let layout = layout::compute(&mut objects, &mut symbols, &Args::default()).unwrap();

        let out = generate(&objects, &layout, &symbols).unwrap();
        let decoded = relocations::decode_stream(&out.instruction_bytes).unwrap();
        // Both members relocate through the code output, which is already in
        // the C register; only the second member needs a position change.
        assert_eq!(
            decoded,
            vec![
                RelocInstruction::BySectC { run: 0 },
                RelocInstruction::SetPosition { offset: 16 },
                RelocInstruction::BySectC { run: 0 },
            ]
        );
        // The word pointing into the moved section gains its displacement.
        assert_eq!(out.fixups.len(), 1);
        assert_eq!(out.fixups[0].offset, 0);
        assert_eq!(out.fixups[0].value, 4 + 16);
    }

    #[test]
    fn tvector8_expands_to_section_relative_pairs() {
        let input = InputFile::for_tests("a.o");
        let code = [0u8; 8];
        let data = [0u8; 8];
        let stream =
            relocations::encode_stream(&[RelocInstruction::TVector8 { run: 0 }]).unwrap();
        let mut objects = [object(
            &input,
            vec![
                section(0, SectionKind::Code, &code, &[]),
                section(1, SectionKind::UnpackedData, &data, &stream),
            ],
        )];
        let mut symbols = SymbolTable::new();
        let layout = layout::compute(&mut objects, &mut symbols, &Args::default()).unwrap();

        let out = generate(&objects, &layout, &symbols).unwrap();
        let decoded = relocations::decode_stream(&out.instruction_bytes).unwrap();
        assert_eq!(
            decoded,
            vec![
                RelocInstruction::BySectC { run: 0 },
                RelocInstruction::BySectD { run: 0 },
            ]
        );
        assert_eq!(out.headers[0].section_index, 1);
    }
}
