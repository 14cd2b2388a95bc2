//! The PEF relocation bytecode.
//!
//! Relocation instructions are 16-bit big-endian words with the opcode in
//! the high 6 bits and an operand in the low 10; a few instructions carry a
//! 16-bit tail in a following word. The stream drives a little state machine
//! in the runtime loader: a byte position within the section being relocated,
//! the current "code" and "data" section indices, and a running import
//! index. We decode input streams to learn which words reference which
//! sections and imports, and re-encode an equivalent stream for the output.

use crate::error::LinkError;
use crate::error::Result;

pub(crate) const OPCODE_SET_POSITION: u16 = 0x08;
pub(crate) const OPCODE_LG_BY_IMPORT: u16 = 0x12;
pub(crate) const OPCODE_LG_REPEAT: u16 = 0x18;
pub(crate) const OPCODE_BY_SECT_C: u16 = 0x20;
pub(crate) const OPCODE_BY_SECT_D: u16 = 0x21;
pub(crate) const OPCODE_TVECTOR12: u16 = 0x22;
pub(crate) const OPCODE_TVECTOR8: u16 = 0x23;
pub(crate) const OPCODE_VTABLE8: u16 = 0x24;
pub(crate) const OPCODE_IMPORT_RUN: u16 = 0x25;
pub(crate) const OPCODE_SM_REPEAT: u16 = 0x28;
pub(crate) const OPCODE_SM_SET_SECT_C: u16 = 0x29;
pub(crate) const OPCODE_SM_SET_SECT_D: u16 = 0x2A;
pub(crate) const OPCODE_SM_BY_IMPORT: u16 = 0x2B;

/// Largest position expressible by SetPosition (10 high bits + 16 low bits).
pub(crate) const MAX_POSITION: u32 = (1 << 26) - 1;

/// Largest import index expressible by LgByImport.
pub(crate) const MAX_IMPORT_INDEX: u32 = (1 << 26) - 1;

/// Largest run operand; runs patch `run + 1` words.
pub(crate) const MAX_RUN: u16 = 0x3FF;

/// A decoded relocation instruction. Repeat instructions don't appear here;
/// the decoder replays them into the instructions they stand for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelocInstruction {
    /// Add the code section's base to `run + 1` consecutive words.
    BySectC { run: u16 },
    /// Add the data section's base to `run + 1` consecutive words.
    BySectD { run: u16 },
    /// `run + 1` twelve-byte transition vectors: patch a code word and a
    /// data word, then skip four bytes.
    TVector12 { run: u16 },
    /// `run + 1` eight-byte transition vectors: patch a code word then a
    /// data word.
    TVector8 { run: u16 },
    /// `run + 1` eight-byte vtable entries: patch a data word, skip four.
    VTable8 { run: u16 },
    /// Patch `run + 1` words with consecutively numbered imports, continuing
    /// from the state machine's import counter.
    ImportRun { run: u16 },
    /// Patch the next word with the address of the numbered import.
    SmByImport { index: u16 },
    SmSetSectC { section: u16 },
    SmSetSectD { section: u16 },
    /// Move the relocation position to a byte offset within the section.
    SetPosition { offset: u32 },
    LgByImport { index: u32 },
}

impl RelocInstruction {
    pub(crate) fn encode(self, out: &mut Vec<u16>) -> Result {
        match self {
            RelocInstruction::BySectC { run } => out.push(compose(OPCODE_BY_SECT_C, run)?),
            RelocInstruction::BySectD { run } => out.push(compose(OPCODE_BY_SECT_D, run)?),
            RelocInstruction::TVector12 { run } => out.push(compose(OPCODE_TVECTOR12, run)?),
            RelocInstruction::TVector8 { run } => out.push(compose(OPCODE_TVECTOR8, run)?),
            RelocInstruction::VTable8 { run } => out.push(compose(OPCODE_VTABLE8, run)?),
            RelocInstruction::ImportRun { run } => out.push(compose(OPCODE_IMPORT_RUN, run)?),
            RelocInstruction::SmByImport { index } => out.push(compose(OPCODE_SM_BY_IMPORT, index)?),
            RelocInstruction::SmSetSectC { section } => {
                out.push(compose(OPCODE_SM_SET_SECT_C, section)?);
            }
            RelocInstruction::SmSetSectD { section } => {
                out.push(compose(OPCODE_SM_SET_SECT_D, section)?);
            }
            RelocInstruction::SetPosition { offset } => {
                if offset > MAX_POSITION {
                    return Err(LinkError::reloc_overflow(format!(
                        "position 0x{offset:x} cannot be encoded"
                    )));
                }
                out.push(compose(OPCODE_SET_POSITION, (offset >> 16) as u16)?);
                out.push(offset as u16);
            }
            RelocInstruction::LgByImport { index } => {
                if index > MAX_IMPORT_INDEX {
                    return Err(LinkError::reloc_overflow(format!(
                        "import index {index} cannot be encoded"
                    )));
                }
                out.push(compose(OPCODE_LG_BY_IMPORT, (index >> 16) as u16)?);
                out.push(index as u16);
            }
        }
        Ok(())
    }
}

fn compose(opcode: u16, operand: u16) -> Result<u16> {
    if operand > MAX_RUN {
        return Err(LinkError::reloc_overflow(format!(
            "relocation operand 0x{operand:x} exceeds 10 bits"
        )));
    }
    Ok((opcode << 10) | operand)
}

/// Upper bound on decoded instructions; repeat counts make it possible to
/// describe absurd expansions in a few bytes.
const MAX_DECODED: usize = 1 << 22;

/// Decodes a raw big-endian instruction stream, replaying repeats.
pub(crate) fn decode_stream(bytes: &[u8]) -> Result<Vec<RelocInstruction>> {
    if bytes.len() % 2 != 0 {
        return Err(LinkError::malformed("odd-length relocation stream"));
    }
    let words: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();

    let mut out = Vec::new();
    let mut i = 0;
    let tail = |i: &mut usize| -> Result<u16> {
        *i += 1;
        words.get(*i).copied().ok_or_else(|| {
            LinkError::malformed("relocation instruction is missing its second word")
        })
    };

    while i < words.len() {
        let word = words[i];
        let opcode = word >> 10;
        let operand = word & 0x3FF;

        match opcode {
            OPCODE_BY_SECT_C => out.push(RelocInstruction::BySectC { run: operand }),
            OPCODE_BY_SECT_D => out.push(RelocInstruction::BySectD { run: operand }),
            OPCODE_TVECTOR12 => out.push(RelocInstruction::TVector12 { run: operand }),
            OPCODE_TVECTOR8 => out.push(RelocInstruction::TVector8 { run: operand }),
            OPCODE_VTABLE8 => out.push(RelocInstruction::VTable8 { run: operand }),
            OPCODE_IMPORT_RUN => out.push(RelocInstruction::ImportRun { run: operand }),
            OPCODE_SM_BY_IMPORT => out.push(RelocInstruction::SmByImport { index: operand }),
            OPCODE_SM_SET_SECT_C => out.push(RelocInstruction::SmSetSectC { section: operand }),
            OPCODE_SM_SET_SECT_D => out.push(RelocInstruction::SmSetSectD { section: operand }),
            OPCODE_SET_POSITION => {
                let low = tail(&mut i)?;
                out.push(RelocInstruction::SetPosition {
                    offset: (u32::from(operand) << 16) | u32::from(low),
                });
            }
            OPCODE_LG_BY_IMPORT => {
                let low = tail(&mut i)?;
                out.push(RelocInstruction::LgByImport {
                    index: (u32::from(operand) << 16) | u32::from(low),
                });
            }
            OPCODE_SM_REPEAT => {
                let blocks = usize::from(operand >> 6) + 1;
                let count = usize::from(operand & 0x3F) + 1;
                replay(&mut out, blocks, count)?;
            }
            OPCODE_LG_REPEAT => {
                let blocks = usize::from(operand >> 6) + 1;
                let low = tail(&mut i)?;
                let count = ((usize::from(operand & 0x3F) << 16) | usize::from(low)) + 1;
                replay(&mut out, blocks, count)?;
            }
            other => {
                return Err(LinkError::malformed(format!(
                    "invalid relocation opcode 0x{other:02x}"
                )))
            }
        }

        if out.len() > MAX_DECODED {
            return Err(LinkError::reloc_overflow(
                "relocation stream expands beyond supported size".to_owned(),
            ));
        }
        i += 1;
    }
    Ok(out)
}

/// Appends the previous `blocks` decoded instructions `count` more times.
fn replay(out: &mut Vec<RelocInstruction>, blocks: usize, count: usize) -> Result {
    if blocks > out.len() {
        return Err(LinkError::malformed(
            "repeat instruction reaches before the start of the stream",
        ));
    }
    if count.saturating_mul(blocks) > MAX_DECODED {
        return Err(LinkError::reloc_overflow(
            "repeat instruction expands beyond supported size".to_owned(),
        ));
    }
    let start = out.len() - blocks;
    for _ in 0..count {
        out.extend_from_within(start..start + blocks);
    }
    Ok(())
}

/// Serialises instructions back into big-endian bytes.
pub(crate) fn encode_stream(instructions: &[RelocInstruction]) -> Result<Vec<u8>> {
    let mut words = Vec::with_capacity(instructions.len());
    for instruction in instructions {
        instruction.encode(&mut words)?;
    }
    let mut bytes = Vec::with_capacity(words.len() * 2);
    for word in words {
        bytes.extend_from_slice(&word.to_be_bytes());
    }
    Ok(bytes)
}

/// Returns the import indices a stream references, in reference order.
/// ImportRun continues numbering from the most recent explicit import.
pub(crate) fn referenced_import_indices(instructions: &[RelocInstruction]) -> Vec<u32> {
    let mut indices = Vec::new();
    let mut counter = 0u32;
    for instruction in instructions {
        match *instruction {
            RelocInstruction::SmByImport { index } => {
                indices.push(u32::from(index));
                counter = u32::from(index) + 1;
            }
            RelocInstruction::LgByImport { index } => {
                indices.push(index);
                counter = index + 1;
            }
            RelocInstruction::ImportRun { run } => {
                for _ in 0..u32::from(run) + 1 {
                    indices.push(counter);
                    counter += 1;
                }
            }
            _ => {}
        }
    }
    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(instructions: &[RelocInstruction]) {
        let bytes = encode_stream(instructions).unwrap();
        assert_eq!(decode_stream(&bytes).unwrap(), instructions);
    }

    #[test]
    fn decode_encode_round_trip() {
        round_trip(&[
            RelocInstruction::SetPosition { offset: 0x12_3456 },
            RelocInstruction::BySectC { run: 0 },
            RelocInstruction::BySectD { run: 17 },
            RelocInstruction::SmByImport { index: 3 },
            RelocInstruction::LgByImport { index: 0x1_0002 },
            RelocInstruction::SmSetSectC { section: 2 },
            RelocInstruction::TVector12 { run: 1 },
            RelocInstruction::ImportRun { run: 4 },
        ]);
    }

    #[test]
    fn small_repeat_replays() {
        // BySectC(0), then repeat the previous instruction twice more.
        let words = [
            (OPCODE_BY_SECT_C << 10),
            (OPCODE_SM_REPEAT << 10) | 0x001,
        ];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
        assert_eq!(
            decode_stream(&bytes).unwrap(),
            vec![RelocInstruction::BySectC { run: 0 }; 3]
        );
    }

    #[test]
    fn large_repeat_replays() {
        let words = [
            (OPCODE_BY_SECT_D << 10) | 2,
            (OPCODE_LG_REPEAT << 10),
            0x0003,
        ];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
        assert_eq!(
            decode_stream(&bytes).unwrap(),
            vec![RelocInstruction::BySectD { run: 2 }; 5]
        );
    }

    #[test]
    fn import_scan_follows_runs() {
        let instructions = [
            RelocInstruction::SmByImport { index: 5 },
            RelocInstruction::ImportRun { run: 1 },
            RelocInstruction::LgByImport { index: 100 },
        ];
        assert_eq!(referenced_import_indices(&instructions), vec![5, 6, 7, 100]);
    }

    #[test]
    fn rejects_truncated_two_word_instruction() {
        let word = OPCODE_SET_POSITION << 10;
        assert!(decode_stream(&word.to_be_bytes()).is_err());
    }

    #[test]
    fn rejects_unknown_opcode() {
        let word = 0x3Fu16 << 10;
        assert!(decode_stream(&word.to_be_bytes()).is_err());
    }

    #[test]
    fn rejects_oversized_operand() {
        let mut out = Vec::new();
        assert!(RelocInstruction::BySectC { run: 0x400 }.encode(&mut out).is_err());
    }
}
