//! Expansion of pattern-initialized data sections.
//!
//! Pattern data is a small bytecode: each instruction starts with a byte
//! holding a 3-bit opcode and a 5-bit count, where a count of zero means the
//! real count follows as a variable-length integer (7 bits per byte, high bit
//! set on all but the last byte). The section merger only works with
//! unpacked bytes, so these sections are expanded as they're materialised.

use crate::error::LinkError;
use crate::error::Result;

const OP_ZERO: u8 = 0;
const OP_BLOCK_COPY: u8 = 1;
const OP_REPEATED_BLOCK: u8 = 2;
const OP_INTERLEAVE_REPEAT: u8 = 3;
const OP_INTERLEAVE_ZERO: u8 = 4;

struct Reader<'data> {
    data: &'data [u8],
    pos: usize,
}

impl<'data> Reader<'data> {
    fn byte(&mut self) -> Result<u8> {
        let b = self
            .data
            .get(self.pos)
            .copied()
            .ok_or_else(|| LinkError::malformed("pattern data ends mid-instruction"))?;
        self.pos += 1;
        Ok(b)
    }

    fn block(&mut self, len: usize) -> Result<&'data [u8]> {
        let block = self
            .data
            .get(self.pos..self.pos + len)
            .ok_or_else(|| LinkError::malformed("pattern data block out of bounds"))?;
        self.pos += len;
        Ok(block)
    }

    fn varint(&mut self) -> Result<usize> {
        let mut value = 0usize;
        loop {
            let b = self.byte()?;
            value = value
                .checked_shl(7)
                .and_then(|v| v.checked_add(usize::from(b & 0x7F)))
                .ok_or_else(|| LinkError::malformed("pattern count overflows"))?;
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
    }

    /// Reads the count attached to an instruction byte, following the
    /// zero-means-extended convention.
    fn count(&mut self, immediate: u8) -> Result<usize> {
        if immediate == 0 {
            self.varint()
        } else {
            Ok(usize::from(immediate))
        }
    }
}

/// Expands `packed` into exactly `unpacked_size` bytes.
pub(crate) fn unpack(packed: &[u8], unpacked_size: usize) -> Result<Vec<u8>> {
    let mut reader = Reader {
        data: packed,
        pos: 0,
    };
    let mut out = Vec::with_capacity(unpacked_size);

    while reader.pos < packed.len() {
        let instr = reader.byte()?;
        let opcode = instr >> 5;
        let count = reader.count(instr & 0x1F)?;

        match opcode {
            OP_ZERO => out.resize(out.len() + count, 0),
            OP_BLOCK_COPY => out.extend_from_slice(reader.block(count)?),
            OP_REPEATED_BLOCK => {
                let repeat = reader.varint()?;
                let block = reader.block(count)?;
                for _ in 0..repeat + 1 {
                    out.extend_from_slice(block);
                }
            }
            OP_INTERLEAVE_REPEAT => {
                let custom_size = reader.varint()?;
                let repeat = reader.varint()?;
                let common = reader.block(count)?;
                out.extend_from_slice(common);
                for _ in 0..repeat {
                    let custom = reader.block(custom_size)?;
                    out.extend_from_slice(custom);
                    out.extend_from_slice(common);
                }
            }
            OP_INTERLEAVE_ZERO => {
                let custom_size = reader.varint()?;
                let repeat = reader.varint()?;
                out.resize(out.len() + count, 0);
                for _ in 0..repeat {
                    let custom = reader.block(custom_size)?;
                    out.extend_from_slice(custom);
                    out.resize(out.len() + count, 0);
                }
            }
            other => {
                return Err(LinkError::malformed(format!(
                    "invalid pattern data opcode {other}"
                )))
            }
        }

        if out.len() > unpacked_size {
            return Err(LinkError::malformed(
                "pattern data expands past the declared unpacked size",
            ));
        }
    }

    if out.len() != unpacked_size {
        return Err(LinkError::malformed(format!(
            "pattern data expanded to {} bytes, expected {unpacked_size}",
            out.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_run() {
        assert_eq!(unpack(&[0x05], 5).unwrap(), vec![0; 5]);
    }

    #[test]
    fn block_copy() {
        let packed = [0x23, 0xAA, 0xBB, 0xCC];
        assert_eq!(unpack(&packed, 3).unwrap(), vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn repeated_block() {
        // Two-byte block, repeat count 2 => three copies.
        let packed = [0x42, 0x02, 0x12, 0x34];
        assert_eq!(
            unpack(&packed, 6).unwrap(),
            vec![0x12, 0x34, 0x12, 0x34, 0x12, 0x34]
        );
    }

    #[test]
    fn extended_count() {
        // Count of 0 in the instruction byte, 130 encoded as a varint.
        let packed = [0x00, 0x81, 0x02];
        assert_eq!(unpack(&packed, 130).unwrap(), vec![0; 130]);
    }

    #[test]
    fn interleave_zero() {
        // Two zeros around two one-byte custom blocks.
        let packed = [0x82, 0x01, 0x02, 0xFF, 0xEE];
        assert_eq!(
            unpack(&packed, 8).unwrap(),
            vec![0, 0, 0xFF, 0, 0, 0xEE, 0, 0]
        );
    }

    #[test]
    fn interleave_repeat() {
        let packed = [0x61, 0x01, 0x01, 0xAB, 0xCD];
        assert_eq!(unpack(&packed, 3).unwrap(), vec![0xAB, 0xCD, 0xAB]);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        assert!(unpack(&[0x05], 4).is_err());
        assert!(unpack(&[0x05], 6).is_err());
    }

    #[test]
    fn truncated_block_is_rejected() {
        assert!(unpack(&[0x24, 0xAA], 4).is_err());
    }
}
