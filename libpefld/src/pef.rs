//! The PEF (Preferred Executable Format) on-disk model: container structures,
//! tag values and the big-endian codecs for reading and writing them.
//!
//! All multi-byte integers are big-endian on disk. The structures are packed
//! and unaligned, so every field is read and written individually; nothing in
//! this crate reinterprets raw bytes as a structure.

use crate::error::LinkError;
use crate::error::Result;

/// First magic tag, 'Joy!'.
pub const TAG1: u32 = 0x4A6F_7921;

/// Second magic tag, 'peff'.
pub const TAG2: u32 = 0x7065_6666;

/// The only container format version we understand.
pub const FORMAT_VERSION: u32 = 1;

/// Number of hash-slot bits; the slot table never exceeds 2^16 entries.
pub const EXPONENT_LIMIT: u32 = 16;

/// Average export hash chain length used when sizing the slot table.
pub const AVERAGE_CHAIN_LENGTH: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    PowerPC,
    M68k,
}

impl Architecture {
    pub fn tag(self) -> u32 {
        match self {
            Architecture::PowerPC => 0x7077_7063, // 'pwpc'
            Architecture::M68k => 0x6D36_386B,    // 'm68k'
        }
    }

    pub fn from_tag(tag: u32) -> Result<Architecture> {
        match tag {
            0x7077_7063 => Ok(Architecture::PowerPC),
            0x6D36_386B => Ok(Architecture::M68k),
            other => Err(LinkError::UnknownArchitecture(other).into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Code,
    UnpackedData,
    PatternData,
    Constant,
    Loader,
    Debug,
    ExecutableData,
    Exception,
    Traceback,
}

impl SectionKind {
    pub fn from_u8(value: u8) -> Result<SectionKind> {
        Ok(match value {
            0 => SectionKind::Code,
            1 => SectionKind::UnpackedData,
            2 => SectionKind::PatternData,
            3 => SectionKind::Constant,
            4 => SectionKind::Loader,
            5 => SectionKind::Debug,
            6 => SectionKind::ExecutableData,
            7 => SectionKind::Exception,
            8 => SectionKind::Traceback,
            other => return Err(LinkError::malformed(format!("invalid section kind {other}"))),
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            SectionKind::Code => 0,
            SectionKind::UnpackedData => 1,
            SectionKind::PatternData => 2,
            SectionKind::Constant => 3,
            SectionKind::Loader => 4,
            SectionKind::Debug => 5,
            SectionKind::ExecutableData => 6,
            SectionKind::Exception => 7,
            SectionKind::Traceback => 8,
        }
    }

    /// Whether sections of this kind get merged into the output image.
    pub(crate) fn is_mergeable(self) -> bool {
        matches!(
            self,
            SectionKind::Code
                | SectionKind::UnpackedData
                | SectionKind::PatternData
                | SectionKind::Constant
                | SectionKind::ExecutableData
        )
    }

    /// Whether merged sections of this kind land in the code output.
    pub(crate) fn is_code_like(self) -> bool {
        matches!(self, SectionKind::Code | SectionKind::ExecutableData)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareKind {
    Process,
    Global,
    Protected,
}

impl ShareKind {
    pub fn from_u8(value: u8) -> Result<ShareKind> {
        Ok(match value {
            1 => ShareKind::Process,
            4 => ShareKind::Global,
            5 => ShareKind::Protected,
            other => return Err(LinkError::malformed(format!("invalid share kind {other}"))),
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ShareKind::Process => 1,
            ShareKind::Global => 4,
            ShareKind::Protected => 5,
        }
    }
}

/// Class of an exported or imported symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolClass {
    Code,
    Data,
    TVector,
    Toc,
    Glue,
}

impl SymbolClass {
    pub fn from_u8(value: u8) -> Result<SymbolClass> {
        Ok(match value {
            0 => SymbolClass::Code,
            1 => SymbolClass::Data,
            2 => SymbolClass::TVector,
            3 => SymbolClass::Toc,
            4 => SymbolClass::Glue,
            other => return Err(LinkError::malformed(format!("invalid symbol class {other}"))),
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            SymbolClass::Code => 0,
            SymbolClass::Data => 1,
            SymbolClass::TVector => 2,
            SymbolClass::Toc => 3,
            SymbolClass::Glue => 4,
        }
    }
}

bitflags::bitflags! {
    /// Option bits of an imported library record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LibraryOptions: u8 {
        /// The library may be missing at load time.
        const WEAK_IMPORT = 0x40;
        /// The library must be initialised before the importing fragment.
        const INIT_BEFORE = 0x80;
    }
}

pub fn read_u8(data: &[u8], offset: usize) -> Result<u8> {
    data.get(offset)
        .copied()
        .ok_or_else(|| LinkError::malformed(format!("read of byte at 0x{offset:x} out of bounds")))
}

pub fn read_u16(data: &[u8], offset: usize) -> Result<u16> {
    let bytes = data
        .get(offset..offset + 2)
        .ok_or_else(|| LinkError::malformed(format!("read of u16 at 0x{offset:x} out of bounds")))?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

pub fn read_i16(data: &[u8], offset: usize) -> Result<i16> {
    Ok(read_u16(data, offset)? as i16)
}

pub fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or_else(|| LinkError::malformed(format!("read of u32 at 0x{offset:x} out of bounds")))?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn read_i32(data: &[u8], offset: usize) -> Result<i32> {
    Ok(read_u32(data, offset)? as i32)
}

/// Reads a NUL-terminated string starting at `offset`.
pub fn read_string(data: &[u8], offset: usize) -> Result<&[u8]> {
    let tail = data
        .get(offset..)
        .ok_or_else(|| LinkError::malformed(format!("string offset 0x{offset:x} out of bounds")))?;
    let len = tail
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| LinkError::malformed("string is not NUL-terminated"))?;
    Ok(&tail[..len])
}

pub fn write_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn write_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// The 40-byte header at the start of every container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub tag1: u32,
    pub tag2: u32,
    pub architecture: u32,
    pub format_version: u32,
    pub date_time_stamp: u32,
    pub old_def_version: u32,
    pub old_imp_version: u32,
    pub current_version: u32,
    pub section_count: u16,
    pub inst_section_count: u16,
    pub reserved: u32,
}

impl ContainerHeader {
    pub const SIZE: usize = 40;

    pub fn parse(data: &[u8]) -> Result<ContainerHeader> {
        Ok(ContainerHeader {
            tag1: read_u32(data, 0)?,
            tag2: read_u32(data, 4)?,
            architecture: read_u32(data, 8)?,
            format_version: read_u32(data, 12)?,
            date_time_stamp: read_u32(data, 16)?,
            old_def_version: read_u32(data, 20)?,
            old_imp_version: read_u32(data, 24)?,
            current_version: read_u32(data, 28)?,
            section_count: read_u16(data, 32)?,
            inst_section_count: read_u16(data, 34)?,
            reserved: read_u32(data, 36)?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_u32(out, self.tag1);
        write_u32(out, self.tag2);
        write_u32(out, self.architecture);
        write_u32(out, self.format_version);
        write_u32(out, self.date_time_stamp);
        write_u32(out, self.old_def_version);
        write_u32(out, self.old_imp_version);
        write_u32(out, self.current_version);
        write_u16(out, self.section_count);
        write_u16(out, self.inst_section_count);
        write_u32(out, self.reserved);
    }
}

/// One of the 28-byte section headers that follow the container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    /// Offset of the section's name in the loader string table, or -1 for
    /// an unnamed section.
    pub name_offset: i32,
    pub default_address: u32,
    /// In-memory size.
    pub total_length: u32,
    /// Size once any pattern data has been expanded.
    pub unpacked_length: u32,
    /// Size of the section's bytes within the container.
    pub container_length: u32,
    pub container_offset: u32,
    pub kind: u8,
    pub share_kind: u8,
    /// log₂ of the alignment in bytes.
    pub alignment: u8,
    pub reserved: u8,
}

impl SectionHeader {
    pub const SIZE: usize = 28;

    pub fn parse(data: &[u8]) -> Result<SectionHeader> {
        Ok(SectionHeader {
            name_offset: read_i32(data, 0)?,
            default_address: read_u32(data, 4)?,
            total_length: read_u32(data, 8)?,
            unpacked_length: read_u32(data, 12)?,
            container_length: read_u32(data, 16)?,
            container_offset: read_u32(data, 20)?,
            kind: read_u8(data, 24)?,
            share_kind: read_u8(data, 25)?,
            alignment: read_u8(data, 26)?,
            reserved: read_u8(data, 27)?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_i32(out, self.name_offset);
        write_u32(out, self.default_address);
        write_u32(out, self.total_length);
        write_u32(out, self.unpacked_length);
        write_u32(out, self.container_length);
        write_u32(out, self.container_offset);
        out.push(self.kind);
        out.push(self.share_kind);
        out.push(self.alignment);
        out.push(self.reserved);
    }
}

/// The 56-byte header at the start of the loader section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoaderInfoHeader {
    pub main_section: i32,
    pub main_offset: u32,
    pub init_section: i32,
    pub init_offset: u32,
    pub term_section: i32,
    pub term_offset: u32,
    pub imported_library_count: u32,
    pub total_imported_symbol_count: u32,
    pub reloc_section_count: u32,
    /// Offset of the relocation header array within the loader section. The
    /// instruction area starts right after the headers.
    pub reloc_instr_offset: u32,
    pub loader_strings_offset: u32,
    pub export_hash_offset: u32,
    /// The slot table holds 2^power entries.
    pub export_hash_table_power: u32,
    pub exported_symbol_count: u32,
}

impl LoaderInfoHeader {
    pub const SIZE: usize = 56;

    pub fn parse(data: &[u8]) -> Result<LoaderInfoHeader> {
        Ok(LoaderInfoHeader {
            main_section: read_i32(data, 0)?,
            main_offset: read_u32(data, 4)?,
            init_section: read_i32(data, 8)?,
            init_offset: read_u32(data, 12)?,
            term_section: read_i32(data, 16)?,
            term_offset: read_u32(data, 20)?,
            imported_library_count: read_u32(data, 24)?,
            total_imported_symbol_count: read_u32(data, 28)?,
            reloc_section_count: read_u32(data, 32)?,
            reloc_instr_offset: read_u32(data, 36)?,
            loader_strings_offset: read_u32(data, 40)?,
            export_hash_offset: read_u32(data, 44)?,
            export_hash_table_power: read_u32(data, 48)?,
            exported_symbol_count: read_u32(data, 52)?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_i32(out, self.main_section);
        write_u32(out, self.main_offset);
        write_i32(out, self.init_section);
        write_u32(out, self.init_offset);
        write_i32(out, self.term_section);
        write_u32(out, self.term_offset);
        write_u32(out, self.imported_library_count);
        write_u32(out, self.total_imported_symbol_count);
        write_u32(out, self.reloc_section_count);
        write_u32(out, self.reloc_instr_offset);
        write_u32(out, self.loader_strings_offset);
        write_u32(out, self.export_hash_offset);
        write_u32(out, self.export_hash_table_power);
        write_u32(out, self.exported_symbol_count);
    }
}

/// A 24-byte imported library record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportedLibrary {
    pub name_offset: u32,
    pub old_imp_version: u32,
    pub current_version: u32,
    pub imported_symbol_count: u32,
    /// Index of this library's first symbol in the imported symbol array.
    /// The per-library runs partition that array.
    pub first_imported_symbol: u32,
    pub options: u8,
    pub reserved_a: u8,
    pub reserved_b: u16,
}

impl ImportedLibrary {
    pub const SIZE: usize = 24;

    pub fn parse(data: &[u8]) -> Result<ImportedLibrary> {
        Ok(ImportedLibrary {
            name_offset: read_u32(data, 0)?,
            old_imp_version: read_u32(data, 4)?,
            current_version: read_u32(data, 8)?,
            imported_symbol_count: read_u32(data, 12)?,
            first_imported_symbol: read_u32(data, 16)?,
            options: read_u8(data, 20)?,
            reserved_a: read_u8(data, 21)?,
            reserved_b: read_u16(data, 22)?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_u32(out, self.name_offset);
        write_u32(out, self.old_imp_version);
        write_u32(out, self.current_version);
        write_u32(out, self.imported_symbol_count);
        write_u32(out, self.first_imported_symbol);
        out.push(self.options);
        out.push(self.reserved_a);
        write_u16(out, self.reserved_b);
    }
}

/// An imported symbol is a packed word: class in the top 4 bits, string
/// offset in the low 28.
pub const IMPORTED_SYMBOL_SIZE: usize = 4;

pub fn compose_imported_symbol(class: SymbolClass, name_offset: u32) -> u32 {
    (u32::from(class.as_u8()) << 28) | (name_offset & 0x0FFF_FFFF)
}

pub fn imported_symbol_class(word: u32) -> u8 {
    (word >> 28) as u8
}

pub fn imported_symbol_name_offset(word: u32) -> u32 {
    word & 0x0FFF_FFFF
}

/// A 10-byte exported symbol record: packed class+name word, value, section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportedSymbol {
    pub class_and_name: u32,
    /// Offset of the symbol within its section.
    pub value: u32,
    /// Section index, or -1 for absolute and -2 for undefined symbols.
    pub section_index: i16,
}

impl ExportedSymbol {
    pub const SIZE: usize = 10;

    pub fn parse(data: &[u8]) -> Result<ExportedSymbol> {
        Ok(ExportedSymbol {
            class_and_name: read_u32(data, 0)?,
            value: read_u32(data, 4)?,
            section_index: read_i16(data, 8)?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_u32(out, self.class_and_name);
        write_u32(out, self.value);
        write_u16(out, self.section_index as u16);
    }

    pub fn class(&self) -> u8 {
        (self.class_and_name >> 24) as u8
    }

    pub fn name_offset(&self) -> u32 {
        self.class_and_name & 0x00FF_FFFF
    }
}

pub fn compose_exported_symbol(class: SymbolClass, name_offset: u32) -> u32 {
    (u32::from(class.as_u8()) << 24) | (name_offset & 0x00FF_FFFF)
}

/// A 12-byte relocation header; one per relocated section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderRelocationHeader {
    pub section_index: u16,
    pub reserved: u16,
    /// Number of 16-bit relocation instruction words, not bytes.
    pub reloc_count: u32,
    /// Byte offset of this section's first instruction from the start of the
    /// instruction area.
    pub first_reloc_offset: u32,
}

impl LoaderRelocationHeader {
    pub const SIZE: usize = 12;

    pub fn parse(data: &[u8]) -> Result<LoaderRelocationHeader> {
        Ok(LoaderRelocationHeader {
            section_index: read_u16(data, 0)?,
            reserved: read_u16(data, 2)?,
            reloc_count: read_u32(data, 4)?,
            first_reloc_offset: read_u32(data, 8)?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_u16(out, self.section_index);
        write_u16(out, self.reserved);
        write_u32(out, self.reloc_count);
        write_u32(out, self.first_reloc_offset);
    }
}

/// Export hash slots pack a 14-bit chain count over an 18-bit first index.
pub fn compose_hash_slot(chain_count: u32, first_index: u32) -> u32 {
    ((chain_count & 0x3FFF) << 18) | (first_index & 0x3_FFFF)
}

pub fn hash_slot_chain_count(word: u32) -> u32 {
    (word >> 18) & 0x3FFF
}

pub fn hash_slot_first_index(word: u32) -> u32 {
    word & 0x3_FFFF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_header_round_trip() {
        let header = ContainerHeader {
            tag1: TAG1,
            tag2: TAG2,
            architecture: Architecture::PowerPC.tag(),
            format_version: FORMAT_VERSION,
            date_time_stamp: 0xDEAD_BEEF,
            old_def_version: 1,
            old_imp_version: 2,
            current_version: 3,
            section_count: 5,
            inst_section_count: 4,
            reserved: 0,
        };
        let mut bytes = Vec::new();
        header.write(&mut bytes);
        assert_eq!(bytes.len(), ContainerHeader::SIZE);
        assert_eq!(ContainerHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn section_header_round_trip() {
        let header = SectionHeader {
            name_offset: -1,
            default_address: 0x1000,
            total_length: 0x40,
            unpacked_length: 0x40,
            container_length: 0x40,
            container_offset: 0x60,
            kind: SectionKind::Code.as_u8(),
            share_kind: ShareKind::Global.as_u8(),
            alignment: 4,
            reserved: 0,
        };
        let mut bytes = Vec::new();
        header.write(&mut bytes);
        assert_eq!(bytes.len(), SectionHeader::SIZE);
        assert_eq!(SectionHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn loader_info_header_round_trip() {
        let header = LoaderInfoHeader {
            main_section: 0,
            main_offset: 0x20,
            init_section: -1,
            init_offset: 0,
            term_section: -1,
            term_offset: 0,
            imported_library_count: 1,
            total_imported_symbol_count: 3,
            reloc_section_count: 1,
            reloc_instr_offset: 92,
            loader_strings_offset: 120,
            export_hash_offset: 160,
            export_hash_table_power: 2,
            exported_symbol_count: 7,
        };
        let mut bytes = Vec::new();
        header.write(&mut bytes);
        assert_eq!(bytes.len(), LoaderInfoHeader::SIZE);
        assert_eq!(LoaderInfoHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn exported_symbol_round_trip() {
        let symbol = ExportedSymbol {
            class_and_name: compose_exported_symbol(SymbolClass::TVector, 0x1234),
            value: 0x40,
            section_index: -2,
        };
        let mut bytes = Vec::new();
        symbol.write(&mut bytes);
        assert_eq!(bytes.len(), ExportedSymbol::SIZE);
        let read_back = ExportedSymbol::parse(&bytes).unwrap();
        assert_eq!(read_back, symbol);
        assert_eq!(read_back.class(), SymbolClass::TVector.as_u8());
        assert_eq!(read_back.name_offset(), 0x1234);
    }

    #[test]
    fn imported_library_round_trip() {
        let library = ImportedLibrary {
            name_offset: 12,
            old_imp_version: 0,
            current_version: 0,
            imported_symbol_count: 2,
            first_imported_symbol: 5,
            options: LibraryOptions::WEAK_IMPORT.bits(),
            reserved_a: 0,
            reserved_b: 0,
        };
        let mut bytes = Vec::new();
        library.write(&mut bytes);
        assert_eq!(bytes.len(), ImportedLibrary::SIZE);
        assert_eq!(ImportedLibrary::parse(&bytes).unwrap(), library);
    }

    #[test]
    fn hash_slot_packing() {
        let slot = compose_hash_slot(3, 0x2_0001);
        assert_eq!(hash_slot_chain_count(slot), 3);
        assert_eq!(hash_slot_first_index(slot), 0x2_0001);
        assert_eq!(compose_hash_slot(0, 0), 0);
    }

    #[test]
    fn imported_symbol_packing() {
        let word = compose_imported_symbol(SymbolClass::Data, 0x0ABC_DEF);
        assert_eq!(imported_symbol_class(word), SymbolClass::Data.as_u8());
        assert_eq!(imported_symbol_name_offset(word), 0x0ABC_DEF);
    }

    #[test]
    fn truncated_reads_fail() {
        let bytes = [0u8; 10];
        assert!(ContainerHeader::parse(&bytes).is_err());
        assert!(SectionHeader::parse(&bytes).is_err());
        assert!(read_string(&[b'a', b'b'], 0).is_err());
    }
}
