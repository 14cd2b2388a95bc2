//! End-to-end link scenarios. Input objects and shared libraries are
//! synthesized in memory with a small PEF builder, linked through the
//! library's public API, and the written container is read back and checked
//! field by field.

use libpefld::args::Args;
use libpefld::error::LinkError;
use libpefld::export_hash;
use libpefld::pef;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

const ARCH_POWERPC: u32 = 0x7077_7063;

// Relocation opcodes in the high 6 bits of an instruction word.
const OP_SET_POSITION: u16 = 0x08;
const OP_BY_SECT_C: u16 = 0x20;
const OP_SM_BY_IMPORT: u16 = 0x2B;

fn sm_by_import(index: u16) -> u16 {
    (OP_SM_BY_IMPORT << 10) | index
}

fn by_sect_c(run: u16) -> u16 {
    (OP_BY_SECT_C << 10) | run
}

struct SectionSpec {
    kind: pef::SectionKind,
    data: Vec<u8>,
    /// Differs from `data.len()` only for pattern-data sections, where
    /// `data` holds the packed bytes.
    unpacked_length: u32,
    relocations: Vec<u16>,
}

struct Export {
    name: String,
    class: pef::SymbolClass,
    section_index: i16,
    value: u32,
}

/// Builds a relocatable PEF container byte-for-byte: sections, then a
/// loader section carrying exports (with a one-slot hash table), the
/// imported-symbol name table and per-section relocation streams.
struct ObjectBuilder {
    architecture: u32,
    sections: Vec<SectionSpec>,
    exports: Vec<Export>,
    imports: Vec<(String, pef::SymbolClass)>,
}

impl Default for ObjectBuilder {
    fn default() -> Self {
        ObjectBuilder {
            architecture: ARCH_POWERPC,
            sections: Vec::new(),
            exports: Vec::new(),
            imports: Vec::new(),
        }
    }
}

impl ObjectBuilder {
    fn architecture(mut self, tag: u32) -> Self {
        self.architecture = tag;
        self
    }

    fn code(mut self, data: &[u8]) -> Self {
        self.sections.push(SectionSpec {
            kind: pef::SectionKind::Code,
            data: data.to_vec(),
            unpacked_length: data.len() as u32,
            relocations: Vec::new(),
        });
        self
    }

    fn data(mut self, data: &[u8]) -> Self {
        self.sections.push(SectionSpec {
            kind: pef::SectionKind::UnpackedData,
            data: data.to_vec(),
            unpacked_length: data.len() as u32,
            relocations: Vec::new(),
        });
        self
    }

    fn pattern_data(mut self, packed: &[u8], unpacked_length: u32) -> Self {
        self.sections.push(SectionSpec {
            kind: pef::SectionKind::PatternData,
            data: packed.to_vec(),
            unpacked_length,
            relocations: Vec::new(),
        });
        self
    }

    fn relocations(mut self, section: usize, words: &[u16]) -> Self {
        self.sections[section].relocations = words.to_vec();
        self
    }

    fn export(mut self, name: &str, class: pef::SymbolClass, section: i16, value: u32) -> Self {
        self.exports.push(Export {
            name: name.to_owned(),
            class,
            section_index: section,
            value,
        });
        self
    }

    fn import(mut self, name: &str, class: pef::SymbolClass) -> Self {
        self.imports.push((name.to_owned(), class));
        self
    }

    fn build(&self) -> Vec<u8> {
        let loader = self.build_loader();

        let section_count = self.sections.len() + 1;
        let headers_len = pef::ContainerHeader::SIZE + section_count * pef::SectionHeader::SIZE;

        let mut body_offsets = Vec::new();
        let mut offset = headers_len;
        for section in &self.sections {
            offset = offset.next_multiple_of(16);
            body_offsets.push(offset);
            offset += section.data.len();
        }
        let loader_offset = offset.next_multiple_of(16);

        let mut out = Vec::new();
        pef::ContainerHeader {
            tag1: pef::TAG1,
            tag2: pef::TAG2,
            architecture: self.architecture,
            format_version: pef::FORMAT_VERSION,
            date_time_stamp: 0,
            old_def_version: 0,
            old_imp_version: 0,
            current_version: 0,
            section_count: section_count as u16,
            inst_section_count: self.sections.len() as u16,
            reserved: 0,
        }
        .write(&mut out);

        for (section, body_offset) in self.sections.iter().zip(&body_offsets) {
            pef::SectionHeader {
                name_offset: -1,
                default_address: 0,
                total_length: section.unpacked_length,
                unpacked_length: section.unpacked_length,
                container_length: section.data.len() as u32,
                container_offset: *body_offset as u32,
                kind: section.kind.as_u8(),
                share_kind: pef::ShareKind::Process.as_u8(),
                alignment: 4,
                reserved: 0,
            }
            .write(&mut out);
        }
        pef::SectionHeader {
            name_offset: -1,
            default_address: 0,
            total_length: loader.len() as u32,
            unpacked_length: loader.len() as u32,
            container_length: loader.len() as u32,
            container_offset: loader_offset as u32,
            kind: pef::SectionKind::Loader.as_u8(),
            share_kind: pef::ShareKind::Global.as_u8(),
            alignment: 4,
            reserved: 0,
        }
        .write(&mut out);

        for (section, body_offset) in self.sections.iter().zip(&body_offsets) {
            out.resize(*body_offset, 0);
            out.extend_from_slice(&section.data);
        }
        out.resize(loader_offset, 0);
        out.extend_from_slice(&loader);
        out
    }

    fn build_loader(&self) -> Vec<u8> {
        let mut strings = Vec::new();
        let mut add_string = |strings: &mut Vec<u8>, name: &str| -> u32 {
            let offset = strings.len() as u32;
            strings.extend_from_slice(name.as_bytes());
            strings.push(0);
            offset
        };

        let import_name_offsets: Vec<u32> = self
            .imports
            .iter()
            .map(|(name, _)| add_string(&mut strings, name))
            .collect();
        let export_name_offsets: Vec<u32> = self
            .exports
            .iter()
            .map(|export| add_string(&mut strings, &export.name))
            .collect();

        let relocated: Vec<(usize, &[u16])> = self
            .sections
            .iter()
            .enumerate()
            .filter(|(_, section)| !section.relocations.is_empty())
            .map(|(index, section)| (index, section.relocations.as_slice()))
            .collect();

        let imports_offset = pef::LoaderInfoHeader::SIZE;
        let reloc_headers_offset = imports_offset + self.imports.len() * 4;
        let instr_offset = reloc_headers_offset + relocated.len() * pef::LoaderRelocationHeader::SIZE;
        let instr_len: usize = relocated.iter().map(|(_, words)| words.len() * 2).sum();
        let strings_offset = instr_offset + instr_len;
        let hash_offset = (strings_offset + strings.len()).next_multiple_of(4);

        let mut out = Vec::new();
        pef::LoaderInfoHeader {
            main_section: -1,
            main_offset: 0,
            init_section: -1,
            init_offset: 0,
            term_section: -1,
            term_offset: 0,
            imported_library_count: 0,
            total_imported_symbol_count: self.imports.len() as u32,
            reloc_section_count: relocated.len() as u32,
            reloc_instr_offset: reloc_headers_offset as u32,
            loader_strings_offset: strings_offset as u32,
            export_hash_offset: hash_offset as u32,
            export_hash_table_power: 0,
            exported_symbol_count: self.exports.len() as u32,
        }
        .write(&mut out);

        for ((_, class), name_offset) in self.imports.iter().zip(&import_name_offsets) {
            pef::write_u32(&mut out, pef::compose_imported_symbol(*class, *name_offset));
        }

        let mut first_offset = 0u32;
        for (section_index, words) in &relocated {
            pef::LoaderRelocationHeader {
                section_index: *section_index as u16,
                reserved: 0,
                reloc_count: words.len() as u32,
                first_reloc_offset: first_offset,
            }
            .write(&mut out);
            first_offset += words.len() as u32 * 2;
        }
        for (_, words) in &relocated {
            for word in *words {
                pef::write_u16(&mut out, *word);
            }
        }

        out.extend_from_slice(&strings);
        out.resize(hash_offset, 0);

        // One hash slot (power 0) holding the whole export chain.
        pef::write_u32(
            &mut out,
            pef::compose_hash_slot(self.exports.len() as u32, 0),
        );
        for export in &self.exports {
            pef::write_u32(&mut out, export_hash::hash_word(export.name.as_bytes()));
        }
        for (export, name_offset) in self.exports.iter().zip(&export_name_offsets) {
            pef::ExportedSymbol {
                class_and_name: pef::compose_exported_symbol(export.class, *name_offset),
                value: export.value,
                section_index: export.section_index,
            }
            .write(&mut out);
        }
        out
    }
}

/// A parsed view of a written container, for assertions.
struct ReadContainer {
    header: pef::ContainerHeader,
    sections: Vec<(pef::SectionHeader, Vec<u8>)>,
    loader_info: pef::LoaderInfoHeader,
    loader: Vec<u8>,
}

impl ReadContainer {
    fn read(path: &Path) -> ReadContainer {
        let bytes = std::fs::read(path).expect("output file should exist");
        let header = pef::ContainerHeader::parse(&bytes).unwrap();
        let mut sections = Vec::new();
        let mut loader = None;
        for index in 0..usize::from(header.section_count) {
            let offset = pef::ContainerHeader::SIZE + index * pef::SectionHeader::SIZE;
            let section = pef::SectionHeader::parse(&bytes[offset..]).unwrap();
            let body = bytes[section.container_offset as usize..]
                [..section.container_length as usize]
                .to_vec();
            if section.kind == pef::SectionKind::Loader.as_u8() {
                loader = Some(body.clone());
            }
            sections.push((section, body));
        }
        let loader = loader.expect("output must have a loader section");
        let loader_info = pef::LoaderInfoHeader::parse(&loader).unwrap();
        ReadContainer {
            header,
            sections,
            loader_info,
            loader,
        }
    }

    fn loader_string(&self, offset: u32) -> String {
        let start = self.loader_info.loader_strings_offset as usize + offset as usize;
        let end = start
            + self.loader[start..]
                .iter()
                .position(|b| *b == 0)
                .expect("unterminated loader string");
        String::from_utf8(self.loader[start..end].to_vec()).unwrap()
    }

    /// The relocation instruction words for the section with the given
    /// output index, or an empty list.
    fn relocations_for(&self, section_index: u16) -> Vec<u16> {
        let headers_offset = self.loader_info.reloc_instr_offset as usize;
        let count = self.loader_info.reloc_section_count as usize;
        let instr_offset = headers_offset + count * pef::LoaderRelocationHeader::SIZE;
        for index in 0..count {
            let header = pef::LoaderRelocationHeader::parse(
                &self.loader[headers_offset + index * pef::LoaderRelocationHeader::SIZE..],
            )
            .unwrap();
            if header.section_index != section_index {
                continue;
            }
            let start = instr_offset + header.first_reloc_offset as usize;
            return self.loader[start..start + header.reloc_count as usize * 2]
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
        }
        Vec::new()
    }

    fn exported_symbols(&self) -> Vec<(String, pef::ExportedSymbol)> {
        let info = &self.loader_info;
        let table_offset = info.export_hash_offset as usize
            + (1usize << info.export_hash_table_power) * 4
            + info.exported_symbol_count as usize * 4;
        (0..info.exported_symbol_count as usize)
            .map(|index| {
                let record = pef::ExportedSymbol::parse(
                    &self.loader[table_offset + index * pef::ExportedSymbol::SIZE..],
                )
                .unwrap();
                (self.loader_string(record.name_offset()), record)
            })
            .collect()
    }
}

static NEXT_TEST_DIR: AtomicU32 = AtomicU32::new(0);

fn test_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "pefld-test-{}-{}",
        std::process::id(),
        NEXT_TEST_DIR.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_input(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

fn base_args(dir: &Path) -> Args {
    Args {
        entry: "main".to_owned(),
        output: dir.join("out.pef"),
        // Every successful link in this suite also runs the structural
        // self-check over the written container.
        validate_output: true,
        ..Args::default()
    }
}

const MAIN_CODE: &[u8] = &[0x7C, 0x08, 0x02, 0xA6, 0x4E, 0x80, 0x00, 0x20];

#[test]
fn empty_link_fails_without_creating_output() {
    let dir = test_dir();
    let args = base_args(&dir);
    let error = libpefld::link(&args).unwrap_err();
    match error.downcast_ref::<LinkError>() {
        Some(LinkError::UndefinedSymbol(message)) => assert_eq!(message, "no input files"),
        other => panic!("expected UndefinedSymbol, got {other:?}"),
    }
    assert!(!args.output.exists());
}

#[test]
fn single_object_with_entry_point() {
    let dir = test_dir();
    let object = ObjectBuilder::default()
        .code(MAIN_CODE)
        .export("main", pef::SymbolClass::Code, 0, 0)
        .build();
    let mut args = base_args(&dir);
    args.inputs = vec![write_input(&dir, "main.o", &object)];
    libpefld::link(&args).unwrap();

    let read = ReadContainer::read(&args.output);
    assert_eq!(read.header.tag1, 0x4A6F_7921);
    assert_eq!(read.header.tag2, 0x7065_6666);
    assert_eq!(read.header.architecture, 0x7077_7063);
    assert_eq!(read.header.format_version, 1);
    // Code, the (empty) data section and the loader.
    assert_eq!(read.header.section_count, 3);
    assert_eq!(read.header.inst_section_count, 2);

    let (code_header, code_body) = &read.sections[0];
    assert_eq!(code_header.kind, pef::SectionKind::Code.as_u8());
    assert_eq!(code_header.share_kind, pef::ShareKind::Global.as_u8());
    assert_eq!(code_body.as_slice(), MAIN_CODE);

    assert_eq!(read.loader_info.main_section, 0);
    assert_eq!(read.loader_info.main_offset, 0);
    assert_eq!(read.loader_info.exported_symbol_count, 1);
    assert_eq!(read.loader_info.imported_library_count, 0);
    assert_eq!(read.loader_info.total_imported_symbol_count, 0);

    let exports = read.exported_symbols();
    assert_eq!(exports[0].0, "main");
    assert_eq!(exports[0].1.section_index, 0);
    assert_eq!(exports[0].1.value, 0);
}

#[test]
fn cross_object_reference_resolves_without_imports() {
    let dir = test_dir();
    let object_a = ObjectBuilder::default()
        .code(MAIN_CODE)
        .export("main", pef::SymbolClass::Code, 0, 0)
        .export("foo", pef::SymbolClass::Code, 0, 4)
        .build();
    // Object B holds a word that should receive foo's address.
    let object_b = ObjectBuilder::default()
        .code(&[0u8; 8])
        .import("foo", pef::SymbolClass::Code)
        .relocations(0, &[sm_by_import(0)])
        .build();

    let mut args = base_args(&dir);
    args.inputs = vec![
        write_input(&dir, "a.o", &object_a),
        write_input(&dir, "b.o", &object_b),
    ];
    libpefld::link(&args).unwrap();

    let read = ReadContainer::read(&args.output);
    assert_eq!(read.loader_info.imported_library_count, 0);
    assert_eq!(read.loader_info.total_imported_symbol_count, 0);

    // B's code starts 16-byte aligned after A's 8 bytes; the patched word
    // now carries foo's offset in the merged code section, rebased at load
    // time by a section-relative relocation.
    let (_, code_body) = &read.sections[0];
    assert_eq!(&code_body[16..20], &4u32.to_be_bytes());

    let words = read.relocations_for(0);
    let set_position = (OP_SET_POSITION << 10) | 0;
    assert_eq!(words, vec![set_position, 16, by_sect_c(0)]);
}

#[test]
fn import_resolves_against_shared_library() {
    let dir = test_dir();
    let library = ObjectBuilder::default()
        .code(&[0u8; 32])
        .export("SysBeep", pef::SymbolClass::TVector, 0, 0x10)
        .build();
    write_input(&dir, "InterfaceLib.pef", &library);

    let object = ObjectBuilder::default()
        .code(MAIN_CODE)
        .export("main", pef::SymbolClass::Code, 0, 0)
        .data(&[0u8; 4])
        .import("SysBeep", pef::SymbolClass::TVector)
        .relocations(1, &[sm_by_import(0)])
        .build();

    let mut args = base_args(&dir);
    args.inputs = vec![write_input(&dir, "main.o", &object)];
    args.libraries = vec!["InterfaceLib".to_owned()];
    args.lib_search_path = vec![dir.clone()];
    libpefld::link(&args).unwrap();

    let read = ReadContainer::read(&args.output);
    assert_eq!(read.loader_info.imported_library_count, 1);
    assert_eq!(read.loader_info.total_imported_symbol_count, 1);

    let library_record =
        pef::ImportedLibrary::parse(&read.loader[pef::LoaderInfoHeader::SIZE..]).unwrap();
    assert_eq!(read.loader_string(library_record.name_offset), "InterfaceLib");
    assert_eq!(library_record.imported_symbol_count, 1);
    assert_eq!(library_record.first_imported_symbol, 0);
    assert_eq!(library_record.options, 0);

    let import_word = pef::read_u32(
        &read.loader,
        pef::LoaderInfoHeader::SIZE + pef::ImportedLibrary::SIZE,
    )
    .unwrap();
    assert_eq!(
        pef::imported_symbol_class(import_word),
        pef::SymbolClass::TVector.as_u8()
    );
    assert_eq!(
        read.loader_string(pef::imported_symbol_name_offset(import_word)),
        "SysBeep"
    );

    // The data section's stream patches its word at the original offset.
    let words = read.relocations_for(1);
    assert_eq!(words, vec![sm_by_import(0)]);
}

#[test]
fn weak_library_miss_is_not_fatal() {
    let dir = test_dir();
    let library = ObjectBuilder::default().code(&[0u8; 16]).build();
    write_input(&dir, "OptionalLib.pef", &library);

    let object = ObjectBuilder::default()
        .code(MAIN_CODE)
        .export("main", pef::SymbolClass::Code, 0, 0)
        .import("OptionalProc", pef::SymbolClass::TVector)
        .relocations(0, &[sm_by_import(0)])
        .build();

    let mut args = base_args(&dir);
    args.inputs = vec![write_input(&dir, "main.o", &object)];
    args.weak_libraries = vec!["OptionalLib".to_owned()];
    args.lib_search_path = vec![dir.clone()];
    libpefld::link(&args).unwrap();

    let read = ReadContainer::read(&args.output);
    assert_eq!(read.loader_info.imported_library_count, 0);
    assert_eq!(read.loader_info.total_imported_symbol_count, 0);
}

#[test]
fn duplicate_definition_is_rejected_by_default() {
    let dir = test_dir();
    let object_a = ObjectBuilder::default()
        .code(MAIN_CODE)
        .export("main", pef::SymbolClass::Code, 0, 0)
        .build();
    let object_b = ObjectBuilder::default()
        .code(MAIN_CODE)
        .export("main", pef::SymbolClass::Code, 0, 4)
        .build();

    let mut args = base_args(&dir);
    args.inputs = vec![
        write_input(&dir, "a.o", &object_a),
        write_input(&dir, "b.o", &object_b),
    ];
    let error = libpefld::link(&args).unwrap_err();
    match error.downcast_ref::<LinkError>() {
        Some(LinkError::DuplicateDefinition { name, .. }) => assert_eq!(name, "main"),
        other => panic!("expected DuplicateDefinition, got {other:?}"),
    }
    assert!(!args.output.exists());
}

#[test]
fn duplicate_definition_first_wins_when_allowed() {
    let dir = test_dir();
    let object_a = ObjectBuilder::default()
        .code(MAIN_CODE)
        .export("main", pef::SymbolClass::Code, 0, 0)
        .build();
    let object_b = ObjectBuilder::default()
        .code(&[0u8; 16])
        .export("main", pef::SymbolClass::Code, 0, 4)
        .build();

    let mut args = base_args(&dir);
    args.inputs = vec![
        write_input(&dir, "a.o", &object_a),
        write_input(&dir, "b.o", &object_b),
    ];
    args.allow_undefined = true;
    libpefld::link(&args).unwrap();

    let read = ReadContainer::read(&args.output);
    // The first object's definition (offset 0 in the merged code) wins.
    assert_eq!(read.loader_info.main_section, 0);
    assert_eq!(read.loader_info.main_offset, 0);
    assert_eq!(read.loader_info.exported_symbol_count, 1);
}

#[test]
fn written_container_parses_as_an_object_again() {
    let dir = test_dir();
    let object = ObjectBuilder::default()
        .code(MAIN_CODE)
        .export("main", pef::SymbolClass::Code, 0, 0)
        .export("helper", pef::SymbolClass::Code, 0, 4)
        .build();
    let mut args = base_args(&dir);
    args.inputs = vec![write_input(&dir, "main.o", &object)];
    libpefld::link(&args).unwrap();

    // Re-link the output as an input: the reader must accept everything the
    // writer produced, and the round trip must preserve the code bytes and
    // the exports.
    let dir2 = test_dir();
    let mut args2 = base_args(&dir2);
    args2.inputs = vec![args.output.clone()];
    libpefld::link(&args2).unwrap();

    let first = ReadContainer::read(&args.output);
    let second = ReadContainer::read(&args2.output);
    assert_eq!(first.sections[0].1, second.sections[0].1);
    assert_eq!(
        first.loader_info.exported_symbol_count,
        second.loader_info.exported_symbol_count
    );
    let exports: Vec<String> = second
        .exported_symbols()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert!(exports.contains(&"main".to_owned()));
    assert!(exports.contains(&"helper".to_owned()));
}

#[test]
fn entry_point_must_be_defined() {
    let dir = test_dir();
    let object = ObjectBuilder::default()
        .code(MAIN_CODE)
        .export("helper", pef::SymbolClass::Code, 0, 0)
        .build();
    let mut args = base_args(&dir);
    args.inputs = vec![write_input(&dir, "helper.o", &object)];
    let error = libpefld::link(&args).unwrap_err();
    match error.downcast_ref::<LinkError>() {
        Some(LinkError::UndefinedSymbol(name)) => assert_eq!(name, "main"),
        other => panic!("expected UndefinedSymbol, got {other:?}"),
    }
    assert!(!args.output.exists());
}

#[test]
fn pattern_data_is_expanded_before_merging() {
    let dir = test_dir();
    // Repeated-block instruction: the two bytes 12 34, three times over.
    let packed = [0x42, 0x02, 0x12, 0x34];
    let object = ObjectBuilder::default()
        .code(MAIN_CODE)
        .export("main", pef::SymbolClass::Code, 0, 0)
        .pattern_data(&packed, 6)
        .build();
    let mut args = base_args(&dir);
    args.inputs = vec![write_input(&dir, "main.o", &object)];
    libpefld::link(&args).unwrap();

    let read = ReadContainer::read(&args.output);
    let (data_header, data_body) = &read.sections[1];
    assert_eq!(data_header.kind, pef::SectionKind::UnpackedData.as_u8());
    assert_eq!(&data_body[..6], &[0x12, 0x34, 0x12, 0x34, 0x12, 0x34]);
}

#[test]
fn init_and_term_entry_points_are_recorded() {
    let dir = test_dir();
    let object = ObjectBuilder::default()
        .code(&[0u8; 16])
        .export("main", pef::SymbolClass::Code, 0, 0)
        .export("do_init", pef::SymbolClass::Code, 0, 4)
        .export("do_term", pef::SymbolClass::Code, 0, 8)
        .build();
    let mut args = base_args(&dir);
    args.inputs = vec![write_input(&dir, "main.o", &object)];
    args.init = Some("do_init".to_owned());
    args.term = Some("do_term".to_owned());
    libpefld::link(&args).unwrap();

    let read = ReadContainer::read(&args.output);
    assert_eq!(read.loader_info.init_section, 0);
    assert_eq!(read.loader_info.init_offset, 4);
    assert_eq!(read.loader_info.term_section, 0);
    assert_eq!(read.loader_info.term_offset, 8);
}

#[test]
fn base_addresses_become_default_addresses() {
    let dir = test_dir();
    let object = ObjectBuilder::default()
        .code(MAIN_CODE)
        .export("main", pef::SymbolClass::Code, 0, 0)
        .data(&[1, 2, 3, 4])
        .build();
    let mut args = base_args(&dir);
    args.inputs = vec![write_input(&dir, "main.o", &object)];
    args.base_code = 0x1000;
    args.base_data = 0x8000;
    libpefld::link(&args).unwrap();

    let read = ReadContainer::read(&args.output);
    assert_eq!(read.sections[0].0.default_address, 0x1000);
    assert_eq!(read.sections[1].0.default_address, 0x8000);
    // The entry point stays section-relative.
    assert_eq!(read.loader_info.main_section, 0);
    assert_eq!(read.loader_info.main_offset, 0);
}

#[test]
fn m68k_containers_link_as_m68k() {
    const ARCH_M68K: u32 = 0x6D36_386B;
    let dir = test_dir();
    let object = ObjectBuilder::default()
        .architecture(ARCH_M68K)
        .code(MAIN_CODE)
        .export("main", pef::SymbolClass::Code, 0, 0)
        .build();
    let mut args = base_args(&dir);
    args.inputs = vec![write_input(&dir, "main.o", &object)];
    libpefld::link(&args).unwrap();

    let read = ReadContainer::read(&args.output);
    assert_eq!(read.header.architecture, ARCH_M68K);
}

#[test]
fn mixed_architectures_are_rejected() {
    let dir = test_dir();
    let ppc = ObjectBuilder::default()
        .code(MAIN_CODE)
        .export("main", pef::SymbolClass::Code, 0, 0)
        .build();
    let m68k = ObjectBuilder::default()
        .architecture(0x6D36_386B)
        .code(&[0u8; 4])
        .export("helper", pef::SymbolClass::Code, 0, 0)
        .build();
    let mut args = base_args(&dir);
    args.inputs = vec![
        write_input(&dir, "a.o", &ppc),
        write_input(&dir, "b.o", &m68k),
    ];
    let error = libpefld::link(&args).unwrap_err();
    assert!(matches!(
        error.downcast_ref::<LinkError>(),
        Some(LinkError::MalformedFile(_))
    ));
    assert!(!args.output.exists());
}

#[test]
fn undefined_symbol_fails_unless_allowed() {
    let dir = test_dir();
    let object = ObjectBuilder::default()
        .code(MAIN_CODE)
        .export("main", pef::SymbolClass::Code, 0, 0)
        .import("MissingProc", pef::SymbolClass::TVector)
        .relocations(0, &[sm_by_import(0)])
        .build();

    let mut args = base_args(&dir);
    args.inputs = vec![write_input(&dir, "main.o", &object)];
    let error = libpefld::link(&args).unwrap_err();
    match error.downcast_ref::<LinkError>() {
        Some(LinkError::UndefinedSymbol(name)) => assert_eq!(name, "MissingProc"),
        other => panic!("expected UndefinedSymbol, got {other:?}"),
    }

    args.allow_undefined = true;
    libpefld::link(&args).unwrap();
    assert!(args.output.exists());
}
