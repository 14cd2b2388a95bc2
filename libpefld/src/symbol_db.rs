//! The global symbol table: one entry per name for the lifetime of a link,
//! kept both in a hash map (for lookup) and in an insertion-order list so
//! that every iteration that reaches the output is deterministic.

use crate::hash::PassThroughHashMap;
use crate::input_data::FileId;
use crate::pef::SymbolClass;
use crate::symbol::SymbolName;

/// Index of a symbol in the table's insertion-order list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct SymbolId(u32);

impl SymbolId {
    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Index of a shared library in the link's library list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LibraryId(pub(crate) usize);

#[derive(Debug, Clone, Copy)]
pub(crate) enum Symbol {
    Defined(Defined),
    Undefined(Undefined),
    Imported(Imported),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Defined {
    pub(crate) file_id: FileId,
    /// Offset of the symbol within its defining section.
    pub(crate) value: u32,
    /// Section index within the defining file; negative values mean the
    /// symbol is absolute (-1) or re-exported as undefined (-2).
    pub(crate) section_index: i16,
    pub(crate) class: SymbolClass,
    /// Assigned once layout has placed the defining section.
    pub(crate) virtual_address: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Undefined {
    pub(crate) file_id: FileId,
    pub(crate) class: SymbolClass,
    /// Whether a weak library was consulted for this symbol. Unresolved
    /// symbols that a weak library was asked about don't fail the link.
    pub(crate) weak_touched: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Imported {
    pub(crate) library: LibraryId,
    pub(crate) class: SymbolClass,
    pub(crate) weak: bool,
    /// Global index in the output's imported symbol array, assigned when
    /// imports are collated.
    pub(crate) import_index: Option<u32>,
}

/// What `add_defined` did with the new definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddDefinedOutcome {
    New(SymbolId),
    /// A previously undefined symbol became defined.
    Resolved(SymbolId),
    /// The name already had a definition; the caller decides whether that's
    /// an error. The existing definition is kept either way.
    Duplicate { id: SymbolId, prior: FileId },
}

struct SymbolEntry<'data> {
    name: SymbolName<'data>,
    symbol: Symbol,
}

pub(crate) struct SymbolTable<'data> {
    names: PassThroughHashMap<SymbolName<'data>, SymbolId>,
    entries: Vec<SymbolEntry<'data>>,
}

impl<'data> SymbolTable<'data> {
    pub(crate) fn new() -> SymbolTable<'data> {
        SymbolTable {
            names: PassThroughHashMap::default(),
            entries: Vec::new(),
        }
    }

    fn insert(&mut self, name: &'data [u8], symbol: Symbol) -> SymbolId {
        let id = SymbolId(self.entries.len() as u32);
        self.entries.push(SymbolEntry {
            name: SymbolName::new(name),
            symbol,
        });
        self.names.insert(SymbolName::prehashed(name), id);
        id
    }

    pub(crate) fn find(&self, name: &[u8]) -> Option<SymbolId> {
        self.names.get(&SymbolName::prehashed(name)).copied()
    }

    pub(crate) fn name(&self, id: SymbolId) -> SymbolName<'data> {
        self.entries[id.as_usize()].name
    }

    pub(crate) fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.entries[id.as_usize()].symbol
    }

    pub(crate) fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.entries[id.as_usize()].symbol
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Symbol IDs in insertion order.
    pub(crate) fn ids(&self) -> impl Iterator<Item = SymbolId> {
        (0..self.entries.len() as u32).map(SymbolId)
    }

    pub(crate) fn add_defined(
        &mut self,
        name: &'data [u8],
        file_id: FileId,
        value: u32,
        section_index: i16,
        class: SymbolClass,
    ) -> AddDefinedOutcome {
        let defined = Symbol::Defined(Defined {
            file_id,
            value,
            section_index,
            class,
            virtual_address: 0,
        });
        match self.find(name) {
            None => AddDefinedOutcome::New(self.insert(name, defined)),
            Some(id) => match *self.symbol(id) {
                Symbol::Defined(existing) => AddDefinedOutcome::Duplicate {
                    id,
                    prior: existing.file_id,
                },
                // The interned name is kept; only the symbol state changes.
                Symbol::Undefined(_) | Symbol::Imported(_) => {
                    *self.symbol_mut(id) = defined;
                    AddDefinedOutcome::Resolved(id)
                }
            },
        }
    }

    pub(crate) fn add_undefined(
        &mut self,
        name: &'data [u8],
        file_id: FileId,
        class: SymbolClass,
    ) -> SymbolId {
        match self.find(name) {
            Some(id) => id,
            None => self.insert(
                name,
                Symbol::Undefined(Undefined {
                    file_id,
                    class,
                    weak_touched: false,
                }),
            ),
        }
    }

    /// Resolves an undefined symbol against a library export. Defined and
    /// already-imported symbols are left alone: local definitions are
    /// preferred, and the first providing library wins.
    pub(crate) fn add_imported(
        &mut self,
        name: &'data [u8],
        library: LibraryId,
        class: SymbolClass,
        weak: bool,
    ) -> SymbolId {
        let imported = Symbol::Imported(Imported {
            library,
            class,
            weak,
            import_index: None,
        });
        match self.find(name) {
            None => self.insert(name, imported),
            Some(id) => {
                if let Symbol::Undefined(_) = self.symbol(id) {
                    *self.symbol_mut(id) = imported;
                }
                id
            }
        }
    }
}
