//! Address-keyed facts collected from per-module symbol streams.
//!
//! The global symbol stream only carries public symbols and references; procedure lengths
//! and the types of data symbols live in the symbol stream of the module that defined them.

use hashbrown::HashMap as FastMap;
use log::{debug, warn};

use crate::dbi::ModuleInfo;
use crate::symbols::{Symbol, SymbolIter, module_symbols};
use crate::type_table::TypeIndex;

/// `(segment, offset)`, as recorded by symbols.
pub type SymbolAddress = (u16, u32);

/// Code length of every procedure found in module streams, keyed by its start address.
#[derive(Debug, Clone, Default)]
pub struct FunctionSizes {
    sizes: FastMap<SymbolAddress, u32, ahash::RandomState>,
}

impl FunctionSizes {
    /// Length of the procedure starting at `segment:offset`. `None` means no procedure record
    /// was seen there, which is distinct from a zero-length procedure.
    pub fn get(&self, segment: u16, offset: u32) -> Option<u32> {
        self.sizes.get(&(segment, offset)).copied()
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SymbolAddress, u32)> + '_ {
        self.sizes.iter().map(|(k, v)| (*k, *v))
    }

    fn insert(&mut self, address: SymbolAddress, len: u32) {
        self.sizes.entry(address).or_insert(len);
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModuleIndex {
    function_sizes: FunctionSizes,
    data_types: FastMap<SymbolAddress, TypeIndex, ahash::RandomState>,
    modules_scanned: usize,
    modules_failed: usize,
}

impl ModuleIndex {
    /// Scan every module's symbol stream, then the global symbol records.
    ///
    /// `stream` maps a stream index to its bytes. Modules whose stream is missing or fails to
    /// decode are logged and skipped; records decoded before a failure are kept. The first
    /// record seen for an address wins.
    pub fn build<'a, F>(modules: &[ModuleInfo], stream: F, globals: Option<&[u8]>) -> ModuleIndex
    where
        F: Fn(u32) -> Option<&'a [u8]>,
    {
        let mut index = ModuleIndex::default();

        for (i, module) in modules.iter().enumerate() {
            let Some(stream_index) = module.symbol_stream() else {
                continue;
            };
            let Some(bytes) = stream(stream_index) else {
                warn!(
                    "Module {i} ({}) names stream {stream_index}, which does not exist",
                    module.module_name
                );
                index.modules_failed += 1;
                continue;
            };

            index.modules_scanned += 1;
            match module_symbols(bytes, module.symbols_size) {
                Ok(records) => {
                    if !index.add_records(records) {
                        warn!(
                            "Module {i} ({}) has a malformed symbol stream",
                            module.module_name
                        );
                        index.modules_failed += 1;
                    }
                }
                Err(e) => {
                    warn!("Skipping symbols of module {i} ({}): {e}", module.module_name);
                    index.modules_failed += 1;
                }
            }
        }

        if let Some(globals) = globals {
            if !index.add_records(SymbolIter::new(globals)) {
                warn!("Global symbol stream is malformed, indexing the records before the error");
            }
        }

        debug!(
            "Indexed {} functions and {} data symbols from {} modules ({} failed)",
            index.function_sizes.len(),
            index.data_types.len(),
            index.modules_scanned,
            index.modules_failed
        );
        index
    }

    /// Returns `false` if the records ended with a decode error.
    fn add_records(&mut self, records: SymbolIter<'_>) -> bool {
        let (symbols, error) = records.collect_partial();
        for symbol in symbols {
            match symbol {
                Symbol::Procedure(p) => self.function_sizes.insert((p.segment, p.offset), p.len),
                Symbol::Data(d) => {
                    self.data_types
                        .entry((d.segment, d.offset))
                        .or_insert(d.type_index);
                }
                _ => {}
            }
        }
        if let Some(e) = &error {
            debug!("Symbol records stopped early: {e}");
        }
        error.is_none()
    }

    pub fn function_sizes(&self) -> &FunctionSizes {
        &self.function_sizes
    }

    /// Type of the data symbol at `segment:offset`, if any module or the global stream
    /// described one.
    pub fn data_type(&self, segment: u16, offset: u32) -> Option<TypeIndex> {
        self.data_types.get(&(segment, offset)).copied()
    }

    pub fn modules_scanned(&self) -> usize {
        self.modules_scanned
    }

    pub fn modules_failed(&self) -> usize {
        self.modules_failed
    }
}
