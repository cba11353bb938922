pub use dbi::{DbiHeader, DebugInformation, DebugStreams, ModuleInfo};
pub use err::{DecodeError, DecodeResult, PdbError, Result};
pub use module_index::{FunctionSizes, ModuleIndex};
pub use msf::{Msf, MsfHeader, StreamDescriptor};
pub use pdb::{GlobalSymbols, ParserSettings, Pdb, Stream, parse};
pub use pdb_info::PdbInformation;
pub use section_table::{ResolvedAddress, SectionHeader, SectionTable};
pub use symbols::{
    DataSymbol, ProcedureSymbol, PublicSymbol, ReferenceSymbol, Symbol, SymbolIter, SymbolKind,
    UserDefinedTypeSymbol,
};
pub use type_table::{TypeIndex, TypeInformation, TypeRecord, TypeTable, get_type_size};

pub mod dbi;
pub mod err;
pub mod module_index;
pub mod msf;
pub mod pdb;
pub mod pdb_info;
pub mod section_table;
pub mod symbols;
pub mod type_table;

mod utils;
