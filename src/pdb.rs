use std::fs::File;
use std::ops::Deref;
use std::path::Path;
use std::sync::OnceLock;

use log::{debug, warn};
use memmap2::Mmap;

use crate::dbi::{DebugInformation, ModuleInfo};
use crate::err::{DecodeError, DecodeResult, PdbError, Result};
use crate::module_index::{FunctionSizes, ModuleIndex};
use crate::msf::{Msf, MsfData};
use crate::pdb_info::PdbInformation;
use crate::section_table::SectionTable;
use crate::symbols::{PublicSymbol, Symbol, SymbolIter};
use crate::type_table::{DEFAULT_POINTER_WIDTH, TypeIndex, TypeInformation, TypeTable};

pub const PDB_INFORMATION_STREAM: u32 = 1;
pub const TPI_STREAM: u32 = 2;
pub const DBI_STREAM: u32 = 3;
pub const IPI_STREAM: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParserSettings {
    /// Overrides the pointer width derived from the DBI machine type.
    pointer_width: Option<u8>,
    /// Whether to read module symbol streams for function sizes and data types.
    scan_modules: bool,
}

impl Default for ParserSettings {
    fn default() -> Self {
        ParserSettings {
            pointer_width: None,
            scan_modules: true,
        }
    }
}

impl ParserSettings {
    pub fn new() -> Self {
        ParserSettings::default()
    }

    /// Sets the width used for pointers whose type record does not state a size.
    /// Only 4 and 8 are meaningful; other values are ignored with a warning.
    pub fn pointer_width(mut self, pointer_width: Option<u8>) -> Self {
        self.pointer_width = match pointer_width {
            Some(4 | 8) | None => pointer_width,
            Some(other) => {
                warn!("Ignoring unsupported pointer width {other}");
                None
            }
        };
        self
    }

    /// When disabled, module symbol streams are never read: function sizes and `typind`
    /// lookups come back empty.
    pub fn scan_modules(mut self, scan_modules: bool) -> Self {
        self.scan_modules = scan_modules;
        self
    }

    pub fn get_pointer_width(&self) -> Option<u8> {
        self.pointer_width
    }

    pub fn should_scan_modules(&self) -> bool {
        self.scan_modules
    }
}

/// A borrowed view over one stream's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stream<'a> {
    index: u32,
    data: &'a [u8],
}

impl<'a> Stream<'a> {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn as_slice(&self) -> &'a [u8] {
        self.data
    }
}

impl Deref for Stream<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data
    }
}

/// A parsed PDB. Streams and the structures derived from them are decoded on first use and
/// cached for the lifetime of the container.
#[derive(Debug)]
pub struct Pdb {
    msf: Msf,
    settings: ParserSettings,
    info: Option<PdbInformation>,
    dbi: Option<DebugInformation>,
    sections: Option<SectionTable>,
    types: OnceLock<Option<TypeInformation>>,
    module_index: OnceLock<ModuleIndex>,
}

impl Pdb {
    /// Memory-map and parse the file at `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Pdb> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| PdbError::FailedToOpenFile {
            path: path.to_path_buf(),
            source,
        })?;

        let data = if file.metadata()?.len() == 0 {
            MsfData::Owned(Vec::new())
        } else {
            // SAFETY: the map is read-only and the container never hands out mutable access.
            // Modifying the file while it is mapped is outside the crate's contract.
            MsfData::Mapped(unsafe { Mmap::map(&file)? })
        };

        Ok(Pdb::from_msf(Msf::parse(data)?, ParserSettings::default())?)
    }

    pub fn from_buffer(buffer: Vec<u8>) -> DecodeResult<Pdb> {
        Pdb::from_buffer_with_settings(buffer, ParserSettings::default())
    }

    pub fn from_buffer_with_settings(
        buffer: Vec<u8>,
        settings: ParserSettings,
    ) -> DecodeResult<Pdb> {
        Pdb::from_msf(Msf::from_buffer(buffer)?, settings)
    }

    /// Replace the settings. Cached types and module data are rebuilt on next use.
    pub fn with_configuration(self, settings: ParserSettings) -> Pdb {
        Pdb {
            settings,
            types: OnceLock::new(),
            module_index: OnceLock::new(),
            ..self
        }
    }

    fn from_msf(msf: Msf, settings: ParserSettings) -> DecodeResult<Pdb> {
        let info = decode_optional(
            &msf,
            PDB_INFORMATION_STREAM,
            "PDB information",
            PdbInformation::parse,
        )?;
        if let Some(info) = &info {
            debug!(
                "PDB version {} age {} with {} named streams",
                info.version,
                info.age,
                info.stream_names().count()
            );
        }

        let dbi = decode_optional(&msf, DBI_STREAM, "DBI", DebugInformation::parse)?;

        // The section table is fixed-width: a bad one fails the whole container.
        let sections = match dbi.as_ref().and_then(DebugInformation::section_header_stream) {
            Some(index) => match msf.stream_bytes(index) {
                Some(bytes) => Some(SectionTable::parse(bytes)?),
                None => {
                    warn!("Section header stream {index} is not in the stream directory");
                    None
                }
            },
            None => None,
        };

        Ok(Pdb {
            msf,
            settings,
            info,
            dbi,
            sections,
            types: OnceLock::new(),
            module_index: OnceLock::new(),
        })
    }

    pub fn settings(&self) -> &ParserSettings {
        &self.settings
    }

    pub fn msf(&self) -> &Msf {
        &self.msf
    }

    pub fn stream_count(&self) -> usize {
        self.msf.stream_count()
    }

    /// Stream `index`, or `None` past the end of the stream directory.
    pub fn stream(&self, index: u32) -> Option<Stream<'_>> {
        let data = self.msf.stream_bytes(index)?;
        Some(Stream { index, data })
    }

    /// A stream listed by name in the PDB information stream, such as `/names`.
    pub fn named_stream(&self, name: &str) -> Option<Stream<'_>> {
        let index = self.info.as_ref()?.stream_index(name)?;
        self.stream(index)
    }

    pub fn pdb_information(&self) -> Option<&PdbInformation> {
        self.info.as_ref()
    }

    pub fn debug_information(&self) -> Option<&DebugInformation> {
        self.dbi.as_ref()
    }

    pub fn modules(&self) -> &[ModuleInfo] {
        self.dbi.as_ref().map_or(&[], |dbi| dbi.modules.as_slice())
    }

    pub fn section_headers(&self) -> Option<&SectionTable> {
        self.sections.as_ref()
    }

    /// Width of pointers whose type records leave the size out: the configured override,
    /// else what the DBI machine type implies, else 4.
    pub fn pointer_width(&self) -> u8 {
        self.settings
            .get_pointer_width()
            .or_else(|| self.dbi.as_ref().and_then(|dbi| dbi.header.pointer_width()))
            .unwrap_or(DEFAULT_POINTER_WIDTH)
    }

    /// The TPI stream, decoded on first use. `None` when the stream is absent, empty or has an
    /// unreadable header.
    pub fn type_information(&self) -> Option<&TypeInformation> {
        self.types
            .get_or_init(|| {
                let bytes = self.msf.stream_bytes(TPI_STREAM).filter(|b| !b.is_empty())?;
                match TypeInformation::parse(bytes) {
                    Ok(tpi) => Some(tpi.with_pointer_width(self.pointer_width())),
                    Err(e) => {
                        warn!("Failed to decode the TPI stream: {e}");
                        None
                    }
                }
            })
            .as_ref()
    }

    pub fn types(&self) -> Option<&TypeTable> {
        self.type_information().map(TypeInformation::types)
    }

    pub fn global_symbols(&self) -> Option<GlobalSymbols<'_>> {
        let index = self.dbi.as_ref()?.symbol_records_stream()?;
        let stream = self.stream(index)?;
        Some(GlobalSymbols { pdb: self, stream })
    }

    /// Function sizes and data types gathered from module symbol streams, built on first use.
    pub fn module_index(&self) -> &ModuleIndex {
        self.module_index.get_or_init(|| {
            if !self.settings.should_scan_modules() {
                debug!("Module scanning disabled");
                return ModuleIndex::default();
            }
            let globals = self
                .dbi
                .as_ref()
                .and_then(DebugInformation::symbol_records_stream)
                .and_then(|index| self.msf.stream_bytes(index));
            ModuleIndex::build(self.modules(), |index| self.msf.stream_bytes(index), globals)
        })
    }
}

/// Decode a well-known stream. Absent streams and streams with a malformed body yield `None`;
/// a stream too short for its fixed header fails the container.
fn decode_optional<T>(
    msf: &Msf,
    index: u32,
    what: &str,
    decode: impl FnOnce(&[u8]) -> DecodeResult<T>,
) -> DecodeResult<Option<T>> {
    let Some(bytes) = msf.stream_bytes(index).filter(|b| !b.is_empty()) else {
        debug!("{what} stream {index} is absent");
        return Ok(None);
    };

    match decode(bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e @ DecodeError::Malformed { .. }) => {
            warn!("Ignoring malformed {what} stream: {e}");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// The global symbol record stream, as named by the DBI header.
#[derive(Debug, Clone, Copy)]
pub struct GlobalSymbols<'a> {
    pdb: &'a Pdb,
    stream: Stream<'a>,
}

impl<'a> GlobalSymbols<'a> {
    /// Size of the stream in bytes.
    pub fn size(&self) -> usize {
        self.stream.len()
    }

    pub fn stream(&self) -> Stream<'a> {
        self.stream
    }

    /// Every record, including kinds this crate does not decode. Each call starts over from
    /// the beginning of the stream.
    pub fn records(&self) -> SymbolIter<'a> {
        SymbolIter::new(self.stream.as_slice())
    }

    /// Decoded records, skipping unknown kinds. A decode error is yielded once and ends the
    /// sequence.
    pub fn globals(&self) -> impl Iterator<Item = DecodeResult<Symbol>> + use<'a> {
        self.records()
            .filter(|record| !matches!(record, Ok(symbol) if symbol.is_unknown()))
    }

    pub fn func_sizes(&self) -> &'a FunctionSizes {
        self.pdb.module_index().function_sizes()
    }

    /// Type of the data a public symbol labels, taken from a data record at the same address.
    pub fn typind(&self, symbol: &PublicSymbol) -> Option<TypeIndex> {
        self.pdb
            .module_index()
            .data_type(symbol.segment, symbol.offset)
    }
}

/// Open and parse the PDB at `path`.
pub fn parse(path: impl AsRef<Path>) -> Result<Pdb> {
    Pdb::from_path(path)
}
