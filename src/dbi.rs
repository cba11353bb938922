//! The DBI ("debug information") stream, stream 3.
//!
//! Only the parts needed to locate other streams are decoded: the header (which names the
//! global symbol record stream), the module list (which names each module's symbol stream) and
//! the optional debug header (which names the section header stream). The section
//! contribution, section map, file info, type server map and EC substreams are skipped.

use log::{debug, trace};

use crate::err::{DecodeError, DecodeResult};
use crate::utils::{ByteCursor, bytes};

pub const DBI_HEADER_SIZE: usize = 64;

/// Stream index value meaning "no such stream".
pub const NO_STREAM: u16 = 0xFFFF;

const MODULE_INFO_FIXED_SIZE: usize = 64;

pub const IMAGE_FILE_MACHINE_I386: u16 = 0x014C;
pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
pub const IMAGE_FILE_MACHINE_ARM64: u16 = 0xAA64;
pub const IMAGE_FILE_MACHINE_IA64: u16 = 0x0200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbiHeader {
    pub version_signature: i32,
    pub version_header: u32,
    pub age: u32,
    pub global_stream_index: u16,
    pub build_number: u16,
    pub public_stream_index: u16,
    pub pdb_dll_version: u16,
    pub symbol_records_stream: u16,
    pub pdb_dll_rbld: u16,
    pub module_info_size: u32,
    pub section_contribution_size: u32,
    pub section_map_size: u32,
    pub source_info_size: u32,
    pub type_server_map_size: u32,
    pub mfc_type_server_index: u32,
    pub optional_debug_header_size: u32,
    pub ec_substream_size: u32,
    pub flags: u16,
    pub machine: u16,
}

impl DbiHeader {
    pub fn from_bytes(buf: &[u8]) -> DecodeResult<DbiHeader> {
        let _ = bytes::slice_r(buf, 0, DBI_HEADER_SIZE, "DBI header")?;
        let mut cursor = ByteCursor::new(buf);

        let header = DbiHeader {
            version_signature: cursor.i32_named("version_signature")?,
            version_header: cursor.u32_named("version_header")?,
            age: cursor.u32_named("age")?,
            global_stream_index: cursor.u16_named("global_stream_index")?,
            build_number: cursor.u16_named("build_number")?,
            public_stream_index: cursor.u16_named("public_stream_index")?,
            pdb_dll_version: cursor.u16_named("pdb_dll_version")?,
            symbol_records_stream: cursor.u16_named("symbol_records_stream")?,
            pdb_dll_rbld: cursor.u16_named("pdb_dll_rbld")?,
            module_info_size: substream_size(&mut cursor, "module_info_size")?,
            section_contribution_size: substream_size(&mut cursor, "section_contribution_size")?,
            section_map_size: substream_size(&mut cursor, "section_map_size")?,
            source_info_size: substream_size(&mut cursor, "source_info_size")?,
            type_server_map_size: substream_size(&mut cursor, "type_server_map_size")?,
            mfc_type_server_index: cursor.u32_named("mfc_type_server_index")?,
            optional_debug_header_size: substream_size(&mut cursor, "optional_debug_header_size")?,
            ec_substream_size: substream_size(&mut cursor, "ec_substream_size")?,
            flags: cursor.u16_named("flags")?,
            machine: cursor.u16_named("machine")?,
        };

        Ok(header)
    }

    /// Pointer width of the target, when the machine type names a known architecture.
    pub fn pointer_width(&self) -> Option<u8> {
        match self.machine {
            IMAGE_FILE_MACHINE_AMD64 | IMAGE_FILE_MACHINE_ARM64 | IMAGE_FILE_MACHINE_IA64 => Some(8),
            IMAGE_FILE_MACHINE_I386 => Some(4),
            _ => None,
        }
    }
}

/// Substream sizes are stored as signed 32-bit values; negative sizes are nonsense.
fn substream_size(cursor: &mut ByteCursor<'_>, what: &'static str) -> DecodeResult<u32> {
    let at = cursor.pos();
    let value = cursor.i32_named(what)?;
    u32::try_from(value)
        .map_err(|_| DecodeError::malformed(what, at, format!("negative size {value}")))
}

/// One compiland (object file or import library member) linked into the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub flags: u16,
    /// Stream holding this module's symbols, or [`NO_STREAM`].
    pub stream_index: u16,
    /// Size of the symbol substream, including its leading 4-byte signature.
    pub symbols_size: u32,
    pub c11_lines_size: u32,
    pub c13_lines_size: u32,
    pub source_file_count: u16,
    pub module_name: String,
    pub object_file_name: String,
}

impl ModuleInfo {
    pub fn symbol_stream(&self) -> Option<u32> {
        (self.stream_index != NO_STREAM).then_some(u32::from(self.stream_index))
    }
}

/// Stream indices recorded in the DBI optional debug header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugStreams {
    pub fpo: Option<u16>,
    pub exception: Option<u16>,
    pub fixup: Option<u16>,
    pub omap_to_source: Option<u16>,
    pub omap_from_source: Option<u16>,
    pub section_headers: Option<u16>,
    pub token_rid_map: Option<u16>,
    pub xdata: Option<u16>,
    pub pdata: Option<u16>,
    pub new_fpo: Option<u16>,
    pub original_section_headers: Option<u16>,
}

impl DebugStreams {
    /// Entries past the end of a short header are treated as absent.
    fn from_bytes(buf: &[u8]) -> DebugStreams {
        let entry = |i: usize| bytes::read_u16_le(buf, i * 2).filter(|&index| index != NO_STREAM);

        DebugStreams {
            fpo: entry(0),
            exception: entry(1),
            fixup: entry(2),
            omap_to_source: entry(3),
            omap_from_source: entry(4),
            section_headers: entry(5),
            token_rid_map: entry(6),
            xdata: entry(7),
            pdata: entry(8),
            new_fpo: entry(9),
            original_section_headers: entry(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugInformation {
    pub header: DbiHeader,
    pub modules: Vec<ModuleInfo>,
    pub debug_streams: DebugStreams,
}

impl DebugInformation {
    pub fn parse(buf: &[u8]) -> DecodeResult<DebugInformation> {
        let header = DbiHeader::from_bytes(buf)?;
        debug!("DBI header: {header:?}");

        let mut cursor = ByteCursor::with_pos(buf, DBI_HEADER_SIZE)?;

        let module_bytes =
            cursor.take_bytes(header.module_info_size as usize, "module info substream")?;
        let modules = parse_modules(module_bytes).map_err(DecodeError::scoped_to_stream)?;
        trace!("DBI lists {} modules", modules.len());

        for (size, what) in [
            (header.section_contribution_size, "section contribution substream"),
            (header.section_map_size, "section map substream"),
            (header.source_info_size, "file info substream"),
            (header.type_server_map_size, "type server map substream"),
            (header.ec_substream_size, "EC substream"),
        ] {
            cursor.advance(size as usize, what)?;
        }

        let debug_header = cursor.take_bytes(
            header.optional_debug_header_size as usize,
            "optional debug header",
        )?;
        let debug_streams = DebugStreams::from_bytes(debug_header);

        Ok(DebugInformation {
            header,
            modules,
            debug_streams,
        })
    }

    pub fn symbol_records_stream(&self) -> Option<u32> {
        (self.header.symbol_records_stream != NO_STREAM)
            .then_some(u32::from(self.header.symbol_records_stream))
    }

    pub fn section_header_stream(&self) -> Option<u32> {
        self.debug_streams.section_headers.map(u32::from)
    }
}

fn parse_modules(buf: &[u8]) -> DecodeResult<Vec<ModuleInfo>> {
    let mut cursor = ByteCursor::new(buf);
    let mut modules = Vec::new();

    while !cursor.is_empty() {
        let _ = bytes::slice_r(buf, cursor.pos(), MODULE_INFO_FIXED_SIZE, "module info")?;

        // unused, followed by the module's first section contribution
        cursor.advance(4 + 28, "module section contribution")?;
        let flags = cursor.u16_named("module flags")?;
        let stream_index = cursor.u16_named("module stream index")?;
        let symbols_size = cursor.u32_named("module symbols size")?;
        let c11_lines_size = cursor.u32_named("module c11 size")?;
        let c13_lines_size = cursor.u32_named("module c13 size")?;
        let source_file_count = cursor.u16_named("module source file count")?;
        // padding, unused, source file name index, pdb file path name index
        cursor.advance(2 + 4 + 4 + 4, "module reserved fields")?;

        let module_name = cursor.c_str_lossy("module name")?;
        let object_file_name = cursor.c_str_lossy("object file name")?;
        cursor.align(4, "module info padding")?;

        modules.push(ModuleInfo {
            flags,
            stream_index,
            symbols_size,
            c11_lines_size,
            c13_lines_size,
            source_file_count,
            module_name,
            object_file_name,
        });
    }

    Ok(modules)
}
