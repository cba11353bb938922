//! CodeView symbol records.
//!
//! A symbol stream is a flat run of variable-length records:
//!
//! ```text
//! u16 length   // bytes following this field, including `kind`
//! u16 kind
//! [u8]         // length - 2 bytes of kind-specific payload
//! ```
//!
//! Records never refer to each other positionally, so decoding one only needs the previous
//! record's length. [`SymbolIter`] walks such a buffer lazily; it is finite and stops for good
//! at the first record that does not fit in the stream.

use std::fmt;

use log::trace;

use crate::err::{DecodeError, DecodeResult};
use crate::type_table::TypeIndex;
use crate::utils::ByteCursor;

pub type SymbolKind = u16;

pub const S_UDT: SymbolKind = 0x1108;
pub const S_LDATA32: SymbolKind = 0x110C;
pub const S_GDATA32: SymbolKind = 0x110D;
pub const S_PUB32: SymbolKind = 0x110E;
pub const S_LPROC32: SymbolKind = 0x110F;
pub const S_GPROC32: SymbolKind = 0x1110;
pub const S_LTHREAD32: SymbolKind = 0x1112;
pub const S_GTHREAD32: SymbolKind = 0x1113;
pub const S_PROCREF: SymbolKind = 0x1125;
pub const S_DATAREF: SymbolKind = 0x1126;
pub const S_LPROCREF: SymbolKind = 0x1127;
pub const S_LPROC32_ID: SymbolKind = 0x1146;
pub const S_GPROC32_ID: SymbolKind = 0x1147;

/// Signature opening every module symbol stream.
pub const CV_SIGNATURE_C13: u32 = 4;

/// `pubsymflags` bits of an `S_PUB32` record.
pub const CVPSF_CODE: u32 = 0x0000_0001;
pub const CVPSF_FUNCTION: u32 = 0x0000_0002;
pub const CVPSF_MANAGED: u32 = 0x0000_0004;
pub const CVPSF_MSIL: u32 = 0x0000_0008;

/// `S_PUB32`: an entry of the linker's public symbol table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicSymbol {
    pub flags: u32,
    pub offset: u32,
    pub segment: u16,
    pub name: String,
}

impl PublicSymbol {
    pub fn is_function(&self) -> bool {
        self.flags & CVPSF_FUNCTION != 0
    }

    pub fn is_code(&self) -> bool {
        self.flags & CVPSF_CODE != 0
    }
}

/// `S_GDATA32`, `S_LDATA32` and their thread-local counterparts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSymbol {
    pub global: bool,
    pub thread_local: bool,
    pub type_index: TypeIndex,
    pub offset: u32,
    pub segment: u16,
    pub name: String,
}

/// `S_GPROC32`, `S_LPROC32` and their `_ID` variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureSymbol {
    pub global: bool,
    pub parent: u32,
    pub end: u32,
    pub next: u32,
    /// Length of the procedure's code in bytes.
    pub len: u32,
    pub debug_start: u32,
    pub debug_end: u32,
    pub type_index: TypeIndex,
    pub offset: u32,
    pub segment: u16,
    pub flags: u8,
    pub name: String,
}

/// `S_PROCREF`, `S_LPROCREF`, `S_DATAREF`: pointers into a module's symbol stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSymbol {
    pub kind: SymbolKind,
    pub sum_name: u32,
    /// Offset of the referenced record within the module's symbol stream.
    pub symbol_offset: u32,
    /// One-based index into the DBI module list.
    pub module: u16,
    pub name: String,
}

/// `S_UDT`: a typedef or user-defined type name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDefinedTypeSymbol {
    pub type_index: TypeIndex,
    pub name: String,
}

#[derive(Clone, PartialEq, Eq)]
pub enum Symbol {
    Public(PublicSymbol),
    Data(DataSymbol),
    Procedure(ProcedureSymbol),
    ProcedureReference(ReferenceSymbol),
    DataReference(ReferenceSymbol),
    UserDefinedType(UserDefinedTypeSymbol),
    /// Any record kind this crate does not decode. The payload excludes the length and kind.
    Unknown { kind: SymbolKind, data: Vec<u8> },
}

impl Symbol {
    /// Decode one record's payload.
    pub fn parse(kind: SymbolKind, payload: &[u8]) -> DecodeResult<Symbol> {
        let mut cursor = ByteCursor::new(payload);

        let symbol = match kind {
            S_PUB32 => Symbol::Public(PublicSymbol {
                flags: cursor.u32_named("S_PUB32 flags")?,
                offset: cursor.u32_named("S_PUB32 offset")?,
                segment: cursor.u16_named("S_PUB32 segment")?,
                name: cursor.c_str_lossy("S_PUB32 name")?,
            }),
            S_LDATA32 | S_GDATA32 | S_LTHREAD32 | S_GTHREAD32 => Symbol::Data(DataSymbol {
                global: matches!(kind, S_GDATA32 | S_GTHREAD32),
                thread_local: matches!(kind, S_LTHREAD32 | S_GTHREAD32),
                type_index: TypeIndex(cursor.u32_named("data type index")?),
                offset: cursor.u32_named("data offset")?,
                segment: cursor.u16_named("data segment")?,
                name: cursor.c_str_lossy("data name")?,
            }),
            S_LPROC32 | S_GPROC32 | S_LPROC32_ID | S_GPROC32_ID => {
                Symbol::Procedure(ProcedureSymbol {
                    global: matches!(kind, S_GPROC32 | S_GPROC32_ID),
                    parent: cursor.u32_named("procedure parent")?,
                    end: cursor.u32_named("procedure end")?,
                    next: cursor.u32_named("procedure next")?,
                    len: cursor.u32_named("procedure length")?,
                    debug_start: cursor.u32_named("procedure debug start")?,
                    debug_end: cursor.u32_named("procedure debug end")?,
                    type_index: TypeIndex(cursor.u32_named("procedure type index")?),
                    offset: cursor.u32_named("procedure offset")?,
                    segment: cursor.u16_named("procedure segment")?,
                    flags: cursor.u8_named("procedure flags")?,
                    name: cursor.c_str_lossy("procedure name")?,
                })
            }
            S_PROCREF | S_LPROCREF | S_DATAREF => {
                let reference = ReferenceSymbol {
                    kind,
                    sum_name: cursor.u32_named("reference checksum")?,
                    symbol_offset: cursor.u32_named("reference symbol offset")?,
                    module: cursor.u16_named("reference module")?,
                    name: cursor.c_str_lossy("reference name")?,
                };
                if kind == S_DATAREF {
                    Symbol::DataReference(reference)
                } else {
                    Symbol::ProcedureReference(reference)
                }
            }
            S_UDT => Symbol::UserDefinedType(UserDefinedTypeSymbol {
                type_index: TypeIndex(cursor.u32_named("S_UDT type index")?),
                name: cursor.c_str_lossy("S_UDT name")?,
            }),
            _ => Symbol::Unknown {
                kind,
                data: payload.to_vec(),
            },
        };

        Ok(symbol)
    }

    /// The raw record kind (`leaf_type`). `_ID` procedures report their plain counterpart.
    pub fn kind(&self) -> SymbolKind {
        match self {
            Symbol::Public(_) => S_PUB32,
            Symbol::Data(d) => match (d.global, d.thread_local) {
                (true, false) => S_GDATA32,
                (false, false) => S_LDATA32,
                (true, true) => S_GTHREAD32,
                (false, true) => S_LTHREAD32,
            },
            Symbol::Procedure(p) if p.global => S_GPROC32,
            Symbol::Procedure(_) => S_LPROC32,
            Symbol::ProcedureReference(r) | Symbol::DataReference(r) => r.kind,
            Symbol::UserDefinedType(_) => S_UDT,
            Symbol::Unknown { kind, .. } => *kind,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Symbol::Public(s) => Some(&s.name),
            Symbol::Data(s) => Some(&s.name),
            Symbol::Procedure(s) => Some(&s.name),
            Symbol::ProcedureReference(s) | Symbol::DataReference(s) => Some(&s.name),
            Symbol::UserDefinedType(s) => Some(&s.name),
            Symbol::Unknown { .. } => None,
        }
    }

    /// `(segment, offset)` for records that carry an address.
    pub fn location(&self) -> Option<(u16, u32)> {
        match self {
            Symbol::Public(s) => Some((s.segment, s.offset)),
            Symbol::Data(s) => Some((s.segment, s.offset)),
            Symbol::Procedure(s) => Some((s.segment, s.offset)),
            _ => None,
        }
    }

    /// The type index, for records that carry one.
    pub fn type_index(&self) -> Option<TypeIndex> {
        match self {
            Symbol::Data(s) => Some(s.type_index),
            Symbol::Procedure(s) => Some(s.type_index),
            Symbol::UserDefinedType(s) => Some(s.type_index),
            _ => None,
        }
    }

    /// Public symbol flags, or the type index of records that carry one.
    pub fn symtype(&self) -> Option<u32> {
        match self {
            Symbol::Public(s) => Some(s.flags),
            other => other.type_index().map(|ti| ti.0),
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Symbol::Unknown { .. })
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::Public(s) => fmt::Debug::fmt(s, f),
            Symbol::Data(s) => fmt::Debug::fmt(s, f),
            Symbol::Procedure(s) => fmt::Debug::fmt(s, f),
            Symbol::ProcedureReference(s) | Symbol::DataReference(s) => fmt::Debug::fmt(s, f),
            Symbol::UserDefinedType(s) => fmt::Debug::fmt(s, f),
            Symbol::Unknown { kind, data } => f
                .debug_struct("Unknown")
                .field("kind", &format_args!("{kind:#06x}"))
                .field("len", &data.len())
                .finish(),
        }
    }
}

/// Lazily decodes the records of a symbol buffer, in stream order.
#[derive(Debug, Clone)]
pub struct SymbolIter<'a> {
    cursor: ByteCursor<'a>,
    done: bool,
}

impl<'a> SymbolIter<'a> {
    pub fn new(buf: &'a [u8]) -> SymbolIter<'a> {
        SymbolIter {
            cursor: ByteCursor::new(buf),
            done: false,
        }
    }

    /// Offset of the next record relative to the start of the buffer.
    pub fn position(&self) -> usize {
        self.cursor.pos()
    }

    /// Drain the iterator, keeping every record decoded before the first error.
    pub fn collect_partial(self) -> (Vec<Symbol>, Option<DecodeError>) {
        let mut symbols = Vec::new();
        for record in self {
            match record {
                Ok(symbol) => symbols.push(symbol),
                Err(e) => return (symbols, Some(e)),
            }
        }
        (symbols, None)
    }

    fn next_record(&mut self) -> DecodeResult<Option<Symbol>> {
        let start = self.cursor.pos();
        let remaining = self.cursor.remaining();

        // Streams may end in a few bytes of zero padding.
        if remaining < 4 {
            let tail = self.cursor.take_bytes(remaining, "symbol padding")?;
            if tail.iter().all(|&b| b == 0) {
                return Ok(None);
            }
            return Err(DecodeError::malformed(
                "symbol record",
                start,
                format!("{remaining} trailing bytes"),
            ));
        }

        let length = usize::from(self.cursor.u16_named("symbol record length")?);
        if length < 2 {
            return Err(DecodeError::malformed(
                "symbol record",
                start,
                format!("length {length} cannot hold a kind"),
            ));
        }
        if length > self.cursor.remaining() {
            return Err(DecodeError::malformed(
                "symbol record",
                start,
                format!(
                    "length {length} exceeds the {} bytes left in the stream",
                    self.cursor.remaining()
                ),
            ));
        }

        let kind = self.cursor.u16_named("symbol record kind")?;
        let payload = self.cursor.take_bytes(length - 2, "symbol record payload")?;
        trace!("Symbol record at {start}: kind {kind:#06x}, {length} bytes");

        let symbol = Symbol::parse(kind, payload).map_err(|e| match e {
            DecodeError::Truncated { what, .. } => DecodeError::malformed(
                what,
                start,
                format!("record of kind {kind:#06x} is shorter than its fields"),
            ),
            other => other,
        })?;

        Ok(Some(symbol))
    }
}

impl Iterator for SymbolIter<'_> {
    type Item = DecodeResult<Symbol>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.next_record() {
            Ok(Some(symbol)) => Some(Ok(symbol)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl std::iter::FusedIterator for SymbolIter<'_> {}

/// The records of a module symbol stream, after its leading signature.
///
/// `symbols_size` comes from the module's DBI entry and includes the signature; bytes beyond it
/// hold line information and are not symbols.
pub fn module_symbols(stream: &[u8], symbols_size: u32) -> DecodeResult<SymbolIter<'_>> {
    let mut cursor = ByteCursor::new(stream);
    let signature = cursor.u32_named("module symbol signature")?;
    if signature != CV_SIGNATURE_C13 {
        return Err(DecodeError::malformed(
            "module symbol stream",
            0,
            format!("unsupported signature {signature}"),
        ));
    }

    let end = symbols_size as usize;
    let records = stream.get(4..end).ok_or_else(|| DecodeError::Truncated {
        what: "module symbols",
        offset: 4,
        need: end.saturating_sub(4),
        have: stream.len().saturating_sub(4),
    })?;

    Ok(SymbolIter::new(records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, WriteBytesExt};
    use pretty_assertions::assert_eq;

    fn record(kind: SymbolKind, payload: &[u8]) -> Vec<u8> {
        let mut body = payload.to_vec();
        while (body.len() + 4) % 4 != 0 {
            body.push(0);
        }
        let mut out = vec![];
        out.write_u16::<LittleEndian>((body.len() + 2) as u16).unwrap();
        out.write_u16::<LittleEndian>(kind).unwrap();
        out.extend(body);
        out
    }

    fn public(flags: u32, segment: u16, offset: u32, name: &str) -> Vec<u8> {
        let mut payload = vec![];
        payload.write_u32::<LittleEndian>(flags).unwrap();
        payload.write_u32::<LittleEndian>(offset).unwrap();
        payload.write_u16::<LittleEndian>(segment).unwrap();
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        record(S_PUB32, &payload)
    }

    fn data(kind: SymbolKind, type_index: u32, segment: u16, offset: u32, name: &str) -> Vec<u8> {
        let mut payload = vec![];
        payload.write_u32::<LittleEndian>(type_index).unwrap();
        payload.write_u32::<LittleEndian>(offset).unwrap();
        payload.write_u16::<LittleEndian>(segment).unwrap();
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        record(kind, &payload)
    }

    #[test]
    fn test_decodes_public_and_data_symbols_in_order() {
        let mut raw = public(CVPSF_FUNCTION, 1, 0x20, "foo");
        raw.extend(data(S_GDATA32, 0x74, 2, 0x50, "g_counter"));
        raw.extend(data(S_LDATA32, 0x1000, 2, 0x60, "s_local"));
        raw.extend(public(0, 2, 0x100, "g_table"));

        let symbols: Vec<Symbol> = SymbolIter::new(&raw).map(Result::unwrap).collect();
        assert_eq!(
            symbols,
            vec![
                Symbol::Public(PublicSymbol {
                    flags: CVPSF_FUNCTION,
                    offset: 0x20,
                    segment: 1,
                    name: "foo".to_owned(),
                }),
                Symbol::Data(DataSymbol {
                    global: true,
                    thread_local: false,
                    type_index: TypeIndex(0x74),
                    offset: 0x50,
                    segment: 2,
                    name: "g_counter".to_owned(),
                }),
                Symbol::Data(DataSymbol {
                    global: false,
                    thread_local: false,
                    type_index: TypeIndex(0x1000),
                    offset: 0x60,
                    segment: 2,
                    name: "s_local".to_owned(),
                }),
                Symbol::Public(PublicSymbol {
                    flags: 0,
                    offset: 0x100,
                    segment: 2,
                    name: "g_table".to_owned(),
                }),
            ]
        );
        assert_eq!(symbols[1].kind(), S_GDATA32);
        assert_eq!(symbols[2].kind(), S_LDATA32);
        assert_eq!(symbols[2].location(), Some((2, 0x60)));
    }

    #[test]
    fn test_function_flag_classification() {
        let as_public = |flags| match Symbol::parse(S_PUB32, &public(flags, 1, 0, "x")[4..]) {
            Ok(Symbol::Public(p)) => p,
            other => panic!("unexpected {other:?}"),
        };

        assert!(as_public(CVPSF_FUNCTION).is_function());
        assert!(as_public(CVPSF_FUNCTION | CVPSF_CODE).is_function());
        assert!(!as_public(0).is_function());
        assert!(!as_public(CVPSF_CODE | CVPSF_MANAGED).is_function());
    }

    #[test]
    fn test_unknown_kinds_are_kept_raw() {
        let mut raw = record(0x1234, &[1, 2, 3, 4, 5, 6, 7, 8]);
        raw.extend(public(0, 1, 4, "after"));

        let symbols: Vec<Symbol> = SymbolIter::new(&raw).map(Result::unwrap).collect();
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0].kind(), 0x1234);
        assert!(symbols[0].is_unknown());
        assert_eq!(symbols[0].name(), None);
        assert_eq!(symbols[1].name(), Some("after"));
    }

    #[test]
    fn test_overlong_record_stops_with_partial_results() {
        let mut raw = public(0, 1, 4, "first");
        raw.extend(public(0, 1, 8, "second"));
        // A record claiming 0x100 bytes with only a handful present.
        raw.extend([0x00, 0x01, 0x0E, 0x11, 0, 0, 0, 0]);

        let mut iter = SymbolIter::new(&raw);
        let (symbols, error) = iter.clone().collect_partial();
        assert_eq!(symbols.len(), 2);
        assert!(matches!(error, Some(DecodeError::Malformed { .. })));

        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none(), "iterator must stop after an error");
    }

    #[test]
    fn test_record_shorter_than_its_fields_is_malformed() {
        let raw = record(S_PUB32, &[1, 0, 0, 0]);
        let (symbols, error) = SymbolIter::new(&raw).collect_partial();
        assert!(symbols.is_empty());
        assert!(matches!(error, Some(DecodeError::Malformed { offset: 0, .. })));
    }

    #[test]
    fn test_empty_stream_has_no_symbols() {
        assert_eq!(SymbolIter::new(&[]).count(), 0);
        assert_eq!(SymbolIter::new(&[0, 0]).count(), 0);
    }

    #[test]
    fn test_iteration_is_restartable_and_deterministic() {
        let mut raw = public(CVPSF_FUNCTION, 1, 0x20, "foo");
        raw.extend(data(S_GDATA32, 0x74, 2, 0x50, "g_counter"));

        let first: Vec<_> = SymbolIter::new(&raw).collect();
        let second: Vec<_> = SymbolIter::new(&raw).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_decodes_module_procedures() {
        let mut payload = vec![];
        for v in [0_u32, 0, 0, 0x40, 4, 0x3c, 0x1002, 0x20] {
            payload.write_u32::<LittleEndian>(v).unwrap();
        }
        payload.write_u16::<LittleEndian>(1).unwrap();
        payload.push(0);
        payload.extend_from_slice(b"foo\0");

        let mut stream = CV_SIGNATURE_C13.to_le_bytes().to_vec();
        stream.extend(record(S_GPROC32_ID, &payload));
        let symbols_size = stream.len() as u32;
        // Line information follows the symbols and must not be parsed as records.
        stream.extend([0xF2, 0x00, 0x00, 0x00, 0xFF, 0xFF]);

        let symbols: Vec<Symbol> = module_symbols(&stream, symbols_size)
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(symbols.len(), 1);
        match &symbols[0] {
            Symbol::Procedure(p) => {
                assert!(p.global);
                assert_eq!(p.len, 0x40);
                assert_eq!((p.segment, p.offset), (1, 0x20));
                assert_eq!(p.name, "foo");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_module_stream_with_bad_signature_is_rejected() {
        assert!(module_symbols(&[1, 0, 0, 0], 4).is_err());
        assert!(module_symbols(&[4, 0, 0, 0], 64).is_err());
    }
}
