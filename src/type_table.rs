//! The TPI (type information) stream and the type size resolver.
//!
//! Type records are framed exactly like symbol records (`u16 length, u16 leaf, payload`), but
//! carry no explicit index: the n-th record in the stream has type index
//! `type_index_begin + n`. Indices below `0x1000` are never stored; they name built-in
//! primitive types whose sizes are fixed.

use std::fmt;
use std::sync::OnceLock;

use hashbrown::HashMap;
use log::{debug, trace, warn};

use crate::err::{DecodeError, DecodeResult};
use crate::utils::{ByteCursor, bytes};

pub const TPI_HEADER_SIZE: usize = 56;

/// First index that is not a built-in primitive.
pub const FIRST_NON_PRIMITIVE_INDEX: u32 = 0x1000;

/// Bound on nested lookups while resolving a size. Corrupt streams can build cycles.
pub const MAX_TYPE_DEPTH: usize = 64;

/// Pointer width assumed when nothing in the container names the target architecture.
pub const DEFAULT_POINTER_WIDTH: u8 = 4;

pub type TypeLeaf = u16;

pub const LF_MODIFIER: TypeLeaf = 0x1001;
pub const LF_POINTER: TypeLeaf = 0x1002;
pub const LF_PROCEDURE: TypeLeaf = 0x1008;
pub const LF_MFUNCTION: TypeLeaf = 0x1009;
pub const LF_ARGLIST: TypeLeaf = 0x1201;
pub const LF_FIELDLIST: TypeLeaf = 0x1203;
pub const LF_BITFIELD: TypeLeaf = 0x1205;
pub const LF_ARRAY: TypeLeaf = 0x1503;
pub const LF_CLASS: TypeLeaf = 0x1504;
pub const LF_STRUCTURE: TypeLeaf = 0x1505;
pub const LF_UNION: TypeLeaf = 0x1506;
pub const LF_ENUM: TypeLeaf = 0x1507;
pub const LF_ALIAS: TypeLeaf = 0x150A;
pub const LF_INTERFACE: TypeLeaf = 0x1519;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeIndex(pub u32);

impl TypeIndex {
    pub fn is_primitive(self) -> bool {
        self.0 < FIRST_NON_PRIMITIVE_INDEX
    }
}

impl fmt::Debug for TypeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeIndex({:#06x})", self.0)
    }
}

impl fmt::Display for TypeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl From<u32> for TypeIndex {
    fn from(value: u32) -> Self {
        TypeIndex(value)
    }
}

/// Size of a built-in primitive type index.
///
/// Bits 8..12 select a pointer mode (0 = the value itself), bits 0..8 the base kind. `void`
/// and the "no type" kind have no size.
pub fn primitive_size(index: TypeIndex) -> Option<u64> {
    if !index.is_primitive() {
        return None;
    }

    match (index.0 >> 8) & 0xF {
        0 => {}
        1 => return Some(2),
        2 | 3 | 4 => return Some(4),
        5 => return Some(6),
        6 => return Some(8),
        7 => return Some(16),
        _ => return None,
    }

    let size = match index.0 & 0xFF {
        0x10 | 0x20 | 0x30 | 0x68 | 0x69 | 0x70 | 0x7C => 1,
        0x11 | 0x21 | 0x31 | 0x46 | 0x71 | 0x72 | 0x73 | 0x7A => 2,
        0x44 => 6,
        0x08 | 0x12 | 0x22 | 0x32 | 0x40 | 0x45 | 0x74 | 0x75 | 0x7B => 4,
        0x13 | 0x23 | 0x33 | 0x41 | 0x50 | 0x76 | 0x77 => 8,
        0x42 => 10,
        0x14 | 0x24 | 0x43 | 0x51 | 0x78 | 0x79 => 16,
        0x52 => 20,
        0x53 => 32,
        _ => return None,
    };
    Some(size)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpiHeader {
    pub version: u32,
    pub header_size: u32,
    pub type_index_begin: u32,
    pub type_index_end: u32,
    pub type_record_bytes: u32,
    pub hash_stream_index: u16,
    pub hash_aux_stream_index: u16,
    pub hash_key_size: u32,
    pub num_hash_buckets: u32,
}

impl TpiHeader {
    pub fn from_bytes(buf: &[u8]) -> DecodeResult<TpiHeader> {
        let _ = bytes::slice_r(buf, 0, TPI_HEADER_SIZE, "TPI header")?;
        let mut cursor = ByteCursor::new(buf);

        let header = TpiHeader {
            version: cursor.u32_named("TPI version")?,
            header_size: cursor.u32_named("TPI header size")?,
            type_index_begin: cursor.u32_named("TPI type index begin")?,
            type_index_end: cursor.u32_named("TPI type index end")?,
            type_record_bytes: cursor.u32_named("TPI type record bytes")?,
            hash_stream_index: cursor.u16_named("TPI hash stream")?,
            hash_aux_stream_index: cursor.u16_named("TPI hash aux stream")?,
            hash_key_size: cursor.u32_named("TPI hash key size")?,
            num_hash_buckets: cursor.u32_named("TPI hash buckets")?,
        };
        // The remaining 24 bytes locate hash substreams, which are not needed for lookups by
        // index.

        if (header.header_size as usize) < TPI_HEADER_SIZE {
            return Err(DecodeError::malformed(
                "TPI header",
                4,
                format!("header size {} is too small", header.header_size),
            ));
        }
        if header.type_index_end < header.type_index_begin {
            return Err(DecodeError::malformed(
                "TPI header",
                8,
                format!(
                    "type index range {:#x}..{:#x} is inverted",
                    header.type_index_begin, header.type_index_end
                ),
            ));
        }

        Ok(header)
    }
}

/// `property` bits shared by class, union and enum records.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeProperties(pub u16);

impl TypeProperties {
    /// This record only names the type; the definition is elsewhere in the stream.
    pub fn forward_reference(self) -> bool {
        self.0 & 0x0080 != 0
    }

    /// A decorated unique name follows the display name.
    pub fn has_unique_name(self) -> bool {
        self.0 & 0x0200 != 0
    }
}

impl fmt::Debug for TypeProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeProperties({:#06x})", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifierType {
    pub underlying_type: TypeIndex,
    pub attributes: u16,
}

impl ModifierType {
    pub fn is_const(&self) -> bool {
        self.attributes & 0x1 != 0
    }

    pub fn is_volatile(&self) -> bool {
        self.attributes & 0x2 != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerType {
    pub underlying_type: TypeIndex,
    pub attributes: u32,
}

impl PointerType {
    /// Size in bytes as recorded in the attributes, 0 when the compiler left it out.
    pub fn size(&self) -> u8 {
        ((self.attributes >> 13) & 0x3F) as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayType {
    pub element_type: TypeIndex,
    pub indexing_type: TypeIndex,
    /// Total size of the array in bytes.
    pub size: u64,
    pub name: String,
}

impl ArrayType {
    /// Number of elements, when the element size is known and non-zero.
    pub fn element_count(&self, types: &TypeTable) -> Option<u64> {
        let element_size = types.size_of(self.element_type)?;
        self.size.checked_div(element_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Class,
    Struct,
    Interface,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassType {
    pub kind: ClassKind,
    pub count: u16,
    pub properties: TypeProperties,
    pub fields: TypeIndex,
    pub derived_from: TypeIndex,
    pub vtable_shape: TypeIndex,
    pub size: u64,
    pub name: String,
    pub unique_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnionType {
    pub count: u16,
    pub properties: TypeProperties,
    pub fields: TypeIndex,
    pub size: u64,
    pub name: String,
    pub unique_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumerationType {
    pub count: u16,
    pub properties: TypeProperties,
    pub underlying_type: TypeIndex,
    pub fields: TypeIndex,
    pub name: String,
    pub unique_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitfieldType {
    pub underlying_type: TypeIndex,
    pub length: u8,
    pub position: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasType {
    pub underlying_type: TypeIndex,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeRecord {
    Modifier(ModifierType),
    Pointer(PointerType),
    Array(ArrayType),
    Class(ClassType),
    Union(UnionType),
    Enumeration(EnumerationType),
    Bitfield(BitfieldType),
    Alias(AliasType),
    /// Procedures, field lists, argument lists and every other leaf without a size of its own.
    Other { kind: TypeLeaf },
}

impl TypeRecord {
    pub fn parse(leaf: TypeLeaf, payload: &[u8]) -> DecodeResult<TypeRecord> {
        let mut cursor = ByteCursor::new(payload);

        let record = match leaf {
            LF_MODIFIER => TypeRecord::Modifier(ModifierType {
                underlying_type: TypeIndex(cursor.u32_named("LF_MODIFIER type")?),
                attributes: cursor.u16_named("LF_MODIFIER attributes")?,
            }),
            LF_POINTER => TypeRecord::Pointer(PointerType {
                underlying_type: TypeIndex(cursor.u32_named("LF_POINTER type")?),
                attributes: cursor.u32_named("LF_POINTER attributes")?,
            }),
            LF_ARRAY => TypeRecord::Array(ArrayType {
                element_type: TypeIndex(cursor.u32_named("LF_ARRAY element type")?),
                indexing_type: TypeIndex(cursor.u32_named("LF_ARRAY index type")?),
                size: cursor.numeric_leaf("LF_ARRAY size")?,
                name: cursor.c_str_lossy("LF_ARRAY name")?,
            }),
            LF_CLASS | LF_STRUCTURE | LF_INTERFACE => {
                let kind = match leaf {
                    LF_CLASS => ClassKind::Class,
                    LF_STRUCTURE => ClassKind::Struct,
                    _ => ClassKind::Interface,
                };
                let count = cursor.u16_named("class field count")?;
                let properties = TypeProperties(cursor.u16_named("class properties")?);
                let fields = TypeIndex(cursor.u32_named("class field list")?);
                let derived_from = TypeIndex(cursor.u32_named("class derived list")?);
                let vtable_shape = TypeIndex(cursor.u32_named("class vtable shape")?);
                let size = cursor.numeric_leaf("class size")?;
                let (name, unique_name) = read_names(&mut cursor, properties)?;
                TypeRecord::Class(ClassType {
                    kind,
                    count,
                    properties,
                    fields,
                    derived_from,
                    vtable_shape,
                    size,
                    name,
                    unique_name,
                })
            }
            LF_UNION => {
                let count = cursor.u16_named("union field count")?;
                let properties = TypeProperties(cursor.u16_named("union properties")?);
                let fields = TypeIndex(cursor.u32_named("union field list")?);
                let size = cursor.numeric_leaf("union size")?;
                let (name, unique_name) = read_names(&mut cursor, properties)?;
                TypeRecord::Union(UnionType {
                    count,
                    properties,
                    fields,
                    size,
                    name,
                    unique_name,
                })
            }
            LF_ENUM => {
                let count = cursor.u16_named("enum field count")?;
                let properties = TypeProperties(cursor.u16_named("enum properties")?);
                let underlying_type = TypeIndex(cursor.u32_named("enum underlying type")?);
                let fields = TypeIndex(cursor.u32_named("enum field list")?);
                let (name, unique_name) = read_names(&mut cursor, properties)?;
                TypeRecord::Enumeration(EnumerationType {
                    count,
                    properties,
                    underlying_type,
                    fields,
                    name,
                    unique_name,
                })
            }
            LF_BITFIELD => TypeRecord::Bitfield(BitfieldType {
                underlying_type: TypeIndex(cursor.u32_named("LF_BITFIELD type")?),
                length: cursor.u8_named("LF_BITFIELD length")?,
                position: cursor.u8_named("LF_BITFIELD position")?,
            }),
            LF_ALIAS => TypeRecord::Alias(AliasType {
                underlying_type: TypeIndex(cursor.u32_named("LF_ALIAS type")?),
                name: cursor.c_str_lossy("LF_ALIAS name")?,
            }),
            kind => TypeRecord::Other { kind },
        };

        Ok(record)
    }

    pub fn kind(&self) -> TypeLeaf {
        match self {
            TypeRecord::Modifier(_) => LF_MODIFIER,
            TypeRecord::Pointer(_) => LF_POINTER,
            TypeRecord::Array(_) => LF_ARRAY,
            TypeRecord::Class(c) => match c.kind {
                ClassKind::Class => LF_CLASS,
                ClassKind::Struct => LF_STRUCTURE,
                ClassKind::Interface => LF_INTERFACE,
            },
            TypeRecord::Union(_) => LF_UNION,
            TypeRecord::Enumeration(_) => LF_ENUM,
            TypeRecord::Bitfield(_) => LF_BITFIELD,
            TypeRecord::Alias(_) => LF_ALIAS,
            TypeRecord::Other { kind } => *kind,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            TypeRecord::Array(a) => Some(&a.name),
            TypeRecord::Class(c) => Some(&c.name),
            TypeRecord::Union(u) => Some(&u.name),
            TypeRecord::Enumeration(e) => Some(&e.name),
            TypeRecord::Alias(a) => Some(&a.name),
            _ => None,
        }
    }

    /// `(properties, name, unique name)` for the kinds that can be forward references.
    fn tag(&self) -> Option<(TypeProperties, &str, Option<&str>)> {
        match self {
            TypeRecord::Class(c) => Some((c.properties, &c.name, c.unique_name.as_deref())),
            TypeRecord::Union(u) => Some((u.properties, &u.name, u.unique_name.as_deref())),
            TypeRecord::Enumeration(e) => {
                Some((e.properties, &e.name, e.unique_name.as_deref()))
            }
            _ => None,
        }
    }

    pub fn is_forward_reference(&self) -> bool {
        self.tag()
            .is_some_and(|(properties, ..)| properties.forward_reference())
    }
}

fn read_names(
    cursor: &mut ByteCursor<'_>,
    properties: TypeProperties,
) -> DecodeResult<(String, Option<String>)> {
    let name = cursor.c_str_lossy("type name")?;
    let unique_name = if properties.has_unique_name() {
        Some(cursor.c_str_lossy("type unique name")?)
    } else {
        None
    };
    Ok((name, unique_name))
}

/// Decoded type records, indexable by [`TypeIndex`]. Read-only once built.
#[derive(Debug, Clone)]
pub struct TypeTable {
    type_index_begin: u32,
    records: Vec<TypeRecord>,
    pointer_width: u8,
    /// Tag name -> defining record. Built on the first forward reference lookup.
    definitions: OnceLock<HashMap<String, TypeIndex>>,
}

impl TypeTable {
    /// Decode a run of type records, failing on the first malformed one.
    pub fn decode(buf: &[u8], type_index_begin: u32) -> DecodeResult<TypeTable> {
        match TypeTable::decode_partial(buf, type_index_begin) {
            (table, None) => Ok(table),
            (_, Some(e)) => Err(e),
        }
    }

    /// Decode a run of type records, keeping every record before the first malformed one.
    pub fn decode_partial(buf: &[u8], type_index_begin: u32) -> (TypeTable, Option<DecodeError>) {
        let mut records = Vec::new();
        let mut cursor = ByteCursor::new(buf);
        let mut error = None;

        while !cursor.is_empty() {
            match next_record(&mut cursor) {
                Ok(record) => records.push(record),
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }

        let table = TypeTable {
            type_index_begin,
            records,
            pointer_width: DEFAULT_POINTER_WIDTH,
            definitions: OnceLock::new(),
        };
        (table, error)
    }

    pub fn with_pointer_width(mut self, pointer_width: u8) -> TypeTable {
        self.pointer_width = pointer_width;
        self
    }

    pub fn pointer_width(&self) -> u8 {
        self.pointer_width
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn type_index_begin(&self) -> TypeIndex {
        TypeIndex(self.type_index_begin)
    }

    /// One past the last index present in the table.
    pub fn type_index_end(&self) -> TypeIndex {
        TypeIndex(self.type_index_begin.saturating_add(self.records.len() as u32))
    }

    pub fn get(&self, index: TypeIndex) -> Option<&TypeRecord> {
        let slot = index.0.checked_sub(self.type_index_begin)?;
        self.records.get(slot as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TypeIndex, &TypeRecord)> {
        (self.type_index_begin..)
            .map(TypeIndex)
            .zip(self.records.iter())
    }

    /// The full definition a forward reference stands for, matched by unique name and then by
    /// name. Records that are not forward references resolve to themselves.
    pub fn resolve_forward_reference(&self, index: TypeIndex) -> Option<TypeIndex> {
        let record = self.get(index)?;
        let (properties, name, unique_name) = record.tag()?;
        if !properties.forward_reference() {
            return Some(index);
        }

        let definitions = self.definitions.get_or_init(|| self.collect_definitions());
        unique_name
            .and_then(|unique| definitions.get(unique))
            .or_else(|| definitions.get(name))
            .copied()
    }

    fn collect_definitions(&self) -> HashMap<String, TypeIndex> {
        let mut definitions = HashMap::new();
        for (index, record) in self.iter() {
            let Some((properties, name, unique_name)) = record.tag() else {
                continue;
            };
            if properties.forward_reference() {
                continue;
            }
            if let Some(unique) = unique_name {
                definitions.entry(unique.to_owned()).or_insert(index);
            }
            definitions.entry(name.to_owned()).or_insert(index);
        }
        debug!("Indexed {} type definitions by name", definitions.len());
        definitions
    }

    /// Size in bytes of the type named by `index`, or `None` if it cannot be determined.
    pub fn size_of(&self, index: TypeIndex) -> Option<u64> {
        self.size_of_at_depth(index, 0)
    }

    fn size_of_at_depth(&self, index: TypeIndex, depth: usize) -> Option<u64> {
        if depth >= MAX_TYPE_DEPTH {
            trace!("Gave up sizing {index} after {depth} nested lookups");
            return None;
        }
        if index.is_primitive() {
            return primitive_size(index);
        }

        match self.get(index)? {
            TypeRecord::Modifier(m) => self.size_of_at_depth(m.underlying_type, depth + 1),
            TypeRecord::Pointer(p) => match p.size() {
                0 => Some(u64::from(self.pointer_width)),
                size => Some(u64::from(size)),
            },
            TypeRecord::Array(a) => Some(a.size),
            TypeRecord::Bitfield(b) => self.size_of_at_depth(b.underlying_type, depth + 1),
            TypeRecord::Alias(a) => self.size_of_at_depth(a.underlying_type, depth + 1),
            record if record.is_forward_reference() => {
                let definition = self.resolve_forward_reference(index)?;
                self.size_of_at_depth(definition, depth + 1)
            }
            TypeRecord::Class(c) => Some(c.size),
            TypeRecord::Union(u) => Some(u.size),
            TypeRecord::Enumeration(e) => self.size_of_at_depth(e.underlying_type, depth + 1),
            TypeRecord::Other { .. } => None,
        }
    }
}

fn next_record(cursor: &mut ByteCursor<'_>) -> DecodeResult<TypeRecord> {
    let start = cursor.pos();
    let length = usize::from(
        cursor
            .u16_named("type record length")
            .map_err(DecodeError::scoped_to_stream)?,
    );
    if length < 2 || length > cursor.remaining() {
        return Err(DecodeError::malformed(
            "type record",
            start,
            format!(
                "length {length} does not fit the {} bytes left in the stream",
                cursor.remaining()
            ),
        ));
    }

    let leaf = cursor.u16_named("type record leaf")?;
    let payload = cursor.take_bytes(length - 2, "type record payload")?;

    TypeRecord::parse(leaf, payload).map_err(|e| match e {
        DecodeError::Truncated { what, .. } => DecodeError::malformed(
            what,
            start,
            format!("record with leaf {leaf:#06x} is shorter than its fields"),
        ),
        other => other,
    })
}

/// The TPI stream: header plus decoded record table.
#[derive(Debug, Clone)]
pub struct TypeInformation {
    header: TpiHeader,
    types: TypeTable,
    error: Option<DecodeError>,
}

impl TypeInformation {
    /// Parse a TPI stream. A bad header fails; a bad record keeps the records before it and
    /// is reported by [`TypeInformation::decode_error`].
    pub fn parse(buf: &[u8]) -> DecodeResult<TypeInformation> {
        let header = TpiHeader::from_bytes(buf)?;
        debug!("TPI header: {header:?}");

        let start = header.header_size as usize;
        let declared_end = start.saturating_add(header.type_record_bytes as usize);
        let end = declared_end.min(buf.len());
        let records = buf.get(start..end).unwrap_or(&[]);

        let (types, mut error) = TypeTable::decode_partial(records, header.type_index_begin);
        if error.is_none() && declared_end > buf.len() {
            error = Some(DecodeError::malformed(
                "TPI stream",
                buf.len(),
                format!(
                    "type records declared up to offset {declared_end}, stream ends at {}",
                    buf.len()
                ),
            ));
        }

        let declared = u64::from(header.type_index_end - header.type_index_begin);
        if let Some(e) = &error {
            warn!("TPI stream decoded {} records before failing: {e}", types.len());
        } else if declared != types.len() as u64 {
            warn!(
                "TPI header declares {declared} records, stream holds {}",
                types.len()
            );
        }

        Ok(TypeInformation {
            header,
            types,
            error,
        })
    }

    pub fn with_pointer_width(mut self, pointer_width: u8) -> TypeInformation {
        self.types = self.types.with_pointer_width(pointer_width);
        self
    }

    pub fn header(&self) -> &TpiHeader {
        &self.header
    }

    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    /// The error that stopped record decoding early, if any.
    pub fn decode_error(&self) -> Option<&DecodeError> {
        self.error.as_ref()
    }
}

/// Size of `index` in `types`, tolerating the absence of a type table.
pub fn get_type_size(types: Option<&TypeTable>, index: TypeIndex) -> Option<u64> {
    types?.size_of(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, WriteBytesExt};
    use pretty_assertions::assert_eq;

    const T_INT4: u32 = 0x74;
    const T_UINT8: u32 = 0x77;
    const T_VOID: u32 = 0x03;
    const T_64PINT4: u32 = 0x0674;

    fn record(leaf: TypeLeaf, payload: &[u8]) -> Vec<u8> {
        let mut body = payload.to_vec();
        let mut pad = 0xF3_u8;
        while (body.len() + 4) % 4 != 0 {
            body.push(pad);
            pad -= 1;
        }
        let mut out = vec![];
        out.write_u16::<LittleEndian>((body.len() + 2) as u16).unwrap();
        out.write_u16::<LittleEndian>(leaf).unwrap();
        out.extend(body);
        out
    }

    fn modifier(underlying: u32) -> Vec<u8> {
        let mut payload = vec![];
        payload.write_u32::<LittleEndian>(underlying).unwrap();
        payload.write_u16::<LittleEndian>(0x1).unwrap();
        record(LF_MODIFIER, &payload)
    }

    fn pointer(underlying: u32, size: u32) -> Vec<u8> {
        let mut payload = vec![];
        payload.write_u32::<LittleEndian>(underlying).unwrap();
        payload.write_u32::<LittleEndian>(0x0C | (size << 13)).unwrap();
        record(LF_POINTER, &payload)
    }

    fn array(element: u32, size: u32) -> Vec<u8> {
        let mut payload = vec![];
        payload.write_u32::<LittleEndian>(element).unwrap();
        payload.write_u32::<LittleEndian>(0x23).unwrap();
        payload.write_u16::<LittleEndian>(0x8004).unwrap();
        payload.write_u32::<LittleEndian>(size).unwrap();
        payload.push(0);
        record(LF_ARRAY, &payload)
    }

    fn structure(properties: u16, size: u16, name: &str, unique_name: Option<&str>) -> Vec<u8> {
        let mut payload = vec![];
        payload.write_u16::<LittleEndian>(2).unwrap();
        payload.write_u16::<LittleEndian>(properties).unwrap();
        for _ in 0..3 {
            payload.write_u32::<LittleEndian>(0).unwrap();
        }
        payload.write_u16::<LittleEndian>(size).unwrap();
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        if let Some(unique) = unique_name {
            payload.extend_from_slice(unique.as_bytes());
            payload.push(0);
        }
        record(LF_STRUCTURE, &payload)
    }

    fn enumeration(underlying: u32, name: &str) -> Vec<u8> {
        let mut payload = vec![];
        payload.write_u16::<LittleEndian>(3).unwrap();
        payload.write_u16::<LittleEndian>(0).unwrap();
        payload.write_u32::<LittleEndian>(underlying).unwrap();
        payload.write_u32::<LittleEndian>(0x1000).unwrap();
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        record(LF_ENUM, &payload)
    }

    fn table(records: &[Vec<u8>]) -> TypeTable {
        TypeTable::decode(&records.concat(), FIRST_NON_PRIMITIVE_INDEX).unwrap()
    }

    #[test]
    fn test_primitive_sizes() {
        assert_eq!(primitive_size(TypeIndex(T_INT4)), Some(4));
        assert_eq!(primitive_size(TypeIndex(T_UINT8)), Some(8));
        assert_eq!(primitive_size(TypeIndex(0x10)), Some(1));
        assert_eq!(primitive_size(TypeIndex(0x30)), Some(1));
        assert_eq!(primitive_size(TypeIndex(0x41)), Some(8));
        assert_eq!(primitive_size(TypeIndex(0x40)), Some(4));
        assert_eq!(primitive_size(TypeIndex(T_64PINT4)), Some(8));
        assert_eq!(primitive_size(TypeIndex(0x0474)), Some(4));
        assert_eq!(primitive_size(TypeIndex(T_VOID)), None);
        assert_eq!(primitive_size(TypeIndex(0x1000)), None);
    }

    #[test]
    fn test_sizes_of_composite_records() {
        let types = table(&[
            modifier(T_INT4),                                  // 0x1000
            array(T_INT4, 16),                                 // 0x1001
            structure(0x0080, 0, "Point", None),               // 0x1002
            structure(0x0000, 8, "Point", None),               // 0x1003
            pointer(0x1003, 8),                                // 0x1004
            pointer(0x1003, 0),                                // 0x1005
            enumeration(T_INT4, "Color"),                      // 0x1006
            record(LF_FIELDLIST, &[]),                         // 0x1007
        ]);

        assert_eq!(types.len(), 8);
        assert_eq!(types.size_of(TypeIndex(0x1000)), Some(4));
        assert_eq!(types.size_of(TypeIndex(0x1001)), Some(16));
        assert_eq!(types.size_of(TypeIndex(0x1002)), Some(8));
        assert_eq!(types.size_of(TypeIndex(0x1003)), Some(8));
        assert_eq!(types.size_of(TypeIndex(0x1004)), Some(8));
        assert_eq!(types.size_of(TypeIndex(0x1005)), Some(4));
        assert_eq!(
            types.clone().with_pointer_width(8).size_of(TypeIndex(0x1005)),
            Some(8)
        );
        assert_eq!(types.size_of(TypeIndex(0x1006)), Some(4));
        assert_eq!(types.size_of(TypeIndex(0x1007)), None);

        match types.get(TypeIndex(0x1001)) {
            Some(TypeRecord::Array(a)) => assert_eq!(a.element_count(&types), Some(4)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_forward_reference_prefers_unique_name() {
        let types = table(&[
            structure(0x0280, 0, "Node", Some(".?AUNode@b@@")),
            structure(0x0200, 24, "Node", Some(".?AUNode@a@@")),
            structure(0x0200, 40, "Node", Some(".?AUNode@b@@")),
        ]);

        assert_eq!(
            types.resolve_forward_reference(TypeIndex(0x1000)),
            Some(TypeIndex(0x1002))
        );
        assert_eq!(types.size_of(TypeIndex(0x1000)), Some(40));
        assert_eq!(
            types.resolve_forward_reference(TypeIndex(0x1001)),
            Some(TypeIndex(0x1001))
        );
    }

    #[test]
    fn test_unresolved_forward_reference_is_unknown() {
        let types = table(&[structure(0x0080, 0, "Opaque", None)]);
        assert_eq!(types.size_of(TypeIndex(0x1000)), None);
    }

    #[test]
    fn test_out_of_range_indices_are_unknown() {
        let types = table(&[modifier(T_INT4)]);
        assert_eq!(types.size_of(TypeIndex(0x1001)), None);
        assert_eq!(types.size_of(TypeIndex(0xFFFF_FFFF)), None);
        assert_eq!(get_type_size(None, TypeIndex(T_INT4)), None);
        assert_eq!(get_type_size(Some(&types), TypeIndex(0x1000)), Some(4));
    }

    #[test]
    fn test_modifier_chain_depth_limit() {
        // Each modifier wraps the previous one; the first wraps a primitive.
        let chain = |len: u32| {
            let records: Vec<Vec<u8>> = (0..len)
                .map(|i| modifier(if i == 0 { T_INT4 } else { 0x1000 + i - 1 }))
                .collect();
            table(&records)
        };

        let types = chain(63);
        assert_eq!(types.size_of(TypeIndex(0x1000 + 62)), Some(4));
        assert_eq!(types.size_of(TypeIndex(0x1000 + 62)), Some(4));

        let types = chain(64);
        assert_eq!(types.size_of(TypeIndex(0x1000 + 63)), None);
    }

    #[test]
    fn test_cyclic_modifiers_terminate() {
        let types = table(&[modifier(0x1001), modifier(0x1000)]);
        assert_eq!(types.size_of(TypeIndex(0x1000)), None);

        let self_referencing = table(&[modifier(0x1000)]);
        assert_eq!(self_referencing.size_of(TypeIndex(0x1000)), None);
    }

    #[test]
    fn test_malformed_record_keeps_earlier_records() {
        let mut raw = modifier(T_INT4);
        raw.extend(array(T_INT4, 8));
        raw.extend([0x40, 0x00, 0x01, 0x10]);

        let (types, error) = TypeTable::decode_partial(&raw, FIRST_NON_PRIMITIVE_INDEX);
        assert_eq!(types.len(), 2);
        assert!(matches!(error, Some(DecodeError::Malformed { .. })));
        assert!(TypeTable::decode(&raw, FIRST_NON_PRIMITIVE_INDEX).is_err());
    }

    #[test]
    fn test_trailing_byte_is_malformed() {
        let mut raw = modifier(T_INT4);
        raw.push(0x40);

        let (types, error) = TypeTable::decode_partial(&raw, FIRST_NON_PRIMITIVE_INDEX);
        assert_eq!(types.len(), 1);
        assert!(matches!(error, Some(DecodeError::Malformed { .. })));

        let (types, error) = TypeTable::decode_partial(&[0x40], FIRST_NON_PRIMITIVE_INDEX);
        assert_eq!(types.len(), 0);
        assert!(error.is_some_and(|e| !e.is_fatal()));
    }

    fn tpi_stream(records: &[Vec<u8>], declared_bytes: Option<u32>) -> Vec<u8> {
        let body = records.concat();
        let mut out = vec![];
        out.write_u32::<LittleEndian>(20040203).unwrap();
        out.write_u32::<LittleEndian>(TPI_HEADER_SIZE as u32).unwrap();
        out.write_u32::<LittleEndian>(0x1000).unwrap();
        out.write_u32::<LittleEndian>(0x1000 + records.len() as u32).unwrap();
        out.write_u32::<LittleEndian>(declared_bytes.unwrap_or(body.len() as u32))
            .unwrap();
        out.write_u16::<LittleEndian>(0xFFFF).unwrap();
        out.write_u16::<LittleEndian>(0xFFFF).unwrap();
        out.write_u32::<LittleEndian>(4).unwrap();
        out.write_u32::<LittleEndian>(0x3FFFF).unwrap();
        out.extend([0_u8; 24]);
        out.extend(body);
        out
    }

    #[test]
    fn test_parses_tpi_stream() {
        let raw = tpi_stream(&[modifier(T_INT4), array(0x1000, 12)], None);
        let tpi = TypeInformation::parse(&raw).unwrap().with_pointer_width(8);

        assert_eq!(tpi.header().type_index_begin, 0x1000);
        assert_eq!(tpi.header().type_index_end, 0x1002);
        assert!(tpi.decode_error().is_none());
        assert_eq!(tpi.types().pointer_width(), 8);
        assert_eq!(tpi.types().size_of(TypeIndex(0x1001)), Some(12));
        assert_eq!(tpi.types().type_index_end(), TypeIndex(0x1002));
    }

    #[test]
    fn test_tpi_records_past_stream_end_are_reported() {
        let raw = tpi_stream(&[modifier(T_INT4)], Some(400));
        let tpi = TypeInformation::parse(&raw).unwrap();
        assert_eq!(tpi.types().len(), 1);
        assert!(tpi.decode_error().is_some());
    }

    #[test]
    fn test_truncated_tpi_header_is_an_error() {
        assert!(matches!(
            TypeInformation::parse(&[0_u8; 20]),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
