//! The PDB information stream (stream 1): identity of the PDB plus the table mapping stream
//! names (`/names`, `/LinkInfo`, `/src/headerblock`, ...) to stream indices.

use hashbrown::HashMap;
use log::trace;

use crate::err::{DecodeError, DecodeResult};
use crate::utils::{ByteCursor, bytes};

pub const PDB_INFO_HEADER_SIZE: usize = 28;

/// Feature code signalling that the PDB carries an IPI (id) stream.
pub const FEATURE_VC140: u32 = 20140508;
/// Feature code for PDBs linked with `/DEBUG:FASTLINK`.
pub const FEATURE_MINIMAL_DEBUG_INFO: u32 = 0x494E_494D;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdbInformation {
    pub version: u32,
    pub signature: u32,
    pub age: u32,
    pub guid: [u8; 16],
    named_streams: HashMap<String, u32>,
    pub features: Vec<u32>,
}

impl PdbInformation {
    pub fn parse(buf: &[u8]) -> DecodeResult<PdbInformation> {
        let _ = bytes::slice_r(buf, 0, PDB_INFO_HEADER_SIZE, "PDB info header")?;
        let mut cursor = ByteCursor::new(buf);

        let version = cursor.u32_named("PDB info version")?;
        let signature = cursor.u32_named("PDB info signature")?;
        let age = cursor.u32_named("PDB info age")?;
        let guid = cursor.array::<16>("PDB info guid")?;

        let named_streams =
            read_named_stream_map(&mut cursor).map_err(DecodeError::scoped_to_stream)?;
        trace!("Named streams: {named_streams:?}");

        let mut features = Vec::new();
        while cursor.remaining() >= 4 {
            features.push(cursor.u32_named("PDB feature code")?);
        }

        Ok(PdbInformation {
            version,
            signature,
            age,
            guid,
            named_streams,
            features,
        })
    }

    pub fn stream_index(&self, name: &str) -> Option<u32> {
        self.named_streams.get(name).copied()
    }

    pub fn stream_names(&self) -> impl Iterator<Item = (&str, u32)> {
        self.named_streams.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn has_id_stream(&self) -> bool {
        self.features.contains(&FEATURE_VC140)
    }

    pub fn is_minimal_debug_info(&self) -> bool {
        self.features.contains(&FEATURE_MINIMAL_DEBUG_INFO)
    }
}

fn read_bit_vector(cursor: &mut ByteCursor<'_>, what: &'static str) -> DecodeResult<Vec<u32>> {
    let words = cursor.u32_named(what)? as usize;
    let start = cursor.pos();
    let len = words
        .checked_mul(4)
        .ok_or_else(|| DecodeError::malformed(what, start, "bit vector too large"))?;
    let raw = cursor.take_bytes(len, what)?;
    bytes::read_u32_vec_le_r(raw, 0, words, what)
}

/// Indices of the set bits, in ascending order.
fn set_bits(words: &[u32]) -> impl Iterator<Item = usize> + '_ {
    words.iter().enumerate().flat_map(|(i, &word)| {
        (0..32)
            .filter(move |bit| word & (1 << bit) != 0)
            .map(move |bit| i * 32 + bit)
    })
}

/// Serialized hash table of `name offset -> stream index`, keyed into a preceding string buffer.
fn read_named_stream_map(cursor: &mut ByteCursor<'_>) -> DecodeResult<HashMap<String, u32>> {
    let strings_len = cursor.u32_named("named stream string buffer size")? as usize;
    let strings = cursor.take_bytes(strings_len, "named stream string buffer")?;

    let table_start = cursor.pos();
    let size = cursor.u32_named("named stream map size")? as usize;
    let capacity = cursor.u32_named("named stream map capacity")? as usize;
    let present = read_bit_vector(cursor, "named stream present bits")?;
    let _deleted = read_bit_vector(cursor, "named stream deleted bits")?;

    let bucket_limit = present.len().saturating_mul(32);
    if size > capacity || capacity > bucket_limit {
        return Err(DecodeError::malformed(
            "named stream map",
            table_start,
            format!(
                "{size} entries in {capacity} buckets, present bits cover {bucket_limit} buckets"
            ),
        ));
    }

    // Each entry takes 8 bytes, so what is left bounds the entry count.
    let mut map = HashMap::with_capacity(size.min(cursor.remaining() / 8));
    for _bucket in set_bits(&present).take_while(|&bucket| bucket < capacity) {
        let name_offset = cursor.u32_named("named stream key")? as usize;
        let stream_index = cursor.u32_named("named stream value")?;

        let mut name_cursor = ByteCursor::with_pos(strings, name_offset)?;
        let name = name_cursor.c_str_lossy("named stream name")?;
        map.insert(name, stream_index);
    }

    if map.len() != size {
        return Err(DecodeError::malformed(
            "named stream map",
            table_start,
            format!("declares {size} entries, found {}", map.len()),
        ));
    }

    Ok(map)
}
