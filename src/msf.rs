//! The MSF ("multi-stream file") envelope every PDB is stored in.
//!
//! An MSF file is a sequence of fixed-size pages. Page 0 holds the superblock; a page named by
//! the superblock holds the list of pages that make up the *stream directory*; the directory in
//! turn lists, for every logical stream, its byte length and the pages holding its bytes.
//!
//! Streams may be scattered across the file in any order, so reading one means concatenating
//! its pages in directory order. Streams whose pages happen to be contiguous are handed out as
//! direct slices of the file; everything else is copied once and cached.

use std::fmt;
use std::ops::Deref;
use std::sync::OnceLock;

use log::{debug, trace};
use memmap2::Mmap;

use crate::err::{DecodeError, DecodeResult};
use crate::utils::{ByteCursor, bytes};

pub const MSF_MAGIC: &[u8; 32] = b"Microsoft C/C++ MSF 7.00\r\n\x1aDS\0\0\0";
pub const MSF_SUPERBLOCK_SIZE: usize = 56;

/// Directory size recorded for streams that were deleted or never written.
pub const NIL_STREAM_SIZE: u32 = 0xFFFF_FFFF;

const MIN_BLOCK_SIZE: u32 = 512;
const MAX_BLOCK_SIZE: u32 = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsfHeader {
    pub block_size: u32,
    pub free_block_map_block: u32,
    pub num_blocks: u32,
    pub num_directory_bytes: u32,
    pub block_map_addr: u32,
}

impl MsfHeader {
    pub fn from_bytes(buf: &[u8]) -> DecodeResult<MsfHeader> {
        let magic = buf.get(..MSF_MAGIC.len()).unwrap_or(buf);
        if magic != MSF_MAGIC {
            return Err(DecodeError::BadSignature {
                found: magic.to_vec(),
            });
        }

        let _ = bytes::slice_r(buf, 0, MSF_SUPERBLOCK_SIZE, "MSF superblock")?;
        let mut cursor = ByteCursor::with_pos(buf, MSF_MAGIC.len())?;

        let block_size = cursor.u32_named("block_size")?;
        let free_block_map_block = cursor.u32_named("free_block_map_block")?;
        let num_blocks = cursor.u32_named("num_blocks")?;
        let num_directory_bytes = cursor.u32_named("num_directory_bytes")?;
        // unknown
        let _ = cursor.u32_named("reserved")?;
        let block_map_addr = cursor.u32_named("block_map_addr")?;

        if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(DecodeError::malformed(
                "MSF superblock",
                MSF_MAGIC.len(),
                format!("invalid block size {block_size}"),
            ));
        }

        Ok(MsfHeader {
            block_size,
            free_block_map_block,
            num_blocks,
            num_directory_bytes,
            block_map_addr,
        })
    }

    #[inline]
    pub fn pages_for(&self, byte_len: u32) -> usize {
        byte_len.div_ceil(self.block_size) as usize
    }

    #[inline]
    fn page_offset(&self, page: u32) -> usize {
        page as usize * self.block_size as usize
    }
}

/// One entry of the stream directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    /// Byte length of the stream. Nil streams report 0.
    pub size: u32,
    pub is_nil: bool,
    pub pages: Vec<u32>,
}

impl StreamDescriptor {
    fn is_contiguous(&self) -> bool {
        self.pages.windows(2).all(|w| w[1] == w[0].wrapping_add(1))
    }
}

/// Backing storage of a container.
pub(crate) enum MsfData {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for MsfData {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        match self {
            MsfData::Mapped(mmap) => mmap,
            MsfData::Owned(buf) => buf,
        }
    }
}

impl fmt::Debug for MsfData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MsfData::Mapped(mmap) => write!(f, "Mapped({} bytes)", mmap.len()),
            MsfData::Owned(buf) => write!(f, "Owned({} bytes)", buf.len()),
        }
    }
}

#[derive(Debug)]
pub struct Msf {
    data: MsfData,
    header: MsfHeader,
    streams: Vec<StreamDescriptor>,
    materialized: Vec<OnceLock<Box<[u8]>>>,
}

impl Msf {
    /// Parse a container from an in-memory buffer.
    pub fn from_buffer(buffer: Vec<u8>) -> DecodeResult<Msf> {
        Msf::parse(MsfData::Owned(buffer))
    }

    pub(crate) fn parse(data: MsfData) -> DecodeResult<Msf> {
        let header = MsfHeader::from_bytes(&data)?;
        debug!("MSF header: {header:?}");

        let expected_len = u64::from(header.num_blocks) * u64::from(header.block_size);
        if (data.len() as u64) < expected_len {
            return Err(DecodeError::Truncated {
                what: "MSF pages",
                offset: 0,
                need: usize::try_from(expected_len).unwrap_or(usize::MAX),
                have: data.len(),
            });
        }

        let directory = read_directory(&data, &header)?;
        let streams = parse_directory(&directory, &header)?;
        debug!("MSF directory lists {} streams", streams.len());

        let materialized = streams.iter().map(|_| OnceLock::new()).collect();

        Ok(Msf {
            data,
            header,
            streams,
            materialized,
        })
    }

    pub fn header(&self) -> &MsfHeader {
        &self.header
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn descriptor(&self, index: u32) -> Option<&StreamDescriptor> {
        self.streams.get(index as usize)
    }

    /// Bytes of stream `index`, or `None` if the directory has no such stream.
    ///
    /// Nil and zero-length streams yield an empty slice.
    pub fn stream_bytes(&self, index: u32) -> Option<&[u8]> {
        let descriptor = self.streams.get(index as usize)?;
        let size = descriptor.size as usize;

        match descriptor.pages.first() {
            None => Some(&[]),
            Some(&first) if descriptor.is_contiguous() => {
                // Page bounds were validated while parsing the directory.
                let start = self.header.page_offset(first);
                self.data.get(start..start + size)
            }
            Some(_) => {
                let cached = self.materialized[index as usize].get_or_init(|| {
                    trace!(
                        "Materializing stream {index} from {} pages",
                        descriptor.pages.len()
                    );
                    self.concatenate_pages(descriptor)
                });
                Some(cached)
            }
        }
    }

    fn concatenate_pages(&self, descriptor: &StreamDescriptor) -> Box<[u8]> {
        let block_size = self.header.block_size as usize;
        let mut out = Vec::with_capacity(descriptor.size as usize);
        let mut remaining = descriptor.size as usize;

        for &page in &descriptor.pages {
            let take = remaining.min(block_size);
            let start = self.header.page_offset(page);
            out.extend_from_slice(&self.data[start..start + take]);
            remaining -= take;
        }

        out.into_boxed_slice()
    }
}

fn check_page(page: u32, header: &MsfHeader, what: &'static str) -> DecodeResult<()> {
    if page >= header.num_blocks {
        return Err(DecodeError::OutOfBounds {
            what,
            offset: u64::from(page),
            limit: u64::from(header.num_blocks),
        });
    }
    Ok(())
}

/// Reassemble the stream directory from the pages listed in the block map.
fn read_directory(data: &[u8], header: &MsfHeader) -> DecodeResult<Vec<u8>> {
    check_page(header.block_map_addr, header, "block map page")?;

    let page_count = header.pages_for(header.num_directory_bytes);
    let directory_pages = bytes::read_u32_vec_le_r(
        data,
        header.page_offset(header.block_map_addr),
        page_count,
        "directory page list",
    )?;
    trace!("Directory pages: {directory_pages:?}");

    let block_size = header.block_size as usize;
    let mut remaining = header.num_directory_bytes as usize;
    let mut directory = Vec::with_capacity(remaining);

    for page in directory_pages {
        check_page(page, header, "directory page")?;
        let take = remaining.min(block_size);
        directory.extend_from_slice(bytes::slice_r(
            data,
            header.page_offset(page),
            take,
            "directory page",
        )?);
        remaining -= take;
    }

    Ok(directory)
}

fn parse_directory(directory: &[u8], header: &MsfHeader) -> DecodeResult<Vec<StreamDescriptor>> {
    let mut cursor = ByteCursor::new(directory);
    let num_streams = cursor.u32_named("stream count")? as usize;

    let sizes = bytes::read_u32_vec_le_r(directory, cursor.pos(), num_streams, "stream sizes")?;
    cursor.advance(num_streams * 4, "stream sizes")?;

    let mut streams = Vec::with_capacity(num_streams);
    for size in sizes {
        let is_nil = size == NIL_STREAM_SIZE;
        let size = if is_nil { 0 } else { size };
        let page_count = header.pages_for(size);

        let pages =
            bytes::read_u32_vec_le_r(directory, cursor.pos(), page_count, "stream page list")?;
        cursor.advance(page_count * 4, "stream page list")?;

        for &page in &pages {
            check_page(page, header, "stream page")?;
        }

        streams.push(StreamDescriptor {
            size,
            is_nil,
            pages,
        });
    }

    Ok(streams)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, WriteBytesExt};

    const BLOCK_SIZE: u32 = 512;

    /// Lay out `pages` (page index -> contents) and a superblock into a flat buffer.
    fn build(
        num_blocks: u32,
        directory_bytes: u32,
        block_map_addr: u32,
        pages: &[(u32, Vec<u8>)],
    ) -> Vec<u8> {
        let mut buf = vec![0_u8; (num_blocks * BLOCK_SIZE) as usize];
        let mut superblock = MSF_MAGIC.to_vec();
        for value in [BLOCK_SIZE, 1, num_blocks, directory_bytes, 0, block_map_addr] {
            superblock.write_u32::<LittleEndian>(value).unwrap();
        }
        buf[..superblock.len()].copy_from_slice(&superblock);

        for (page, contents) in pages {
            let start = (*page * BLOCK_SIZE) as usize;
            buf[start..start + contents.len()].copy_from_slice(contents);
        }
        buf
    }

    fn u32s(values: &[u32]) -> Vec<u8> {
        let mut out = vec![];
        for &v in values {
            out.write_u32::<LittleEndian>(v).unwrap();
        }
        out
    }

    #[test]
    fn test_rejects_bad_signature() {
        let mut buf = build(4, 4, 3, &[(3, u32s(&[2])), (2, u32s(&[0]))]);
        buf[0] = b'm';
        assert!(matches!(
            Msf::from_buffer(buf),
            Err(DecodeError::BadSignature { .. })
        ));
        assert!(matches!(
            Msf::from_buffer(b"short".to_vec()),
            Err(DecodeError::BadSignature { .. })
        ));
    }

    #[test]
    fn test_rejects_truncated_file() {
        let mut buf = build(4, 4, 3, &[(3, u32s(&[2])), (2, u32s(&[0]))]);
        buf.truncate(3 * BLOCK_SIZE as usize);
        assert!(matches!(
            Msf::from_buffer(buf),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_block_size() {
        let mut buf = build(4, 4, 3, &[(3, u32s(&[2])), (2, u32s(&[0]))]);
        buf[32..36].copy_from_slice(&1000_u32.to_le_bytes());
        assert!(matches!(
            Msf::from_buffer(buf),
            Err(DecodeError::Malformed { .. })
        ));
    }

    #[test]
    fn test_reassembles_scattered_stream() {
        // Stream 0 spans pages 5 then 4 (out of order), stream 1 is nil, stream 2 is empty.
        let mut first = vec![0xAA_u8; BLOCK_SIZE as usize];
        first[0] = 0x01;
        let second = vec![0xBB_u8; 10];
        let directory = u32s(&[3, BLOCK_SIZE + 10, NIL_STREAM_SIZE, 0, 5, 4]);
        let buf = build(
            6,
            directory.len() as u32,
            3,
            &[
                (3, u32s(&[2])),
                (2, directory),
                (5, first.clone()),
                (4, second.clone()),
            ],
        );

        let msf = Msf::from_buffer(buf).unwrap();
        assert_eq!(msf.stream_count(), 3);

        let stream = msf.stream_bytes(0).unwrap();
        assert_eq!(stream.len(), BLOCK_SIZE as usize + 10);
        assert_eq!(&stream[..BLOCK_SIZE as usize], first.as_slice());
        assert_eq!(&stream[BLOCK_SIZE as usize..], second.as_slice());

        // The second read is served from the cache and must be identical.
        assert_eq!(msf.stream_bytes(0).unwrap(), stream);

        assert!(msf.descriptor(1).unwrap().is_nil);
        assert_eq!(msf.stream_bytes(1), Some(&[][..]));
        assert_eq!(msf.stream_bytes(2), Some(&[][..]));
        assert_eq!(msf.stream_bytes(3), None);
    }

    #[test]
    fn test_rejects_page_past_block_count() {
        let directory = u32s(&[1, 4, 17]);
        let buf = build(
            4,
            directory.len() as u32,
            3,
            &[(3, u32s(&[2])), (2, directory)],
        );
        assert!(matches!(
            Msf::from_buffer(buf),
            Err(DecodeError::OutOfBounds { offset: 17, .. })
        ));
    }

    #[test]
    fn test_rejects_truncated_directory() {
        // Claims 5 streams but only lists one size.
        let directory = u32s(&[5, 4]);
        let buf = build(
            4,
            directory.len() as u32,
            3,
            &[(3, u32s(&[2])), (2, directory)],
        );
        assert!(matches!(
            Msf::from_buffer(buf),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
