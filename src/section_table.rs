use std::fmt;

use crate::err::{DecodeError, DecodeResult};
use crate::utils::ByteCursor;

pub const IMAGE_SECTION_HEADER_SIZE: usize = 40;

pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
pub const IMAGE_SCN_CNT_UNINITIALIZED_DATA: u32 = 0x0000_0080;
pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

/// An `IMAGE_SECTION_HEADER` as copied into the PDB by the linker.
///
/// Every field of the on-disk record is kept, so the original 40 bytes can be reproduced.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    pub raw_name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_line_numbers: u32,
    pub number_of_relocations: u16,
    pub number_of_line_numbers: u16,
    pub characteristics: u32,
}

impl SectionHeader {
    pub fn from_bytes(raw: &[u8]) -> DecodeResult<SectionHeader> {
        let mut cursor = ByteCursor::new(raw);

        Ok(SectionHeader {
            raw_name: cursor.array::<8>("section name")?,
            virtual_size: cursor.u32_named("section virtual size")?,
            virtual_address: cursor.u32_named("section virtual address")?,
            size_of_raw_data: cursor.u32_named("section raw data size")?,
            pointer_to_raw_data: cursor.u32_named("section raw data pointer")?,
            pointer_to_relocations: cursor.u32_named("section relocations pointer")?,
            pointer_to_line_numbers: cursor.u32_named("section line numbers pointer")?,
            number_of_relocations: cursor.u16_named("section relocation count")?,
            number_of_line_numbers: cursor.u16_named("section line number count")?,
            characteristics: cursor.u32_named("section characteristics")?,
        })
    }

    /// The section name with trailing NUL and space padding removed.
    pub fn name(&self) -> String {
        let end = self
            .raw_name
            .iter()
            .rposition(|&b| b != 0 && b != b' ')
            .map_or(0, |i| i + 1);
        String::from_utf8_lossy(&self.raw_name[..end]).into_owned()
    }

    pub fn is_code(&self) -> bool {
        self.characteristics & IMAGE_SCN_CNT_CODE != 0
    }

    pub fn is_executable(&self) -> bool {
        self.characteristics & IMAGE_SCN_MEM_EXECUTE != 0
    }
}

impl fmt::Debug for SectionHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectionHeader")
            .field("name", &self.name())
            .field("virtual_address", &format_args!("{:#x}", self.virtual_address))
            .field("virtual_size", &format_args!("{:#x}", self.virtual_size))
            .field("pointer_to_raw_data", &format_args!("{:#x}", self.pointer_to_raw_data))
            .field("characteristics", &format_args!("{:#x}", self.characteristics))
            .finish()
    }
}

/// A symbol location translated through the section table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub virtual_address: u64,
    pub file_offset: u64,
    /// `false` when the segment did not name a section and the raw offset was passed through.
    pub resolved: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionTable {
    sections: Vec<SectionHeader>,
}

impl SectionTable {
    pub fn parse(buf: &[u8]) -> DecodeResult<SectionTable> {
        if buf.len() % IMAGE_SECTION_HEADER_SIZE != 0 {
            return Err(DecodeError::malformed(
                "section header stream",
                buf.len() - buf.len() % IMAGE_SECTION_HEADER_SIZE,
                format!(
                    "length {} is not a multiple of {IMAGE_SECTION_HEADER_SIZE}",
                    buf.len()
                ),
            ));
        }

        let sections = buf
            .chunks_exact(IMAGE_SECTION_HEADER_SIZE)
            .map(SectionHeader::from_bytes)
            .collect::<DecodeResult<Vec<_>>>()?;

        Ok(SectionTable { sections })
    }

    pub fn sections(&self) -> &[SectionHeader] {
        &self.sections
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Section named by a one-based segment number. Segment 0 is reserved.
    pub fn section(&self, segment: u16) -> Option<&SectionHeader> {
        let index = usize::from(segment).checked_sub(1)?;
        self.sections.get(index)
    }

    /// Translate `segment:offset` into a virtual address and a file offset.
    ///
    /// Segments that do not name a section pass `offset` through unchanged for both values.
    /// Offsets beyond the section's declared size are accepted as-is.
    pub fn resolve(&self, segment: u16, offset: u32) -> ResolvedAddress {
        match self.section(segment) {
            Some(section) => ResolvedAddress {
                virtual_address: u64::from(section.virtual_address) + u64::from(offset),
                file_offset: u64::from(section.pointer_to_raw_data) + u64::from(offset),
                resolved: true,
            },
            None => ResolvedAddress {
                virtual_address: u64::from(offset),
                file_offset: u64::from(offset),
                resolved: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, WriteBytesExt};
    use pretty_assertions::assert_eq;

    fn section(name: &[u8], virtual_address: u32, pointer_to_raw_data: u32, size: u32) -> Vec<u8> {
        let mut out = vec![0_u8; 8];
        out[..name.len()].copy_from_slice(name);
        for v in [size, virtual_address, size, pointer_to_raw_data, 0, 0] {
            out.write_u32::<LittleEndian>(v).unwrap();
        }
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE)
            .unwrap();
        out
    }

    fn table() -> SectionTable {
        let mut raw = section(b".text", 0x1000, 0x400, 0x2000);
        raw.extend(section(b".data   ", 0x3000, 0x2400, 0x200));
        SectionTable::parse(&raw).unwrap()
    }

    #[test]
    fn test_parses_sections_in_order() {
        let table = table();
        assert_eq!(table.len(), 2);
        assert_eq!(table.sections()[0].name(), ".text");
        assert_eq!(table.sections()[1].name(), ".data");
        assert_eq!(table.sections()[1].raw_name, *b".data   ");
        assert_eq!(table.sections()[0].virtual_size, 0x2000);
        assert!(table.sections()[0].is_code());
        assert!(table.sections()[0].is_executable());
    }

    #[test]
    fn test_rejects_partial_record() {
        let mut raw = section(b".text", 0x1000, 0x400, 0x10);
        raw.push(0);
        assert!(matches!(
            SectionTable::parse(&raw),
            Err(DecodeError::Malformed { offset: 40, .. })
        ));
    }

    #[test]
    fn test_empty_stream_is_empty_table() {
        assert!(SectionTable::parse(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_resolves_segment_and_offset() {
        let table = table();
        assert_eq!(
            table.resolve(1, 0x20),
            ResolvedAddress {
                virtual_address: 0x1020,
                file_offset: 0x420,
                resolved: true,
            }
        );
        // Past the declared size is still resolved against the section base.
        assert_eq!(table.resolve(2, 0x500).virtual_address, 0x3500);
    }

    #[test]
    fn test_unresolvable_segments_pass_offset_through() {
        let table = table();
        for segment in [0, 3, u16::MAX] {
            assert_eq!(
                table.resolve(segment, 0x1234),
                ResolvedAddress {
                    virtual_address: 0x1234,
                    file_offset: 0x1234,
                    resolved: false,
                }
            );
        }
        assert_eq!(SectionTable::default().resolve(1, 8).virtual_address, 8);
    }
}
