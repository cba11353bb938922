use anyhow::{Context, Result};
use pdb_reader::ResolvedAddress;
use serde_json::json;
use std::fmt;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// The `Size=` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    /// Section sizes, printed as `0x%08X`.
    Hex(u32),
    Bytes(u64),
    /// Printed as `?`, or `null` in JSON.
    Unknown,
}

impl From<Option<u64>> for Size {
    fn from(size: Option<u64>) -> Self {
        size.map_or(Size::Unknown, Size::Bytes)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Size::Hex(size) => write!(f, "0x{size:08X}"),
            Size::Bytes(size) => write!(f, "{size}"),
            Size::Unknown => write!(f, "?"),
        }
    }
}

/// One listed entry.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    pub name: &'a str,
    pub address: ResolvedAddress,
    pub size: Size,
}

pub struct Output {
    format: OutputFormat,
    writer: Box<dyn Write>,
}

impl Output {
    pub fn new(format: OutputFormat, writer: Box<dyn Write>) -> Self {
        Output { format, writer }
    }

    pub fn write_row(&mut self, row: &Row<'_>) -> Result<()> {
        match self.format {
            OutputFormat::Text => writeln!(
                self.writer,
                "{} VA=0x{:08X} FileAddr=0x{:08X} Size={}",
                row.name, row.address.virtual_address, row.address.file_offset, row.size
            ),
            OutputFormat::Json => {
                let size = match row.size {
                    Size::Hex(size) => json!(size),
                    Size::Bytes(size) => json!(size),
                    Size::Unknown => json!(null),
                };
                let value = json!({
                    "name": row.name,
                    "virtual_address": row.address.virtual_address,
                    "file_offset": row.address.file_offset,
                    "resolved": row.address.resolved,
                    "size": size,
                });
                writeln!(self.writer, "{value}")
            }
        }
        .context("failed to write output")
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("failed to flush output")
    }
}
