use anyhow::Result;
use clap::Command;
use indoc::indoc;
use pdb_reader::{Pdb, ResolvedAddress};

use crate::output::{Output, Row, Size};

pub fn command() -> Command {
    Command::new("segments")
        .about("List the image section headers recorded in the PDB")
        .long_about(indoc!(
            r#"
            List the image section headers recorded in the PDB, one per line:

                <name> VA=0x<virtual address> FileAddr=0x<raw data pointer> Size=0x<virtual size>

            Prints nothing when the PDB carries no section header stream.
        "#
        ))
}

pub fn run(pdb: &Pdb, output: &mut Output) -> Result<()> {
    let Some(sections) = pdb.section_headers() else {
        return Ok(());
    };

    for section in sections.sections() {
        output.write_row(&Row {
            name: &section.name(),
            address: ResolvedAddress {
                virtual_address: u64::from(section.virtual_address),
                file_offset: u64::from(section.pointer_to_raw_data),
                resolved: true,
            },
            size: Size::Hex(section.virtual_size),
        })?;
    }

    Ok(())
}
