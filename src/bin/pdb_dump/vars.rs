use anyhow::Result;
use clap::Command;
use indoc::indoc;
use pdb_reader::{Pdb, SectionTable, Symbol, get_type_size};

use crate::output::{Output, Row};

pub fn command() -> Command {
    Command::new("vars")
        .about("List global and static variables with their addresses and sizes")
        .long_about(indoc!(
            r#"
            List data symbols and public symbols not flagged as functions, in stream order:

                <name> VA=0x<virtual address> FileAddr=0x<file offset> Size=<bytes or ?>

            Data symbols are sized through the type stream. Public symbols are sized through
            the data record a module recorded at the same address; `Size=?` when there is none
            or the type's size cannot be determined.
        "#
        ))
}

pub fn run(pdb: &Pdb, output: &mut Output) -> Result<()> {
    let Some(globals) = pdb.global_symbols().filter(|g| g.size() > 0) else {
        return Ok(());
    };

    let no_sections = SectionTable::default();
    let sections = pdb.section_headers().unwrap_or(&no_sections);
    let types = pdb.types();

    for record in globals.globals() {
        let symbol = match record {
            Ok(symbol) => symbol,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        match &symbol {
            Symbol::Data(data) if !data.thread_local => {
                output.write_row(&Row {
                    name: &data.name,
                    address: sections.resolve(data.segment, data.offset),
                    size: get_type_size(types, data.type_index).into(),
                })?;
            }
            Symbol::Public(public) if !public.is_function() => {
                let size = globals
                    .typind(public)
                    .and_then(|type_index| get_type_size(types, type_index));
                output.write_row(&Row {
                    name: &public.name,
                    address: sections.resolve(public.segment, public.offset),
                    size: size.into(),
                })?;
            }
            _ => {}
        }
    }

    Ok(())
}
