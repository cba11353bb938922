use anyhow::Result;
use clap::Command;
use indoc::indoc;
use pdb_reader::{Pdb, SectionTable, Symbol};

use crate::output::{Output, Row, Size};

pub fn command() -> Command {
    Command::new("functions")
        .about("List public function symbols with their addresses and code sizes")
        .long_about(indoc!(
            r#"
            List every public symbol flagged as a function, in stream order:

                <name> VA=0x<virtual address> FileAddr=0x<file offset> Size=<bytes>

            Sizes come from procedure records in module symbol streams. Functions without a
            procedure record print `Size=0`.
        "#
        ))
}

pub fn run(pdb: &Pdb, output: &mut Output) -> Result<()> {
    let Some(globals) = pdb.global_symbols().filter(|g| g.size() > 0) else {
        return Ok(());
    };

    let no_sections = SectionTable::default();
    let sections = pdb.section_headers().unwrap_or(&no_sections);
    let func_sizes = globals.func_sizes();

    for record in globals.globals() {
        let symbol = match record {
            Ok(symbol) => symbol,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        let Symbol::Public(public) = symbol else {
            continue;
        };
        if !public.is_function() {
            continue;
        }

        let size = func_sizes
            .get(public.segment, public.offset)
            .unwrap_or(0);
        output.write_row(&Row {
            name: &public.name,
            address: sections.resolve(public.segment, public.offset),
            size: Size::Bytes(u64::from(size)),
        })?;
    }

    Ok(())
}
