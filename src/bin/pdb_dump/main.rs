use anyhow::{Context, Result, bail};
use clap::{Arg, ArgAction, ArgMatches, Command};
use dialoguer::Confirm;
use indoc::indoc;
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};

use pdb_reader::{ParserSettings, Pdb};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::exit;

mod functions;
mod output;
mod segments;
mod vars;

use output::{Output, OutputFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Listing {
    Segments,
    Functions,
    Vars,
}

struct PdbDump {
    parser_settings: ParserSettings,
    input: PathBuf,
    listing: Listing,
    output_format: OutputFormat,
    output_target: Option<PathBuf>,
    confirm_overwrite: bool,
    verbosity_level: Option<LevelFilter>,
}

impl PdbDump {
    pub fn from_cli_matches(matches: &ArgMatches) -> Result<Self> {
        let (listing, sub_matches) = match matches.subcommand() {
            Some(("segments", m)) => (Listing::Segments, m),
            Some(("functions", m)) => (Listing::Functions, m),
            Some(("vars", m)) => (Listing::Vars, m),
            _ => bail!("expected one of `segments`, `functions` or `vars`"),
        };

        let input = PathBuf::from(
            sub_matches
                .get_one::<String>("INPUT")
                .context("missing input PDB path")?,
        );

        let output_format = match sub_matches
            .get_one::<String>("output-format")
            .map(String::as_str)
        {
            Some("json") | Some("jsonl") => OutputFormat::Json,
            _ => OutputFormat::Text,
        };

        let verbosity_level = match sub_matches.get_count("verbose") {
            0 => None,
            1 => Some(LevelFilter::Info),
            2 => Some(LevelFilter::Debug),
            3 => Some(LevelFilter::Trace),
            _ => {
                eprintln!("using more than -vvv does not affect verbosity level");
                Some(LevelFilter::Trace)
            }
        };

        let pointer_width = sub_matches
            .get_one::<String>("pointer-width")
            .map(|w| w.parse::<u8>())
            .transpose()
            .context("invalid pointer width")?;

        Ok(PdbDump {
            parser_settings: ParserSettings::new()
                .pointer_width(pointer_width)
                .scan_modules(!sub_matches.get_flag("no-module-scan")),
            input,
            listing,
            output_format,
            output_target: sub_matches.get_one::<String>("output-target").map(PathBuf::from),
            confirm_overwrite: !sub_matches.get_flag("no-confirm-overwrite"),
            verbosity_level,
        })
    }

    /// Main entry point for `PdbDump`
    pub fn run(&self) -> Result<()> {
        self.try_to_initialize_logging();

        if !self.input.exists() {
            bail!("File not found - {}", self.input.display());
        }

        let pdb = Pdb::from_path(&self.input)
            .with_context(|| format!("Failed to parse {}", self.input.display()))?
            .with_configuration(self.parser_settings.clone());

        let writer: Box<dyn Write> = match &self.output_target {
            Some(path) => Box::new(
                Self::create_output_file(path, self.confirm_overwrite).with_context(|| {
                    format!(
                        "An error occurred while creating output file at `{}`",
                        path.display()
                    )
                })?,
            ),
            None => Box::new(io::stdout().lock()),
        };
        let mut output = Output::new(self.output_format, writer);

        match self.listing {
            Listing::Segments => segments::run(&pdb, &mut output)?,
            Listing::Functions => functions::run(&pdb, &mut output)?,
            Listing::Vars => vars::run(&pdb, &mut output)?,
        }

        output.flush()
    }

    /// If `prompt` is passed, will display a confirmation prompt before overwriting files.
    fn create_output_file(path: impl AsRef<Path>, prompt: bool) -> Result<File> {
        let p = path.as_ref();

        if p.is_dir() {
            bail!(
                "There is a directory at {}, refusing to overwrite",
                p.display()
            );
        }

        if p.exists() {
            if prompt {
                match Confirm::new()
                    .with_prompt(format!(
                        "Are you sure you want to override output file at {}",
                        p.display()
                    ))
                    .default(false)
                    .interact()
                {
                    Ok(true) => Ok(File::create(p)?),
                    Ok(false) => bail!("Cancelled"),
                    Err(e) => bail!(
                        "Failed to write confirmation prompt to term caused by\n{}",
                        e
                    ),
                }
            } else {
                Ok(File::create(p)?)
            }
        } else {
            // Ok to assume p is not an existing directory
            match p.parent() {
                Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => {
                    fs::create_dir_all(parent)?;
                    Ok(File::create(p)?)
                }
                Some(_) => Ok(File::create(p)?),
                None => bail!("Output file cannot be root."),
            }
        }
    }

    fn try_to_initialize_logging(&self) {
        if let Some(level) = self.verbosity_level {
            if let Err(e) = TermLogger::init(
                level,
                Config::default(),
                TerminalMode::Stderr,
                ColorChoice::Auto,
            ) {
                eprintln!("Failed to initialize logging: {e}");
            }
        }
    }
}

fn input_arg() -> Arg {
    Arg::new("INPUT")
        .required(true)
        .value_name("PDB")
        .help("Path to the PDB file.")
}

fn cli() -> Command {
    Command::new("pdb_dump")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Utility to list sections, functions and variables recorded in a PDB file")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(segments::command().arg(input_arg()))
        .subcommand(functions::command().arg(input_arg()))
        .subcommand(vars::command().arg(input_arg()))
        .arg(
            Arg::new("output-format")
                .short('o')
                .long("format")
                .global(true)
                .value_parser(["text", "json", "jsonl"])
                .default_value("text")
                .help("Sets the output format")
                .long_help(indoc!(
                    r#"
                    Sets the output format:
                        "text"  - one `<name> VA=0x... FileAddr=0x... Size=...` line per entry.
                        "json"  - one JSON object per line.
                        "jsonl" - same as json.
                    "#
                )),
        )
        .arg(
            Arg::new("output-target")
                .long("output")
                .short('f')
                .global(true)
                .action(ArgAction::Set)
                .help(indoc!(
                    "Writes output to the file specified instead of stdout, errors will still be printed to stderr.
                     Will ask for confirmation before overwriting files, to allow overwriting, pass `--no-confirm-overwrite`
                     Will create parent directories if needed."
                )),
        )
        .arg(
            Arg::new("no-confirm-overwrite")
                .long("no-confirm-overwrite")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("When set, will not ask for confirmation before overwriting files, useful for automation"),
        )
        .arg(
            Arg::new("pointer-width")
                .long("pointer-width")
                .global(true)
                .value_parser(["4", "8"])
                .help("Size of pointers whose type record leaves it out. Defaults to the width implied by the PDB's machine type."),
        )
        .arg(
            Arg::new("no-module-scan")
                .long("no-module-scan")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("When set, module symbol streams are not read. Function sizes print as 0 and public variables as `?`."),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::Count)
                .help(indoc!(r#"
                Sets debug prints level for the application:
                    -v   - info
                    -vv  - debug
                    -vvv - trace
                NOTE: trace output is only available in debug builds, as it is extremely verbose."#)),
        )
}

fn main() {
    let matches = cli().get_matches();

    let result = PdbDump::from_cli_matches(&matches).and_then(|app| app.run());
    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}
