use std::path::PathBuf;

use clap::Parser;

/// Relays newline-delimited JSON event records to a line protocol database.
#[derive(Parser)]
#[command(about)]
pub struct Cli {
    /// Path to the YAML configuration file.
    ///
    /// Values from the environment (prefixed with `SLUICE_`) take precedence over values from the file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Path to the file to read event records from.
    ///
    /// Defaults to standard input.
    #[arg(short = 'i', long = "input")]
    pub input: Option<PathBuf>,
}
