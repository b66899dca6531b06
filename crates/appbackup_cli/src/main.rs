//! appbackup CLI
//!
//! Command-line tools for appbackup archive streams.
//!
//! # Commands
//!
//! - `inspect` - List the records of an archive
//! - `verify` - Check an archive for structural problems
//! - `pack` - Build a single-package archive from a directory tree

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// appbackup archive tools.
#[derive(Parser)]
#[command(name = "appbackup")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the records of an archive
    Inspect {
        /// Archive file
        archive: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check an archive for structural problems
    Verify {
        /// Archive file
        archive: PathBuf,
    },

    /// Build a single-package archive from `<dir>/<domain>/<path>`
    Pack {
        /// Directory holding one subdirectory per domain
        dir: PathBuf,

        /// Package name written to the manifest
        #[arg(long)]
        package: String,

        /// Version code written to the manifest
        #[arg(long)]
        version_code: i64,

        /// Platform version written to the manifest
        #[arg(long, default_value = "0")]
        platform_version: i32,

        /// Signing certificate as hex; repeat for several
        #[arg(long = "signature")]
        signatures: Vec<String>,

        /// Output archive
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { archive, format } => {
            commands::inspect::run(&archive, &format)?;
        }
        Commands::Verify { archive } => {
            commands::verify::run(&archive)?;
        }
        Commands::Pack {
            dir,
            package,
            version_code,
            platform_version,
            signatures,
            output,
        } => {
            let options = commands::pack::PackOptions {
                package,
                version_code,
                platform_version,
                signatures: commands::pack::parse_signatures(&signatures)?,
            };
            commands::pack::run(&dir, &options, &output)?;
        }
        Commands::Version => {
            println!("appbackup CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("archive manifest format v{}", appbackup_codec::MANIFEST_VERSION);
        }
    }

    Ok(())
}
