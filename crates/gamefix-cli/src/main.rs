mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use commands::hex_utils::parse_hex_address;

#[derive(Parser)]
#[command(name = "gamefix")]
#[command(about = "Offline tools for writing game fixes: pattern scans and pointer decoding")]
struct Args {
    /// Log engine detail (scan and decode steps)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Search a file for a wildcard byte pattern
    Scan {
        file: PathBuf,
        /// Pattern such as "48 8B 05 ?? ?? ?? ??"
        pattern: String,
        /// Stop at the first match
        #[arg(long)]
        first: bool,
        /// Address of file offset 0 (hex)
        #[arg(long, default_value = "0", value_parser = parse_hex_address)]
        base: usize,
        /// Maximum matches to print
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Resolve every entry of a signature set against a file
    Signatures {
        file: PathBuf,
        signatures: PathBuf,
        /// Address of file offset 0 (hex)
        #[arg(long, default_value = "0", value_parser = parse_hex_address)]
        base: usize,
    },
    /// Decode a pointer embedded in the instruction at a file offset
    Pointer {
        file: PathBuf,
        /// File offset of the instruction (hex)
        offset: String,
        /// absolute:<n>, relative:<n>, rip:<disp>:<len>, or JSON
        #[arg(short, long)]
        encoding: String,
        /// Address of file offset 0 (hex)
        #[arg(long, default_value = "0", value_parser = parse_hex_address)]
        base: usize,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(format!("gamefix_core={}", level).parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Scan {
            file,
            pattern,
            first,
            base,
            limit,
        } => {
            debug!("scan {} {:?} first={} base={:#x}", file.display(), pattern, first, base);
            commands::scan::run(&file, &pattern, first, base, limit)
        }
        Command::Signatures {
            file,
            signatures,
            base,
        } => commands::signatures::run(&file, &signatures, base),
        Command::Pointer {
            file,
            offset,
            encoding,
            base,
        } => commands::pointer::run(&file, &offset, &encoding, base),
    }
}
