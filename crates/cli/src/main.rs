use clap::{Parser, Subcommand};
use log::error;

mod commands;
mod progress_bar;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose (debug-level) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract a .dz archive and write a TOML config describing it
    Unpack {
        /// Path to the base archive file (e.g. resources.dz)
        input: String,
        /// Directory to extract files into
        #[arg(short, long, default_value = ".")]
        output: String,
        /// Write raw (undecoded) bytes for chunks whose codec fails or is unsupported,
        /// instead of aborting the whole operation
        #[arg(long)]
        keep_raw: bool,
    },
    /// Pack a directory of files, described by a TOML config, into a .dz archive
    Pack {
        /// Path to the TOML config produced by `unpack`
        config: String,
        /// Directory the config's file paths are relative to
        #[arg(short, long, default_value = ".")]
        source: String,
        /// Path the base archive file should be written to
        #[arg(short, long)]
        output: String,
        /// Roll onto a new split volume once the current one would exceed this
        /// many bytes of chunk payload, ignoring the config's own volume
        /// assignments. Omit to keep each chunk on the volume its config names.
        #[arg(long)]
        split_bytes: Option<u64>,
    },
    /// Parse an archive's header tables and report what it contains, without extracting
    Verify {
        /// Path to the base archive file
        input: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let result = match &cli.command {
        Commands::Unpack {
            input,
            output,
            keep_raw,
        } => commands::unpack::run(input, output, *keep_raw),
        Commands::Pack {
            config,
            source,
            output,
            split_bytes,
        } => commands::pack::run(config, source, output, *split_bytes),
        Commands::Verify { input } => commands::verify::run(input),
    };

    if let Err(err) = result {
        error!("{err:#}");
        std::process::exit(1);
    }
}
