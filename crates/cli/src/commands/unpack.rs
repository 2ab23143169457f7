use std::path::Path;

use anyhow::{Context, Result};
use dzip_core::codec::create_default_registry;
use dzip_core::io::CancellationToken;
use dzip_core::pipeline::unpack;
use dzip_core::volume::{FsUnpackSink, FsUnpackSource};
use log::info;

use crate::progress_bar::IndicatifObserver;

pub fn run(input: &str, output_dir: &str, keep_raw: bool) -> Result<()> {
    std::fs::create_dir_all(output_dir).context("creating output directory")?;

    let source = FsUnpackSource::new(input);
    let sink = FsUnpackSink::new(output_dir);
    let registry = create_default_registry();
    let observer = IndicatifObserver::new();
    let cancel = CancellationToken::new();

    info!("reading header tables from {input}");
    let parsed = unpack::parse_header(&source).context("parsing archive header")?;
    info!(
        "{} files, {} directories, {} chunks",
        parsed.user_files.len(),
        parsed.directories.len().max(1),
        parsed.chunks.len()
    );

    let config = unpack::run(
        &parsed,
        &source,
        &sink,
        &registry,
        keep_raw,
        &observer,
        &cancel,
    )
    .context("extracting archive")?;

    let config_path = config_output_path(input, output_dir);
    let toml_string = toml::to_string_pretty(&config).context("serializing config")?;
    std::fs::write(&config_path, toml_string)
        .with_context(|| format!("writing {}", config_path.display()))?;

    info!("wrote config to {}", config_path.display());
    Ok(())
}

fn config_output_path(input: &str, output_dir: &str) -> std::path::PathBuf {
    let stem = Path::new(input)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    Path::new(output_dir).join(format!("{stem}.toml"))
}
