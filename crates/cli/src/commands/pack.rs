use anyhow::{Context, Result};
use dzip_core::codec::create_default_registry;
use dzip_core::config::Config;
use dzip_core::io::CancellationToken;
use dzip_core::pipeline::pack;
use dzip_core::volume::{FsPackSink, FsPackSource};
use log::info;

use crate::progress_bar::IndicatifObserver;

pub fn run(
    config_path: &str,
    source_dir: &str,
    output: &str,
    split_bytes: Option<u64>,
) -> Result<()> {
    let raw = std::fs::read_to_string(config_path)
        .with_context(|| format!("reading {config_path}"))?;
    let config: Config = toml::from_str(&raw).context("parsing config TOML")?;

    info!(
        "packing {} files into {output} ({} chunks)",
        config.files.len(),
        config.chunks.len()
    );

    let source = FsPackSource::new(source_dir);
    let sink = FsPackSink::new(output);
    let registry = create_default_registry();
    let observer = IndicatifObserver::new();
    let cancel = CancellationToken::new();

    pack::run(
        &config,
        &source,
        &sink,
        &registry,
        &observer,
        &cancel,
        split_bytes,
    )
    .context("packing archive")?;

    info!("wrote {output}");
    Ok(())
}
