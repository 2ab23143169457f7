use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};

use anyhow::{Context, Result};
use dzip_core::codec::{create_default_registry, CodecRegistry};
use dzip_core::format::ChunkFlags;
use dzip_core::io::{NoOpObserver, UnpackSource};
use dzip_core::model::{ChunkPlan, Model, ResolvedFile};
use dzip_core::pipeline::{collect_volume_lengths, unpack};
use dzip_core::volume::FsUnpackSource;
use rayon::prelude::*;

/// Parses an archive's header tables and resolved model without extracting
/// anything, reports a structural summary, then attempts to decode every
/// chunk each file references and prints a per-file integrity table. Exits
/// non-zero (via `?`) on any structural problem; a chunk that fails to
/// decode marks its file `FAIL` in the table rather than aborting the whole
/// command, since the point of `verify` is to report every bad file found.
pub fn run(input: &str) -> Result<()> {
    let source = FsUnpackSource::new(input);
    let parsed = unpack::parse_header(&source).context("parsing archive header")?;

    let num_volumes = parsed.split_file_names.len() as u16 + 1;
    let volume_lengths =
        collect_volume_lengths(&source, num_volumes).context("reading volume lengths")?;

    let mut model = Model::from_parsed(
        parsed.directories.clone(),
        &parsed.user_files,
        &parsed.map_entries,
        &parsed.chunks,
        &NoOpObserver,
    )
    .context("resolving archive model")?;
    model
        .recompute_effective_lengths(&volume_lengths)
        .context("recomputing chunk lengths")?;

    println!("archive version:   {}", parsed.version);
    println!("user files:        {}", model.files.len());
    println!("directories:       {}", model.directories.len());
    println!("chunks:            {}", model.chunks.len());
    println!(
        "volumes:           {} (base + {} split)",
        num_volumes,
        parsed.split_file_names.len()
    );
    println!(
        "range settings:    {}",
        if parsed.range_settings.is_some() {
            "present"
        } else {
            "absent"
        }
    );

    let mut flag_counts: HashMap<&'static str, usize> = HashMap::new();
    for chunk in &model.chunks {
        for name in chunk.flags.decode_names() {
            *flag_counts.entry(name).or_default() += 1;
        }
    }
    println!("chunk flag histogram:");
    let mut names: Vec<_> = flag_counts.into_iter().collect();
    names.sort_by_key(|(name, _)| *name);
    for (name, count) in names {
        println!("  {name:<12} {count}");
    }

    println!();
    println!("Verifying archive integrity...");
    println!(
        "{:<5} | {:<7} | {:<10} | {:<10} | {:<8} | Path",
        "Idx", "Status", "Size", "Packed", "Method"
    );
    println!(
        "{:-<5}-+-{:-<7}-+-{:-<10}-+-{:-<10}-+-{:-<8}-+-{:-<20}",
        "", "", "", "", "", ""
    );

    let registry = create_default_registry();
    let rows: Vec<String> = model
        .files
        .par_iter()
        .enumerate()
        .map(|(idx, file)| format_row(idx, file, &model, &source, &registry))
        .collect();
    for row in rows {
        println!("{row}");
    }

    Ok(())
}

fn format_row(
    idx: usize,
    file: &ResolvedFile,
    model: &Model,
    source: &FsUnpackSource,
    registry: &CodecRegistry,
) -> String {
    let status = verify_file(file, model, source, registry);

    let mut size = 0u64;
    let mut packed = 0u64;
    let mut method = "Unknown";
    for (slot, &chunk_id) in file.chunk_refs.iter().enumerate() {
        let Some(plan) = model.chunk(chunk_id) else {
            continue;
        };
        size += plan.decompressed_len as u64;
        packed += plan.effective_compressed_len as u64;
        if slot == 0 {
            method = method_name(plan.flags);
        }
    }

    format!(
        "{:<5} | {:<7} | {:<10} | {:<10} | {:<8} | {}",
        idx, status, size, packed, method, file.logical_path
    )
}

/// Attempts to decode every chunk `file` references, against freshly opened
/// volume readers, without writing the output anywhere. Mirrors the
/// decode-and-discard verification the teacher's read-only `verify` command
/// ran per file, adapted to this codebase's port traits and codec registry.
fn verify_file(
    file: &ResolvedFile,
    model: &Model,
    source: &dyn UnpackSource,
    registry: &CodecRegistry,
) -> &'static str {
    for &chunk_id in &file.chunk_refs {
        let Some(plan) = model.chunk(chunk_id) else {
            return "FAIL";
        };
        if plan.flags.contains(ChunkFlags::ZERO) {
            continue;
        }
        let Some(codec) = registry.find_decompressor(plan.flags) else {
            return "FAIL";
        };
        let raw = match read_chunk_bytes(plan, source) {
            Ok(raw) => raw,
            Err(_) => return "FAIL",
        };
        let mut out = Vec::with_capacity(plan.decompressed_len as usize);
        let decoded = codec.decompress(
            &mut std::io::Cursor::new(&raw),
            &mut out,
            plan.decompressed_len,
        );
        if decoded.is_err() || out.len() as u32 != plan.decompressed_len {
            return "FAIL";
        }
    }
    "OK"
}

fn read_chunk_bytes(plan: &ChunkPlan, source: &dyn UnpackSource) -> dzip_core::Result<Vec<u8>> {
    let mut reader = if plan.physical_volume == 0 {
        source.open_base()?
    } else {
        source.open_volume(plan.physical_volume)?
    };
    reader.seek(SeekFrom::Start(plan.offset as u64))?;
    let mut raw = vec![0u8; plan.effective_compressed_len as usize];
    reader.read_exact(&mut raw)?;
    Ok(raw)
}

fn method_name(flags: ChunkFlags) -> &'static str {
    if flags.contains(ChunkFlags::ZLIB) {
        "Zlib"
    } else if flags.contains(ChunkFlags::BZIP) {
        "Bzip"
    } else if flags.contains(ChunkFlags::LZMA) {
        "LZMA"
    } else if flags.contains(ChunkFlags::COPYCOMP) {
        "Copy"
    } else if flags.contains(ChunkFlags::ZERO) {
        "Zero"
    } else if flags.contains(ChunkFlags::DZ) {
        "Dz"
    } else {
        "Unknown"
    }
}
