//! Pack pipeline: turns a `Config` document plus a file tree back into a DZ
//! archive, the inverse of `pipeline::unpack`.
//!
//! Compression runs on a `rayon` worker pool; workers hand `(chunk_id,
//! payload)` pairs to a single dedicated writer role over a bounded channel.
//! The writer is not part of the worker pool: it buffers
//! out-of-order arrivals in a reorder map and only accepts payloads in
//! strictly ascending chunk-id order, assigning each its final offset and
//! volume. The bounded channel capacity is the back-pressure: a worker whose
//! chunk is far ahead of the writer's cursor blocks on `send` until the
//! writer catches up.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};
use rayon::prelude::*;

use crate::codec::CodecRegistry;
use crate::config::Config;
use crate::error::DzipError;
use crate::format::{self, ArchiveSettings, Chunk, ChunkFlags, ChunkSettings};
use crate::io::{CancellationToken, FinalizeOutcome, PackSink, PackSource, ProgressObserver};
use crate::path::sanitize_logical_path;
use crate::Result;

/// A chunk's compressed payload, still unordered with respect to its peers
/// until the writer picks it up.
struct CompressedChunk {
    id: u16,
    flags: ChunkFlags,
    decompressed_len: u32,
    bytes: Vec<u8>,
}

/// Groups of consecutive file indices that all reference the same chunk id,
/// in ascending chunk-id order. A chunk with one consumer is a solo chunk; a
/// chunk with more is shared across that contiguous run of files.
fn chunk_consumer_groups(config: &Config) -> Vec<(u16, Vec<usize>)> {
    let mut by_chunk: HashMap<u16, Vec<usize>> = HashMap::new();
    for (file_idx, file) in config.files.iter().enumerate() {
        for &cid in &file.chunks {
            by_chunk.entry(cid).or_default().push(file_idx);
        }
    }
    let mut groups: Vec<(u16, Vec<usize>)> = by_chunk.into_iter().collect();
    groups.sort_by_key(|(id, _)| *id);
    groups
}

/// Sanity-checks `config` against the file tree `source` exposes before any
/// compression starts: every logical path sanitizes
/// cleanly and exists, and every chunk id a file references is declared in
/// `config.chunks`.
fn validate_against_source(config: &Config, source: &dyn PackSource) -> Result<()> {
    let known_chunks: std::collections::HashSet<u16> =
        config.chunks.iter().map(|c| c.id).collect();
    for file in &config.files {
        sanitize_logical_path(&file.path)?;
        source.file_len(&file.path)?;
        for &cid in &file.chunks {
            if !known_chunks.contains(&cid) {
                return Err(DzipError::CorruptIndex {
                    kind: "chunk_index".to_string(),
                    offender: cid as u32,
                });
            }
        }
    }
    Ok(())
}

/// Writes a fresh archive (plus any split volumes the config names, or a
/// size-threshold-driven split when `volume_split_bytes` is given) from
/// `config` and the files it references, reading file contents through
/// `source` and emitting volumes through `sink`.
///
/// When `volume_split_bytes` is `None`, each chunk lands on the volume named
/// in its `Config` record (round-trip fidelity with an unpacked archive).
/// When `Some(threshold)`, the writer ignores the config's volume
/// assignments and rolls onto a fresh volume whenever the current one would
/// exceed `threshold`, naming each new volume via `PackSink::volume_name`.
pub fn run(
    config: &Config,
    source: &dyn PackSource,
    sink: &dyn PackSink,
    registry: &CodecRegistry,
    observer: &dyn ProgressObserver,
    cancel: &CancellationToken,
    volume_split_bytes: Option<u64>,
) -> Result<()> {
    let result = run_inner(
        config,
        source,
        sink,
        registry,
        observer,
        cancel,
        volume_split_bytes,
    );
    let outcome = match &result {
        Ok(()) => FinalizeOutcome::Committed,
        Err(_) => FinalizeOutcome::Aborted,
    };
    sink.finalize(outcome)?;
    result
}

fn run_inner(
    config: &Config,
    source: &dyn PackSource,
    sink: &dyn PackSink,
    registry: &CodecRegistry,
    observer: &dyn ProgressObserver,
    cancel: &CancellationToken,
    volume_split_bytes: Option<u64>,
) -> Result<()> {
    validate_against_source(config, source)?;

    let groups = chunk_consumer_groups(config);
    observer.set_total(groups.len() as u64);

    let chunk_flags_by_id: HashMap<u16, ChunkFlags> = config
        .chunks
        .iter()
        .map(|c| (c.id, ChunkFlags::encode_names(&c.flags)))
        .collect();
    let archive_file_by_id: HashMap<u16, u16> = config
        .chunks
        .iter()
        .map(|c| (c.id, c.archive_file_index))
        .collect();

    // Bounded at roughly 2x the worker pool so an unlucky schedule (highly
    // compressible data finishing out of order) can't buffer every payload
    // in memory before the writer drains them.
    let capacity = (rayon::current_num_threads() * 2).max(4);
    let (tx, rx) = std::sync::mpsc::sync_channel::<Result<CompressedChunk>>(capacity);

    let writer_result = std::thread::scope(|scope| {
        let producer = scope.spawn(|| {
            groups.par_iter().for_each(|(chunk_id, file_idxs)| {
                if cancel.is_cancelled() {
                    let _ = tx.send(Err(DzipError::Cancelled));
                    return;
                }
                let result = compress_group(
                    *chunk_id,
                    file_idxs,
                    config,
                    source,
                    registry,
                    &chunk_flags_by_id,
                );
                if result.is_ok() {
                    observer.advance(1);
                }
                let _ = tx.send(result);
            });
        });

        let result = run_writer(rx, &archive_file_by_id, sink, volume_split_bytes, cancel);
        producer.join().expect("pack compression worker panicked");
        result
    });

    observer.finish("pack complete");
    let (chunk_records, volume_names, payloads) = writer_result?;
    finalize_archive(config, sink, chunk_records, volume_names, payloads)
}

fn compress_group(
    chunk_id: u16,
    file_idxs: &[usize],
    config: &Config,
    source: &dyn PackSource,
    registry: &CodecRegistry,
    chunk_flags_by_id: &HashMap<u16, ChunkFlags>,
) -> Result<CompressedChunk> {
    let flags = chunk_flags_by_id
        .get(&chunk_id)
        .copied()
        .unwrap_or(ChunkFlags::ZLIB);

    let raw = if flags.contains(ChunkFlags::ZERO) {
        let mut total = 0usize;
        for &idx in file_idxs {
            total += source.file_len(&config.files[idx].path)? as usize;
        }
        vec![0u8; total]
    } else {
        let mut buf = Vec::new();
        for &idx in file_idxs {
            let mut reader = source.open_file(&config.files[idx].path)?;
            std::io::Read::read_to_end(reader.as_mut(), &mut buf)?;
        }
        buf
    };
    let decompressed_len = raw.len() as u32;

    let bytes = if flags.contains(ChunkFlags::ZERO) {
        Vec::new()
    } else {
        let compressor = registry
            .find_compressor(flags)
            .ok_or(DzipError::UnsupportedCodec {
                chunk_id,
                flag: flags.bits(),
            })?;
        let mut out = Vec::new();
        compressor.compress(&mut std::io::Cursor::new(&raw), &mut out)?;
        out
    };

    Ok(CompressedChunk {
        id: chunk_id,
        flags,
        decompressed_len,
        bytes,
    })
}

/// The writer role: a single dedicated role that does not participate in
/// the worker pool. Drains the channel, reorders arrivals
/// by ascending chunk id, assigns each chunk's final volume/offset, and
/// accumulates payload bytes per volume. Returns the finished `Chunk`
/// records (ascending by id), the split-volume name list, and each volume's
/// accumulated payload bytes.
fn run_writer(
    rx: std::sync::mpsc::Receiver<Result<CompressedChunk>>,
    archive_file_by_id: &HashMap<u16, u16>,
    sink: &dyn PackSink,
    volume_split_bytes: Option<u64>,
    cancel: &CancellationToken,
) -> Result<(Vec<Chunk>, BTreeMap<u16, String>, HashMap<u16, Vec<u8>>)> {
    let mut pending: BTreeMap<u16, CompressedChunk> = BTreeMap::new();
    let mut chunk_records: Vec<Chunk> = Vec::new();
    let mut payloads: HashMap<u16, Vec<u8>> = HashMap::new();
    let mut volume_names: BTreeMap<u16, String> = BTreeMap::new();

    let mut current_volume: u16 = 0;
    let mut current_volume_bytes: u64 = 0;
    let mut next_expected: u16 = 0;

    while let Ok(msg) = rx.recv() {
        let chunk = msg?;
        cancel.check()?;
        pending.insert(chunk.id, chunk);

        while let Some(chunk) = pending.remove(&next_expected) {
            let target_volume = match volume_split_bytes {
                Some(threshold) => {
                    if current_volume_bytes > 0
                        && current_volume_bytes + chunk.bytes.len() as u64 > threshold
                    {
                        current_volume += 1;
                        current_volume_bytes = 0;
                        volume_names.insert(current_volume, sink.volume_name(current_volume)?);
                    }
                    current_volume_bytes += chunk.bytes.len() as u64;
                    current_volume
                }
                None => archive_file_by_id.get(&chunk.id).copied().unwrap_or(0),
            };

            let buf = payloads.entry(target_volume).or_default();
            let offset = buf.len() as u32;
            buf.extend_from_slice(&chunk.bytes);

            if target_volume != 0 && !volume_names.contains_key(&target_volume) {
                volume_names.insert(target_volume, sink.volume_name(target_volume)?);
            }

            chunk_records.push(Chunk {
                offset,
                compressed_length: chunk.bytes.len() as u32,
                decompressed_length: chunk.decompressed_len,
                flags: chunk.flags,
                file: target_volume,
            });
            next_expected += 1;
        }
    }

    if !pending.is_empty() {
        let offender = *pending.keys().next().unwrap();
        return Err(DzipError::CorruptIndex {
            kind: "missing_chunk_payload".to_string(),
            offender: offender as u32,
        });
    }

    Ok((chunk_records, volume_names, payloads))
}

/// Assembles the header (string tables, mapping stream, chunk table,
/// volume-name list, decoder settings blocks) now that every chunk's final
/// offset and volume are known, then writes the base volume and any split
/// volumes through `sink`.
fn finalize_archive(
    config: &Config,
    sink: &dyn PackSink,
    mut chunk_records: Vec<Chunk>,
    volume_names: BTreeMap<u16, String>,
    mut payloads: HashMap<u16, Vec<u8>>,
) -> Result<()> {
    // `run_writer` only ever pops `next_expected`, so `chunk_records` is
    // already in ascending chunk-id order; nothing to sort here.

    let directories = collect_directories(config);
    let directory_index: HashMap<&str, usize> = directories
        .iter()
        .enumerate()
        .map(|(i, d)| (d.as_str(), i))
        .collect();

    let mut header = Vec::new();
    format::write_archive_settings(
        &mut header,
        &ArchiveSettings {
            num_user_files: config.files.len() as u16,
            num_directories: directories.len() as u16,
            version: config.archive.version,
        },
    )?;
    for file in &config.files {
        format::write_null_term_string(&mut header, &file.filename)?;
    }
    for dir in directories.iter().skip(1) {
        format::write_null_term_string(&mut header, dir)?;
    }
    for file in &config.files {
        let dir_idx = *directory_index.get(file.directory.as_str()).unwrap_or(&0);
        header.write_u16::<LittleEndian>(dir_idx as u16)?;
        format::write_chunk_ref_list(&mut header, &file.chunks)?;
    }

    let num_archive_files = volume_names.keys().max().copied().unwrap_or(0) + 1;
    format::write_chunk_settings(
        &mut header,
        &ChunkSettings {
            num_archive_files,
            num_chunks: chunk_records.len() as u16,
        },
    )?;

    // Split filenames and range settings sit between the chunk table and the
    // first chunk's data, so their bytes must be accounted for in volume 0's
    // base offset even though they're appended to `header` below.
    let mut tail = Vec::new();
    for idx in 1..num_archive_files {
        let name = volume_names
            .get(&idx)
            .cloned()
            .unwrap_or_else(|| format!("volume{idx}"));
        format::write_null_term_string(&mut tail, &name)?;
    }
    let has_dz = chunk_records.iter().any(|c| c.flags.contains(ChunkFlags::DZ));
    if has_dz {
        if let Some(range) = &config.range_settings {
            format::write_range_settings(&mut tail, &(range.clone().into()))?;
        }
    }

    let header_len = header.len() as u64 + 16 * chunk_records.len() as u64 + tail.len() as u64;
    for record in chunk_records.iter_mut() {
        if record.file == 0 {
            record.offset += header_len as u32;
        }
    }
    for record in &chunk_records {
        format::write_chunk(&mut header, record)?;
    }
    header.extend_from_slice(&tail);

    let mut base_writer = sink.create_base()?;
    base_writer.write_all(&header)?;
    if let Some(base_payload) = payloads.remove(&0) {
        base_writer.write_all(&base_payload)?;
    }
    base_writer.flush()?;

    for (index, payload) in payloads {
        let mut writer = sink.create_volume(index)?;
        writer.write_all(&payload)?;
        writer.flush()?;
    }

    Ok(())
}

fn collect_directories(config: &Config) -> Vec<String> {
    let mut directories = vec![String::new()];
    for file in &config.files {
        if !file.directory.is_empty() && !directories.contains(&file.directory) {
            directories.push(file.directory.clone());
        }
    }
    directories
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemPackSource {
        content: Vec<u8>,
    }

    impl PackSource for MemPackSource {
        fn open_file(&self, _logical_path: &str) -> Result<Box<dyn std::io::Read + Send>> {
            Ok(Box::new(std::io::Cursor::new(self.content.clone())))
        }
        fn file_len(&self, _logical_path: &str) -> Result<u64> {
            Ok(self.content.len() as u64)
        }
    }

    struct RecordingPackSink {
        finalized_with: std::sync::Mutex<Vec<crate::io::FinalizeOutcome>>,
    }

    impl PackSink for RecordingPackSink {
        fn create_base(&self) -> Result<Box<dyn Write + Send>> {
            Ok(Box::new(Vec::new()))
        }
        fn create_volume(&self, _index: u16) -> Result<Box<dyn Write + Send>> {
            Ok(Box::new(Vec::new()))
        }
        fn volume_name(&self, index: u16) -> Result<String> {
            Ok(format!("volume{index}"))
        }
        fn finalize(&self, outcome: crate::io::FinalizeOutcome) -> Result<()> {
            self.finalized_with.lock().unwrap().push(outcome);
            Ok(())
        }
    }

    fn single_file_config() -> Config {
        Config {
            archive: crate::config::ArchiveMeta {
                version: 0,
                total_files: 1,
                total_directories: 1,
                total_chunks: 1,
            },
            archive_files: vec![],
            range_settings: None,
            files: vec![crate::config::FileEntry {
                path: "a.txt".into(),
                directory: String::new(),
                filename: "a.txt".into(),
                chunks: vec![0],
            }],
            chunks: vec![crate::config::ChunkRecord {
                id: 0,
                offset: 0,
                size_compressed: 4,
                size_decompressed: 4,
                flags: vec!["COPYCOMP".to_string()],
                archive_file_index: 0,
            }],
        }
    }

    /// Pre-cancelling before any chunk is compressed surfaces `Cancelled`
    /// and the sink still observes exactly one `finalize(Aborted)` call.
    #[test]
    fn cancellation_surfaces_error_and_finalizes_as_aborted() {
        let config = single_file_config();
        let source = MemPackSource {
            content: b"AAAA".to_vec(),
        };
        let sink = RecordingPackSink {
            finalized_with: std::sync::Mutex::new(Vec::new()),
        };
        let registry = crate::codec::create_default_registry();
        let observer = crate::io::NoOpObserver;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = run(&config, &source, &sink, &registry, &observer, &cancel, None).unwrap_err();
        assert!(matches!(err, DzipError::Cancelled));
        assert_eq!(
            sink.finalized_with.into_inner().unwrap(),
            vec![crate::io::FinalizeOutcome::Aborted]
        );
    }

    #[test]
    fn chunk_consumer_groups_orders_by_ascending_chunk_id() {
        let config = Config {
            archive: crate::config::ArchiveMeta {
                version: 0,
                total_files: 2,
                total_directories: 1,
                total_chunks: 2,
            },
            archive_files: vec![],
            range_settings: None,
            files: vec![
                crate::config::FileEntry {
                    path: "a".into(),
                    directory: String::new(),
                    filename: "a".into(),
                    chunks: vec![1],
                },
                crate::config::FileEntry {
                    path: "b".into(),
                    directory: String::new(),
                    filename: "b".into(),
                    chunks: vec![0],
                },
            ],
            chunks: vec![],
        };
        let groups = chunk_consumer_groups(&config);
        assert_eq!(groups[0].0, 0);
        assert_eq!(groups[1].0, 1);
    }
}
