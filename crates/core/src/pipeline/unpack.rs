//! Unpack pipeline: parse the header tables, resolve the model, then
//! decompress chunks in parallel and write them through the sink.

use std::collections::HashMap;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};

use rayon::prelude::*;

use crate::codec::CodecRegistry;
use crate::config::{ArchiveMeta, ChunkRecord, Config, FileEntry};
use crate::error::DzipError;
use crate::format::{self, ChunkFlags, DEFAULT_BUFFER_SIZE};
use crate::io::{
    CancellationToken, FinalizeOutcome, ProgressObserver, ReadSeek, UnpackSink, UnpackSource,
};
use crate::model::{ChunkPlan, MapEntry, Model};
use crate::Result;

use super::{collect_volume_lengths, ParsedArchive};

/// Reads every header table from the base volume, in wire order.
pub fn parse_header(source: &dyn UnpackSource) -> Result<ParsedArchive> {
    let base = source.open_base()?;
    let mut reader = BufReader::with_capacity(DEFAULT_BUFFER_SIZE, base);

    let archive_settings = format::read_archive_settings(&mut reader)?;

    let mut user_files = Vec::with_capacity(archive_settings.num_user_files as usize);
    for _ in 0..archive_settings.num_user_files {
        user_files.push(format::read_null_term_string(&mut reader)?);
    }

    let mut directories = Vec::with_capacity(archive_settings.num_directories as usize);
    if archive_settings.num_directories > 0 {
        directories.push(String::new());
        for _ in 1..archive_settings.num_directories {
            directories.push(format::read_null_term_string(&mut reader)?);
        }
    }

    let mut map_entries = Vec::with_capacity(archive_settings.num_user_files as usize);
    for _ in 0..archive_settings.num_user_files {
        use byteorder::{LittleEndian, ReadBytesExt};
        let directory_index = reader.read_u16::<LittleEndian>()? as usize;
        let chunk_ids = format::read_chunk_ref_list(&mut reader)?;
        map_entries.push(MapEntry {
            directory_index,
            chunk_ids,
        });
    }

    let chunk_settings = format::read_chunk_settings(&mut reader)?;

    let mut chunks = Vec::with_capacity(chunk_settings.num_chunks as usize);
    let mut has_dz_chunk = false;
    for id in 0..chunk_settings.num_chunks {
        let chunk = format::read_chunk(&mut reader, id)?;
        if chunk.flags.contains(ChunkFlags::DZ) {
            has_dz_chunk = true;
        }
        chunks.push(chunk);
    }

    let mut split_file_names = Vec::new();
    if chunk_settings.num_archive_files > 1 {
        for _ in 0..(chunk_settings.num_archive_files - 1) {
            split_file_names.push(format::read_null_term_string(&mut reader)?);
        }
    }

    let range_settings = if has_dz_chunk {
        Some(format::read_range_settings(&mut reader)?)
    } else {
        None
    };

    Ok(ParsedArchive {
        version: archive_settings.version,
        user_files,
        directories,
        map_entries,
        chunks,
        split_file_names,
        range_settings,
    })
}

/// Extracts every file described by `model` through `sink`, returning a
/// `Config` document describing exactly what was written (so a pack from it
/// reproduces an equivalent archive).
///
/// When `keep_raw` is set, a chunk whose codec fails to decompress (or whose
/// flags name a codec this build doesn't register) is written verbatim
/// instead of aborting the whole operation.
pub fn run(
    parsed: &ParsedArchive,
    source: &dyn UnpackSource,
    sink: &dyn UnpackSink,
    registry: &CodecRegistry,
    keep_raw: bool,
    observer: &dyn ProgressObserver,
    cancel: &CancellationToken,
) -> Result<Config> {
    let result = run_inner(parsed, source, sink, registry, keep_raw, observer, cancel);
    let outcome = match &result {
        Ok(_) => FinalizeOutcome::Committed,
        Err(_) => FinalizeOutcome::Aborted,
    };
    sink.finalize(outcome)?;
    result
}

fn run_inner(
    parsed: &ParsedArchive,
    source: &dyn UnpackSource,
    sink: &dyn UnpackSink,
    registry: &CodecRegistry,
    keep_raw: bool,
    observer: &dyn ProgressObserver,
    cancel: &CancellationToken,
) -> Result<Config> {
    let num_volumes = parsed.split_file_names.len() as u16 + 1;
    let volume_lengths = collect_volume_lengths(source, num_volumes)?;

    let mut model = Model::from_parsed(
        parsed.directories.clone(),
        &parsed.user_files,
        &parsed.map_entries,
        &parsed.chunks,
        observer,
    )?;
    model.recompute_effective_lengths(&volume_lengths)?;

    observer.set_total(model.files.len() as u64);

    // COMBUF chunks are decoded once, up front, and concatenated in
    // ascending chunk-id order into one logical stream; every
    // consumer byte range for a COMBUF chunk is already expressed in that
    // stream's coordinate space (see `Model::from_parsed`).
    let mut volumes = ThreadLocalVolumes::default();
    let mut combuf_stream = Vec::new();
    for plan in &model.chunks {
        if !plan.flags.contains(ChunkFlags::COMBUF) {
            continue;
        }
        cancel.check()?;
        match decode_chunk(plan, &mut volumes, source, registry, false) {
            Ok(ChunkOutcome::Decoded(bytes)) => combuf_stream.extend_from_slice(&bytes),
            Ok(ChunkOutcome::Sidecared(_)) => unreachable!("keep_raw disabled for combuf decode"),
            Err(e) if keep_raw => {
                observer.warn(&format!(
                    "combuf chunk {} failed to decode ({e}); padding stream with zeros",
                    plan.id
                ));
                combuf_stream.extend(std::iter::repeat(0u8).take(plan.decompressed_len as usize));
            }
            Err(e) => return Err(e),
        }
    }

    model
        .files
        .par_iter()
        .enumerate()
        .try_for_each_init(ThreadLocalVolumes::default, |volumes, (file_index, file)| -> Result<()> {
            cancel.check()?;
            let mut writer = sink.create_file(&file.logical_path)?;

            for &chunk_id in &file.chunk_refs {
                let plan = model.chunk(chunk_id).ok_or(DzipError::CorruptIndex {
                    kind: "chunk_index".to_string(),
                    offender: chunk_id as u32,
                })?;

                let consumer = plan
                    .consumers
                    .iter()
                    .find(|c| c.file_index == file_index)
                    .ok_or(DzipError::CorruptIndex {
                        kind: "chunk_consumer".to_string(),
                        offender: chunk_id as u32,
                    })?;

                if plan.flags.contains(ChunkFlags::COMBUF) {
                    let start = consumer.byte_start as usize;
                    let end = (consumer.byte_end as usize).min(combuf_stream.len());
                    writer.write_all(&combuf_stream[start.min(end)..end])?;
                    continue;
                }

                match decode_chunk(plan, volumes, source, registry, keep_raw)? {
                    ChunkOutcome::Decoded(decompressed) => {
                        let start = consumer.byte_start as usize;
                        let end = (consumer.byte_end as usize).min(decompressed.len());
                        writer.write_all(&decompressed[start.min(end)..end])?;
                    }
                    ChunkOutcome::Sidecared(raw) => {
                        let suffix = sidecar_suffix(plan.flags);
                        observer.warn(&format!(
                            "chunk {} uses an unsupported codec; raw bytes written to sidecar",
                            plan.id
                        ));
                        let mut sidecar = sink.create_sidecar(&file.logical_path, suffix)?;
                        sidecar.write_all(&raw)?;
                        sidecar.flush()?;
                    }
                }
            }
            writer.flush()?;
            observer.advance(1);
            Ok(())
        })?;

    observer.finish("unpack complete");
    build_config(parsed, &model)
}

/// Picks the sidecar file suffix for a chunk whose codec was skipped under
/// `keep_raw`: the proprietary range coder gets its own recognizable
/// extension, everything else (MP3/JPEG/RANDOMACCESS or a failed codec)
/// falls back to a generic `.raw`.
fn sidecar_suffix(flags: ChunkFlags) -> &'static str {
    if flags.contains(ChunkFlags::DZ) {
        ".rangecoder"
    } else {
        ".raw"
    }
}

enum ChunkOutcome {
    Decoded(Vec<u8>),
    /// The codec for this chunk's flags isn't registered, or failed; carries
    /// the already-read raw compressed bytes for the caller to sidecar.
    Sidecared(Vec<u8>),
}

fn read_raw_chunk(
    plan: &ChunkPlan,
    volumes: &mut ThreadLocalVolumes,
    source: &dyn UnpackSource,
) -> Result<Vec<u8>> {
    let reader = volumes.open(plan.physical_volume, source)?;
    reader.seek(SeekFrom::Start(plan.offset as u64))?;
    let mut raw = vec![0u8; plan.effective_compressed_len as usize];
    reader.read_exact(&mut raw)?;
    Ok(raw)
}

fn decode_chunk(
    plan: &ChunkPlan,
    volumes: &mut ThreadLocalVolumes,
    source: &dyn UnpackSource,
    registry: &CodecRegistry,
    keep_raw: bool,
) -> Result<ChunkOutcome> {
    if plan.flags.contains(ChunkFlags::ZERO) {
        return Ok(ChunkOutcome::Decoded(vec![0u8; plan.decompressed_len as usize]));
    }

    let Some(codec) = registry.find_decompressor(plan.flags) else {
        if keep_raw {
            return Ok(ChunkOutcome::Sidecared(read_raw_chunk(plan, volumes, source)?));
        }
        return Err(DzipError::UnsupportedCodec {
            chunk_id: plan.id,
            flag: plan.flags.bits(),
        });
    };

    let raw = read_raw_chunk(plan, volumes, source)?;
    let mut out = Vec::with_capacity(plan.decompressed_len as usize);
    let result = codec
        .decompress(&mut std::io::Cursor::new(&raw), &mut out, plan.decompressed_len)
        .and_then(|()| {
            if out.len() as u32 != plan.decompressed_len {
                Err(DzipError::SizeMismatch {
                    expected: plan.decompressed_len as u64,
                    got: out.len() as u64,
                    chunk_id: plan.id,
                })
            } else {
                Ok(())
            }
        });
    match result {
        Ok(()) => Ok(ChunkOutcome::Decoded(out)),
        Err(e) if keep_raw => {
            log::warn!("chunk {} failed to decompress ({e}); routing to sidecar", plan.id);
            Ok(ChunkOutcome::Sidecared(raw))
        }
        Err(e) => Err(e),
    }
}

fn build_config(parsed: &ParsedArchive, model: &Model) -> Result<Config> {
    let files = model
        .files
        .iter()
        .enumerate()
        .map(|(idx, f)| {
            let directory = model.directories[f.directory_index].clone();
            let filename = parsed.user_files[idx].clone();
            FileEntry {
                path: f.logical_path.clone(),
                directory,
                filename,
                chunks: f.chunk_refs.clone(),
            }
        })
        .collect();

    let chunks = model
        .chunks
        .iter()
        .map(|c| ChunkRecord {
            id: c.id,
            offset: c.offset,
            size_compressed: c.effective_compressed_len,
            size_decompressed: c.decompressed_len,
            flags: c.flags.decode_names().into_iter().map(String::from).collect(),
            archive_file_index: c.physical_volume,
        })
        .collect();

    Ok(Config {
        archive: ArchiveMeta {
            version: parsed.version,
            total_files: model.files.len() as u16,
            total_directories: model.directories.len() as u16,
            total_chunks: model.chunks.len() as u16,
        },
        archive_files: parsed.split_file_names.clone(),
        range_settings: parsed.range_settings.map(Into::into),
        files,
        chunks,
    })
}

/// Per-worker-thread cache of open volume readers, avoiding repeated
/// open/close syscalls for chunks sharing a volume.
#[derive(Default)]
struct ThreadLocalVolumes {
    open: HashMap<u16, Box<dyn ReadSeek>>,
}

impl ThreadLocalVolumes {
    fn open(&mut self, index: u16, source: &dyn UnpackSource) -> Result<&mut Box<dyn ReadSeek>> {
        if !self.open.contains_key(&index) {
            let reader = if index == 0 {
                source.open_base()?
            } else {
                source.open_volume(index)?
            };
            self.open.insert(index, reader);
        }
        Ok(self.open.get_mut(&index).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::create_default_registry;
    use crate::format::ChunkFlags;
    use crate::model::ChunkPlan;
    use std::io::Cursor;

    struct MemSource {
        base: Vec<u8>,
    }

    impl UnpackSource for MemSource {
        fn open_base(&self) -> Result<Box<dyn ReadSeek>> {
            Ok(Box::new(Cursor::new(self.base.clone())))
        }
        fn open_volume(&self, index: u16) -> Result<Box<dyn ReadSeek>> {
            Err(DzipError::VolumeMissing { index })
        }
        fn volume_len(&self, _index: u16) -> Result<u64> {
            Ok(self.base.len() as u64)
        }
    }

    fn combuf_plan(id: u16, offset: u32, decompressed_len: u32) -> ChunkPlan {
        ChunkPlan {
            id,
            physical_volume: 0,
            offset,
            raw_compressed_len: decompressed_len,
            effective_compressed_len: decompressed_len,
            decompressed_len,
            flags: ChunkFlags::COMBUF | ChunkFlags::COPYCOMP,
            consumers: Vec::new(),
            combuf_stream_offset: None,
        }
    }

    struct RecordingSink {
        finalized_with: std::sync::Mutex<Vec<FinalizeOutcome>>,
    }

    impl UnpackSink for RecordingSink {
        fn create_file(&self, _logical_path: &str) -> Result<Box<dyn Write + Send>> {
            Ok(Box::new(Vec::new()))
        }
        fn create_sidecar(&self, _logical_path: &str, _suffix: &str) -> Result<Box<dyn Write + Send>> {
            Ok(Box::new(Vec::new()))
        }
        fn finalize(&self, outcome: FinalizeOutcome) -> Result<()> {
            self.finalized_with.lock().unwrap().push(outcome);
            Ok(())
        }
    }

    /// Cancelling before any chunk is decoded surfaces `Cancelled` and the
    /// sink still observes exactly one `finalize(Aborted)` call, so it can
    /// decide whether to discard whatever partial output exists.
    #[test]
    fn cancellation_surfaces_error_and_finalizes_as_aborted() {
        let source = MemSource {
            base: b"AAAA".to_vec(),
        };
        let parsed = ParsedArchive {
            version: 0,
            user_files: vec!["a.txt".to_string()],
            directories: vec![String::new()],
            map_entries: vec![MapEntry {
                directory_index: 0,
                chunk_ids: vec![0],
            }],
            chunks: vec![crate::format::Chunk {
                offset: 0,
                compressed_length: 4,
                decompressed_length: 4,
                flags: ChunkFlags::COPYCOMP,
                file: 0,
            }],
            split_file_names: Vec::new(),
            range_settings: None,
        };
        let sink = RecordingSink {
            finalized_with: std::sync::Mutex::new(Vec::new()),
        };
        let registry = create_default_registry();
        let observer = crate::io::NoOpObserver;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = run(&parsed, &source, &sink, &registry, false, &observer, &cancel).unwrap_err();
        assert!(matches!(err, DzipError::Cancelled));
        assert_eq!(
            sink.finalized_with.into_inner().unwrap(),
            vec![FinalizeOutcome::Aborted]
        );
    }

    /// Two COMBUF chunks decode to "AAAA" and "BBBB"; concatenated and
    /// sliced at [2, 6) yields "AABB".
    #[test]
    fn combuf_chunks_concatenate_before_slicing() {
        let mut base = Vec::new();
        base.extend_from_slice(b"AAAA");
        base.extend_from_slice(b"BBBB");
        let source = MemSource { base };
        let registry = create_default_registry();
        let mut volumes = ThreadLocalVolumes::default();

        let plans = [combuf_plan(0, 0, 4), combuf_plan(1, 4, 4)];
        let mut stream = Vec::new();
        for plan in &plans {
            match decode_chunk(plan, &mut volumes, &source, &registry, false).unwrap() {
                ChunkOutcome::Decoded(bytes) => stream.extend_from_slice(&bytes),
                ChunkOutcome::Sidecared(_) => panic!("unexpected sidecar"),
            }
        }
        assert_eq!(stream, b"AAAABBBB");
        assert_eq!(&stream[2..6], b"AABB");
    }
}
