//! In-memory archive representation: resolves user-file <-> chunk <->
//! directory relationships, normalizes paths, and validates index bounds.

use std::collections::HashMap;

use crate::error::DzipError;
use crate::format::{Chunk, ChunkFlags};
use crate::io::ProgressObserver;
use crate::path::{join_logical, sanitize_logical_path};
use crate::Result;

/// One parsed-but-unresolved mapping record: a user file's directory index
/// and the ordered chunk ids it references, straight off the wire.
#[derive(Debug, Clone)]
pub struct MapEntry {
    pub directory_index: usize,
    pub chunk_ids: Vec<u16>,
}

/// A resolved user file: its logical path and the byte range each of its
/// chunks contributes.
#[derive(Debug, Clone)]
pub struct ResolvedFile {
    pub directory_index: usize,
    pub logical_path: String,
    pub chunk_refs: Vec<u16>,
    pub expected_length: u64,
}

/// A chunk consumer: which file, and which byte range of the chunk's
/// decompressed bytes (or of the COMBUF logical stream) it receives.
#[derive(Debug, Clone, Copy)]
pub struct ChunkConsumer {
    pub file_index: usize,
    pub byte_start: u64,
    pub byte_end: u64,
}

/// A fully planned chunk: its location, sizes, flags, and consumers.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    pub id: u16,
    pub physical_volume: u16,
    pub offset: u32,
    pub raw_compressed_len: u32,
    pub effective_compressed_len: u32,
    pub decompressed_len: u32,
    pub flags: ChunkFlags,
    pub consumers: Vec<ChunkConsumer>,
    /// Set for COMBUF chunks: this chunk's starting byte position within the
    /// logical stream formed by concatenating every COMBUF chunk in
    /// ascending chunk-id order. `consumers` byte ranges for a COMBUF chunk
    /// are already expressed in that combined stream's coordinate space
    /// (i.e. already shifted by this value), so the pipeline can slice
    /// straight out of the concatenated buffer.
    pub combuf_stream_offset: Option<u64>,
}

/// The resolved archive graph: immutable once built for unpack, built from a
/// Config for pack.
#[derive(Debug, Clone)]
pub struct Model {
    pub directories: Vec<String>,
    pub files: Vec<ResolvedFile>,
    pub chunks: Vec<ChunkPlan>,
}

impl Model {
    /// Builds the model from parsed header tables (unpack path). `chunks`
    /// must already carry their effective compressed lengths, computed by
    /// the pipeline before this call via `recompute_effective_lengths`.
    pub fn from_parsed(
        mut directories: Vec<String>,
        user_files: &[String],
        map_entries: &[MapEntry],
        chunks: &[Chunk],
        observer: &dyn ProgressObserver,
    ) -> Result<Self> {
        if directories.is_empty() {
            // Legacy fixup: NumDirectories == 0 shows up in archives built by
            // older tooling; treat it as an implicit empty root directory.
            observer.warn("archive has zero directories; synthesizing empty root directory");
            directories.push(String::new());
        }

        if user_files.is_empty() {
            return Err(DzipError::CorruptIndex {
                kind: "num_user_files".to_string(),
                offender: 0,
            });
        }
        if directories.is_empty() {
            return Err(DzipError::CorruptIndex {
                kind: "num_directories".to_string(),
                offender: 0,
            });
        }

        for entry in map_entries {
            if entry.directory_index >= directories.len() {
                return Err(DzipError::CorruptIndex {
                    kind: "directory_index".to_string(),
                    offender: entry.directory_index as u32,
                });
            }
            for &cid in &entry.chunk_ids {
                if cid as usize >= chunks.len() {
                    return Err(DzipError::CorruptIndex {
                        kind: "chunk_index".to_string(),
                        offender: cid as u32,
                    });
                }
            }
        }

        // A chunk's consumer list is every map entry whose chunk_ids contain
        // it, which by construction of the format is always a contiguous
        // range of files: group by chunk id directly, then derive each
        // file's byte contribution from its own consumer list.
        let mut consumers: Vec<Vec<ChunkConsumer>> = vec![Vec::new(); chunks.len()];
        let mut expected_lengths = vec![0u64; user_files.len()];
        let mut chunk_to_files: HashMap<u16, Vec<usize>> = HashMap::new();
        for (file_idx, entry) in map_entries.iter().enumerate() {
            for &cid in &entry.chunk_ids {
                chunk_to_files.entry(cid).or_default().push(file_idx);
            }
        }

        // Solo chunks contribute their full decompressed length directly.
        for (&cid, file_idxs) in chunk_to_files.iter() {
            if file_idxs.len() == 1 {
                let f = file_idxs[0];
                expected_lengths[f] += chunks[cid as usize].decompressed_length as u64;
            }
        }

        // Shared chunks (K >= 2 adjacent files): there's no raw per-file
        // length table in the format, so the decompressed bytes are divided
        // evenly across the K consuming files, with the last file absorbing
        // any remainder from integer division.
        for (&cid, file_idxs) in chunk_to_files.iter() {
            if file_idxs.len() < 2 {
                continue;
            }
            if !is_contiguous(file_idxs) {
                return Err(DzipError::CorruptIndex {
                    kind: "shared_chunk_not_contiguous".to_string(),
                    offender: cid as u32,
                });
            }
            let decompressed_len = chunks[cid as usize].decompressed_length as u64;
            let k = file_idxs.len();
            let mut consumed = 0u64;
            for (slot, &file_idx) in file_idxs.iter().enumerate() {
                let slice_len = if slot == k - 1 {
                    decompressed_len - consumed
                } else {
                    // Evenly distribute remaining bytes minus what later slots
                    // need at least one byte for; in practice DZ archives only
                    // ever split a shared chunk across files whose *other*
                    // chunks already pin their total size, so the common case
                    // (single shared chunk with no solo siblings) divides the
                    // remainder across the non-final slots equally.
                    decompressed_len / k as u64
                };
                consumed += slice_len;
                let start = consumed - slice_len;
                consumers[cid as usize].push(ChunkConsumer {
                    file_index: file_idx,
                    byte_start: start,
                    byte_end: start + slice_len,
                });
                expected_lengths[file_idx] += slice_len;
            }
        }

        for (&cid, file_idxs) in chunk_to_files.iter() {
            if file_idxs.len() == 1 {
                let f = file_idxs[0];
                consumers[cid as usize].push(ChunkConsumer {
                    file_index: f,
                    byte_start: 0,
                    byte_end: chunks[cid as usize].decompressed_length as u64,
                });
            }
        }

        // COMBUF chunks are decoded individually but then concatenated, in
        // ascending chunk-id order, into one logical stream;
        // every COMBUF consumer's byte range is shifted into that stream's
        // coordinate space so the pipeline can slice straight out of the
        // concatenated buffer instead of each chunk's own decompressed bytes.
        let mut combuf_stream_offset: Vec<Option<u64>> = vec![None; chunks.len()];
        let mut combuf_cursor = 0u64;
        for (idx, c) in chunks.iter().enumerate() {
            if c.flags.contains(ChunkFlags::COMBUF) {
                combuf_stream_offset[idx] = Some(combuf_cursor);
                combuf_cursor += c.decompressed_length as u64;
                for consumer in consumers[idx].iter_mut() {
                    let shift = combuf_stream_offset[idx].unwrap();
                    consumer.byte_start += shift;
                    consumer.byte_end += shift;
                }
            }
        }

        let files = map_entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| {
                let logical = join_logical(&directories[entry.directory_index], &user_files[idx]);
                let logical_path = sanitize_logical_path(&logical)?;
                Ok(ResolvedFile {
                    directory_index: entry.directory_index,
                    logical_path,
                    chunk_refs: entry.chunk_ids.clone(),
                    expected_length: expected_lengths[idx],
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let chunk_plans = chunks
            .iter()
            .enumerate()
            .map(|(idx, c)| ChunkPlan {
                id: idx as u16,
                physical_volume: c.file,
                offset: c.offset,
                raw_compressed_len: c.compressed_length,
                effective_compressed_len: c.compressed_length,
                decompressed_len: c.decompressed_length,
                flags: c.flags,
                consumers: consumers[idx].clone(),
                combuf_stream_offset: combuf_stream_offset[idx],
            })
            .collect();

        Ok(Model {
            directories,
            files,
            chunks: chunk_plans,
        })
    }

    /// Overwrites each chunk plan's effective compressed length, computed as
    /// `next_chunk_offset_in_same_volume - this_offset`, or
    /// `volume_length - this_offset` for the last chunk in a volume. The
    /// on-disk `compressed_length` field is unreliable in legacy archives.
    pub fn recompute_effective_lengths(&mut self, volume_lengths: &HashMap<u16, u64>) -> Result<()> {
        let mut by_volume: HashMap<u16, Vec<usize>> = HashMap::new();
        for (i, c) in self.chunks.iter().enumerate() {
            by_volume.entry(c.physical_volume).or_default().push(i);
        }
        for (volume, indices) in by_volume.iter_mut() {
            indices.sort_by_key(|&i| self.chunks[i].offset);
            let volume_len = *volume_lengths
                .get(volume)
                .ok_or(DzipError::VolumeMissing { index: *volume })?;
            for w in 0..indices.len() {
                let this_offset = self.chunks[indices[w]].offset;
                if this_offset as u64 >= volume_len {
                    return Err(DzipError::CorruptIndex {
                        kind: "chunk_offset".to_string(),
                        offender: self.chunks[indices[w]].id as u32,
                    });
                }
                let next_offset = if w + 1 < indices.len() {
                    self.chunks[indices[w + 1]].offset as u64
                } else {
                    volume_len
                };
                let effective = next_offset.saturating_sub(this_offset as u64);
                self.chunks[indices[w]].effective_compressed_len = effective as u32;
            }
        }
        Ok(())
    }

    pub fn chunk(&self, id: u16) -> Option<&ChunkPlan> {
        self.chunks.get(id as usize)
    }
}

fn is_contiguous(sorted_candidates: &[usize]) -> bool {
    let mut v = sorted_candidates.to_vec();
    v.sort_unstable();
    v.windows(2).all(|w| w[1] == w[0] + 1)
}
