//! The parallel pack/unpack engines.
//!
//! Header parsing is sequential (the tables must be read in order and are
//! small); chunk compression/decompression is parallelized with `rayon`
//! since chunks are independent once the mapping is resolved.

pub mod pack;
pub mod unpack;

use std::collections::HashMap;

use crate::format::RangeSettings;

/// Directory/file/chunk tables as they come off the wire, before the mapping
/// resolution in `model::Model::from_parsed`.
pub struct ParsedArchive {
    pub version: u8,
    pub user_files: Vec<String>,
    pub directories: Vec<String>,
    pub map_entries: Vec<crate::model::MapEntry>,
    pub chunks: Vec<crate::format::Chunk>,
    pub split_file_names: Vec<String>,
    pub range_settings: Option<RangeSettings>,
}

/// Volume byte lengths keyed by physical volume index (0 = base file), used
/// by `Model::recompute_effective_lengths`.
pub fn collect_volume_lengths(
    source: &dyn crate::io::UnpackSource,
    num_volumes: u16,
) -> crate::Result<HashMap<u16, u64>> {
    let mut lengths = HashMap::new();
    for idx in 0..num_volumes {
        lengths.insert(idx, source.volume_len(idx)?);
    }
    Ok(lengths)
}
