//! The pack-side configuration document. Pure data: `serde` derives only, no
//! TOML/JSON calls here — encoding is a concern of the surrounding tool
//! (`dzip-cli`), not the core.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub archive: ArchiveMeta,
    pub archive_files: Vec<String>,
    pub range_settings: Option<RangeSettingsDoc>,
    pub files: Vec<FileEntry>,
    pub chunks: Vec<ChunkRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveMeta {
    pub version: u8,
    pub total_files: u16,
    pub total_directories: u16,
    pub total_chunks: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub directory: String,
    pub filename: String,
    pub chunks: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: u16,
    pub offset: u32,
    pub size_compressed: u32,
    pub size_decompressed: u32,
    pub flags: Vec<String>,
    pub archive_file_index: u16,
}

/// Opaque range-coder settings, round-tripped as-is.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RangeSettingsDoc {
    pub win_size: u8,
    pub flags: u8,
    pub offset_table_size: u8,
    pub offset_tables: u8,
    pub offset_contexts: u8,
    pub ref_length_table_size: u8,
    pub ref_length_tables: u8,
    pub ref_offset_table_size: u8,
    pub ref_offset_tables: u8,
    pub big_min_match: u8,
}

impl From<crate::format::RangeSettings> for RangeSettingsDoc {
    fn from(r: crate::format::RangeSettings) -> Self {
        RangeSettingsDoc {
            win_size: r.win_size,
            flags: r.flags,
            offset_table_size: r.offset_table_size,
            offset_tables: r.offset_tables,
            offset_contexts: r.offset_contexts,
            ref_length_table_size: r.ref_length_table_size,
            ref_length_tables: r.ref_length_tables,
            ref_offset_table_size: r.ref_offset_table_size,
            ref_offset_tables: r.ref_offset_tables,
            big_min_match: r.big_min_match,
        }
    }
}

impl From<RangeSettingsDoc> for crate::format::RangeSettings {
    fn from(r: RangeSettingsDoc) -> Self {
        crate::format::RangeSettings {
            win_size: r.win_size,
            flags: r.flags,
            offset_table_size: r.offset_table_size,
            offset_tables: r.offset_tables,
            offset_contexts: r.offset_contexts,
            ref_length_table_size: r.ref_length_table_size,
            ref_length_tables: r.ref_length_tables,
            ref_offset_table_size: r.ref_offset_table_size,
            ref_offset_tables: r.ref_offset_tables,
            big_min_match: r.big_min_match,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::RangeSettings;

    #[test]
    fn range_settings_doc_roundtrips_through_format_type() {
        let original = RangeSettings {
            win_size: 10,
            flags: 1,
            offset_table_size: 2,
            offset_tables: 3,
            offset_contexts: 4,
            ref_length_table_size: 5,
            ref_length_tables: 6,
            ref_offset_table_size: 7,
            ref_offset_tables: 8,
            big_min_match: 9,
        };
        let doc: RangeSettingsDoc = original.into();
        let back: RangeSettings = doc.into();
        assert_eq!(back.win_size, 10);
        assert_eq!(back.big_min_match, 9);
    }
}
