//! Bit-exact read/write of the DZ on-disk layout: fixed little-endian
//! structs with no padding, field-by-field.

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{BufRead, Read, Write};

use crate::error::DzipError;
use crate::Result;

/// Maps an `UnexpectedEof` from a field read into `Truncated(field)`; any
/// other I/O error passes through as `DzipError::Io`. Every fixed-width
/// field read in this module goes through this so a table or record cut
/// short by EOF is reported as a format error, not a bare I/O error.
fn eof_as_truncated<T>(result: std::io::Result<T>, field: &'static str) -> Result<T> {
    result.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            DzipError::Truncated(field)
        } else {
            DzipError::Io(e)
        }
    })
}

pub const MAGIC: u32 = 0x5A52_5444; // 'DTRZ' little-endian
pub const CHUNK_LIST_TERMINATOR: u16 = 0xFFFF;
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
pub const CURRENT_VERSION: u8 = 0;

bitflags! {
    /// Chunk compression / hint bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct ChunkFlags: u16 {
        const COMBUF       = 0x001;
        const DZ           = 0x004;
        const ZLIB         = 0x008;
        const BZIP         = 0x010;
        const MP3          = 0x020;
        const JPEG         = 0x040;
        const ZERO         = 0x080;
        const COPYCOMP     = 0x100;
        const LZMA         = 0x200;
        const RANDOMACCESS = 0x400;
    }
}

impl ChunkFlags {
    const COMPRESSION_BITS: ChunkFlags = ChunkFlags::from_bits_truncate(
        ChunkFlags::DZ.bits()
            | ChunkFlags::ZLIB.bits()
            | ChunkFlags::BZIP.bits()
            | ChunkFlags::MP3.bits()
            | ChunkFlags::JPEG.bits()
            | ChunkFlags::ZERO.bits()
            | ChunkFlags::COPYCOMP.bits(),
    );

    /// At most one compression bit should be set on a well-formed chunk.
    /// LZMA is intentionally not in `COMPRESSION_BITS` here because its bit
    /// (0x200) is already disjoint from the others; it is still counted below.
    pub fn compression_bits(self) -> ChunkFlags {
        self & (ChunkFlags::COMPRESSION_BITS | ChunkFlags::LZMA)
    }

    pub fn has_single_compression_bit(self) -> bool {
        self.compression_bits().bits().count_ones() == 1
    }

    pub fn decode_names(self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.contains(ChunkFlags::COMBUF) {
            out.push("COMBUF");
        }
        if self.contains(ChunkFlags::DZ) {
            out.push("DZ");
        }
        if self.contains(ChunkFlags::ZLIB) {
            out.push("ZLIB");
        }
        if self.contains(ChunkFlags::BZIP) {
            out.push("BZIP");
        }
        if self.contains(ChunkFlags::MP3) {
            out.push("MP3");
        }
        if self.contains(ChunkFlags::JPEG) {
            out.push("JPEG");
        }
        if self.contains(ChunkFlags::ZERO) {
            out.push("ZERO");
        }
        if self.contains(ChunkFlags::COPYCOMP) {
            out.push("COPYCOMP");
        }
        if self.contains(ChunkFlags::LZMA) {
            out.push("LZMA");
        }
        if self.contains(ChunkFlags::RANDOMACCESS) {
            out.push("RANDOMACCESS");
        }
        out
    }

    pub fn encode_names(names: &[String]) -> ChunkFlags {
        let mut flags = ChunkFlags::empty();
        for n in names {
            flags |= match n.as_str() {
                "COMBUF" => ChunkFlags::COMBUF,
                "DZ" => ChunkFlags::DZ,
                "ZLIB" => ChunkFlags::ZLIB,
                "BZIP" => ChunkFlags::BZIP,
                "MP3" => ChunkFlags::MP3,
                "JPEG" => ChunkFlags::JPEG,
                "ZERO" => ChunkFlags::ZERO,
                "COPYCOMP" => ChunkFlags::COPYCOMP,
                "LZMA" => ChunkFlags::LZMA,
                "RANDOMACCESS" => ChunkFlags::RANDOMACCESS,
                _ => ChunkFlags::empty(),
            };
        }
        flags
    }
}

/// 9-byte fixed header.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveSettings {
    pub num_user_files: u16,
    pub num_directories: u16,
    pub version: u8,
}

/// 4-byte chunk settings block.
#[derive(Debug, Clone, Copy)]
pub struct ChunkSettings {
    pub num_archive_files: u16,
    pub num_chunks: u16,
}

/// 16-byte on-disk chunk table record.
#[derive(Debug, Clone, Copy)]
pub struct Chunk {
    pub offset: u32,
    pub compressed_length: u32,
    pub decompressed_length: u32,
    pub flags: ChunkFlags,
    pub file: u16,
}

/// The only per-decoder settings block with a defined layout (range coder).
/// Stored opaquely by the core; never decoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeSettings {
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

pub fn read_null_term_string<R: BufRead>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    let n = reader.read_until(0, &mut bytes)?;
    if n == 0 || bytes.last() != Some(&0) {
        return Err(DzipError::Truncated("null-terminated string"));
    }
    bytes.pop();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn write_null_term_string<W: Write>(writer: &mut W, s: &str) -> Result<()> {
    writer.write_all(s.as_bytes())?;
    writer.write_u8(0)?;
    Ok(())
}

pub fn read_archive_settings<R: Read>(reader: &mut R) -> Result<ArchiveSettings> {
    let magic = eof_as_truncated(reader.read_u32::<LittleEndian>(), "magic")?;
    if magic != MAGIC {
        return Err(DzipError::BadMagic(magic));
    }
    let num_user_files = eof_as_truncated(reader.read_u16::<LittleEndian>(), "num_user_files")?;
    let num_directories =
        eof_as_truncated(reader.read_u16::<LittleEndian>(), "num_directories")?;
    let version = eof_as_truncated(reader.read_u8(), "version")?;
    if version != CURRENT_VERSION {
        return Err(DzipError::UnsupportedVersion(version));
    }
    Ok(ArchiveSettings {
        num_user_files,
        num_directories,
        version,
    })
}

pub fn write_archive_settings<W: Write>(writer: &mut W, settings: &ArchiveSettings) -> Result<()> {
    writer.write_u32::<LittleEndian>(MAGIC)?;
    writer.write_u16::<LittleEndian>(settings.num_user_files)?;
    writer.write_u16::<LittleEndian>(settings.num_directories)?;
    writer.write_u8(settings.version)?;
    Ok(())
}

pub fn read_chunk_settings<R: Read>(reader: &mut R) -> Result<ChunkSettings> {
    Ok(ChunkSettings {
        num_archive_files: eof_as_truncated(
            reader.read_u16::<LittleEndian>(),
            "num_archive_files",
        )?,
        num_chunks: eof_as_truncated(reader.read_u16::<LittleEndian>(), "num_chunks")?,
    })
}

pub fn write_chunk_settings<W: Write>(writer: &mut W, settings: &ChunkSettings) -> Result<()> {
    writer.write_u16::<LittleEndian>(settings.num_archive_files)?;
    writer.write_u16::<LittleEndian>(settings.num_chunks)?;
    Ok(())
}

pub fn read_chunk<R: Read>(reader: &mut R, chunk_id: u16) -> Result<Chunk> {
    let offset = eof_as_truncated(reader.read_u32::<LittleEndian>(), "chunk.offset")?;
    let compressed_length = eof_as_truncated(
        reader.read_u32::<LittleEndian>(),
        "chunk.compressed_length",
    )?;
    let decompressed_length = eof_as_truncated(
        reader.read_u32::<LittleEndian>(),
        "chunk.decompressed_length",
    )?;
    let raw_flags = eof_as_truncated(reader.read_u16::<LittleEndian>(), "chunk.flags")?;
    let file = eof_as_truncated(reader.read_u16::<LittleEndian>(), "chunk.file")?;
    let flags = ChunkFlags::from_bits_truncate(raw_flags);
    if !flags.has_single_compression_bit() {
        return Err(DzipError::BadChunkFlags { chunk_id });
    }
    Ok(Chunk {
        offset,
        compressed_length,
        decompressed_length,
        flags,
        file,
    })
}

pub fn write_chunk<W: Write>(writer: &mut W, chunk: &Chunk) -> Result<()> {
    writer.write_u32::<LittleEndian>(chunk.offset)?;
    writer.write_u32::<LittleEndian>(chunk.compressed_length)?;
    writer.write_u32::<LittleEndian>(chunk.decompressed_length)?;
    writer.write_u16::<LittleEndian>(chunk.flags.bits())?;
    writer.write_u16::<LittleEndian>(chunk.file)?;
    Ok(())
}

pub fn read_range_settings<R: Read>(reader: &mut R) -> Result<RangeSettings> {
    Ok(RangeSettings {
        win_size: eof_as_truncated(reader.read_u8(), "range.win_size")?,
        flags: eof_as_truncated(reader.read_u8(), "range.flags")?,
        offset_table_size: eof_as_truncated(reader.read_u8(), "range.offset_table_size")?,
        offset_tables: eof_as_truncated(reader.read_u8(), "range.offset_tables")?,
        offset_contexts: eof_as_truncated(reader.read_u8(), "range.offset_contexts")?,
        ref_length_table_size: eof_as_truncated(reader.read_u8(), "range.ref_length_table_size")?,
        ref_length_tables: eof_as_truncated(reader.read_u8(), "range.ref_length_tables")?,
        ref_offset_table_size: eof_as_truncated(reader.read_u8(), "range.ref_offset_table_size")?,
        ref_offset_tables: eof_as_truncated(reader.read_u8(), "range.ref_offset_tables")?,
        big_min_match: eof_as_truncated(reader.read_u8(), "range.big_min_match")?,
    })
}

pub fn write_range_settings<W: Write>(writer: &mut W, settings: &RangeSettings) -> Result<()> {
    writer.write_u8(settings.win_size)?;
    writer.write_u8(settings.flags)?;
    writer.write_u8(settings.offset_table_size)?;
    writer.write_u8(settings.offset_tables)?;
    writer.write_u8(settings.offset_contexts)?;
    writer.write_u8(settings.ref_length_table_size)?;
    writer.write_u8(settings.ref_length_tables)?;
    writer.write_u8(settings.ref_offset_table_size)?;
    writer.write_u8(settings.ref_offset_tables)?;
    writer.write_u8(settings.big_min_match)?;
    Ok(())
}

/// Reads the `0xFFFF`-terminated chunk-id list for one user-file mapping
/// record, after its directory index has already been consumed.
pub fn read_chunk_ref_list<R: Read>(reader: &mut R) -> Result<Vec<u16>> {
    let mut ids = Vec::new();
    loop {
        let id = eof_as_truncated(reader.read_u16::<LittleEndian>(), "chunk_ref_list")?;
        if id == CHUNK_LIST_TERMINATOR {
            break;
        }
        ids.push(id);
    }
    Ok(ids)
}

pub fn write_chunk_ref_list<W: Write>(writer: &mut W, ids: &[u16]) -> Result<()> {
    for id in ids {
        writer.write_u16::<LittleEndian>(*id)?;
    }
    writer.write_u16::<LittleEndian>(CHUNK_LIST_TERMINATOR)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip_archive_settings() {
        let settings = ArchiveSettings {
            num_user_files: 3,
            num_directories: 1,
            version: 0,
        };
        let mut buf = Vec::new();
        write_archive_settings(&mut buf, &settings).unwrap();
        assert_eq!(buf.len(), 9);
        let parsed = read_archive_settings(&mut Cursor::new(buf)).unwrap();
        assert_eq!(parsed.num_user_files, 3);
        assert_eq!(parsed.num_directories, 1);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let buf = [0u8; 9];
        let err = read_archive_settings(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, DzipError::BadMagic(0)));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut buf = Vec::new();
        write_archive_settings(
            &mut buf,
            &ArchiveSettings {
                num_user_files: 1,
                num_directories: 1,
                version: 7,
            },
        )
        .unwrap();
        let err = read_archive_settings(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, DzipError::UnsupportedVersion(7)));
    }

    #[test]
    fn chunk_roundtrip() {
        let chunk = Chunk {
            offset: 9,
            compressed_length: 0xDEAD_BEEF,
            decompressed_length: 11,
            flags: ChunkFlags::ZLIB,
            file: 0,
        };
        let mut buf = Vec::new();
        write_chunk(&mut buf, &chunk).unwrap();
        assert_eq!(buf.len(), 16);
        let parsed = read_chunk(&mut Cursor::new(buf), 0).unwrap();
        assert_eq!(parsed.offset, 9);
        assert_eq!(parsed.decompressed_length, 11);
        assert_eq!(parsed.flags, ChunkFlags::ZLIB);
    }

    #[test]
    fn multiple_compression_bits_is_bad_flags() {
        let mut buf = Vec::new();
        write_chunk(
            &mut buf,
            &Chunk {
                offset: 0,
                compressed_length: 0,
                decompressed_length: 0,
                flags: ChunkFlags::ZLIB | ChunkFlags::BZIP,
                file: 0,
            },
        )
        .unwrap();
        let err = read_chunk(&mut Cursor::new(buf), 4).unwrap_err();
        assert!(matches!(err, DzipError::BadChunkFlags { chunk_id: 4 }));
    }

    #[test]
    fn null_term_string_roundtrip() {
        let mut buf = Vec::new();
        write_null_term_string(&mut buf, "hello").unwrap();
        assert_eq!(buf, b"hello\0");
        let mut cursor = Cursor::new(buf);
        let s = read_null_term_string(&mut cursor).unwrap();
        assert_eq!(s, "hello");
    }

    #[test]
    fn chunk_ref_list_roundtrip() {
        let mut buf = Vec::new();
        write_chunk_ref_list(&mut buf, &[3, 4, 5]).unwrap();
        let ids = read_chunk_ref_list(&mut Cursor::new(buf)).unwrap();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn null_term_string_without_terminator_is_truncated() {
        let mut cursor = Cursor::new(b"hello".to_vec());
        let err = read_null_term_string(&mut cursor).unwrap_err();
        assert!(matches!(err, DzipError::Truncated(_)));
    }

    #[test]
    fn archive_settings_cut_mid_field_is_truncated() {
        // Magic plus one byte of num_user_files: not enough for a u16.
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.push(0);
        let err = read_archive_settings(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, DzipError::Truncated(_)));
    }

    #[test]
    fn chunk_settings_cut_short_is_truncated() {
        let err = read_chunk_settings(&mut Cursor::new(vec![1, 0])).unwrap_err();
        assert!(matches!(err, DzipError::Truncated(_)));
    }

    #[test]
    fn chunk_cut_short_is_truncated() {
        let mut buf = Vec::new();
        write_chunk(
            &mut buf,
            &Chunk {
                offset: 1,
                compressed_length: 2,
                decompressed_length: 3,
                flags: ChunkFlags::ZLIB,
                file: 0,
            },
        )
        .unwrap();
        buf.truncate(buf.len() - 1);
        let err = read_chunk(&mut Cursor::new(buf), 0).unwrap_err();
        assert!(matches!(err, DzipError::Truncated(_)));
    }

    #[test]
    fn range_settings_cut_short_is_truncated() {
        let err = read_range_settings(&mut Cursor::new(vec![0u8; 5])).unwrap_err();
        assert!(matches!(err, DzipError::Truncated(_)));
    }

    #[test]
    fn chunk_ref_list_cut_mid_entry_is_truncated() {
        let err = read_chunk_ref_list(&mut Cursor::new(vec![3, 0, 4])).unwrap_err();
        assert!(matches!(err, DzipError::Truncated(_)));
    }
}
