//! Codec registry: flag bit -> {compress, decompress} pair.
//!
//! ZERO is intentionally not registered here: the pipeline synthesizes
//! `decompressed_length` zero bytes directly rather than routing through a
//! no-op codec. MP3/JPEG/DZ/RANDOMACCESS are opaque to this registry; a
//! lookup miss is how the pipeline detects `UnsupportedCodec`.

use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::format::ChunkFlags;
use crate::Result;

/// Decompresses a single chunk's payload. `decompressed_len` is the
/// authoritative expected output size from the chunk table.
pub trait Decompressor: Send + Sync {
    fn decompress(
        &self,
        input: &mut dyn Read,
        output: &mut dyn Write,
        decompressed_len: u32,
    ) -> Result<()>;
}

/// Compresses a single chunk's payload.
pub trait Compressor: Send + Sync {
    fn compress(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<()>;
}

#[derive(Clone, Default)]
pub struct CodecRegistry {
    decompressors: Vec<(ChunkFlags, Arc<dyn Decompressor>)>,
    compressors: Vec<(ChunkFlags, Arc<dyn Compressor>)>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_decompressor<D: Decompressor + 'static>(&mut self, flag: ChunkFlags, d: D) {
        self.decompressors.push((flag, Arc::new(d)));
    }

    pub fn register_compressor<C: Compressor + 'static>(&mut self, flag: ChunkFlags, c: C) {
        self.compressors.push((flag, Arc::new(c)));
    }

    /// Returns `None` (rather than erroring) when no decompressor is
    /// registered for `flags`, so the caller can apply the `keep_raw` policy.
    pub fn find_decompressor(&self, flags: ChunkFlags) -> Option<&Arc<dyn Decompressor>> {
        self.decompressors
            .iter()
            .find(|(mask, _)| flags.contains(*mask))
            .map(|(_, d)| d)
    }

    pub fn find_compressor(&self, flags: ChunkFlags) -> Option<&Arc<dyn Compressor>> {
        self.compressors
            .iter()
            .find(|(mask, _)| flags.contains(*mask))
            .map(|(_, c)| c)
    }
}

// --- Decompressors ---

struct ZlibDecompressor;
impl Decompressor for ZlibDecompressor {
    fn decompress(&self, input: &mut dyn Read, output: &mut dyn Write, _len: u32) -> Result<()> {
        let mut d = flate2::read::ZlibDecoder::new(input);
        io::copy(&mut d, output)?;
        Ok(())
    }
}

struct Bzip2Decompressor;
impl Decompressor for Bzip2Decompressor {
    fn decompress(&self, input: &mut dyn Read, output: &mut dyn Write, _len: u32) -> Result<()> {
        let mut d = bzip2::read::BzDecoder::new(input);
        io::copy(&mut d, output)?;
        Ok(())
    }
}

struct CopyCodec;
impl Decompressor for CopyCodec {
    fn decompress(&self, input: &mut dyn Read, output: &mut dyn Write, _len: u32) -> Result<()> {
        io::copy(input, output)?;
        Ok(())
    }
}
impl Compressor for CopyCodec {
    fn compress(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<()> {
        io::copy(input, output)?;
        Ok(())
    }
}

/// Legacy LZMA framing: 5-byte properties + 8-byte little-endian
/// decompressed size (`0xFFFF_FFFF_FFFF_FFFF` = unknown), then the raw LZMA
/// stream. `lzma-rust2`'s header mode writes/reads exactly this classic
/// `.lzma` framing.
struct LzmaDecompressor;
impl Decompressor for LzmaDecompressor {
    fn decompress(&self, input: &mut dyn Read, output: &mut dyn Write, _len: u32) -> Result<()> {
        let mut decoder = lzma_rust2::LzmaReader::new_mem_limit(input, u32::MAX, None)
            .map_err(|e| crate::error::DzipError::codec_failure(0, LzmaError(e.to_string())))?;
        io::copy(&mut decoder, output)?;
        Ok(())
    }
}

struct LzmaCompressor;
impl Compressor for LzmaCompressor {
    fn compress(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<()> {
        let mut raw = Vec::new();
        input.read_to_end(&mut raw)?;

        let options = lzma_rust2::LzmaOptions::with_preset(6);
        let mut encoder =
            lzma_rust2::LzmaWriter::new_use_header(output, &options, Some(raw.len() as u64))
                .map_err(|e| {
                    crate::error::DzipError::codec_failure(0, LzmaError(e.to_string()))
                })?;
        encoder.write_all(&raw)?;
        encoder
            .finish()
            .map_err(|e| crate::error::DzipError::codec_failure(0, LzmaError(e.to_string())))?;
        Ok(())
    }
}

#[derive(Debug)]
struct LzmaError(String);
impl std::fmt::Display for LzmaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for LzmaError {}

struct ZlibCompressor;
impl Compressor for ZlibCompressor {
    fn compress(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<()> {
        let mut e = flate2::write::ZlibEncoder::new(output, flate2::Compression::default());
        io::copy(input, &mut e)?;
        e.finish()?;
        Ok(())
    }
}

struct Bzip2Compressor;
impl Compressor for Bzip2Compressor {
    fn compress(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<()> {
        let mut e = bzip2::write::BzEncoder::new(output, bzip2::Compression::default());
        io::copy(input, &mut e)?;
        e.finish()?;
        Ok(())
    }
}

pub fn create_default_registry() -> CodecRegistry {
    let mut reg = CodecRegistry::new();

    reg.register_decompressor(ChunkFlags::ZLIB, ZlibDecompressor);
    reg.register_decompressor(ChunkFlags::BZIP, Bzip2Decompressor);
    reg.register_decompressor(ChunkFlags::LZMA, LzmaDecompressor);
    reg.register_decompressor(ChunkFlags::COPYCOMP, CopyCodec);

    reg.register_compressor(ChunkFlags::ZLIB, ZlibCompressor);
    reg.register_compressor(ChunkFlags::BZIP, Bzip2Compressor);
    reg.register_compressor(ChunkFlags::LZMA, LzmaCompressor);
    reg.register_compressor(ChunkFlags::COPYCOMP, CopyCodec);

    reg
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn zlib_roundtrip() {
        let reg = create_default_registry();
        let data = b"the quick brown fox jumps over the lazy dog, repeated. the quick brown fox.";
        let mut compressed = Cursor::new(Vec::new());
        reg.find_compressor(ChunkFlags::ZLIB)
            .unwrap()
            .compress(&mut Cursor::new(data), &mut compressed)
            .unwrap();

        let mut restored = Cursor::new(Vec::new());
        reg.find_decompressor(ChunkFlags::ZLIB)
            .unwrap()
            .decompress(
                &mut Cursor::new(compressed.into_inner()),
                &mut restored,
                data.len() as u32,
            )
            .unwrap();
        assert_eq!(restored.into_inner(), data);
    }

    #[test]
    fn bzip_roundtrip() {
        let reg = create_default_registry();
        let data = b"bzip2 roundtrip test data, bzip2 roundtrip test data.";
        let mut compressed = Cursor::new(Vec::new());
        reg.find_compressor(ChunkFlags::BZIP)
            .unwrap()
            .compress(&mut Cursor::new(data), &mut compressed)
            .unwrap();

        let mut restored = Cursor::new(Vec::new());
        reg.find_decompressor(ChunkFlags::BZIP)
            .unwrap()
            .decompress(
                &mut Cursor::new(compressed.into_inner()),
                &mut restored,
                data.len() as u32,
            )
            .unwrap();
        assert_eq!(restored.into_inner(), data);
    }

    #[test]
    fn copy_roundtrip() {
        let reg = create_default_registry();
        let data = b"store, no compression";
        let mut compressed = Cursor::new(Vec::new());
        reg.find_compressor(ChunkFlags::COPYCOMP)
            .unwrap()
            .compress(&mut Cursor::new(data), &mut compressed)
            .unwrap();
        assert_eq!(compressed.get_ref(), data);
    }

    #[test]
    fn unknown_flag_has_no_codec() {
        let reg = create_default_registry();
        assert!(reg.find_decompressor(ChunkFlags::MP3).is_none());
        assert!(reg.find_decompressor(ChunkFlags::JPEG).is_none());
        assert!(reg.find_decompressor(ChunkFlags::DZ).is_none());
    }
}
