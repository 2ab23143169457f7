//! Filesystem implementations of the I/O ports.
//!
//! Split-volume naming: the base file keeps its given extension (typically
//! `.dz`); continuation volumes are named `<stem>.d01`, `<stem>.d02`, ... by
//! zero-padding the 1-based index to two digits, matching the Marmalade
//! packer's convention.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::DzipError;
use crate::io::{PackSink, PackSource, ReadSeek, UnpackSink, UnpackSource};
use crate::path::to_native;
use crate::Result;

fn volume_path(base: &Path, index: u16) -> PathBuf {
    if index == 0 {
        return base.to_path_buf();
    }
    let stem = base.with_extension("");
    let ext = format!("d{index:02}");
    stem.with_extension(ext)
}

pub struct FsUnpackSource {
    base_path: PathBuf,
}

impl FsUnpackSource {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }
}

impl UnpackSource for FsUnpackSource {
    fn open_base(&self) -> Result<Box<dyn ReadSeek>> {
        self.open_volume(0)
    }

    fn open_volume(&self, index: u16) -> Result<Box<dyn ReadSeek>> {
        let path = volume_path(&self.base_path, index);
        let file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DzipError::VolumeMissing { index }
            } else {
                DzipError::Io(e)
            }
        })?;
        Ok(Box::new(file))
    }

    fn volume_len(&self, index: u16) -> Result<u64> {
        let path = volume_path(&self.base_path, index);
        let meta = fs::metadata(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DzipError::VolumeMissing { index }
            } else {
                DzipError::Io(e)
            }
        })?;
        Ok(meta.len())
    }
}

pub struct FsUnpackSink {
    out_dir: PathBuf,
}

impl FsUnpackSink {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }
}

impl UnpackSink for FsUnpackSink {
    fn create_file(&self, logical_path: &str) -> Result<Box<dyn Write + Send>> {
        let native = to_native(logical_path)?;
        let full = self.out_dir.join(native);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&full)?;
        Ok(Box::new(BufWriter::new(file)))
    }

    fn create_sidecar(&self, logical_path: &str, suffix: &str) -> Result<Box<dyn Write + Send>> {
        let native = to_native(logical_path)?;
        let mut full = self.out_dir.join(native).into_os_string();
        full.push(suffix);
        let full = PathBuf::from(full);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&full)?;
        Ok(Box::new(BufWriter::new(file)))
    }
}

pub struct FsPackSource {
    root_dir: PathBuf,
}

impl FsPackSource {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }
}

impl PackSource for FsPackSource {
    fn open_file(&self, logical_path: &str) -> Result<Box<dyn std::io::Read + Send>> {
        let native = to_native(logical_path)?;
        let full = self.root_dir.join(native);
        Ok(Box::new(File::open(full)?))
    }

    fn file_len(&self, logical_path: &str) -> Result<u64> {
        let native = to_native(logical_path)?;
        let full = self.root_dir.join(native);
        Ok(fs::metadata(full)?.len())
    }
}

pub struct FsPackSink {
    base_path: PathBuf,
}

impl FsPackSink {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }
}

impl PackSink for FsPackSink {
    fn create_base(&self) -> Result<Box<dyn Write + Send>> {
        self.create_volume(0)
    }

    fn create_volume(&self, index: u16) -> Result<Box<dyn Write + Send>> {
        let path = volume_path(&self.base_path, index);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Box::new(BufWriter::new(file)))
    }

    fn volume_name(&self, index: u16) -> Result<String> {
        let path = volume_path(&self.base_path, index);
        Ok(path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_path_zero_pads_index() {
        let base = PathBuf::from("/archives/resources.dz");
        assert_eq!(volume_path(&base, 0), base);
        assert_eq!(
            volume_path(&base, 1),
            PathBuf::from("/archives/resources.d01")
        );
        assert_eq!(
            volume_path(&base, 12),
            PathBuf::from("/archives/resources.d12")
        );
    }

    #[test]
    fn missing_volume_reports_volume_missing() {
        let source = FsUnpackSource::new("/nonexistent/path/that/should/not/exist.dz");
        let err = source.open_volume(3).unwrap_err();
        assert!(matches!(err, DzipError::VolumeMissing { index: 3 }));
    }

    #[test]
    fn volume_name_matches_split_suffix() {
        let sink = FsPackSink::new("/archives/resources.dz");
        assert_eq!(sink.volume_name(1).unwrap(), "resources.d01");
    }

    #[test]
    fn sidecar_path_appends_suffix_to_full_name() {
        let dir = std::env::temp_dir().join("dzip-sidecar-test");
        let sink = FsUnpackSink::new(&dir);
        let mut w = sink.create_sidecar("music/theme.mp3", ".raw").unwrap();
        w.write_all(b"raw bytes").unwrap();
        drop(w);
        let contents = fs::read(dir.join("music").join("theme.mp3.raw")).unwrap();
        assert_eq!(contents, b"raw bytes");
        let _ = fs::remove_dir_all(&dir);
    }
}
