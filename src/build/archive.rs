//! Packet archiving: wrap a finished packet directory into `.tar.gz` or
//! `.zip` next to the directory itself.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::error::{CpmError, Result};

/// Supported archive formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

impl ArchiveFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tar.gz" => Some(ArchiveFormat::TarGz),
            "zip" => Some(ArchiveFormat::Zip),
            _ => None,
        }
    }

    fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::Zip => "zip",
        }
    }
}

/// Archive the packet directory. Entries are added in sorted path order so
/// the archive contents are deterministic for identical input trees.
pub fn archive_packet(packet_dir: &Path, format: ArchiveFormat) -> Result<PathBuf> {
    let dir_name = packet_dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CpmError::Storage(format!("bad packet dir: {}", packet_dir.display())))?;
    let out_path = packet_dir.with_file_name(format!("{}.{}", dir_name, format.extension()));

    let entries = sorted_files(packet_dir)?;
    match format {
        ArchiveFormat::TarGz => write_tar_gz(packet_dir, dir_name, &entries, &out_path)?,
        ArchiveFormat::Zip => write_zip(packet_dir, dir_name, &entries, &out_path)?,
    }

    log::info!("archived packet to {}", out_path.display());
    Ok(out_path)
}

/// Relative file paths under `dir`, sorted byte-lexicographically.
fn sorted_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if entry.path().is_file() {
            let rel = entry
                .path()
                .strip_prefix(dir)
                .map_err(|_| CpmError::Storage("walk escaped packet dir".to_string()))?
                .to_path_buf();
            files.push(rel);
        }
    }
    files.sort();
    Ok(files)
}

fn write_tar_gz(dir: &Path, dir_name: &str, entries: &[PathBuf], out: &Path) -> Result<()> {
    let file = File::create(out)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for rel in entries {
        let mut f = File::open(dir.join(rel))?;
        let archive_path = Path::new(dir_name).join(rel);
        builder.append_file(&archive_path, &mut f)?;
    }
    let encoder = builder
        .into_inner()
        .map_err(|e| CpmError::Storage(format!("tar finalize failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| CpmError::Storage(format!("gzip finalize failed: {}", e)))?;
    Ok(())
}

fn write_zip(dir: &Path, dir_name: &str, entries: &[PathBuf], out: &Path) -> Result<()> {
    let file = File::create(out)?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    for rel in entries {
        let name = format!("{}/{}", dir_name, posix(rel));
        writer
            .start_file(name, options)
            .map_err(|e| CpmError::Storage(format!("zip entry failed: {}", e)))?;
        let mut f = File::open(dir.join(rel))?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        writer.write_all(&buf)?;
    }
    writer
        .finish()
        .map_err(|e| CpmError::Storage(format!("zip finalize failed: {}", e)))?;
    Ok(())
}

fn posix(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
