use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{BuildError, CpmError, Result};

/// One accepted source file: POSIX-relative path, decoded text, extension.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub relpath: String,
    pub absolute_path: PathBuf,
    pub ext: String,
    pub text: String,
}

/// Result of walking a source tree.
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Accepted files, sorted by byte-lexicographic POSIX path.
    pub files: Vec<SourceFile>,
    /// Extension frequency over accepted files.
    pub ext_counts: BTreeMap<String, usize>,
}

/// Extensions accepted by the scanner (code + text), case-insensitive.
const SUPPORTED_EXTENSIONS: &[&str] = &[
    // Documentation / markup
    "md", "txt", "rst", "xml", "html",
    // Data / configuration
    "yaml", "yml", "json", "toml", "ini",
    // Source code
    "rs", "py", "ts", "tsx", "js", "jsx", "go", "java", "c", "h", "cpp", "hpp", "cs", "rb", "sh",
    "sql",
];

/// Fraction of replacement characters above which a lossy decode is treated
/// as a binary file and skipped.
const MAX_REPLACEMENT_RATIO: f64 = 0.05;

/// Walk the source tree and collect every supported text file.
///
/// Files that fail to decode as UTF-8 after a permissive fallback are
/// skipped, as are empty files. The result ordering is deterministic:
/// byte-lexicographic over the POSIX-relative path, so downstream hashes
/// never depend on directory iteration order.
pub fn scan(root: &Path) -> Result<ScanResult> {
    if !root.exists() {
        return Err(CpmError::Build(BuildError::SourceMissing(root.to_path_buf())));
    }

    let mut result = ScanResult::default();

    for entry in WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_lowercase();
        if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }

        let text = match decode_permissive(path)? {
            Some(text) => text,
            None => {
                log::debug!("skipping undecodable file: {}", path.display());
                continue;
            }
        };
        if text.trim().is_empty() {
            continue;
        }

        let relpath = posix_relpath(root, path)?;

        *result.ext_counts.entry(ext.clone()).or_insert(0) += 1;
        result.files.push(SourceFile {
            relpath,
            absolute_path: path.to_path_buf(),
            ext,
            text,
        });
    }

    if result.files.is_empty() {
        return Err(CpmError::Build(BuildError::NoInputs));
    }

    result.files.sort_by(|a, b| a.relpath.as_bytes().cmp(b.relpath.as_bytes()));
    log::info!("scanned {} files under {}", result.files.len(), root.display());
    Ok(result)
}

/// Decode file bytes as UTF-8, tolerating isolated invalid sequences.
/// Returns None when the content looks binary (NUL bytes, or too many
/// replacement characters after the lossy pass).
fn decode_permissive(path: &Path) -> Result<Option<String>> {
    let bytes = std::fs::read(path)?;
    if bytes.contains(&0) {
        return Ok(None);
    }
    match String::from_utf8(bytes) {
        Ok(text) => Ok(Some(text)),
        Err(err) => {
            let bytes = err.into_bytes();
            let lossy = String::from_utf8_lossy(&bytes);
            let total = lossy.chars().count().max(1);
            let replaced = lossy.chars().filter(|c| *c == '\u{FFFD}').count();
            if (replaced as f64) / (total as f64) > MAX_REPLACEMENT_RATIO {
                Ok(None)
            } else {
                Ok(Some(lossy.into_owned()))
            }
        }
    }
}

/// Relative path with forward slashes regardless of platform.
fn posix_relpath(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        CpmError::Config(format!("failed to compute relative path for: {}", path.display()))
    })?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}
