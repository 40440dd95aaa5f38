//! docs.jsonl I/O: one chunk per line, LF terminators, stable key order.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{CpmError, Result};
use crate::packet::types::DocChunk;

/// Write chunks to `docs.jsonl`, one JSON object per line.
///
/// Line `i` corresponds to vector row `i`; the caller must keep the chunk
/// order aligned with the matrix it persists next.
pub fn write_chunks(path: &Path, chunks: &[DocChunk]) -> Result<()> {
    let mut file = File::create(path)?;
    for chunk in chunks {
        let line = serde_json::to_string(chunk)
            .map_err(|e| CpmError::Parse(format!("failed to serialize chunk {}: {}", chunk.id, e)))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
    }
    file.flush()?;
    Ok(())
}

/// Read every chunk from `docs.jsonl` in line order.
pub fn read_chunks(path: &Path) -> Result<Vec<DocChunk>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut chunks = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let chunk: DocChunk = serde_json::from_str(&line).map_err(|e| {
            CpmError::Parse(format!("docs.jsonl line {}: {}", line_no + 1, e))
        })?;
        chunks.push(chunk);
    }
    Ok(chunks)
}

/// Byte-offset table over `docs.jsonl`, so single chunks can be loaded by
/// row index without deserializing the whole file. Built once per query
/// session against a materialized packet.
#[derive(Debug)]
pub struct DocOffsets {
    offsets: Vec<u64>,
}

impl DocOffsets {
    /// Scan the file once and record the byte offset of each line.
    pub fn build(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut offsets = Vec::new();
        let mut pos: u64 = 0;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf)?;
            if read == 0 {
                break;
            }
            // Skip blank lines but keep offsets aligned to real chunk rows.
            if buf.iter().any(|b| !b.is_ascii_whitespace()) {
                offsets.push(pos);
            }
            pos += read as u64;
        }
        Ok(Self { offsets })
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Load the chunk at row `row` by seeking to its byte offset.
    pub fn load(&self, path: &Path, row: usize) -> Result<DocChunk> {
        let offset = *self.offsets.get(row).ok_or_else(|| {
            CpmError::Retrieval(format!(
                "chunk row {} out of range ({} rows)",
                row,
                self.offsets.len()
            ))
        })?;
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::new(file);
        let mut line = String::new();
        reader.read_line(&mut line)?;
        serde_json::from_str(&line)
            .map_err(|e| CpmError::Parse(format!("docs.jsonl row {}: {}", row, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::sha256_hex;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn make_chunk(id: &str, text: &str) -> DocChunk {
        let mut metadata = BTreeMap::new();
        metadata.insert("path".to_string(), serde_json::json!("a.md"));
        metadata.insert("ext".to_string(), serde_json::json!("md"));
        DocChunk {
            id: id.to_string(),
            text: text.to_string(),
            hash: sha256_hex(text.as_bytes()),
            metadata,
        }
    }

    #[test]
    fn test_write_read_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("docs.jsonl");
        let chunks = vec![make_chunk("a.md:0", "alpha"), make_chunk("a.md:1", "beta")];

        write_chunks(&path, &chunks).unwrap();
        let back = read_chunks(&path).unwrap();
        assert_eq!(back, chunks);
    }

    #[test]
    fn test_lf_terminators_and_determinism() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("docs.jsonl");
        let chunks = vec![make_chunk("a.md:0", "alpha")];

        write_chunks(&path, &chunks).unwrap();
        let bytes1 = std::fs::read(&path).unwrap();
        assert_eq!(bytes1.last(), Some(&b'\n'));
        assert!(!bytes1.windows(2).any(|w| w == b"\r\n"));

        // Byte-identical on rewrite
        write_chunks(&path, &chunks).unwrap();
        let bytes2 = std::fs::read(&path).unwrap();
        assert_eq!(bytes1, bytes2);
    }

    #[test]
    fn test_offsets_random_access() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("docs.jsonl");
        let chunks: Vec<DocChunk> = (0..5)
            .map(|i| make_chunk(&format!("a.md:{}", i), &format!("text number {}", i)))
            .collect();
        write_chunks(&path, &chunks).unwrap();

        let offsets = DocOffsets::build(&path).unwrap();
        assert_eq!(offsets.len(), 5);

        // Out-of-order loads return the right rows
        assert_eq!(offsets.load(&path, 3).unwrap(), chunks[3]);
        assert_eq!(offsets.load(&path, 0).unwrap(), chunks[0]);
        assert_eq!(offsets.load(&path, 4).unwrap(), chunks[4]);
    }

    #[test]
    fn test_offsets_out_of_range() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("docs.jsonl");
        write_chunks(&path, &[make_chunk("a.md:0", "only")]).unwrap();

        let offsets = DocOffsets::build(&path).unwrap();
        assert!(offsets.load(&path, 1).is_err());
    }

    #[test]
    fn test_empty_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("docs.jsonl");
        write_chunks(&path, &[]).unwrap();
        assert!(read_chunks(&path).unwrap().is_empty());
        assert!(DocOffsets::build(&path).unwrap().is_empty());
    }
}
