//! Flat inner-product nearest-neighbor index.
//!
//! Scores are inner products over L2-normalized vectors (equivalent to
//! cosine). The on-disk format is reproducible: identical input produces
//! identical bytes, so index files participate in checksums like any other
//! packet artifact.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::error::{BuildError, CpmError, Result};

/// File magic for the flat index format.
const MAGIC: &[u8; 8] = b"CPMFIP1\0";

/// One search hit: the matrix row, its chunk id, and the inner-product score.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub row: usize,
    pub id: String,
    pub score: f32,
}

/// Flat inner-product index over a fixed row ordering.
#[derive(Debug, Clone)]
pub struct FlatIpIndex {
    dim: u32,
    ids: Vec<String>,
    /// Row-major `n x dim` matrix.
    data: Vec<f32>,
}

impl FlatIpIndex {
    /// Build an index over `rows`, one id per row.
    pub fn build(dim: u32, rows: &[Vec<f32>], ids: Vec<String>) -> Result<Self> {
        if rows.len() != ids.len() {
            return Err(CpmError::Retrieval(format!(
                "index row/id count mismatch: {} rows, {} ids",
                rows.len(),
                ids.len()
            )));
        }
        let mut data = Vec::with_capacity(rows.len() * dim as usize);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != dim as usize {
                return Err(CpmError::Build(BuildError::DimMismatch {
                    expected: dim,
                    actual: row.len() as u32,
                }));
            }
            if row.iter().any(|x| !x.is_finite()) {
                return Err(CpmError::Build(BuildError::NonFiniteVector { row: i }));
            }
            data.extend_from_slice(row);
        }
        Ok(Self { dim, ids, data })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn dim(&self) -> u32 {
        self.dim
    }

    /// Top-k rows by inner product, descending score. Equal scores are
    /// ordered by ascending chunk id so results are deterministic.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Hit>> {
        if query.len() != self.dim as usize {
            return Err(CpmError::Retrieval(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                self.dim
            )));
        }

        let dim = self.dim as usize;
        let mut hits: Vec<Hit> = self
            .ids
            .iter()
            .enumerate()
            .map(|(row, id)| {
                let base = row * dim;
                let score: f32 = self.data[base..base + dim]
                    .iter()
                    .zip(query.iter())
                    .map(|(x, y)| x * y)
                    .sum();
                Hit {
                    row,
                    id: id.clone(),
                    score,
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Persist the index. Layout: magic, dim (u32 LE), row count (u64 LE),
    /// the f32 LE matrix, then length-prefixed ids. Identical input yields
    /// identical bytes.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&self.dim.to_le_bytes());
        buf.extend_from_slice(&(self.ids.len() as u64).to_le_bytes());
        for value in &self.data {
            buf.extend_from_slice(&value.to_le_bytes());
        }
        for id in &self.ids {
            buf.extend_from_slice(&(id.len() as u32).to_le_bytes());
            buf.extend_from_slice(id.as_bytes());
        }
        let mut file = File::create(path)?;
        file.write_all(&buf)?;
        file.flush()?;
        Ok(())
    }

    /// Load an index previously written by [`FlatIpIndex::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let mut cursor = 0usize;
        let magic = take(&buf, &mut cursor, 8, path)?;
        if magic != MAGIC {
            return Err(CpmError::Parse(format!(
                "not a flat index file: {}",
                path.display()
            )));
        }
        let dim = u32::from_le_bytes(take(&buf, &mut cursor, 4, path)?.try_into().unwrap_or([0; 4]));
        let n =
            u64::from_le_bytes(take(&buf, &mut cursor, 8, path)?.try_into().unwrap_or([0; 8])) as usize;

        let mut data = Vec::with_capacity(n * dim as usize);
        for _ in 0..n * dim as usize {
            let bytes = take(&buf, &mut cursor, 4, path)?;
            data.push(f32::from_le_bytes(bytes.try_into().unwrap_or([0; 4])));
        }

        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            let len = u32::from_le_bytes(take(&buf, &mut cursor, 4, path)?.try_into().unwrap_or([0; 4]))
                as usize;
            let raw = take(&buf, &mut cursor, len, path)?;
            let id = std::str::from_utf8(raw)
                .map_err(|e| CpmError::Parse(format!("invalid id in index file: {}", e)))?
                .to_string();
            ids.push(id);
        }

        Ok(Self { dim, ids, data })
    }
}

/// Read `n` bytes at `cursor`, advancing it; errors on truncation.
fn take<'a>(buf: &'a [u8], cursor: &mut usize, n: usize, path: &Path) -> Result<&'a [u8]> {
    let end = cursor.checked_add(n).ok_or_else(|| {
        CpmError::Parse(format!("corrupt index file: {}", path.display()))
    })?;
    let slice = buf
        .get(*cursor..end)
        .ok_or_else(|| CpmError::Parse(format!("truncated index file: {}", path.display())))?;
    *cursor = end;
    Ok(slice)
}
