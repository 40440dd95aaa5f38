//! vectors.f16.bin I/O: row-major little-endian float16,
//! `n_chunks x dim x 2` bytes, no header.

use half::f16;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::error::{CpmError, Result};

/// L2-normalize each row in place. Zero rows are preserved verbatim.
pub fn l2_normalize_rows(rows: &mut [Vec<f32>]) {
    for row in rows.iter_mut() {
        let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in row.iter_mut() {
                *x /= norm;
            }
        }
    }
}

/// Index of the first row containing NaN or Inf, if any.
pub fn find_non_finite(rows: &[Vec<f32>]) -> Option<usize> {
    rows.iter()
        .position(|row| row.iter().any(|x| !x.is_finite()))
}

/// Whether every non-zero row has L2 norm within `eps` of 1.0.
pub fn norms_within(rows: &[Vec<f32>], eps: f32) -> bool {
    rows.iter().all(|row| {
        let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
        norm == 0.0 || (norm - 1.0).abs() <= eps
    })
}

/// Write the matrix as row-major little-endian f16.
pub fn write_f16(path: &Path, rows: &[Vec<f32>]) -> Result<()> {
    let mut buf = Vec::with_capacity(rows.iter().map(|r| r.len() * 2).sum());
    for row in rows {
        for &value in row {
            buf.extend_from_slice(&f16::from_f32(value).to_le_bytes());
        }
    }
    let mut file = File::create(path)?;
    file.write_all(&buf)?;
    file.flush()?;
    Ok(())
}

/// Read an f16 matrix back as f32 rows of width `dim`.
pub fn read_f16(path: &Path, dim: u32) -> Result<Vec<Vec<f32>>> {
    let mut file = File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let row_bytes = dim as usize * 2;
    if row_bytes == 0 {
        return Err(CpmError::Parse("vector dimension is zero".to_string()));
    }
    if buf.len() % row_bytes != 0 {
        return Err(CpmError::Parse(format!(
            "vectors file length {} is not a multiple of row size {} (dim {})",
            buf.len(),
            row_bytes,
            dim
        )));
    }

    let mut rows = Vec::with_capacity(buf.len() / row_bytes);
    for row_bytes_chunk in buf.chunks(row_bytes) {
        let row: Vec<f32> = row_bytes_chunk
            .chunks(2)
            .map(|pair| f16::from_le_bytes([pair[0], pair[1]]).to_f32())
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

/// Expected file size for an `n x dim` matrix.
pub fn expected_len(n: usize, dim: u32) -> u64 {
    (n as u64) * (dim as u64) * 2
}
