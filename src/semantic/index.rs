//! In-memory vector index with inner-product search.
//!
//! Rows are kept L2-normalised in one row-major buffer, index-aligned with
//! the identifier list. The row position is the only link between a vector
//! and its identifier.

use std::collections::HashSet;

use rayon::prelude::*;

/// Dense, append-only similarity index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorIndex {
    /// Row width. Zero until the first row is added.
    dimensions: usize,
    /// Row-major, unit-length rows.
    vectors: Vec<f32>,
    /// Relative image paths, one per row.
    ids: Vec<String>,
}

/// Search result from the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Identifier (relative image path)
    pub id: String,
    /// Cosine similarity score (-1.0 to 1.0)
    pub score: f32,
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot index degenerate vector for '{0}' (zero norm or non-finite)")]
    DegenerateVector(String),

    #[error("Cannot search with a zero-norm query")]
    ZeroNormQuery,

    #[error("Length mismatch: {vectors} vectors for {ids} identifiers")]
    LengthMismatch { vectors: usize, ids: usize },
}

impl VectorIndex {
    /// Create a new empty vector index with specified dimensions.
    ///
    /// Zero leaves the width open; it is fixed by the first appended row.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            vectors: Vec::new(),
            ids: Vec::new(),
        }
    }

    /// Rebuild an index from persisted parts.
    ///
    /// Rows are trusted to be normalised already; only the shape is checked.
    pub fn from_parts(
        dimensions: usize,
        vectors: Vec<f32>,
        ids: Vec<String>,
    ) -> Result<Self, IndexError> {
        let rows = if dimensions == 0 {
            0
        } else {
            vectors.len() / dimensions
        };
        if rows * dimensions != vectors.len() || rows != ids.len() {
            return Err(IndexError::LengthMismatch {
                vectors: rows,
                ids: ids.len(),
            });
        }

        Ok(Self {
            dimensions,
            vectors,
            ids,
        })
    }

    /// Get the embedding dimensions (zero while uninitialised).
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Get the number of entries in the index.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Check if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Identifiers in insertion order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Raw row-major vector payload.
    pub fn vectors(&self) -> &[f32] {
        &self.vectors
    }

    /// Get the stored (normalised) vector at `position`.
    pub fn row(&self, position: usize) -> Option<&[f32]> {
        if position >= self.len() {
            return None;
        }
        let start = position * self.dimensions;
        Some(&self.vectors[start..start + self.dimensions])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|known| known == id)
    }

    /// Append a batch of entries.
    ///
    /// The whole batch is validated before anything is written, so either
    /// every new entry lands or the index is left untouched. Identifiers that
    /// are already present (or repeated inside the batch) are skipped.
    ///
    /// Returns the number of rows actually added.
    pub fn extend(&mut self, entries: Vec<(String, Vec<f32>)>) -> Result<usize, IndexError> {
        let mut dimensions = self.dimensions;
        let mut seen: HashSet<&str> = self.ids.iter().map(String::as_str).collect();
        let mut accepted = Vec::with_capacity(entries.len());

        for (id, vector) in &entries {
            if dimensions == 0 {
                dimensions = vector.len();
            }
            if vector.len() != dimensions || dimensions == 0 {
                return Err(IndexError::DimensionMismatch {
                    expected: dimensions,
                    got: vector.len(),
                });
            }

            if !seen.insert(id.as_str()) {
                log::debug!("skipping duplicate identifier '{id}'");
                continue;
            }

            let normalized =
                l2_normalize(vector).ok_or_else(|| IndexError::DegenerateVector(id.clone()))?;

            accepted.push((id.clone(), normalized));
        }

        let added = accepted.len();
        if added == 0 {
            return Ok(0);
        }

        self.dimensions = dimensions;
        self.vectors.reserve(added * dimensions);
        self.ids.reserve(added);
        for (id, normalized) in accepted {
            self.vectors.extend_from_slice(&normalized);
            self.ids.push(id);
        }

        Ok(added)
    }

    /// Search for the `k` rows most similar to `query`.
    ///
    /// # Arguments
    /// * `query` - The query embedding vector (normalised here)
    /// * `k` - Maximum number of results to return
    /// * `threshold` - Minimum similarity score
    ///
    /// # Returns
    /// Results sorted by similarity score (highest first). Equal scores keep
    /// insertion order.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<SearchHit>, IndexError> {
        if self.is_empty() || k == 0 {
            return Ok(vec![]);
        }

        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        let query = l2_normalize(query).ok_or(IndexError::ZeroNormQuery)?;

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .par_chunks_exact(self.dimensions)
            .enumerate()
            .map(|(position, row)| (position, dot(row, &query)))
            .filter(|(_, score)| *score >= threshold)
            .collect();

        // stable: ties stay in row order
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(position, score)| SearchHit {
                id: self.ids[position].clone(),
                score,
            })
            .collect())
    }
}

/// Scale `v` to unit length. `None` for zero-norm or non-finite input.
pub fn l2_normalize(v: &[f32]) -> Option<Vec<f32>> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if !norm.is_finite() || norm < f32::EPSILON {
        return None;
    }
    Some(v.iter().map(|x| x / norm).collect())
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
