//! Object-name × region similarity scoring.

use async_trait::async_trait;
use nalgebra::{DMatrix, DVector};
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::facts::{ImageData, ObservedRegion, TaskObject};

/// Default natural-language query built around each object name.
pub const DEFAULT_QUERY_TEMPLATE: &str = "Pick up the {name}";

/// Scores how well a text query describes an image. Expected range is `[-1, 1]`.
#[async_trait]
pub trait MatchScorer: Send + Sync {
    async fn match_score(&self, text: &str, image: &ImageData) -> Result<f32>;
}

/// A joint text/image embedding model.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>>;
    async fn embed_image(&self, image: &ImageData) -> Result<Vec<f32>>;
}

/// [`MatchScorer`] over an [`Embedder`]: both embeddings are unit-normalised and the dot
/// product is the similarity.
pub struct EmbeddingScorer<E> {
    embedder: E,
}

impl<E: Embedder> EmbeddingScorer<E> {
    pub fn new(embedder: E) -> Self {
        Self { embedder }
    }
}

fn unit(values: Vec<f32>) -> DVector<f32> {
    let v = DVector::from_vec(values);
    let norm = v.norm();
    if norm > 0.0 {
        v / norm
    } else {
        v
    }
}

#[async_trait]
impl<E: Embedder> MatchScorer for EmbeddingScorer<E> {
    async fn match_score(&self, text: &str, image: &ImageData) -> Result<f32> {
        let text_emb = unit(self.embedder.embed_text(text).await?);
        let image_emb = unit(self.embedder.embed_image(image).await?);
        if text_emb.len() != image_emb.len() {
            return Err(CoreError::collaborator(
                "embedding",
                format!(
                    "text embedding has {} dims, image embedding has {}",
                    text_emb.len(),
                    image_emb.len()
                ),
            ));
        }
        Ok(text_emb.dot(&image_emb))
    }
}

/// N×M similarity scores, rows are task objects and columns are regions.
///
/// Every stored value is finite.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityMatrix {
    scores: DMatrix<f32>,
}

impl SimilarityMatrix {
    pub fn zeros(objects: usize, regions: usize) -> Self {
        Self {
            scores: DMatrix::zeros(objects, regions),
        }
    }

    /// Builds a matrix from row slices; ragged rows are padded with zeros.
    pub fn from_rows(rows: &[Vec<f32>]) -> Self {
        let n = rows.len();
        let m = rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut matrix = Self::zeros(n, m);
        for (i, row) in rows.iter().enumerate() {
            for (j, &value) in row.iter().enumerate() {
                matrix.set(i, j, value);
            }
        }
        matrix
    }

    pub fn objects(&self) -> usize {
        self.scores.nrows()
    }

    pub fn regions(&self) -> usize {
        self.scores.ncols()
    }

    pub fn get(&self, object: usize, region: usize) -> f32 {
        self.scores[(object, region)]
    }

    /// Stores `value`, clamping NaN and infinities to 0.
    pub fn set(&mut self, object: usize, region: usize, value: f32) {
        self.scores[(object, region)] = if value.is_finite() { value } else { 0.0 };
    }
}

/// Fills in `template` with a trimmed object name.
pub fn query_for(template: &str, name: &str) -> String {
    template.replace("{name}", name.trim())
}

/// Scores every task object against every region.
///
/// A failed score degrades that cell to 0 rather than failing the whole matrix.
pub async fn build_similarity_matrix(
    scorer: &dyn MatchScorer,
    template: &str,
    objects: &[TaskObject],
    regions: &[ObservedRegion],
) -> SimilarityMatrix {
    let mut matrix = SimilarityMatrix::zeros(objects.len(), regions.len());
    if regions.is_empty() {
        return matrix;
    }

    for (i, object) in objects.iter().enumerate() {
        let query = query_for(template, &object.name);
        for (j, region) in regions.iter().enumerate() {
            match scorer.match_score(&query, &region.crop).await {
                Ok(score) => matrix.set(i, j, score),
                Err(e) => {
                    warn!(object = %object.name, region = region.id, error = %e, "match score failed; using 0");
                }
            }
        }
    }

    debug!(objects = objects.len(), regions = regions.len(), scores = ?matrix.scores, "similarity matrix");
    matrix
}
