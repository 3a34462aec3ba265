pub mod cache;
pub mod fallback;
pub mod local;

use anyhow::Result;

/// Number of dimensions in the embedding vectors (all-MiniLM-L6-v2).
pub const EMBEDDING_DIM: usize = 384;

/// Trait for embedding text into vectors.
///
/// Implementations produce L2-normalized vectors of exactly [`EMBEDDING_DIM`]
/// dimensions. All methods are synchronous — callers in async contexts should
/// use `tokio::task::spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string into a vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of text strings. Ordering of the output matches the input.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Return the number of dimensions this provider produces.
    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// Check that a vector satisfies the storage contract: exactly
/// [`EMBEDDING_DIM`] components, all finite.
pub fn validate_embedding(vec: &[f32]) -> Result<()> {
    anyhow::ensure!(
        vec.len() == EMBEDDING_DIM,
        "embedding has {} dimensions, expected {EMBEDDING_DIM}",
        vec.len()
    );
    anyhow::ensure!(
        vec.iter().all(|x| x.is_finite()),
        "embedding contains a non-finite component"
    );
    Ok(())
}

/// L2-normalize a vector. Returns a zero vector if the input norm is zero.
pub fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_normalize() {
        let v = vec![3.0, 4.0];
        let normalized = l2_normalize(&v);
        assert!((normalized[0] - 0.6).abs() < 1e-6);
        assert!((normalized[1] - 0.8).abs() < 1e-6);
        let norm: f32 = normalized.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_vector() {
        let v = vec![0.0, 0.0, 0.0];
        let normalized = l2_normalize(&v);
        assert_eq!(normalized, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn validate_rejects_wrong_length() {
        assert!(validate_embedding(&[0.0; 10]).is_err());
        assert!(validate_embedding(&[0.0; EMBEDDING_DIM]).is_ok());
    }

    #[test]
    fn validate_rejects_non_finite() {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[7] = f32::NAN;
        assert!(validate_embedding(&v).is_err());
        v[7] = f32::INFINITY;
        assert!(validate_embedding(&v).is_err());
    }
}
