//! Deterministic fallback embedding.
//!
//! When the ONNX model fails at runtime the pipeline degrades to a pure
//! hash-based embedding so writes and searches keep working. Each unique
//! content token is hashed and spread across four dimensions, weighted by its
//! frequency and relative position in the text; the last twenty dimensions
//! carry bounded trig features of text length, word count, and average word
//! length. The result is L2-normalized and fully finite.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use super::{l2_normalize, EMBEDDING_DIM};

/// Dimensions reserved at the tail for shape features.
const FEATURE_DIMS: usize = 20;
const TOKEN_DIMS: usize = EMBEDDING_DIM - FEATURE_DIMS;

/// Function words that carry no semantic signal and would otherwise dilute
/// the token overlap between paraphrases.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from",
    "had", "has", "have", "i", "in", "is", "it", "its", "me", "my", "of",
    "on", "or", "our", "so", "that", "the", "their", "then", "there", "this",
    "to", "was", "we", "were", "will", "with", "you", "your",
];

/// Produce a deterministic 384-dim embedding for `text`.
///
/// Pure: identical input always yields an identical vector. Bounded: every
/// component is finite and the whole vector is L2-normalized.
pub fn fallback_embedding(text: &str) -> Vec<f32> {
    let mut vec = vec![0.0f32; EMBEDDING_DIM];

    let tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect();

    // Frequency and first-occurrence position per unique token.
    let mut seen: HashMap<&str, (usize, usize)> = HashMap::new();
    for (idx, token) in tokens.iter().enumerate() {
        let entry = seen.entry(token.as_str()).or_insert((0, idx));
        entry.0 += 1;
    }

    let total = tokens.len().max(1) as f32;
    for (token, (freq, first_idx)) in &seen {
        // Earlier tokens weigh more; the tail still contributes half weight.
        let relative_position = 1.0 - 0.5 * (*first_idx as f32 / total);
        let weight = *freq as f32 * relative_position;

        let hash = hash_token(token);
        for k in 0..4 {
            let dim = ((hash >> (16 * k)) as usize) % TOKEN_DIMS;
            vec[dim] += weight;
        }
    }

    // Shape features in the last 20 dimensions, small enough that token
    // overlap dominates the cosine.
    let text_len = text.len() as f32;
    let word_count = tokens.len() as f32;
    let avg_word_len = if tokens.is_empty() {
        0.0
    } else {
        tokens.iter().map(|t| t.len()).sum::<usize>() as f32 / word_count
    };
    for j in 0..FEATURE_DIMS {
        let base = match j % 3 {
            0 => text_len,
            1 => word_count,
            _ => avg_word_len,
        };
        vec[TOKEN_DIMS + j] = 0.05 * (base * (j + 1) as f32 * 0.01).sin();
    }

    // Degenerate inputs (no tokens, zero features) still get a valid unit vector.
    if vec.iter().all(|x| *x == 0.0) {
        vec[0] = 1.0;
    }

    l2_normalize(&vec)
}

fn hash_token(token: &str) -> u64 {
    // DefaultHasher::new() uses fixed keys, so the embedding is stable
    // across processes.
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::validate_embedding;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn fallback_is_deterministic() {
        let a = fallback_embedding("Meeting with Dr. Smith tomorrow at 3pm");
        let b = fallback_embedding("Meeting with Dr. Smith tomorrow at 3pm");
        assert_eq!(a, b);
    }

    #[test]
    fn fallback_is_valid_and_normalized() {
        for text in ["hello world", "x", "!!!", "", "a longer sentence about appointments"] {
            let v = fallback_embedding(text);
            validate_embedding(&v).unwrap();
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4, "norm {norm} for {text:?}");
        }
    }

    #[test]
    fn shared_tokens_raise_similarity() {
        let doc = fallback_embedding("I have an appointment with Dr. Johnson next Tuesday");
        let query = fallback_embedding("doctor appointment");
        let unrelated = fallback_embedding("the stock market closed higher today");

        let sim_related = cosine(&query, &doc);
        let sim_unrelated = cosine(&query, &unrelated);
        assert!(
            sim_related >= 0.3,
            "paraphrase similarity too low: {sim_related}"
        );
        assert!(sim_related > sim_unrelated);
    }

    #[test]
    fn different_texts_produce_different_vectors() {
        let a = fallback_embedding("Meeting on Tuesday");
        let b = fallback_embedding("Coffee on Friday");
        assert_ne!(a, b);
        assert!(cosine(&a, &b) < 0.5);
    }
}
