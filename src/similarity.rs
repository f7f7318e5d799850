//! Vector similarity and top-K ranking over stored documents.
//!
//! Accumulation happens in `f64` even though embeddings are stored as `f32`,
//! so error stays bounded over embeddings with thousands of components.

use ndarray::{Array1, ArrayView1};

use crate::vector_db::Document;

/// Score reported when two vectors cannot be compared.
pub const NO_MATCH: f32 = 0.0;

#[derive(Debug, Clone, Copy)]
pub struct Scored<'a> {
    pub score: f32,
    pub document: &'a Document,
}

fn widen(v: &[f32]) -> Array1<f64> {
    ArrayView1::from(v).mapv(f64::from)
}

fn cosine_widened(a: &Array1<f64>, norm_a: f64, b: &Array1<f64>) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return NO_MATCH;
    }
    let norm_b = b.dot(b).sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return NO_MATCH;
    }
    (a.dot(b) / (norm_a * norm_b)) as f32
}

/// Cosine similarity of two embeddings, or [`NO_MATCH`] when the lengths
/// differ or either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return NO_MATCH;
    }
    let a = widen(a);
    let norm_a = a.dot(&a).sqrt();
    cosine_widened(&a, norm_a, &widen(b))
}

pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return NO_MATCH;
    }
    widen(a).dot(&widen(b)) as f32
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return NO_MATCH;
    }
    let diff = widen(a) - widen(b);
    diff.dot(&diff).sqrt() as f32
}

/// Scores every document against `query` and keeps the best `k`, highest
/// score first. Equal scores fall back to ascending document id.
///
/// This is a full linear scan, O(n·d) per call.
pub fn top_k<'a, I>(query: &[f32], documents: I, k: usize) -> Vec<Scored<'a>>
where
    I: IntoIterator<Item = &'a Document>,
{
    if k == 0 {
        return Vec::new();
    }

    let query = widen(query);
    let query_norm = query.dot(&query).sqrt();

    let mut scored: Vec<Scored<'a>> = documents
        .into_iter()
        .map(|document| Scored {
            score: cosine_widened(&query, query_norm, &widen(&document.embedding)),
            document,
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.document.id.cmp(&b.document.id))
    });
    scored.truncate(k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-6;

    fn doc(id: &str, embedding: Vec<f32>) -> Document {
        Document::with_id(id, "", id, "", "", embedding)
    }

    #[test]
    fn cosine_is_symmetric() {
        let a = [0.3, -1.2, 4.0, 0.5];
        let b = [2.0, 0.1, -0.7, 1.1];
        assert!((cosine_similarity(&a, &b) - cosine_similarity(&b, &a)).abs() < EPS);
    }

    #[test]
    fn cosine_of_vector_with_itself_is_one() {
        let a: Vec<f32> = (1..=1536).map(|i| (i as f32).sin()).collect();
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < EPS);
    }

    #[test]
    fn cosine_of_opposite_vectors_is_minus_one() {
        assert!((cosine_similarity(&[1.0, 2.0], &[-1.0, -2.0]) + 1.0).abs() < EPS);
    }

    #[test]
    fn mismatched_or_zero_vectors_are_no_match() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), NO_MATCH);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), NO_MATCH);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 0.0]), NO_MATCH);
        assert_eq!(cosine_similarity(&[], &[]), NO_MATCH);
    }

    #[test]
    fn dot_and_euclidean() {
        assert!((dot_product(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]) - 32.0).abs() < EPS);
        assert!((euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]) - 5.0).abs() < EPS);
        assert_eq!(dot_product(&[1.0], &[1.0, 2.0]), NO_MATCH);
    }

    #[test]
    fn top_k_ranks_by_cosine() {
        let docs = vec![
            doc("a", vec![1.0, 0.0]),
            doc("b", vec![0.0, 1.0]),
            doc("c", vec![0.7, 0.7]),
        ];
        let ranked = top_k(&[1.0, 0.0], &docs, 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].document.id, "a");
        assert!((ranked[0].score - 1.0).abs() < EPS);
        assert_eq!(ranked[1].document.id, "c");
        assert!((ranked[1].score - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-4);
    }

    #[test]
    fn top_k_is_bounded_descending_subset() {
        let docs: Vec<Document> = (0..10)
            .map(|i| doc(&format!("d{i}"), vec![1.0, i as f32]))
            .collect();
        for k in [0, 1, 4, 10, 25] {
            let ranked = top_k(&[1.0, 0.0], &docs, k);
            assert_eq!(ranked.len(), k.min(docs.len()));
            for pair in ranked.windows(2) {
                assert!(pair[0].score > pair[1].score);
            }
            for hit in &ranked {
                assert!(docs.iter().any(|d| d.id == hit.document.id));
            }
        }
    }

    #[test]
    fn ties_break_on_document_id() {
        let docs = vec![
            doc("zeta", vec![1.0, 1.0]),
            doc("alpha", vec![2.0, 2.0]),
            doc("mid", vec![3.0, 3.0]),
        ];
        let ids: Vec<_> = top_k(&[1.0, 1.0], &docs, 3)
            .iter()
            .map(|s| s.document.id.as_str())
            .collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
    }
}
