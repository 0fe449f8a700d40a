//! Reciprocal Rank Fusion (RRF).

use crate::config::FusionParams;
use crate::index::{DocId, HitSource, RankedHit};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Merges a sparse and a dense ranking.
///
/// Raw BM25 scores and vector similarities live on unrelated scales, so only
/// ranks are used: a hit at 1-indexed position `r` of a list contributes
/// `weight / (r + c)`, and contributions are summed per document. Documents found
/// by only one index keep their single contribution.
pub fn fuse(sparse_hits: &[RankedHit], dense_hits: &[RankedHit], k: usize, params: &FusionParams) -> Vec<RankedHit> {
    let mut fused: HashMap<DocId, f32> = HashMap::new();
    accumulate(&mut fused, sparse_hits, params.sparse_weight, params.c);
    accumulate(&mut fused, dense_hits, params.dense_weight, params.c);

    let mut ranked: Vec<(DocId, f32)> = fused.into_iter().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));
    ranked.truncate(k);
    ranked
        .into_iter()
        .map(|(doc_id, score)| RankedHit { doc_id, score, source: HitSource::Hybrid })
        .collect()
}

fn accumulate(fused: &mut HashMap<DocId, f32>, hits: &[RankedHit], weight: f32, c: f32) {
    for (rank, hit) in hits.iter().enumerate() {
        let position = (rank + 1) as f32;
        *fused.entry(hit.doc_id).or_insert(0.0) += weight / (position + c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hits(ids: &[DocId], source: HitSource) -> Vec<RankedHit> {
        ids.iter().enumerate().map(|(i, &doc_id)| RankedHit { doc_id, score: 100.0 - i as f32, source }).collect()
    }

    fn score_of(fused: &[RankedHit], id: DocId) -> f32 {
        fused.iter().find(|h| h.doc_id == id).map(|h| h.score).unwrap_or(0.0)
    }

    #[test]
    fn documents_in_both_lists_rank_first() {
        let sparse = hits(&[3, 1, 4], HitSource::Sparse);
        let dense = hits(&[1, 2, 3], HitSource::Dense);
        let fused = fuse(&sparse, &dense, 10, &FusionParams::default());
        assert_eq!(fused.len(), 4);
        let top: Vec<DocId> = fused.iter().take(2).map(|h| h.doc_id).collect();
        assert!(top.contains(&1) && top.contains(&3));
        assert!(fused.iter().all(|h| h.source == HitSource::Hybrid));
    }

    #[test]
    fn single_list_documents_are_kept() {
        let sparse = hits(&[7], HitSource::Sparse);
        let dense = hits(&[8], HitSource::Dense);
        let fused = fuse(&sparse, &dense, 10, &FusionParams::default());
        assert_eq!(fused.len(), 2);
        // Equal contributions: lower id wins the tie.
        assert_eq!(fused[0].doc_id, 7);
        assert!((fused[0].score - 1.0 / 61.0).abs() < 1e-7);
    }

    #[test]
    fn raw_scores_are_ignored() {
        let mut sparse = hits(&[1, 2], HitSource::Sparse);
        sparse[0].score = 1e9;
        let dense = hits(&[2, 1], HitSource::Dense);
        let fused = fuse(&sparse, &dense, 10, &FusionParams::default());
        assert!((score_of(&fused, 1) - score_of(&fused, 2)).abs() < 1e-7);
    }

    #[test]
    fn promoting_a_document_never_lowers_its_score() {
        let dense = hits(&[5, 6, 7, 8], HitSource::Dense);
        let params = FusionParams::default();
        let orders: [&[DocId]; 4] = [&[1, 2, 3, 9], &[1, 2, 9, 3], &[1, 9, 2, 3], &[9, 1, 2, 3]];
        let mut last = 0.0f32;
        for order in orders {
            let fused = fuse(&hits(order, HitSource::Sparse), &dense, 10, &params);
            let s = score_of(&fused, 9);
            assert!(s >= last);
            last = s;
        }
        // And from absent to present.
        let absent = fuse(&hits(&[1, 2, 3], HitSource::Sparse), &dense, 10, &params);
        assert_eq!(score_of(&absent, 9), 0.0);
    }

    #[test]
    fn truncates_to_k_and_handles_empty_inputs() {
        let sparse = hits(&[1, 2, 3, 4], HitSource::Sparse);
        assert_eq!(fuse(&sparse, &[], 2, &FusionParams::default()).len(), 2);
        assert!(fuse(&[], &[], 5, &FusionParams::default()).is_empty());
    }

    #[test]
    fn weights_shift_the_balance() {
        let sparse = hits(&[1], HitSource::Sparse);
        let dense = hits(&[2], HitSource::Dense);
        let fused = fuse(&sparse, &dense, 10, &FusionParams::default().with_alpha(0.8));
        assert_eq!(fused[0].doc_id, 2);
    }
}
