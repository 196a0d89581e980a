//! Result fusion strategies.
//!
//! - Reciprocal Rank Fusion works on positions only, so lists with
//!   incomparable score scales can be merged.
//! - Weighted blending min-max normalizes each list to `[0, 1]` first.

use std::collections::HashMap;

/// A document after reciprocal rank fusion.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub id: String,
    pub score: f64,
    /// Best (smallest) 1-based rank any input list gave this document.
    pub best_rank: usize,
}

/// Reciprocal Rank Fusion.
///
/// `rrf(d) = Σ 1 / (rrf_k + rank_i(d))` over the lists containing `d`, with
/// 1-based ranks. Output is sorted by score descending, then best rank
/// ascending, then id ascending. A repeated id inside one list only counts at
/// its first position.
pub fn reciprocal_rank_fusion<S: AsRef<str>>(lists: &[Vec<S>], rrf_k: u32) -> Vec<FusedHit> {
    let k = rrf_k as f64;
    let mut fused: HashMap<&str, FusedHit> = HashMap::new();

    for list in lists {
        let mut seen: Vec<&str> = Vec::new();
        for (pos, id) in list.iter().enumerate() {
            let id = id.as_ref();
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);
            let rank = pos + 1;
            let contribution = 1.0 / (k + rank as f64);
            fused
                .entry(id)
                .and_modify(|hit| {
                    hit.score += contribution;
                    hit.best_rank = hit.best_rank.min(rank);
                })
                .or_insert_with(|| FusedHit {
                    id: id.to_string(),
                    score: contribution,
                    best_rank: rank,
                });
        }
    }

    let mut results: Vec<FusedHit> = fused.into_values().collect();
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.best_rank.cmp(&b.best_rank))
            .then_with(|| a.id.cmp(&b.id))
    });
    results
}

/// Min-max scale scores into `[0, 1]`.
///
/// A list whose scores are all equal maps every entry to 1.0.
pub fn min_max_normalize(scores: &[(String, f64)]) -> HashMap<&str, f64> {
    let max = scores.iter().map(|s| s.1).fold(f64::NEG_INFINITY, f64::max);
    let min = scores.iter().map(|s| s.1).fold(f64::INFINITY, f64::min);
    let range = max - min;
    scores
        .iter()
        .map(|(id, score)| {
            let norm = if range > 0.0 { (score - min) / range } else { 1.0 };
            (id.as_str(), norm)
        })
        .collect()
}

/// Weighted blend of min-max normalized scores.
///
/// Each entry is `(weight, scored list)`. A document missing from a list gets
/// no contribution from it. Sorted by blended score descending, then id.
pub fn weighted_score_blend(lists: &[(f64, &[(String, f64)])]) -> Vec<(String, f64)> {
    let mut blended: HashMap<String, f64> = HashMap::new();
    for (weight, scores) in lists {
        for (id, norm) in min_max_normalize(scores) {
            *blended.entry(id.to_string()).or_insert(0.0) += weight * norm;
        }
    }
    let mut results: Vec<(String, f64)> = blended.into_iter().collect();
    results.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(hits: &[FusedHit]) -> Vec<&str> {
        hits.iter().map(|h| h.id.as_str()).collect()
    }

    #[test]
    fn test_rrf_worked_example() {
        let a = vec!["a", "b", "c"];
        let b = vec!["b", "a", "d"];
        let fused = reciprocal_rank_fusion(&[a, b], 60);

        assert_eq!(ids(&fused), vec!["a", "b", "c", "d"]);
        let expected_ab = 1.0 / 61.0 + 1.0 / 62.0;
        assert_eq!(fused[0].score, expected_ab);
        assert_eq!(fused[1].score, expected_ab);
        assert_eq!(fused[2].score, 1.0 / 63.0);
        assert_eq!(fused[3].score, 1.0 / 63.0);
    }

    #[test]
    fn test_rrf_self_fusion_preserves_order() {
        let list = vec!["x", "q", "m", "a", "z"];
        let fused = reciprocal_rank_fusion(&[list.clone(), list.clone()], 60);
        assert_eq!(ids(&fused), list);
    }

    #[test]
    fn test_rrf_unanimous_first_wins() {
        let fused = reciprocal_rank_fusion(&[vec!["w", "a"], vec!["w", "b", "a"], vec!["w"]], 1);
        assert_eq!(fused[0].id, "w");
    }

    #[test]
    fn test_rrf_tie_prefers_best_rank() {
        // Mirrored lists give an exact score tie.
        let fused = reciprocal_rank_fusion(&[vec!["y", "x"], vec!["x", "y"]], 60);
        assert_eq!(fused[0].score, fused[1].score);
        assert_eq!(ids(&fused), vec!["x", "y"]);

        let fused = reciprocal_rank_fusion(&[vec!["b"], vec!["c", "a"]], 60);
        // b and c both at rank 1 in one list; a only at rank 2.
        assert_eq!(ids(&fused), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_rrf_duplicate_in_list_counts_once() {
        let fused = reciprocal_rank_fusion(&[vec!["a", "a", "b"]], 60);
        assert_eq!(fused[0].score, 1.0 / 61.0);
        assert_eq!(fused[1].score, 1.0 / 63.0);
    }

    #[test]
    fn test_rrf_empty() {
        let lists: Vec<Vec<String>> = vec![];
        assert!(reciprocal_rank_fusion(&lists, 60).is_empty());
    }

    #[test]
    fn test_min_max_normalize() {
        let scores = vec![("a".to_string(), 10.0), ("b".to_string(), 5.0), ("c".to_string(), 0.0)];
        let norm = min_max_normalize(&scores);
        assert_eq!(norm["a"], 1.0);
        assert_eq!(norm["b"], 0.5);
        assert_eq!(norm["c"], 0.0);

        let flat = vec![("a".to_string(), 3.0)];
        assert_eq!(min_max_normalize(&flat)["a"], 1.0);
    }

    #[test]
    fn test_weighted_blend() {
        let vector = vec![("a".to_string(), 0.9), ("b".to_string(), 0.1)];
        let keyword = vec![("b".to_string(), 12.0), ("c".to_string(), 2.0)];
        let blended = weighted_score_blend(&[(0.3, vector.as_slice()), (0.7, keyword.as_slice())]);

        // a: 0.3*1.0, b: 0.3*0.0 + 0.7*1.0, c: 0.7*0.0
        assert_eq!(blended[0].0, "b");
        assert!((blended[0].1 - 0.7).abs() < 1e-12);
        assert_eq!(blended[1].0, "a");
        assert!((blended[1].1 - 0.3).abs() < 1e-12);
        assert_eq!(blended[2], ("c".to_string(), 0.0));
    }

    #[test]
    fn test_weighted_blend_ties_by_id() {
        let vector = vec![("z".to_string(), 1.0)];
        let keyword = vec![("y".to_string(), 4.0)];
        let blended = weighted_score_blend(&[(0.5, vector.as_slice()), (0.5, keyword.as_slice())]);
        assert_eq!(blended[0].0, "y");
        assert_eq!(blended[1].0, "z");
    }
}
