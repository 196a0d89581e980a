//! Maximal Marginal Relevance selection.

/// Greedily pick up to `top_k` candidates balancing relevance and novelty.
///
/// `candidates` holds `(id, relevance)`. Each step picks the candidate
/// maximizing `lambda * relevance - (1 - lambda) * max_sim_to_selected`; the
/// first pick is therefore the most relevant one. `similarity` returns `None`
/// when no data is available for a pair, which counts as 0. Equal MMR values
/// keep input order. Returns indices into `candidates` in selection order.
pub fn mmr_select<F>(candidates: &[(String, f64)], lambda: f64, top_k: usize, similarity: F) -> Vec<usize>
where
    F: Fn(&str, &str) -> Option<f64>,
{
    let target = top_k.min(candidates.len());
    let mut selected: Vec<usize> = Vec::with_capacity(target);
    let mut remaining: Vec<usize> = (0..candidates.len()).collect();
    // Running max similarity of each candidate to the selected set.
    let mut max_sim: Vec<Option<f64>> = vec![None; candidates.len()];

    while selected.len() < target {
        let mut best: Option<(usize, f64)> = None;
        for (pos, &idx) in remaining.iter().enumerate() {
            let value = if selected.is_empty() {
                candidates[idx].1
            } else {
                let penalty = max_sim[idx].unwrap_or(0.0);
                lambda * candidates[idx].1 - (1.0 - lambda) * penalty
            };
            if best.map_or(true, |(_, v)| value > v) {
                best = Some((pos, value));
            }
        }
        let Some((pos, _)) = best else { break };
        let chosen = remaining.remove(pos);
        selected.push(chosen);

        for &idx in &remaining {
            let sim = similarity(&candidates[idx].0, &candidates[chosen].0).unwrap_or(0.0);
            max_sim[idx] = Some(max_sim[idx].map_or(sim, |m| m.max(sim)));
        }
    }
    selected
}
