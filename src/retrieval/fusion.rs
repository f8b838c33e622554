// src/retrieval/fusion.rs
// Reciprocal Rank Fusion over ranked context lists

use crate::retrieval::types::RetrievedContextItem;
use std::collections::HashMap;

/// Standard RRF damping constant.
pub const RRF_K: f64 = 60.0;

/// Identity of an item for fusion purposes.
fn fusion_key(item: &RetrievedContextItem) -> String {
    format!(
        "{}::{}::{}",
        item.item_type,
        item.source_path,
        char_prefix(&item.content, 150)
    )
}

/// Identity of an item for final dedup.
fn dedup_key(item: &RetrievedContextItem) -> (String, String) {
    (item.source_path.clone(), char_prefix(&item.content, 100))
}

fn char_prefix(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Fuse ranked lists with `score = Σ 1/(k + rank)` and sort descending.
///
/// The first occurrence of an item keeps its payload; only the score is
/// replaced by the fused one (which may exceed 1.0 when an item ranks in
/// several lists). Ties keep first-seen order, so fusing an already-fused
/// list back in never reorders the winner.
pub fn reciprocal_rank_fusion(lists: Vec<Vec<RetrievedContextItem>>) -> Vec<RetrievedContextItem> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut payloads: HashMap<String, RetrievedContextItem> = HashMap::new();

    for list in lists {
        for (rank, item) in list.into_iter().enumerate() {
            let key = fusion_key(&item);
            let contribution = 1.0 / (RRF_K + rank as f64);
            match scores.get_mut(&key) {
                Some(score) => *score += contribution,
                None => {
                    scores.insert(key.clone(), contribution);
                    order.push(key.clone());
                    payloads.insert(key, item);
                }
            }
        }
    }

    let mut fused: Vec<RetrievedContextItem> = order
        .iter()
        .filter_map(|key| {
            let mut item = payloads.remove(key)?;
            item.relevance_score = scores.get(key).copied().unwrap_or(0.0);
            Some(item)
        })
        .collect();

    // Stable sort: equal scores keep first-seen order
    fused.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    fused
}

/// Merge new items into an existing ranked list via RRF.
pub fn merge_ranked(
    existing: Vec<RetrievedContextItem>,
    incoming: Vec<RetrievedContextItem>,
) -> Vec<RetrievedContextItem> {
    reciprocal_rank_fusion(vec![existing, incoming])
}

/// Drop duplicates by `(source_path, content[:100])`, keeping the first
/// (highest-ranked) occurrence. Idempotent.
pub fn dedup_items(items: Vec<RetrievedContextItem>) -> Vec<RetrievedContextItem> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(dedup_key(item)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::types::ContextItemType;

    fn item(path: &str, content: &str) -> RetrievedContextItem {
        RetrievedContextItem::new(ContextItemType::FileSnippet, path, content, 0.5)
    }

    #[test]
    fn test_single_list_keeps_order() {
        let fused = reciprocal_rank_fusion(vec![vec![item("a", "1"), item("b", "2")]]);
        assert_eq!(fused[0].source_path, "a");
        assert_eq!(fused[1].source_path, "b");
        assert!(fused[0].relevance_score > fused[1].relevance_score);
    }

    #[test]
    fn test_item_in_both_lists_wins() {
        let fused = reciprocal_rank_fusion(vec![
            vec![item("a", "1"), item("shared", "s")],
            vec![item("shared", "s"), item("b", "2")],
        ]);
        assert_eq!(fused[0].source_path, "shared");
        // 1/61 + 1/60 > 1/60
        let expected = 1.0 / 61.0 + 1.0 / 60.0;
        assert!((fused[0].relevance_score - expected).abs() < 1e-12);
    }

    #[test]
    fn test_top_item_is_member_of_some_input() {
        let a = vec![item("x", "1"), item("y", "2")];
        let b = vec![item("z", "3")];
        let inputs: Vec<String> = a.iter().chain(b.iter()).map(|i| i.source_path.clone()).collect();
        let fused = reciprocal_rank_fusion(vec![a, b]);
        assert!(inputs.contains(&fused[0].source_path));
    }

    #[test]
    fn test_remerging_identical_list_keeps_top_item() {
        let base = vec![item("top", "t"), item("mid", "m"), item("low", "l")];
        let once = reciprocal_rank_fusion(vec![base.clone()]);
        let top_before = once[0].source_path.clone();
        let twice = merge_ranked(once, base);
        assert_eq!(twice[0].source_path, top_before);
    }

    #[test]
    fn test_distinct_types_do_not_collide() {
        let mut doc = item("same", "same content");
        doc.item_type = ContextItemType::Documentation;
        let fused = reciprocal_rank_fusion(vec![vec![item("same", "same content")], vec![doc]]);
        assert_eq!(fused.len(), 2);
    }

    #[test]
    fn test_dedup_removes_same_path_and_prefix() {
        let long = "x".repeat(120);
        let a = item("p", &long);
        let b = item("p", &(long.clone() + "tail beyond the first hundred"));
        let deduped = dedup_items(vec![a, b]);
        assert_eq!(deduped.len(), 1);
    }

    #[test]
    fn test_dedup_is_idempotent() {
        let items = vec![item("a", "1"), item("a", "1"), item("b", "2")];
        let once = dedup_items(items);
        let twice = dedup_items(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_fusion_score_can_exceed_one() {
        // 120 lists all ranking the same item first: score = 120/60 = 2.0
        let lists: Vec<_> = (0..120).map(|_| vec![item("hot", "h")]).collect();
        let fused = reciprocal_rank_fusion(lists);
        assert!(fused[0].relevance_score > 1.0);
    }
}
