//! Context composition
//!
//! Turns retrieved series into the bounded text block handed to the generation
//! provider. Blocks arrive in descending similarity order; when the budget is
//! exceeded the lowest-similarity blocks are dropped first.

use crate::types::ContextRef;

/// One retrieved series rendered for the prompt.
#[derive(Debug, Clone)]
pub struct ContextBlock {
    pub reference: ContextRef,
    pub text: String,
}

impl ContextBlock {
    /// Block citing the series id and similarity ahead of `body`.
    pub fn new(reference: ContextRef, body: &str) -> Self {
        let text = format!(
            "[{}] (similarity {:.3}) {}",
            reference.series_id, reference.similarity, body
        );
        Self { reference, text }
    }
}

/// Context text and the series it covers.
#[derive(Debug, Clone, Default)]
pub struct ComposedContext {
    pub text: String,
    pub references: Vec<ContextRef>,
    /// Blocks left out to respect the budget
    pub dropped: usize,
}

/// Join the longest prefix of `blocks` that fits in `budget_chars`.
///
/// Blocks are separated by newlines, which count toward the budget. If even the
/// first block does not fit it is truncated to the budget rather than dropped,
/// so a non-empty retrieval never yields an empty context.
pub fn compose(blocks: Vec<ContextBlock>, budget_chars: usize) -> ComposedContext {
    let total = blocks.len();
    let mut composed = ComposedContext::default();
    let mut used = 0usize;

    for block in blocks {
        let len = block.text.chars().count();
        let separator = usize::from(!composed.references.is_empty());

        if used + separator + len <= budget_chars {
            if separator == 1 {
                composed.text.push('\n');
            }
            composed.text.push_str(&block.text);
            composed.references.push(block.reference);
            used += separator + len;
        } else if composed.references.is_empty() && budget_chars > 0 {
            composed.text = block.text.chars().take(budget_chars).collect();
            composed.references.push(block.reference);
            break;
        } else {
            break;
        }
    }

    composed.dropped = total - composed.references.len();
    if composed.dropped > 0 {
        tracing::debug!(
            kept = composed.references.len(),
            dropped = composed.dropped,
            budget_chars,
            "Context budget exceeded, dropped lowest-similarity series"
        );
    }
    composed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(id: &str, similarity: f32, body: &str) -> ContextBlock {
        ContextBlock::new(
            ContextRef {
                series_id: id.to_string(),
                report_id: None,
                similarity,
            },
            body,
        )
    }

    #[test]
    fn test_block_cites_series() {
        let b = block("UNRATE", 0.91234, "rising");
        assert_eq!(b.text, "[UNRATE] (similarity 0.912) rising");
    }

    #[test]
    fn test_everything_fits() {
        let blocks = vec![block("A", 0.9, "aaa"), block("B", 0.5, "bbb")];
        let composed = compose(blocks.clone(), 10_000);
        assert_eq!(composed.references.len(), 2);
        assert_eq!(composed.dropped, 0);
        assert_eq!(composed.text, format!("{}\n{}", blocks[0].text, blocks[1].text));
    }

    #[test]
    fn test_drops_lowest_similarity_first() {
        let blocks = vec![
            block("A", 0.9, "aaaa"),
            block("B", 0.7, "bbbb"),
            block("C", 0.1, "cccc"),
        ];
        let first_two = blocks[0].text.chars().count() + 1 + blocks[1].text.chars().count();
        let composed = compose(blocks, first_two);

        let ids: Vec<_> = composed.references.iter().map(|r| r.series_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert_eq!(composed.dropped, 1);
        assert_eq!(composed.text.chars().count(), first_two);
    }

    #[test]
    fn test_truncates_oversized_first_block() {
        let composed = compose(vec![block("A", 0.9, &"é".repeat(100))], 20);
        assert_eq!(composed.text.chars().count(), 20);
        assert_eq!(composed.references.len(), 1);
        assert!(composed.text.starts_with("[A]"));
    }

    #[test]
    fn test_empty_retrieval() {
        let composed = compose(Vec::new(), 100);
        assert!(composed.text.is_empty());
        assert!(composed.references.is_empty());
        assert_eq!(composed.dropped, 0);
    }
}
