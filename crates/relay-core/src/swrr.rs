//! Smooth weighted round-robin balancer (spec §4.5), Nginx-style.
//!
//! Pure state machine: no I/O, no async. Used to pick the head of an
//! equal-effective-priority candidate group weighted by effective key count.

#[derive(Debug, Clone)]
struct Entry<T> {
    item: T,
    weight: i64,
    current: i64,
}

/// Holds per-item `current` state across repeated selections.
pub struct Swrr<T> {
    entries: Vec<Entry<T>>,
}

impl<T: Clone> Swrr<T> {
    /// `weights` must be non-empty and each weight must be >= 1.
    pub fn new(items: impl IntoIterator<Item = (T, i64)>) -> Self {
        let entries = items
            .into_iter()
            .map(|(item, weight)| Entry {
                item,
                weight: weight.max(1),
                current: 0,
            })
            .collect();
        Self { entries }
    }

    /// Select the next item and advance all `current` counters.
    pub fn next(&mut self) -> Option<T> {
        if self.entries.is_empty() {
            return None;
        }
        let total: i64 = self.entries.iter().map(|e| e.weight).sum();
        for entry in &mut self.entries {
            entry.current += entry.weight;
        }
        let winner = self
            .entries
            .iter_mut()
            .max_by_key(|e| e.current)
            .expect("entries is non-empty");
        winner.current -= total;
        Some(winner.item.clone())
    }
}

/// One-shot helper: pick a single head element from a weighted group without
/// retaining balancer state across calls (the candidate selector only needs
/// one pick per request; persistent `current` state would require per-group
/// storage this crate doesn't otherwise carry).
pub fn pick_one<T: Clone>(items: &[(T, i64)]) -> Option<T> {
    let mut swrr = Swrr::new(items.iter().cloned());
    swrr.next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn distributes_exactly_by_weight_over_sum_of_weights() {
        let mut swrr = Swrr::new([("a", 5), ("b", 1), ("c", 1)]);
        let mut counts: HashMap<&str, u32> = HashMap::new();
        for _ in 0..7 {
            *counts.entry(swrr.next().unwrap()).or_default() += 1;
        }
        assert_eq!(counts["a"], 5);
        assert_eq!(counts["b"], 1);
        assert_eq!(counts["c"], 1);
    }

    #[test]
    fn equal_weights_alternate_strictly() {
        let mut swrr = Swrr::new([("a", 1), ("b", 1)]);
        let mut last = None;
        for _ in 0..10 {
            let picked = swrr.next().unwrap();
            assert_ne!(last, Some(picked));
            last = Some(picked);
        }
    }

    #[test]
    fn single_entry_always_wins() {
        let mut swrr = Swrr::new([("only", 3)]);
        assert_eq!(swrr.next(), Some("only"));
        assert_eq!(swrr.next(), Some("only"));
    }

    #[test]
    fn zero_weight_is_floored_to_one() {
        let mut swrr = Swrr::new([("a", 0), ("b", 1)]);
        let picked_a = (0..2).filter(|_| swrr.next() == Some("a")).count();
        assert!(picked_a >= 1);
    }
}
