//! Absolute-deadline ordered set for `wait_until` evaluations.

use crate::evaluation::Evaluation;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

/// Ordering key: deadline first, id as the tie-breaker so two evaluations
/// sharing a deadline keep distinct slots.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct DelayKey {
    wait_until: SystemTime,
    id: String,
}

/// Evaluations parked until a wall-clock deadline, peekable in deadline
/// order and removable by evaluation id.
#[derive(Debug, Default)]
pub(crate) struct DelayHeap {
    ordered: BTreeMap<DelayKey, Arc<Evaluation>>,
    by_id: HashMap<String, DelayKey>,
}

impl DelayHeap {
    pub fn new() -> DelayHeap {
        DelayHeap::default()
    }

    /// Park `eval` until `wait_until`. A second push for the same id
    /// replaces the first.
    pub fn push(&mut self, eval: Arc<Evaluation>, wait_until: SystemTime) {
        let key = DelayKey {
            wait_until,
            id: eval.id.clone(),
        };
        if let Some(previous) = self.by_id.insert(eval.id.clone(), key.clone()) {
            self.ordered.remove(&previous);
        }
        self.ordered.insert(key, eval);
    }

    /// The evaluation with the earliest deadline, if any.
    pub fn peek(&self) -> Option<(&Arc<Evaluation>, SystemTime)> {
        self.ordered
            .first_key_value()
            .map(|(key, eval)| (eval, key.wait_until))
    }

    pub fn remove(&mut self, id: &str) -> Option<Arc<Evaluation>> {
        let key = self.by_id.remove(id)?;
        self.ordered.remove(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn eval(id: &str) -> Arc<Evaluation> {
        Arc::new(Evaluation::new(id, "default", "web", "service", 50, 1))
    }

    #[test]
    fn peeks_earliest_deadline() {
        let now = SystemTime::now();
        let mut heap = DelayHeap::new();
        heap.push(eval("late"), now + Duration::from_secs(30));
        heap.push(eval("early"), now + Duration::from_secs(5));

        let (head, wait_until) = heap.peek().unwrap();
        assert_eq!(head.id, "early");
        assert_eq!(wait_until, now + Duration::from_secs(5));
    }

    #[test]
    fn removes_by_id() {
        let now = SystemTime::now();
        let mut heap = DelayHeap::new();
        heap.push(eval("a"), now + Duration::from_secs(1));
        heap.push(eval("b"), now + Duration::from_secs(2));

        assert_eq!(heap.remove("a").unwrap().id, "a");
        assert!(heap.remove("a").is_none());
        assert_eq!(heap.peek().unwrap().0.id, "b");
        assert!(heap.remove("b").is_some());
        assert!(heap.is_empty());
    }

    #[test]
    fn repush_replaces_deadline() {
        let now = SystemTime::now();
        let mut heap = DelayHeap::new();
        heap.push(eval("a"), now + Duration::from_secs(10));
        heap.push(eval("a"), now + Duration::from_secs(1));

        assert_eq!(heap.peek().unwrap().1, now + Duration::from_secs(1));
        heap.remove("a");
        assert!(heap.is_empty());
    }
}
