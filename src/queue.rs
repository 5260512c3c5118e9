//! Priority queue shared by the ready and blocked evaluation sets.

use crate::evaluation::Evaluation;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// Heap entry carrying the dispatch ordering.
///
/// Higher priority sorts first when the two evaluations belong to distinct
/// jobs and carry distinct priorities; otherwise creation order wins. The
/// same-job clause keeps one job's evaluations FIFO even when their
/// priorities differ. `Ord` is arranged so the standard max-heap pops the
/// evaluation that dispatches first.
#[derive(Debug, Clone)]
struct PendingEval(Arc<Evaluation>);

impl Ord for PendingEval {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (&self.0, &other.0);
        if a.job_id != b.job_id && a.priority != b.priority {
            a.priority.cmp(&b.priority)
        } else {
            b.create_index.cmp(&a.create_index)
        }
    }
}

impl PartialOrd for PendingEval {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PendingEval {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PendingEval {}

/// Pending evaluations for one scheduler class or one blocked job.
#[derive(Debug, Default)]
pub(crate) struct PendingQueue {
    heap: BinaryHeap<PendingEval>,
}

impl PendingQueue {
    pub fn push(&mut self, eval: Arc<Evaluation>) {
        self.heap.push(PendingEval(eval));
    }

    /// Remove and return the evaluation that dispatches next.
    pub fn pop(&mut self) -> Option<Arc<Evaluation>> {
        self.heap.pop().map(|entry| entry.0)
    }

    /// The evaluation [`Self::pop`] would return.
    pub fn peek(&self) -> Option<&Arc<Evaluation>> {
        self.heap.peek().map(|entry| &entry.0)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::Evaluation;

    fn eval(id: &str, job: &str, priority: i32, create_index: u64) -> Arc<Evaluation> {
        Arc::new(Evaluation::new(
            id,
            "default",
            job,
            "service",
            priority,
            create_index,
        ))
    }

    #[test]
    fn pops_highest_priority_across_jobs() {
        let mut queue = PendingQueue::default();
        queue.push(eval("e1", "job1", 10, 1));
        queue.push(eval("e2", "job2", 50, 2));
        queue.push(eval("e3", "job3", 30, 3));

        assert_eq!(queue.pop().unwrap().priority, 50);
        assert_eq!(queue.pop().unwrap().priority, 30);
        assert_eq!(queue.pop().unwrap().priority, 10);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn equal_priorities_dispatch_in_creation_order() {
        let mut queue = PendingQueue::default();
        queue.push(eval("e2", "job2", 50, 7));
        queue.push(eval("e1", "job1", 50, 3));
        queue.push(eval("e3", "job3", 50, 9));

        assert_eq!(queue.pop().unwrap().id, "e1");
        assert_eq!(queue.pop().unwrap().id, "e2");
        assert_eq!(queue.pop().unwrap().id, "e3");
    }

    #[test]
    fn same_job_keeps_creation_order_across_priorities() {
        let mut queue = PendingQueue::default();
        queue.push(eval("e1", "job1", 10, 1));
        queue.push(eval("e2", "job1", 90, 2));

        // Both evaluations belong to one job, so the earlier one dispatches
        // first despite its lower priority.
        assert_eq!(queue.pop().unwrap().id, "e1");
        assert_eq!(queue.pop().unwrap().id, "e2");
    }

    #[test]
    fn peek_matches_pop() {
        let mut queue = PendingQueue::default();
        queue.push(eval("e1", "job1", 10, 1));
        queue.push(eval("e2", "job2", 50, 2));
        queue.push(eval("e3", "job3", 30, 3));

        while let Some(head) = queue.peek().cloned() {
            assert_eq!(queue.pop().unwrap().id, head.id);
        }
        assert!(queue.is_empty());
    }
}
