//! Evaluation payload shared by every broker queue.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Unit of scheduling work dispatched by the broker.
///
/// The broker interprets only the fields below: `id` for de-duplication,
/// the job key for per-job serialization, `scheduler` to select the ready
/// queue, `priority` and `create_index` for dispatch ordering, and the two
/// optional time gates. Orchestrators attach whatever else they need to the
/// evaluation record outside the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Unique evaluation identifier.
    pub id: String,
    /// Namespace of the job this evaluation belongs to.
    pub namespace: String,
    /// Job this evaluation schedules work for.
    pub job_id: String,
    /// Scheduler class whose ready queue this evaluation lands in.
    pub scheduler: String,
    /// Dispatch urgency; higher values dequeue first across distinct jobs.
    pub priority: i32,
    /// Monotonic creation sequence number, used as the FIFO tie-breaker.
    pub create_index: u64,
    /// Relative hold: admission is deferred by this long.
    pub wait: Option<Duration>,
    /// Absolute hold: admission is deferred until this wall-clock instant.
    pub wait_until: Option<SystemTime>,
}

impl Evaluation {
    /// Create an evaluation that is immediately eligible for admission.
    pub fn new(
        id: impl Into<String>,
        namespace: impl Into<String>,
        job_id: impl Into<String>,
        scheduler: impl Into<String>,
        priority: i32,
        create_index: u64,
    ) -> Evaluation {
        Evaluation {
            id: id.into(),
            namespace: namespace.into(),
            job_id: job_id.into(),
            scheduler: scheduler.into(),
            priority,
            create_index,
            wait: None,
            wait_until: None,
        }
    }

    /// Defer admission by a relative duration.
    pub fn with_wait(mut self, wait: Duration) -> Evaluation {
        self.wait = Some(wait);
        self
    }

    /// Defer admission until an absolute wall-clock instant.
    pub fn with_wait_until(mut self, wait_until: SystemTime) -> Evaluation {
        self.wait_until = Some(wait_until);
        self
    }

    /// Key under which evaluations of the same job are serialized.
    pub fn job_key(&self) -> JobKey {
        JobKey {
            namespace: self.namespace.clone(),
            job_id: self.job_id.clone(),
        }
    }
}

/// `(namespace, job_id)` pair identifying a job across namespaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub namespace: String,
    pub job_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_time_gates() {
        let eval = Evaluation::new("e1", "default", "web", "service", 50, 1)
            .with_wait(Duration::from_secs(5));
        assert_eq!(eval.wait, Some(Duration::from_secs(5)));
        assert_eq!(eval.wait_until, None);
        assert_eq!(eval.priority, 50);
    }

    #[test]
    fn job_key_spans_namespace_and_job() {
        let a = Evaluation::new("e1", "default", "web", "service", 50, 1);
        let b = Evaluation::new("e2", "default", "web", "service", 10, 2);
        let c = Evaluation::new("e3", "prod", "web", "service", 10, 3);
        assert_eq!(a.job_key(), b.job_key());
        assert_ne!(a.job_key(), c.job_key());
    }
}
