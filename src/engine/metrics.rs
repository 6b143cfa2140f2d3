use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::interpreter::Outcome;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    submitted_total: AtomicU64,
    rejected_total: AtomicU64,
    completed_total: AtomicU64,
    timed_out_total: AtomicU64,
    memory_exceeded_total: AtomicU64,
    errored_total: AtomicU64,
    in_flight: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) {
        self.submitted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected(&self) {
        self.rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finished(&self, outcome: Outcome) {
        self.decrement_in_flight();
        let counter = match outcome {
            Outcome::Completed | Outcome::Crashed => &self.completed_total,
            Outcome::TimeLimitExceeded => &self.timed_out_total,
            Outcome::MemoryLimitExceeded => &self.memory_exceeded_total,
            Outcome::ExecutionError => &self.errored_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        format!(
            concat!(
                "# TYPE grader_submitted_total counter\n",
                "grader_submitted_total {}\n",
                "# TYPE grader_rejected_total counter\n",
                "grader_rejected_total {}\n",
                "# TYPE grader_completed_total counter\n",
                "grader_completed_total {}\n",
                "# TYPE grader_timed_out_total counter\n",
                "grader_timed_out_total {}\n",
                "# TYPE grader_memory_exceeded_total counter\n",
                "grader_memory_exceeded_total {}\n",
                "# TYPE grader_errored_total counter\n",
                "grader_errored_total {}\n",
                "# TYPE grader_in_flight gauge\n",
                "grader_in_flight {}\n"
            ),
            self.submitted_total.load(Ordering::Relaxed),
            self.rejected_total.load(Ordering::Relaxed),
            self.completed_total.load(Ordering::Relaxed),
            self.timed_out_total.load(Ordering::Relaxed),
            self.memory_exceeded_total.load(Ordering::Relaxed),
            self.errored_total.load(Ordering::Relaxed),
            self.in_flight.load(Ordering::Relaxed),
        )
    }

    fn decrement_in_flight(&self) {
        let mut current = self.in_flight.load(Ordering::Relaxed);
        while current > 0 {
            match self.in_flight.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}
