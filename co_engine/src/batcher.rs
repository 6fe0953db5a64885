//! ABOUTME: Batch accumulator for one (channel, priority) queue
//! ABOUTME: State machine {idle, collecting, flushing} with size and timer inputs

use co_config::BatchPolicy;
use co_db::DeliveryJob;
use std::time::Instant;

/// Batch accumulator.
///
/// Inputs are new jobs and timer ticks; the single output is a batch
/// emission. A full batch flushes on push; a partial batch flushes when
/// its deadline passes; shutdown flushes whatever is left.
#[derive(Debug)]
pub struct Batcher {
    policy: BatchPolicy,
    items: Vec<DeliveryJob>,
    deadline: Option<Instant>,
}

impl Batcher {
    pub fn new(policy: BatchPolicy) -> Self {
        Self {
            policy,
            items: Vec::new(),
            deadline: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Batch-size ceiling from the policy
    pub fn capacity(&self) -> usize {
        self.policy.max_size
    }

    /// Add a job; returns a batch when the size trigger fires
    pub fn push(&mut self, job: DeliveryJob, now: Instant) -> Option<Vec<DeliveryJob>> {
        if self.items.is_empty() {
            // idle -> collecting
            self.deadline = Some(now + self.policy.flush_after);
        }
        self.items.push(job);

        if self.items.len() >= self.policy.max_size {
            return self.emit();
        }
        None
    }

    /// Timer input; returns a batch when the flush deadline has passed
    pub fn flush_due(&mut self, now: Instant) -> Option<Vec<DeliveryJob>> {
        match self.deadline {
            Some(deadline) if now >= deadline && !self.items.is_empty() => self.emit(),
            _ => None,
        }
    }

    /// Shutdown input; emits the partial batch unconditionally
    pub fn flush_all(&mut self) -> Option<Vec<DeliveryJob>> {
        if self.items.is_empty() {
            None
        } else {
            self.emit()
        }
    }

    /// Next instant at which flush_due can fire
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.items.is_empty() {
            None
        } else {
            self.deadline
        }
    }

    fn emit(&mut self) -> Option<Vec<DeliveryJob>> {
        // collecting -> flushing -> idle
        self.deadline = None;
        Some(std::mem::take(&mut self.items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use co_core::{ChannelKind, Priority};
    use co_db::JobState;
    use std::time::Duration;

    fn job(id: &str) -> DeliveryJob {
        DeliveryJob {
            id: id.to_string(),
            notification_id: "n1".to_string(),
            user_id: "u1".to_string(),
            kind: "job_alert".to_string(),
            channel: ChannelKind::Email,
            priority: Priority::Normal,
            payload: None,
            attempts: 0,
            max_attempts: 3,
            not_before: 0,
            expires_at: None,
            persistent: false,
            state: JobState::Pending,
            lease_expires_at: None,
            leased_by: None,
            internal_failures: 0,
            last_error: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn policy(max_size: usize, flush_ms: u64) -> BatchPolicy {
        BatchPolicy {
            max_size,
            flush_after: Duration::from_millis(flush_ms),
        }
    }

    #[test]
    fn test_size_trigger() {
        let mut batcher = Batcher::new(policy(2, 60_000));
        let now = Instant::now();

        assert!(batcher.push(job("a"), now).is_none());
        let batch = batcher.push(job("b"), now).expect("size trigger");
        assert_eq!(batch.len(), 2);
        assert!(batcher.is_idle());
    }

    #[test]
    fn test_timeout_trigger() {
        let mut batcher = Batcher::new(policy(10, 100));
        let start = Instant::now();

        batcher.push(job("a"), start);
        assert!(batcher.flush_due(start + Duration::from_millis(50)).is_none());

        let batch = batcher
            .flush_due(start + Duration::from_millis(150))
            .expect("timeout trigger");
        assert_eq!(batch.len(), 1);
        assert!(batcher.is_idle());
    }

    #[test]
    fn test_batch_order_matches_input_order() {
        let mut batcher = Batcher::new(policy(3, 60_000));
        let now = Instant::now();

        batcher.push(job("a"), now);
        batcher.push(job("b"), now);
        let batch = batcher.push(job("c"), now).unwrap();
        let ids: Vec<_> = batch.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_deadline_set_by_first_item() {
        let mut batcher = Batcher::new(policy(10, 100));
        let start = Instant::now();

        batcher.push(job("a"), start);
        // The second push does not extend the deadline
        batcher.push(job("b"), start + Duration::from_millis(90));
        let batch = batcher
            .flush_due(start + Duration::from_millis(110))
            .expect("deadline from first push");
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_flush_all_on_shutdown() {
        let mut batcher = Batcher::new(policy(10, 60_000));
        let now = Instant::now();

        assert!(batcher.flush_all().is_none());
        batcher.push(job("a"), now);
        let batch = batcher.flush_all().expect("partial batch on shutdown");
        assert_eq!(batch.len(), 1);
        assert!(batcher.next_deadline().is_none());
    }

    #[test]
    fn test_immediate_policy_emits_every_push() {
        let mut batcher = Batcher::new(policy(1, 0));
        let now = Instant::now();

        let batch = batcher.push(job("a"), now).expect("size 1 emits immediately");
        assert_eq!(batch.len(), 1);
    }
}
