//! Admission order across jobs.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use crate::job::JobId;

type QueueKey = (Reverse<i32>, u64);

/// Jobs ordered by priority (higher first), then by enqueue sequence.
///
/// Holds ordering only; admissibility is decided by the job's state.
#[derive(Debug, Default)]
pub(crate) struct PriorityQueue {
    order: BTreeMap<QueueKey, JobId>,
    keys: HashMap<JobId, QueueKey>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job_id: JobId, priority: i32, seq: u64) {
        self.remove(&job_id);
        let key = (Reverse(priority), seq);
        self.order.insert(key, job_id.clone());
        self.keys.insert(job_id, key);
    }

    pub fn remove(&mut self, job_id: &JobId) -> bool {
        match self.keys.remove(job_id) {
            Some(key) => {
                self.order.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Changes a job's priority, keeping its original enqueue sequence.
    pub fn reprioritize(&mut self, job_id: &JobId, priority: i32) -> bool {
        let Some(&(_, seq)) = self.keys.get(job_id) else {
            return false;
        };
        self.push(job_id.clone(), priority, seq);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobId> {
        self.order.values()
    }
}
