//! Pending job queue and finished-job cache.
//!
//! Both structures are owned by the queue manager actor and never shared,
//! so they carry no synchronization.
//!
//! # Ordering
//!
//! With [`QueueOrdering::FrontInsertion`] `urgent` and `high` jobs are pushed
//! to the front and `normal` and `low` jobs to the back; jobs are always
//! taken from the front. Two urgent jobs submitted back to back therefore run
//! in reverse order. [`QueueOrdering::StrictPriority`] keeps the queue sorted
//! by priority with first-in-first-out order inside a level.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::config::QueueOrdering;
use super::job::{JobCallback, JobRequest, Priority};
use crate::pipeline::RefinementOptions;

/// A job waiting for admission.
#[derive(Debug)]
pub struct QueuedJob {
    pub request: JobRequest,
    pub options: RefinementOptions,
    pub callback: Option<JobCallback>,
    seq: u64,
}

impl QueuedJob {
    pub fn priority(&self) -> Priority {
        self.request.priority
    }

    pub fn id(&self) -> &str {
        &self.request.id
    }
}

/// Priority queue of jobs waiting for admission.
#[derive(Debug)]
pub struct JobQueue {
    entries: VecDeque<QueuedJob>,
    ordering: QueueOrdering,
    next_seq: u64,
}

impl JobQueue {
    pub fn new(ordering: QueueOrdering) -> Self {
        Self {
            entries: VecDeque::new(),
            ordering,
            next_seq: 0,
        }
    }

    pub fn ordering(&self) -> QueueOrdering {
        self.ordering
    }

    /// Enqueues a job according to the current ordering.
    pub fn enqueue(
        &mut self,
        request: JobRequest,
        options: RefinementOptions,
        callback: Option<JobCallback>,
    ) {
        let job = QueuedJob {
            request,
            options,
            callback,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        match self.ordering {
            QueueOrdering::FrontInsertion => {
                if job.priority().is_expedited() {
                    self.entries.push_front(job);
                } else {
                    self.entries.push_back(job);
                }
            }
            QueueOrdering::StrictPriority => {
                let priority = job.priority();
                let position = self
                    .entries
                    .iter()
                    .position(|queued| queued.priority() < priority)
                    .unwrap_or(self.entries.len());
                self.entries.insert(position, job);
            }
        }
    }

    /// Takes the next job to admit.
    pub fn dequeue(&mut self) -> Option<QueuedJob> {
        self.entries.pop_front()
    }

    /// Removes a queued job by id.
    pub fn remove(&mut self, job_id: &str) -> Option<QueuedJob> {
        let position = self.entries.iter().position(|job| job.id() == job_id)?;
        self.entries.remove(position)
    }

    pub fn get(&self, job_id: &str) -> Option<&JobRequest> {
        self.entries
            .iter()
            .find(|job| job.id() == job_id)
            .map(|job| &job.request)
    }

    /// Queued jobs in admission order.
    pub fn iter(&self) -> impl Iterator<Item = &JobRequest> {
        self.entries.iter().map(|job| &job.request)
    }

    /// Removes every queued job.
    pub fn drain(&mut self) -> Vec<QueuedJob> {
        self.entries.drain(..).collect()
    }

    /// Switches ordering. Moving to strict priority re-sorts the waiting jobs.
    pub fn set_ordering(&mut self, ordering: QueueOrdering) {
        if ordering == QueueOrdering::StrictPriority && self.ordering != ordering {
            self.entries
                .make_contiguous()
                .sort_by(|a, b| b.priority().cmp(&a.priority()).then(a.seq.cmp(&b.seq)));
        }
        self.ordering = ordering;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Bounded cache of finished jobs.
///
/// Entries are evicted oldest first once the cache is full or their
/// retention window has passed.
#[derive(Debug)]
pub struct ResultsCache {
    jobs: HashMap<String, JobRequest>,
    order: VecDeque<(String, Instant)>,
    capacity: usize,
    retention: Duration,
}

impl ResultsCache {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            jobs: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            retention,
        }
    }

    /// Changes the bounds, evicting immediately if needed.
    pub fn resize(&mut self, capacity: usize, retention: Duration) {
        self.capacity = capacity.max(1);
        self.retention = retention;
        self.evict(Instant::now());
    }

    pub fn insert(&mut self, request: JobRequest) {
        let now = Instant::now();
        if self.jobs.insert(request.id.clone(), request.clone()).is_some() {
            self.order.retain(|(id, _)| id != &request.id);
        }
        self.order.push_back((request.id, now));
        self.evict(now);
    }

    pub fn get(&mut self, job_id: &str) -> Option<&JobRequest> {
        self.evict(Instant::now());
        self.jobs.get(job_id)
    }

    pub fn contains(&mut self, job_id: &str) -> bool {
        self.get(job_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn evict(&mut self, now: Instant) {
        while let Some((id, stored_at)) = self.order.front() {
            let expired = now.duration_since(*stored_at) > self.retention;
            if !expired && self.order.len() <= self.capacity {
                break;
            }
            self.jobs.remove(id);
            self.order.pop_front();
        }
    }
}
