//! Partition bookkeeping at the scheduler.
//!
//! Every partition is unassigned, assigned to exactly one worker, or
//! finished. Selection is FIFO over insertion order. A partition whose
//! worker times out or dies returns to the queue and may be handed to
//! another worker; each return costs one of a bounded retry budget, and
//! exhausting it is fatal for the epoch. Stale finishes (a worker that was
//! already timed out reporting completion) are ignored, and duplicate
//! completions are absorbed upstream by the associative progress merge.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use sparsefleet_core::{Error, Result};
use sparsefleet_proto::{Phase, Workload};

#[derive(Debug, Clone, PartialEq)]
enum PartStatus {
    Unassigned,
    Assigned { worker: String, since: Instant },
    Finished,
}

#[derive(Debug)]
struct Partition {
    workload: Workload,
    status: PartStatus,
    retries: u32,
}

/// The scheduler's partition pool for one phase.
pub struct WorkloadPool {
    parts: Vec<Partition>,
    /// Unassigned partition ids in FIFO order.
    queue: VecDeque<usize>,
    /// Current assignment per worker.
    assignments: HashMap<String, usize>,
    assignment_timeout: Duration,
    max_retries: u32,
}

impl WorkloadPool {
    /// Creates an empty pool with the reassignment policy knobs.
    pub fn new(assignment_timeout: Duration, max_retries: u32) -> Self {
        Self {
            parts: Vec::new(),
            queue: VecDeque::new(),
            assignments: HashMap::new(),
            assignment_timeout,
            max_retries,
        }
    }

    /// Enumerates `files x [0, num_parts_per_file)` into unassigned
    /// partitions, in file order then part order.
    pub fn add(&mut self, files: &[String], num_parts_per_file: u32, phase: Phase, epoch: u32) {
        for file in files {
            for part_id in 0..num_parts_per_file {
                let id = self.parts.len();
                self.parts.push(Partition {
                    workload: Workload {
                        file: file.clone(),
                        part_id,
                        num_parts: num_parts_per_file,
                        phase: phase as i32,
                        epoch,
                    },
                    status: PartStatus::Unassigned,
                    retries: 0,
                });
                self.queue.push_back(id);
            }
        }
    }

    /// Hands the next unassigned partition to `worker`, if any. Partitions
    /// whose assignment timed out are reclaimed first.
    pub fn get(&mut self, worker: &str) -> Option<Workload> {
        self.reclaim_timeouts();
        let id = self.queue.pop_front()?;
        self.parts[id].status = PartStatus::Assigned {
            worker: worker.to_string(),
            since: Instant::now(),
        };
        self.assignments.insert(worker.to_string(), id);
        Some(self.parts[id].workload.clone())
    }

    /// Marks `worker`'s current assignment finished. A stale finish (the
    /// partition was reassigned meanwhile) is ignored.
    pub fn finish(&mut self, worker: &str) {
        if let Some(id) = self.assignments.remove(worker) {
            if matches!(&self.parts[id].status,
                        PartStatus::Assigned { worker: w, .. } if w == worker)
            {
                self.parts[id].status = PartStatus::Finished;
            }
        }
    }

    /// Returns `worker`'s current assignment to the queue, spending one
    /// retry. Exhausting the retry budget is fatal for the epoch.
    pub fn fail(&mut self, worker: &str) -> Result<()> {
        let Some(id) = self.assignments.remove(worker) else {
            return Ok(());
        };
        if !matches!(&self.parts[id].status,
                     PartStatus::Assigned { worker: w, .. } if w == worker)
        {
            return Ok(());
        }
        self.requeue(id)
    }

    /// True iff every partition is finished.
    pub fn is_finished(&self) -> bool {
        self.parts
            .iter()
            .all(|p| p.status == PartStatus::Finished)
    }

    /// Number of partitions in the pool.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// True iff no partitions were added.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    fn requeue(&mut self, id: usize) -> Result<()> {
        let part = &mut self.parts[id];
        part.retries += 1;
        if part.retries > self.max_retries {
            return Err(Error::config(format!(
                "partition {} of {} failed {} times, giving up on this pass",
                part.workload.part_id, part.workload.file, part.retries
            )));
        }
        part.status = PartStatus::Unassigned;
        self.queue.push_back(id);
        Ok(())
    }

    /// Returns timed-out assignments to the queue.
    fn reclaim_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<(String, usize)> = self
            .assignments
            .iter()
            .filter(|(_, &id)| {
                matches!(&self.parts[id].status,
                         PartStatus::Assigned { since, .. }
                             if now.duration_since(*since) > self.assignment_timeout)
            })
            .map(|(w, &id)| (w.clone(), id))
            .collect();
        for (worker, id) in expired {
            tracing::warn!(
                worker,
                part = self.parts[id].workload.part_id,
                "assignment timed out, requeueing"
            );
            self.assignments.remove(&worker);
            // Retry-budget exhaustion surfaces on the next get/fail path;
            // a timed-out partition goes back regardless so the phase can
            // make progress with the remaining workers.
            let _ = self.requeue(id);
        }
    }
}
