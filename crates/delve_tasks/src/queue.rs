//! Priority-bucketed FIFO queue of ready task ids.
//!
//! One `VecDeque` per [`TaskPriority`]; pops scan buckets highest first.
//! Entries carry the task's capability tag so routing decisions never need
//! the task map while the queue lock is held.

use std::collections::VecDeque;

use crate::capability::CapabilitySet;
use crate::task::{TaskId, TaskPriority};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct QueuedTask {
    pub id: TaskId,
    pub capabilities: Option<CapabilitySet>,
}

#[derive(Debug, Default)]
pub(crate) struct PriorityQueue {
    buckets: [VecDeque<QueuedTask>; TaskPriority::COUNT],
    len: usize,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, priority: TaskPriority, task: QueuedTask) {
        self.buckets[priority.index()].push_back(task);
        self.len += 1;
    }

    /// Highest-priority task, oldest first within a bucket.
    #[cfg(test)]
    pub fn pop(&mut self) -> Option<QueuedTask> {
        self.pop_matching(|_| true)
    }

    /// Highest-priority task accepted by `accept`.
    pub fn pop_matching(&mut self, mut accept: impl FnMut(&QueuedTask) -> bool) -> Option<QueuedTask> {
        for priority in TaskPriority::DESCENDING {
            let bucket = &mut self.buckets[priority.index()];
            if let Some(pos) = bucket.iter().position(&mut accept) {
                let task = bucket.remove(pos);
                if task.is_some() {
                    self.len -= 1;
                }
                return task;
            }
        }
        None
    }

    /// Up to `max` accepted tasks in priority order.
    pub fn pop_batch(&mut self, max: usize, mut accept: impl FnMut(&QueuedTask) -> bool) -> Vec<QueuedTask> {
        let mut batch = Vec::new();
        while batch.len() < max {
            match self.pop_matching(&mut accept) {
                Some(task) => batch.push(task),
                None => break,
            }
        }
        batch
    }

    pub fn drain(&mut self) -> Vec<QueuedTask> {
        let mut all = Vec::with_capacity(self.len);
        for priority in TaskPriority::DESCENDING {
            all.extend(self.buckets[priority.index()].drain(..));
        }
        self.len = 0;
        all
    }

    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
