//! Bounded, in-process run history.

use std::collections::VecDeque;

use crate::models::{PipelineFamily, RunSummary};

/// Ring buffer of finished runs. The oldest entry is evicted once the
/// capacity is reached.
#[derive(Debug)]
pub struct RunHistory {
    capacity: usize,
    runs: VecDeque<RunSummary>,
}

impl RunHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            runs: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, summary: RunSummary) {
        if self.runs.len() == self.capacity {
            self.runs.pop_front();
        }
        self.runs.push_back(summary);
    }

    /// Runs newest first, optionally limited to one family.
    pub fn list(&self, family: Option<PipelineFamily>) -> Vec<RunSummary> {
        self.runs
            .iter()
            .rev()
            .filter(|r| family.map_or(true, |f| r.family == f))
            .cloned()
            .collect()
    }

    /// Most recent run of a family.
    pub fn last(&self, family: PipelineFamily) -> Option<&RunSummary> {
        self.runs.iter().rev().find(|r| r.family == family)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
