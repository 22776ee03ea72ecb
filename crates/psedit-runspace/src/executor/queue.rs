//! Request lanes of the pipeline executor.

use std::collections::VecDeque;

use crate::options::{ExecutionOptions, ExecutionPriority};

use super::task::Job;

/// Identifier assigned to a submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub(crate) u64);

/// Request waiting for the pipeline thread.
pub(crate) struct WorkItem {
    pub(crate) id: RequestId,
    pub(crate) options: ExecutionOptions,
    pub(crate) job: Box<dyn Job>,
}

/// Three FIFO lanes; a request is dequeued exactly once.
#[derive(Default)]
pub(crate) struct RequestQueue {
    next: VecDeque<WorkItem>,
    normal: VecDeque<WorkItem>,
    idle: VecDeque<WorkItem>,
}

impl RequestQueue {
    pub(crate) fn push(&mut self, item: WorkItem) {
        match item.options.priority {
            ExecutionPriority::Next => self.next.push_back(item),
            ExecutionPriority::Normal => self.normal.push_back(item),
            ExecutionPriority::Idle => self.idle.push_back(item),
        }
    }

    /// Takes the first runnable request, scanning the priority, normal and
    /// idle lanes in that order. While the debugger is stopped only requests
    /// allowed to run there are taken; the rest keep their position.
    pub(crate) fn take_runnable(&mut self, in_debugger: bool) -> Option<WorkItem> {
        for lane in [&mut self.next, &mut self.normal, &mut self.idle] {
            let position = lane
                .iter()
                .position(|item| !in_debugger || item.options.run_in_debugger);
            if let Some(index) = position {
                return lane.remove(index);
            }
        }
        None
    }

    pub(crate) fn remove(&mut self, id: RequestId) -> Option<WorkItem> {
        for lane in [&mut self.next, &mut self.normal, &mut self.idle] {
            if let Some(index) = lane.iter().position(|item| item.id == id) {
                return lane.remove(index);
            }
        }
        None
    }

    pub(crate) fn drain(&mut self) -> Vec<WorkItem> {
        self.next
            .drain(..)
            .chain(self.normal.drain(..))
            .chain(self.idle.drain(..))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.next.len() + self.normal.len() + self.idle.len()
    }
}
