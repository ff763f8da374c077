//! Executable work items and the completion queue.
//!
//! A [`Work`] item is a unit the scheduler can run: resuming a task,
//! delivering a settled I/O op, or delivering a settled timer or
//! signal wait. Items carry two capabilities: `execute` runs the
//! item, and `destroy` discards an unexecuted one during the
//! scheduler's shutdown drain.
//!
//! The executable units are reference-counted records that already
//! exist (the task, the op slot embedded in its impl), so pushing one
//! onto the queue performs no per-item allocation.
//!
//! [`WorkQueue`] is a FIFO. It is not thread-safe; the scheduler
//! serializes access with its own mutex. Dropping a non-empty queue
//! destroys every remaining item.

use crate::exec::task::Task;
use crate::io::op::OpState;
use crate::signal::SignalWait;
use crate::time::TimerWait;
use std::collections::VecDeque;
use std::sync::Arc;

/// One executable unit.
#[derive(Debug)]
pub(crate) enum Work {
    /// Resume a spawned task.
    Task(Arc<Task>),
    /// Deliver a settled I/O operation.
    Io(Arc<OpState>),
    /// Deliver a settled timer wait.
    Timer(Arc<TimerWait>),
    /// Deliver a settled signal wait.
    Signal(Arc<SignalWait>),
}

impl Work {
    /// Runs the item. Called outside the queue mutex.
    pub(crate) fn execute(self) {
        match self {
            Work::Task(task) => task.run(),
            Work::Io(op) => op.deliver(),
            Work::Timer(wait) => wait.deliver(),
            Work::Signal(wait) => wait.deliver(),
        }
    }

    /// Discards the item without running it (shutdown path).
    pub(crate) fn destroy(self) {
        match self {
            Work::Task(task) => task.abandon(),
            Work::Io(op) => op.discard(),
            Work::Timer(wait) => wait.discard(),
            Work::Signal(wait) => wait.discard(),
        }
    }
}

/// FIFO of work items.
#[derive(Debug, Default)]
pub(crate) struct WorkQueue {
    items: VecDeque<Work>,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, item: Work) {
        self.items.push_back(item);
    }

    pub(crate) fn pop(&mut self) -> Option<Work> {
        self.items.pop_front()
    }

    /// Splices all of `other` onto the back, leaving it empty.
    pub(crate) fn splice(&mut self, other: &mut WorkQueue) {
        self.items.append(&mut other.items);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        while let Some(item) = self.items.pop_front() {
            item.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::op::OpKind;

    #[test]
    fn fifo_order() {
        let mut queue = WorkQueue::new();
        let a = OpState::new(OpKind::Read);
        let b = OpState::new(OpKind::Write);
        queue.push(Work::Io(a.clone()));
        queue.push(Work::Io(b.clone()));

        match queue.pop() {
            Some(Work::Io(op)) => assert!(Arc::ptr_eq(&op, &a)),
            other => panic!("unexpected item: {other:?}"),
        }
        match queue.pop() {
            Some(Work::Io(op)) => assert!(Arc::ptr_eq(&op, &b)),
            other => panic!("unexpected item: {other:?}"),
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn splice_moves_everything() {
        let mut front = WorkQueue::new();
        let mut back = WorkQueue::new();
        front.push(Work::Io(OpState::new(OpKind::Read)));
        back.push(Work::Io(OpState::new(OpKind::Write)));
        back.push(Work::Io(OpState::new(OpKind::Accept)));

        front.splice(&mut back);
        assert!(back.is_empty());
        assert_eq!(front.len(), 3);
    }

    #[test]
    fn drop_destroys_remaining() {
        // An op with a pending keep-alive must release it on destroy.
        let op = OpState::new(OpKind::Read);
        let mut queue = WorkQueue::new();
        queue.push(Work::Io(op.clone()));
        drop(queue);
        assert_eq!(Arc::strong_count(&op), 1);
    }
}
