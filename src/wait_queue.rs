//! Fair FIFO wait queue, the building block of the attention/poll lock.
//!
//! A node represents one waiting thread and owns the condition variable
//! it blocks on, so a release can signal exactly the thread it admits.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, MutexGuard};

pub(crate) struct WaitNode {
    cond: Condvar,
}

impl WaitNode {
    pub(crate) fn new() -> Arc<WaitNode> {
        Arc::new(WaitNode {
            cond: Condvar::new(),
        })
    }

    pub(crate) fn signal(&self) {
        self.cond.notify_one();
    }

    pub(crate) fn wait<T>(&self, guard: &mut MutexGuard<'_, T>) {
        self.cond.wait(guard);
    }
}

pub(crate) struct WaitQueue {
    nodes: VecDeque<Arc<WaitNode>>,
}

impl WaitQueue {
    pub(crate) fn new() -> WaitQueue {
        WaitQueue {
            nodes: VecDeque::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn queue(&mut self, node: &Arc<WaitNode>) {
        self.nodes.push_back(node.clone());
    }

    pub(crate) fn head(&self) -> Option<&Arc<WaitNode>> {
        self.nodes.front()
    }

    pub(crate) fn pop_head(&mut self) -> Option<Arc<WaitNode>> {
        self.nodes.pop_front()
    }

    pub(crate) fn is_head(&self, node: &Arc<WaitNode>) -> bool {
        match self.nodes.front() {
            Some(head) => Arc::ptr_eq(head, node),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_discipline() {
        let mut q = WaitQueue::new();
        assert!(q.is_empty());

        let a = WaitNode::new();
        let b = WaitNode::new();
        q.queue(&a);
        q.queue(&b);

        assert!(q.is_head(&a));
        assert!(!q.is_head(&b));

        let popped = q.pop_head().unwrap();
        assert!(Arc::ptr_eq(&popped, &a));
        assert!(q.is_head(&b));

        let _ = q.pop_head();
        assert!(q.is_empty());
        assert!(!q.is_head(&b));
        assert!(q.head().is_none());
    }
}
