//! Blocking FIFO shared by the per-connection send worker and the message
//! dispatcher.
//!
//! A single consumer blocks in [`WorkQueue::pop`] until an item arrives or the
//! queue is halted.  Once halted, `pop` returns `None` immediately even if
//! items remain, so a stopping worker drains nothing further.  Pushing is
//! always accepted; items pushed while halted wait for [`WorkQueue::resume`].

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

pub(crate) struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Condvar,
}

struct QueueState<T> {
    items: VecDeque<T>,
    halted: bool,
}

impl<T> WorkQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                halted: false,
            }),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, item: T) {
        self.state.lock().items.push_back(item);
        self.ready.notify_one();
    }

    /// Blocks until an item is available or the queue is halted.
    pub(crate) fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if state.halted {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            self.ready.wait(&mut state);
        }
    }

    /// Wakes the consumer and makes every subsequent `pop` return `None`.
    pub(crate) fn halt(&self) {
        self.state.lock().halted = true;
        self.ready.notify_all();
    }

    pub(crate) fn resume(&self) {
        self.state.lock().halted = false;
    }

    pub(crate) fn clear(&self) {
        self.state.lock().items.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }
}
