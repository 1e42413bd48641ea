//! Hands received messages to application code on one dedicated thread.
//!
//! Install [`MessageDispatcher::message_handler`] on connections to move
//! message processing off their receive workers.  Messages from every
//! connection are processed strictly in arrival order.
//!
//! Stopping does not discard queued messages; they are processed after the
//! next [`start`](MessageDispatcher::start).

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::trace;

use crate::connection::{MessageHandler, ReceivedMessage};
use crate::error::NetError;
use crate::queue::WorkQueue;

pub struct MessageDispatcher {
    inner: Arc<DispatchInner>,
}

struct DispatchInner {
    queue: WorkQueue<ReceivedMessage>,
    handler: MessageHandler,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Bumped by every `stop`.  A worker exits as soon as the value it was
    /// started with is stale, so at most one worker ever pops.
    generation: AtomicU64,
}

impl MessageDispatcher {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(ReceivedMessage) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(DispatchInner {
                queue: WorkQueue::new(),
                handler: Arc::new(handler),
                worker: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn enqueue(&self, message: ReceivedMessage) {
        self.inner.queue.push(message);
    }

    /// A [`MessageHandler`] that enqueues into this dispatcher.  Messages are
    /// dropped once the dispatcher itself has been dropped.
    pub fn message_handler(&self) -> MessageHandler {
        let weak: Weak<DispatchInner> = Arc::downgrade(&self.inner);
        Arc::new(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.queue.push(message);
            }
        })
    }

    /// Starts the worker.  No-op if already running.
    ///
    /// # Errors
    ///
    /// [`NetError::Spawn`] if the worker thread cannot be created.
    pub fn start(&self) -> Result<(), NetError> {
        let mut worker = self.inner.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        self.inner.queue.resume();
        let inner = Arc::clone(&self.inner);
        let run = inner.generation.load(Ordering::Acquire);
        let handle = thread::Builder::new()
            .name("lanlink-dispatch".to_string())
            .spawn(move || {
                while inner.generation.load(Ordering::Acquire) == run {
                    let Some(message) = inner.queue.pop() else {
                        break;
                    };
                    (inner.handler)(message);
                }
                trace!("dispatch worker exiting");
            })
            .map_err(|source| NetError::Spawn {
                worker: "dispatch",
                source,
            })?;
        *worker = Some(handle);
        Ok(())
    }

    /// Stops the worker after the message it is currently handling.  Safe to
    /// call from inside the handler, where it does not wait; a `start` that
    /// follows spawns a fresh worker and the current one exits once the
    /// handler returns.
    pub fn stop(&self) {
        let handle = {
            let mut worker = self.inner.worker.lock();
            let Some(handle) = worker.take() else {
                return;
            };
            self.inner.generation.fetch_add(1, Ordering::AcqRel);
            self.inner.queue.halt();
            handle
        };
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.worker.lock().is_some()
    }

    /// Messages waiting to be handled.
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }
}

impl Drop for MessageDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
