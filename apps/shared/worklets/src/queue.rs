//! Home-thread message queues
//!
//! Every execution context is driven by exactly one thread. Work reaches that
//! thread through a [`MessageQueueThread`]: a single-consumer FIFO queue.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::thread::{self, JoinHandle, ThreadId};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// A unit of work posted to a queue
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Dispatch handle for a context's home thread
pub trait MessageQueueThread: Send + Sync {
    /// Queue a task and return immediately. Tasks run in the order they were queued.
    fn run_on_queue(&self, task: Task);

    /// Queue a task and block until it has run
    ///
    /// Runs the task inline when called from the queue's own thread.
    fn run_on_queue_sync(&self, task: Task);

    /// Stop accepting tasks, let queued ones finish and stop the thread
    fn quit_synchronous(&self);
}

/// A dedicated, named OS thread draining an unbounded task channel
pub struct DispatchThread {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl DispatchThread {
    /// Spawn the thread
    ///
    /// # Arguments
    /// * `name` - Thread name, also used in logs
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        let thread_name = name.clone();

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            debug!("Dispatch thread '{}' started", thread_name);
            while let Some(task) = receiver.blocking_recv() {
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!("Task panicked on dispatch thread '{}'", thread_name);
                }
            }
            debug!("Dispatch thread '{}' stopped", thread_name);
        })?;

        let thread_id = handle.thread().id();

        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
            thread_id,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the calling thread is this queue's thread
    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    fn send(&self, task: Task) -> bool {
        let sender = match self.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match sender {
            Some(sender) => sender.send(task).is_ok(),
            None => false,
        }
    }
}

impl MessageQueueThread for DispatchThread {
    fn run_on_queue(&self, task: Task) {
        if !self.send(task) {
            warn!("Dropping task posted to stopped dispatch thread '{}'", self.name);
        }
    }

    fn run_on_queue_sync(&self, task: Task) {
        if self.is_current_thread() {
            task();
            return;
        }

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let wrapped: Task = Box::new(move || {
            task();
            let _ = done_tx.send(());
        });

        if !self.send(wrapped) {
            warn!("Dropping task posted to stopped dispatch thread '{}'", self.name);
            return;
        }
        // An error means the task panicked and dropped the sender
        if done_rx.blocking_recv().is_err() {
            error!("Task on dispatch thread '{}' did not complete", self.name);
        }
    }

    fn quit_synchronous(&self) {
        match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(handle) = handle {
            // The last handle may be released by a task on this very thread
            if self.is_current_thread() {
                return;
            }
            if handle.join().is_err() {
                error!("Dispatch thread '{}' terminated abnormally", self.name);
            }
        }
    }
}

impl Drop for DispatchThread {
    fn drop(&mut self) {
        self.quit_synchronous();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_tasks_run_in_fifo_order() {
        let queue = DispatchThread::spawn("fifo").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let order = Arc::clone(&order);
            queue.run_on_queue(Box::new(move || order.lock().unwrap().push(i)));
        }
        queue.run_on_queue_sync(Box::new(|| {}));

        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_run_on_queue_sync_runs_on_queue_thread() {
        let queue = Arc::new(DispatchThread::spawn("sync").unwrap());
        let observed = Arc::new(Mutex::new(None));

        let inner = Arc::clone(&queue);
        let result = Arc::clone(&observed);
        queue.run_on_queue_sync(Box::new(move || {
            *result.lock().unwrap() = Some(inner.is_current_thread());
        }));

        assert_eq!(*observed.lock().unwrap(), Some(true));
    }

    #[test]
    fn test_nested_sync_call_runs_inline() {
        let queue = Arc::new(DispatchThread::spawn("nested").unwrap());
        let counter = Arc::new(AtomicUsize::new(0));

        let inner_queue = Arc::clone(&queue);
        let inner_counter = Arc::clone(&counter);
        queue.run_on_queue_sync(Box::new(move || {
            let counter = Arc::clone(&inner_counter);
            inner_queue.run_on_queue_sync(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
            inner_counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_task_does_not_stop_queue() {
        let queue = DispatchThread::spawn("panics").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        queue.run_on_queue(Box::new(|| panic!("task failure")));
        let c = Arc::clone(&counter);
        queue.run_on_queue_sync(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_quit_drains_and_rejects() {
        let queue = DispatchThread::spawn("quit").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let c = Arc::clone(&counter);
            queue.run_on_queue(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }
        queue.quit_synchronous();
        assert_eq!(counter.load(Ordering::SeqCst), 5);

        let c = Arc::clone(&counter);
        queue.run_on_queue(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}
