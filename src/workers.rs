//! Priority work queue and worker pool backed by real OS threads, not
//! cooperatively scheduled tasks: segment encoding and backend I/O must
//! not be starved by an unrelated async task hogging the runtime.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
}

type WorkItem = Box<dyn FnOnce() + Send + 'static>;

struct Queues {
    lanes: [VecDeque<WorkItem>; 3],
    blocked: bool,
}

impl Queues {
    fn lane(&mut self, priority: Priority) -> &mut VecDeque<WorkItem> {
        &mut self.lanes[priority as usize]
    }

    fn is_empty(&self) -> bool {
        self.lanes.iter().all(|l| l.is_empty())
    }

    fn pop_highest(&mut self) -> Option<WorkItem> {
        for lane in self.lanes.iter_mut().rev() {
            if let Some(item) = lane.pop_front() {
                return Some(item);
            }
        }
        None
    }
}

pub struct WorkQueue {
    queues: Mutex<Queues>,
    work_available: Condvar,
    queue_empty: Condvar,
}

impl WorkQueue {
    pub fn new() -> Self {
        WorkQueue {
            queues: Mutex::new(Queues {
                lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                blocked: false,
            }),
            work_available: Condvar::new(),
            queue_empty: Condvar::new(),
        }
    }

    pub fn enqueue(&self, item: WorkItem, priority: Priority) {
        let mut queues = self.queues.lock();
        queues.lane(priority).push_back(item);
        self.work_available.notify_one();
    }

    /// Blocks until a work item is available or the queue is closed
    /// (`blocked` with nothing left), returning `None` in the latter
    /// case.
    pub fn dequeue(&self) -> Option<WorkItem> {
        let mut queues = self.queues.lock();
        loop {
            if let Some(item) = queues.pop_highest() {
                if queues.is_empty() {
                    self.queue_empty.notify_all();
                }
                return Some(item);
            }
            if queues.blocked {
                return None;
            }
            self.work_available.wait(&mut queues);
        }
    }

    pub fn clear(&self) {
        let mut queues = self.queues.lock();
        for lane in queues.lanes.iter_mut() {
            lane.clear();
        }
        self.queue_empty.notify_all();
    }

    /// Stops accepting new work conceptually (callers should stop
    /// calling `enqueue`) and wakes every blocked worker so they can
    /// observe the queue draining to empty.
    pub fn block(&self, drop_queue: bool) {
        let mut queues = self.queues.lock();
        queues.blocked = true;
        if drop_queue {
            for lane in queues.lanes.iter_mut() {
                lane.clear();
            }
        }
        self.work_available.notify_all();
        if queues.is_empty() {
            self.queue_empty.notify_all();
        }
    }

    pub fn wait_empty(&self) {
        let mut queues = self.queues.lock();
        while !queues.is_empty() {
            self.queue_empty.wait(&mut queues);
        }
    }

    pub fn len(&self) -> usize {
        self.queues.lock().lanes.iter().map(|l| l.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-size pool of OS threads draining one `WorkQueue`.
pub struct WorkerPool {
    queue: Arc<WorkQueue>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(num_workers: usize, name: &'static str) -> Self {
        let queue = Arc::new(WorkQueue::new());
        let closed = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(num_workers);

        for idx in 0..num_workers {
            let queue = queue.clone();
            let closed = closed.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{idx}"))
                .spawn(move || {
                    while !closed.load(Ordering::SeqCst) {
                        match queue.dequeue() {
                            Some(item) => item(),
                            None => break,
                        }
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        WorkerPool {
            queue,
            handles: Mutex::new(handles),
            closed,
        }
    }

    pub fn submit(&self, priority: Priority, work: impl FnOnce() + Send + 'static) {
        self.queue.enqueue(Box::new(work), priority);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn worker_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Closes the pool. With `drop_queue` false, waits for queued work
    /// to drain before stopping workers; with it true, discards
    /// anything still queued.
    pub fn close(&self, drop_queue: bool) {
        self.closed.store(true, Ordering::SeqCst);
        if !drop_queue {
            self.queue.wait_empty();
        }
        self.queue.block(drop_queue);

        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn high_priority_drains_before_low() {
        let queue = WorkQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        queue.enqueue(Box::new(move || o1.lock().push("low")), Priority::Low);
        let o2 = order.clone();
        queue.enqueue(Box::new(move || o2.lock().push("high")), Priority::High);

        queue.dequeue().unwrap()();
        queue.dequeue().unwrap()();
        assert_eq!(*order.lock(), vec!["high", "low"]);
    }

    #[test]
    fn worker_pool_processes_submitted_work() {
        let pool = WorkerPool::new(2, "test-worker");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.submit(Priority::Normal, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.close(false);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn dequeue_unblocks_on_close_with_empty_queue() {
        let queue = Arc::new(WorkQueue::new());
        let q = queue.clone();
        let handle = std::thread::spawn(move || q.dequeue().is_none());
        std::thread::sleep(Duration::from_millis(20));
        queue.block(false);
        assert!(handle.join().unwrap());
    }
}
