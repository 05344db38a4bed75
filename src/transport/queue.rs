use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;

enum Slot<T> {
    Item(T),
    /// Worker shutdown. Always the last entry once the queue is closed.
    Shutdown,
}

/// Thread-safe FIFO shared between the reactor and the worker.
///
/// The reactor only ever uses the non-blocking half (`push`, `try_pop`).
/// Workers block in [`WorkQueue::pop`]. Closing the queue enqueues a
/// shutdown sentinel behind the pending items; a reader that takes it puts
/// it back for the next reader and gets `None`.
pub struct WorkQueue<T> {
    tx: Sender<Slot<T>>,
    rx: Receiver<Slot<T>>,
    closed: Arc<Mutex<bool>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            tx,
            rx,
            closed: Arc::new(Mutex::new(false)),
        }
    }

    /// Append to the tail. Returns `false` (dropping `item`) when closed.
    pub fn push(&self, item: T) -> bool {
        // Held across the send so nothing lands behind the sentinel.
        let closed = self.closed.lock();
        if *closed {
            return false;
        }
        self.tx.send(Slot::Item(item)).is_ok()
    }

    /// Block until an item is available, or until the shutdown sentinel is
    /// reached.
    pub fn pop(&self) -> Option<T> {
        match self.rx.recv() {
            Ok(slot) => self.open_slot(slot),
            Err(_) => None,
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(slot) => self.open_slot(slot),
            Err(_) => None,
        }
    }

    fn open_slot(&self, slot: Slot<T>) -> Option<T> {
        match slot {
            Slot::Item(item) => Some(item),
            Slot::Shutdown => {
                let _ = self.tx.send(Slot::Shutdown);
                None
            }
        }
    }

    /// Stop accepting items and wake every blocked reader. Items already
    /// queued are still handed out.
    pub fn close(&self) {
        let mut closed = self.closed.lock();
        if !*closed {
            *closed = true;
            let _ = self.tx.send(Slot::Shutdown);
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Pending items, not counting the shutdown sentinel.
    pub fn len(&self) -> usize {
        self.rx.len().saturating_sub(usize::from(self.is_closed()))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let queue = WorkQueue::new();
        for i in 0..5 {
            assert!(queue.push(i));
        }
        let drained: Vec<_> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn blocking_pop_wakes_on_push() {
        let queue = WorkQueue::new();
        let reader = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.push("task");
        assert_eq!(reader.join().unwrap(), Some("task"));
    }

    #[test]
    fn close_wakes_all_readers_with_sentinel() {
        let queue: WorkQueue<u32> = WorkQueue::new();
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || queue.pop())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        queue.close();
        for reader in readers {
            assert_eq!(reader.join().unwrap(), None);
        }
    }

    #[test]
    fn closed_queue_drains_before_sentinel_and_rejects_pushes() {
        let queue = WorkQueue::new();
        queue.push(1);
        queue.close();
        assert!(queue.is_closed());
        assert!(!queue.push(2));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn polling_reader_leaves_sentinel_for_blocked_workers() {
        let queue: WorkQueue<u32> = WorkQueue::new();
        queue.close();
        assert_eq!(queue.try_pop(), None);
        assert_eq!(queue.try_pop(), None);
        assert!(queue.is_empty());

        let worker = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };
        assert_eq!(worker.join().unwrap(), None);
    }

    #[test]
    fn close_is_idempotent() {
        let queue = WorkQueue::new();
        queue.push(7);
        queue.close();
        queue.close();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some(7));
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let queue = WorkQueue::new();
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        queue.push(p * 1000 + i);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        assert_eq!(queue.len(), 1000);
    }
}
