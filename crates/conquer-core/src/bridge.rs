//! FIFO shared between worker threads and the network event loop.
//!
//! [`BridgeQueue`] exposes the same queue through two faces:
//!
//! - blocking [`get`](BridgeQueue::get) / [`put`](BridgeQueue::put) /
//!   [`join`](BridgeQueue::join) for ordinary OS threads
//! - awaitable [`get_async`](BridgeQueue::get_async) /
//!   [`put_async`](BridgeQueue::put_async) / [`join_async`](BridgeQueue::join_async)
//!   for tasks on the event loop, which never block the loop's thread
//!
//! Consumers call [`task_done`](BridgeQueue::task_done) once an item has been
//! fully handled; `join` waits until every item put so far has been marked done.
//!
//! # Usage
//!
//! ```rust,ignore
//! let queue = Arc::new(BridgeQueue::new());
//! // worker thread
//! queue.put(report);
//! // event loop
//! while let Some(report) = queue.get_async().await {
//!     transmit(report).await;
//!     queue.task_done();
//! }
//! ```

use std::time::Duration;

use tokio::sync::watch;

/// Multi-producer, multi-consumer FIFO with blocking and async faces.
#[derive(Debug)]
pub struct BridgeQueue<T> {
    tx: flume::Sender<T>,
    rx: flume::Receiver<T>,
    unfinished: watch::Sender<usize>,
}

impl<T> Default for BridgeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BridgeQueue<T> {
    /// Unbounded queue: `put` never blocks.
    #[must_use]
    pub fn new() -> Self {
        Self::from_channel(flume::unbounded())
    }

    /// Bounded queue: `put` blocks (and `put_async` suspends) while full.
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        Self::from_channel(flume::bounded(capacity))
    }

    fn from_channel((tx, rx): (flume::Sender<T>, flume::Receiver<T>)) -> Self {
        let (unfinished, _) = watch::channel(0);
        Self { tx, rx, unfinished }
    }

    /// Enqueue from a worker thread, blocking while a bounded queue is full.
    pub fn put(&self, item: T) {
        self.unfinished.send_modify(|n| *n += 1);
        if self.tx.send(item).is_err() {
            self.task_done();
        }
    }

    /// Enqueue from the event loop, suspending while a bounded queue is full.
    pub async fn put_async(&self, item: T) {
        self.unfinished.send_modify(|n| *n += 1);
        if self.tx.send_async(item).await.is_err() {
            self.task_done();
        }
    }

    /// Block the calling thread until an item is available.
    ///
    /// Returns `None` only if the channel is disconnected, which cannot happen
    /// while the queue itself is alive.
    pub fn get(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// Like [`get`](Self::get) but gives up after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Suspend the calling task until an item is available.
    pub async fn get_async(&self) -> Option<T> {
        self.rx.recv_async().await.ok()
    }

    /// Take an item if one is immediately available.
    pub fn try_get(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Mark one previously taken item as fully handled.
    pub fn task_done(&self) {
        self.unfinished.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Items put but not yet marked done.
    pub fn unfinished(&self) -> usize {
        *self.unfinished.borrow()
    }

    /// Block the calling thread until every item put so far is marked done.
    pub fn join(&self) {
        futures::executor::block_on(self.join_async());
    }

    /// Suspend the calling task until every item put so far is marked done.
    pub async fn join_async(&self) {
        let mut rx = self.unfinished.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Items currently waiting in the queue.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order_on_blocking_face() {
        let queue = BridgeQueue::new();
        for i in 0..5 {
            queue.put(i);
        }
        let drained: Vec<_> = (0..5).filter_map(|_| queue.get()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn get_timeout_returns_none_when_empty() {
        let queue: BridgeQueue<u8> = BridgeQueue::new();
        assert_eq!(queue.get_timeout(Duration::from_millis(10)), None);
        assert_eq!(queue.try_get(), None);
    }

    #[test]
    fn blocking_get_wakes_on_put_from_other_thread() {
        let queue = Arc::new(BridgeQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.get())
        };
        thread::sleep(Duration::from_millis(20));
        queue.put("batch");
        assert_eq!(consumer.join().unwrap(), Some("batch"));
    }

    #[tokio::test]
    async fn async_face_receives_items_put_by_threads() {
        let queue = Arc::new(BridgeQueue::new());
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..3 {
                    queue.put(i);
                }
            })
        };
        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(queue.get_async().await.unwrap());
        }
        producer.join().unwrap();
        assert_eq!(received, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn join_async_waits_for_task_done() {
        let queue = Arc::new(BridgeQueue::new());
        queue.put_async(1).await;
        queue.put_async(2).await;
        assert_eq!(queue.unfinished(), 2);

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                while queue.unfinished() > 0 {
                    let _ = queue.get_async().await;
                    tokio::task::yield_now().await;
                    queue.task_done();
                }
            })
        };
        queue.join_async().await;
        assert_eq!(queue.unfinished(), 0);
        consumer.await.unwrap();
    }

    #[test]
    fn blocking_join_returns_once_drained() {
        let queue = Arc::new(BridgeQueue::new());
        queue.put(1);
        let worker = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                let _ = queue.get();
                queue.task_done();
            })
        };
        queue.join();
        assert_eq!(queue.unfinished(), 0);
        worker.join().unwrap();
    }

    #[test]
    fn join_on_empty_queue_returns_immediately() {
        let queue: BridgeQueue<()> = BridgeQueue::new();
        queue.join();
    }

    #[test]
    fn task_done_never_underflows() {
        let queue: BridgeQueue<()> = BridgeQueue::new();
        queue.task_done();
        assert_eq!(queue.unfinished(), 0);
    }

    #[tokio::test]
    async fn bounded_put_async_suspends_until_space() {
        let queue = Arc::new(BridgeQueue::bounded(1));
        queue.put_async(1).await;
        let pending = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.put_async(2).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get_async().await, Some(1));
        pending.await.unwrap();
        assert_eq!(queue.get_async().await, Some(2));
    }
}
