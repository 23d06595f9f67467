//! Single-producer, multi-consumer fan-out with per-observer buffers.
//!
//! Publishing never blocks: each subscriber owns a bounded queue and, when it
//! is full, the oldest droppable item is discarded. Items that are not
//! droppable are always enqueued, even past capacity. The first terminal
//! item closes the fan-out; late subscribers receive only that item.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::Notify;
use tokio_stream::Stream;

/// Items carried by a [`Fanout`].
pub trait FanoutItem: Clone + Send + 'static {
    fn is_droppable(&self) -> bool;
    fn is_terminal(&self) -> bool;
}

struct Queue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    closed: AtomicBool,
    /// `None` for lossless subscribers.
    capacity: Option<usize>,
    dropped: AtomicU64,
}

impl<T: FanoutItem> Queue<T> {
    fn new(capacity: Option<usize>) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, item: T) {
        {
            let mut items = lock(&self.items);
            if let Some(capacity) = self.capacity {
                if items.len() >= capacity {
                    if let Some(pos) = items.iter().position(|i| i.is_droppable()) {
                        let _ = items.remove(pos);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            items.push_back(item);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

struct FanoutState<T> {
    subscribers: Vec<Weak<Queue<T>>>,
    terminal: Option<T>,
}

pub struct Fanout<T> {
    state: Mutex<FanoutState<T>>,
    capacity: usize,
}

impl<T: FanoutItem> Fanout<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(FanoutState {
                subscribers: Vec::new(),
                terminal: None,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Deliver an item to every live subscriber. Returns `false` if the
    /// fan-out was already closed and the item was discarded.
    pub fn publish(&self, item: T) -> bool {
        let mut state = lock(&self.state);
        if state.terminal.is_some() {
            return false;
        }
        let terminal = item.is_terminal();
        state.subscribers.retain(|weak| match weak.upgrade() {
            Some(queue) => {
                queue.push(item.clone());
                if terminal {
                    queue.close();
                }
                true
            }
            None => false,
        });
        if terminal {
            state.terminal = Some(item);
            state.subscribers.clear();
        }
        true
    }

    /// Bounded subscription from this point forward (no replay).
    pub fn subscribe(&self) -> Subscription<T> {
        self.attach(Some(self.capacity))
    }

    /// Unbounded subscription; nothing is ever dropped.
    pub fn subscribe_lossless(&self) -> Subscription<T> {
        self.attach(None)
    }

    fn attach(&self, capacity: Option<usize>) -> Subscription<T> {
        let queue = Arc::new(Queue::new(capacity));
        let mut state = lock(&self.state);
        match &state.terminal {
            Some(terminal) => {
                queue.push(terminal.clone());
                queue.close();
            }
            None => state.subscribers.push(Arc::downgrade(&queue)),
        }
        Subscription { queue }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).terminal.is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.state)
            .subscribers
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

/// One observer's view of a [`Fanout`].
pub struct Subscription<T> {
    queue: Arc<Queue<T>>,
}

impl<T: FanoutItem> Subscription<T> {
    /// Next item, or `None` once the stream has ended and been drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            if let Some(item) = lock(&self.queue.items).pop_front() {
                return Some(item);
            }
            if self.queue.closed.load(Ordering::SeqCst) {
                // Re-check: an item may have landed between pop and close.
                return lock(&self.queue.items).pop_front();
            }
            self.queue.notify.notified().await;
        }
    }

    /// Items discarded because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn into_stream(mut self) -> impl Stream<Item = T> + Send {
        async_stream::stream! {
            while let Some(item) = self.recv().await {
                yield item;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[derive(Debug, Clone, PartialEq)]
    enum Item {
        Chunk(u32),
        Pinned(u32),
        End,
    }

    impl FanoutItem for Item {
        fn is_droppable(&self) -> bool {
            matches!(self, Item::Chunk(_))
        }
        fn is_terminal(&self) -> bool {
            matches!(self, Item::End)
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_items_in_order() {
        let fanout = Fanout::new(16);
        let mut a = fanout.subscribe();
        let mut b = fanout.subscribe();
        fanout.publish(Item::Chunk(1));
        fanout.publish(Item::Chunk(2));
        fanout.publish(Item::End);

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.recv().await, Some(Item::Chunk(1)));
            assert_eq!(sub.recv().await, Some(Item::Chunk(2)));
            assert_eq!(sub.recv().await, Some(Item::End));
            assert_eq!(sub.recv().await, None);
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_no_replay() {
        let fanout = Fanout::new(16);
        fanout.publish(Item::Chunk(1));
        let mut late = fanout.subscribe();
        fanout.publish(Item::Chunk(2));
        fanout.publish(Item::End);
        let seen: Vec<_> = late.drain().await;
        assert_eq!(seen, vec![Item::Chunk(2), Item::End]);
    }

    #[tokio::test]
    async fn test_subscribe_after_close_yields_terminal_only() {
        let fanout = Fanout::new(16);
        fanout.publish(Item::Chunk(1));
        fanout.publish(Item::End);
        assert!(!fanout.publish(Item::Chunk(2)));
        let seen: Vec<_> = fanout.subscribe().into_stream().collect().await;
        assert_eq!(seen, vec![Item::End]);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_droppable_only() {
        let fanout = Fanout::new(3);
        let mut slow = fanout.subscribe();
        let mut lossless = fanout.subscribe_lossless();
        fanout.publish(Item::Pinned(0));
        fanout.publish(Item::Chunk(1));
        fanout.publish(Item::Chunk(2));
        fanout.publish(Item::Chunk(3));
        fanout.publish(Item::Pinned(4));
        fanout.publish(Item::End);

        let seen = slow.drain().await;
        assert_eq!(seen, vec![Item::Pinned(0), Item::Pinned(4), Item::End]);
        assert_eq!(slow.dropped(), 3);
        assert_eq!(lossless.dropped(), 0);
        let mut count = 0;
        while lossless.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 6);
    }

    #[tokio::test]
    async fn test_waiting_subscriber_is_woken() {
        let fanout = Arc::new(Fanout::new(4));
        let mut sub = fanout.subscribe();
        let producer = fanout.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            producer.publish(Item::Chunk(7));
            producer.publish(Item::End);
        });
        assert_eq!(sub.recv().await, Some(Item::Chunk(7)));
        assert_eq!(sub.recv().await, Some(Item::End));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let fanout = Fanout::new(4);
        let sub = fanout.subscribe();
        assert_eq!(fanout.subscriber_count(), 1);
        drop(sub);
        fanout.publish(Item::Chunk(1));
        assert_eq!(fanout.subscriber_count(), 0);
    }

    impl Subscription<Item> {
        async fn drain(&mut self) -> Vec<Item> {
            let mut out = Vec::new();
            while let Some(item) = self.recv().await {
                out.push(item);
            }
            out
        }
    }
}
