//! 事件通知中心
//!
//! 生产者（I/O 线程、Mux 生命周期）与消费者（UI 桥接、工具适配器）之间的发布/订阅层。
//!
//! 背压策略：每个订阅者拥有独立的无界通道和一个在途计数。当在途数量达到容量上限时，
//! 新的 `PaneOutput` 事件对该订阅者丢弃（并计数），其余生命周期事件始终入队。
//! 因此发布方永远不会阻塞，退出等事件不会丢失，同一订阅者看到的顺序与发布顺序一致。

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::mux::MuxNotification;

pub type SubscriberId = usize;

#[derive(Debug, Default)]
struct QueueStats {
    pending: AtomicUsize,
    dropped: AtomicU64,
    overflowing: AtomicBool,
}

struct Subscriber {
    sender: Sender<MuxNotification>,
    stats: Arc<QueueStats>,
}

struct NotifierInner {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    next_subscriber_id: AtomicUsize,
    capacity: usize,
}

/// 发布/订阅中心，可廉价克隆
#[derive(Clone)]
pub struct EventNotifier {
    inner: Arc<NotifierInner>,
}

impl EventNotifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                subscribers: RwLock::new(HashMap::new()),
                next_subscriber_id: AtomicUsize::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn subscribe(&self) -> EventStream {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = unbounded();
        let stats = Arc::new(QueueStats::default());

        self.inner.subscribers.write().insert(
            id,
            Subscriber {
                sender,
                stats: Arc::clone(&stats),
            },
        );
        debug!("添加订阅者: {}", id);

        EventStream {
            id,
            receiver,
            stats,
            notifier: Arc::downgrade(&self.inner),
        }
    }

    pub fn unsubscribe(&self, subscriber_id: SubscriberId) -> bool {
        unsubscribe_inner(&self.inner, subscriber_id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// 发送通知给所有订阅者，不会阻塞
    pub fn publish(&self, notification: MuxNotification) {
        let mut disconnected = Vec::new();

        {
            let subscribers = self.inner.subscribers.read();
            for (&subscriber_id, subscriber) in subscribers.iter() {
                let stats = &subscriber.stats;

                if notification.is_droppable()
                    && stats.pending.load(Ordering::Acquire) >= self.inner.capacity
                {
                    stats.dropped.fetch_add(1, Ordering::Relaxed);
                    if !stats.overflowing.swap(true, Ordering::Relaxed) {
                        warn!(
                            "订阅者 {} 积压达到上限 {}，开始丢弃输出事件",
                            subscriber_id, self.inner.capacity
                        );
                    }
                    continue;
                }

                stats.pending.fetch_add(1, Ordering::AcqRel);
                if subscriber.sender.send(notification.clone()).is_err() {
                    stats.pending.fetch_sub(1, Ordering::AcqRel);
                    disconnected.push(subscriber_id);
                } else {
                    trace!("订阅者 {} 收到 {}", subscriber_id, notification.event_name());
                }
            }
        }

        // 清理已断开的订阅者
        if !disconnected.is_empty() {
            let mut subscribers = self.inner.subscribers.write();
            for subscriber_id in disconnected {
                subscribers.remove(&subscriber_id);
                debug!("清理已断开的订阅者: {}", subscriber_id);
            }
        }
    }

    pub fn clear(&self) {
        let mut subscribers = self.inner.subscribers.write();
        let count = subscribers.len();
        subscribers.clear();
        debug!("清理了 {} 个订阅者", count);
    }
}

fn unsubscribe_inner(inner: &NotifierInner, subscriber_id: SubscriberId) -> bool {
    let removed = inner.subscribers.write().remove(&subscriber_id).is_some();
    if removed {
        debug!("移除订阅者: {}", subscriber_id);
    }
    removed
}

impl std::fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventNotifier")
            .field("subscriber_count", &self.subscriber_count())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

/// 单个订阅者的事件流；被丢弃时自动退订
pub struct EventStream {
    id: SubscriberId,
    receiver: Receiver<MuxNotification>,
    stats: Arc<QueueStats>,
    notifier: Weak<NotifierInner>,
}

impl EventStream {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// 阻塞等待下一个事件；通知中心关闭或已退订且队列为空时返回 `None`
    pub fn recv(&self) -> Option<MuxNotification> {
        self.receiver.recv().ok().map(|n| self.on_received(n))
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<MuxNotification, RecvTimeoutError> {
        self.receiver
            .recv_timeout(timeout)
            .map(|n| self.on_received(n))
    }

    pub fn try_recv(&self) -> Result<MuxNotification, TryRecvError> {
        self.receiver.try_recv().map(|n| self.on_received(n))
    }

    /// 取出当前已排队的全部事件
    pub fn drain(&self) -> Vec<MuxNotification> {
        let mut events = Vec::new();
        while let Ok(notification) = self.try_recv() {
            events.push(notification);
        }
        events
    }

    pub fn iter(&self) -> impl Iterator<Item = MuxNotification> + '_ {
        std::iter::from_fn(move || self.recv())
    }

    /// 因积压被丢弃的输出事件数量
    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.stats.pending.load(Ordering::Acquire)
    }

    pub fn unsubscribe(&self) -> bool {
        match self.notifier.upgrade() {
            Some(inner) => unsubscribe_inner(&inner, self.id),
            None => false,
        }
    }

    fn on_received(&self, notification: MuxNotification) -> MuxNotification {
        let previous = self.stats.pending.fetch_sub(1, Ordering::AcqRel);
        if previous <= self.low_watermark() {
            self.stats.overflowing.store(false, Ordering::Relaxed);
        }
        notification
    }

    fn low_watermark(&self) -> usize {
        self.notifier
            .upgrade()
            .map(|inner| inner.capacity / 2)
            .unwrap_or(0)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(inner) = self.notifier.upgrade() {
            unsubscribe_inner(&inner, self.id);
        }
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("id", &self.id)
            .field("pending", &self.pending())
            .field("dropped", &self.dropped())
            .finish()
    }
}
