use crate::config::BusConfig;
use crate::dead_letter::{DeadLetter, DeadLetterLog, DeadLetterReason};
use crate::handler::MessageHandler;
use crate::queue::MessageQueue;
use chrono::Utc;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchyard_core::{Message, MessageKind, SwitchyardError, SwitchyardResult};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Handle returned by [`MessageBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// File under [`BusConfig::persist_dir`] holding the queue and dead letters.
pub const SNAPSHOT_FILE: &str = "bus-snapshot.json";

/// Delivery criteria a subscription applies on top of its topic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    /// Accepted kinds; empty accepts every kind.
    #[serde(default)]
    pub kinds: Vec<MessageKind>,
    /// Messages below this priority are not delivered.
    #[serde(default)]
    pub min_priority: Option<i32>,
}

impl SubscriptionFilter {
    pub fn kinds(kinds: impl IntoIterator<Item = MessageKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            min_priority: None,
        }
    }

    pub fn with_min_priority(mut self, priority: i32) -> Self {
        self.min_priority = Some(priority);
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        if self.min_priority.is_some_and(|min| message.priority < min) {
            return false;
        }
        self.kinds.is_empty() || self.kinds.contains(&message.kind)
    }
}

/// On-disk form of the undelivered state.
#[derive(Debug, Serialize, Deserialize)]
struct BusSnapshot {
    queued: Vec<Message>,
    dead_letters: Vec<DeadLetter>,
}

/// Lifecycle of the dispatch loop, as reported to health checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum BusHealth {
    /// Created; messages are queued but not yet dispatched.
    Idle,
    /// Dispatching.
    Healthy,
    /// Stopped on request.
    Stopped,
    /// The dispatch loop died; needs operator intervention.
    Failed { reason: String },
}

/// Point-in-time bus counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusMetrics {
    pub published: u64,
    pub delivered: u64,
    pub handler_failures: u64,
    pub dead_lettered: u64,
    pub dead_letters_dropped: u64,
    pub evicted: u64,
    pub expired: u64,
    pub queue_depth: usize,
    pub dead_letter_depth: usize,
    pub subscriptions: usize,
    pub avg_dispatch_latency_ms: f64,
}

/// Per-subscription delivery counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionStats {
    pub id: SubscriptionId,
    pub topic: String,
    pub delivered: u64,
    pub failed: u64,
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    filter: SubscriptionFilter,
    handler: Arc<dyn MessageHandler>,
    delivered: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

struct QueueState {
    queue: MessageQueue,
    dispatching: bool,
}

/// Ids of recently published messages, for the correlation invariant.
struct RecentIds {
    set: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn insert(&mut self, id: Uuid) {
        if self.set.insert(id) {
            self.order.push_back(id);
            while self.order.len() > self.capacity {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.set.contains(id)
    }
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    handler_failures: AtomicU64,
    dead_lettered: AtomicU64,
    evicted: AtomicU64,
    expired: AtomicU64,
    dispatched: AtomicU64,
    dispatch_micros: AtomicU64,
}

struct BusInner {
    config: BusConfig,
    state: Mutex<QueueState>,
    next_seq: AtomicU64,
    next_sub: AtomicU64,
    subscriptions: RwLock<HashMap<String, Vec<Subscription>>>,
    dead_letters: Mutex<DeadLetterLog>,
    published_ids: Mutex<RecentIds>,
    counters: Counters,
    health: Mutex<BusHealth>,
    wakeup: Notify,
    idle: Notify,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Async publish/subscribe bus with priority ordering and dead-letter log.
///
/// Messages are queued by `(priority desc, arrival asc)` and delivered by a
/// single dispatch loop. Every handler subscribed to the message's topic is
/// run concurrently; the loop waits for all of them before moving on, so
/// messages of equal priority on one topic arrive in publish order.
///
/// Cloning is cheap and yields a handle to the same bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Create a bus. Call [`start`](Self::start) to begin dispatching.
    pub fn new(config: BusConfig) -> Self {
        let inner = BusInner {
            state: Mutex::new(QueueState {
                queue: MessageQueue::new(config.capacity.max(1)),
                dispatching: false,
            }),
            next_seq: AtomicU64::new(1),
            next_sub: AtomicU64::new(1),
            subscriptions: RwLock::new(HashMap::new()),
            dead_letters: Mutex::new(DeadLetterLog::new(config.dead_letter_capacity)),
            published_ids: Mutex::new(RecentIds::new(config.correlation_window.max(1))),
            counters: Counters::default(),
            health: Mutex::new(BusHealth::Idle),
            wakeup: Notify::new(),
            idle: Notify::new(),
            supervisor: Mutex::new(None),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The configuration this bus was built with.
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Spawn the dispatch loop. Calling it on a running bus is a no-op.
    pub fn start(&self) -> SwitchyardResult<()> {
        {
            let mut health = self.inner.health.lock();
            match &*health {
                BusHealth::Healthy => return Ok(()),
                BusHealth::Stopped => {
                    return Err(SwitchyardError::Bus("bus has been stopped".into()))
                }
                BusHealth::Failed { reason } => {
                    return Err(SwitchyardError::Fatal(format!("bus failed: {reason}")))
                }
                BusHealth::Idle => {}
            }
            *health = BusHealth::Healthy;
        }

        let worker = tokio::spawn(dispatch_loop(Arc::clone(&self.inner)));
        let inner = Arc::clone(&self.inner);
        let supervisor = tokio::spawn(async move {
            if let Err(e) = worker.await {
                let reason = if e.is_panic() {
                    "dispatch loop panicked".to_string()
                } else {
                    format!("dispatch loop aborted: {e}")
                };
                error!(reason = %reason, "Message bus failed");
                *inner.health.lock() = BusHealth::Failed { reason };
                inner.idle.notify_waiters();
            }
        });
        *self.inner.supervisor.lock() = Some(supervisor);

        info!(capacity = self.inner.config.capacity, "Message bus started");
        Ok(())
    }

    /// Stop dispatching. Queued messages stay queued and, with a
    /// `persist_dir`, are written to the snapshot.
    pub async fn stop(&self) {
        {
            let mut health = self.inner.health.lock();
            if matches!(*health, BusHealth::Idle | BusHealth::Healthy) {
                *health = BusHealth::Stopped;
            }
        }
        self.inner.wakeup.notify_one();
        let supervisor = self.inner.supervisor.lock().take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        self.inner.idle.notify_waiters();
        if self.inner.config.persist_dir.is_some() {
            if let Err(e) = self.persist().await {
                error!(error = %e, "Failed to persist bus snapshot");
            }
        }
        info!("Message bus stopped");
    }

    /// Write queued messages and dead letters to `persist_dir`.
    ///
    /// No-op without a `persist_dir`.
    pub async fn persist(&self) -> SwitchyardResult<()> {
        let Some(path) = self.snapshot_path() else {
            return Ok(());
        };
        let snapshot = BusSnapshot {
            queued: self
                .inner
                .state
                .lock()
                .queue
                .snapshot()
                .into_iter()
                .map(|m| (*m).clone())
                .collect(),
            dead_letters: self.inner.dead_letters.lock().snapshot(),
        };
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(
            queued = snapshot.queued.len(),
            dead_letters = snapshot.dead_letters.len(),
            path = %path.display(),
            "Bus snapshot written"
        );
        Ok(())
    }

    /// Load a snapshot written by [`persist`](Self::persist): queued messages
    /// are re-enqueued in their delivery order and dead letters restored.
    ///
    /// Returns the number of re-enqueued messages. A missing snapshot is not
    /// an error; a corrupt one is.
    pub async fn restore(&self) -> SwitchyardResult<usize> {
        let Some(path) = self.snapshot_path() else {
            return Ok(0);
        };
        if !tokio::fs::try_exists(&path).await? {
            return Ok(0);
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let snapshot: BusSnapshot = serde_json::from_str(&data).map_err(|e| {
            SwitchyardError::Fatal(format!("corrupt bus snapshot {}: {e}", path.display()))
        })?;

        let restored = snapshot.queued.len();
        for message in snapshot.queued {
            self.inner.enqueue(message);
        }
        let letters = snapshot.dead_letters.len();
        self.inner.dead_letters.lock().restore(snapshot.dead_letters);
        tokio::fs::remove_file(&path).await?;
        info!(restored, dead_letters = letters, "Bus snapshot restored");
        Ok(restored)
    }

    fn snapshot_path(&self) -> Option<PathBuf> {
        self.inner
            .config
            .persist_dir
            .as_ref()
            .map(|dir| dir.join(SNAPSHOT_FILE))
    }

    /// Current dispatch-loop health.
    pub fn health(&self) -> BusHealth {
        self.inner.health.lock().clone()
    }

    /// Validate and enqueue a message; returns its delivery sequence number.
    ///
    /// Returns as soon as the message is queued. Delivery is best-effort and
    /// asynchronous.
    pub fn publish(&self, message: Message) -> SwitchyardResult<u64> {
        match &*self.inner.health.lock() {
            BusHealth::Stopped => return Err(SwitchyardError::Bus("bus is stopped".into())),
            BusHealth::Failed { reason } => {
                return Err(SwitchyardError::Fatal(format!("bus failed: {reason}")))
            }
            BusHealth::Idle | BusHealth::Healthy => {}
        }
        self.validate(&message)?;
        Ok(self.inner.enqueue(message))
    }

    fn validate(&self, message: &Message) -> SwitchyardResult<()> {
        if message.topic.trim().is_empty() {
            return Err(SwitchyardError::Validation(
                "message topic must not be empty".into(),
            ));
        }
        if let Some(correlation) = message.correlation_id {
            if !self.inner.published_ids.lock().contains(&correlation) {
                return Err(SwitchyardError::Validation(format!(
                    "correlation id {correlation} does not reference a published message"
                )));
            }
        }
        let size = message.size_bytes();
        if size > self.inner.config.max_message_bytes {
            return Err(SwitchyardError::Validation(format!(
                "message size {size} bytes exceeds limit of {} bytes",
                self.inner.config.max_message_bytes
            )));
        }
        Ok(())
    }

    /// Register a handler for every message on a topic.
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> SwitchyardResult<SubscriptionId> {
        self.subscribe_filtered(topic, handler, SubscriptionFilter::default())
    }

    /// Register a handler for the messages on a topic that pass `filter`.
    pub fn subscribe_filtered(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        filter: SubscriptionFilter,
    ) -> SwitchyardResult<SubscriptionId> {
        let topic = topic.into();
        if topic.trim().is_empty() {
            return Err(SwitchyardError::Validation(
                "subscription topic must not be empty".into(),
            ));
        }
        let id = SubscriptionId(self.inner.next_sub.fetch_add(1, Ordering::Relaxed));
        let subscription = Subscription {
            id,
            filter,
            handler,
            delivered: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
        };
        debug!(topic = %topic, subscription = %id, "Subscribed");
        self.inner
            .subscriptions
            .write()
            .entry(topic)
            .or_default()
            .push(subscription);
        Ok(id)
    }

    /// Remove a handler. Unknown ids are ignored.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        let mut subs = self.inner.subscriptions.write();
        if let Some(list) = subs.get_mut(topic) {
            list.retain(|s| s.id != id);
            if list.is_empty() {
                subs.remove(topic);
            }
            debug!(topic = %topic, subscription = %id, "Unsubscribed");
        }
    }

    /// Number of handlers on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .subscriptions
            .read()
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Delivery counters for every live subscription.
    pub fn subscription_stats(&self) -> Vec<SubscriptionStats> {
        let subs = self.inner.subscriptions.read();
        let mut stats: Vec<SubscriptionStats> = subs
            .iter()
            .flat_map(|(topic, list)| {
                list.iter().map(move |s| SubscriptionStats {
                    id: s.id,
                    topic: topic.clone(),
                    delivered: s.delivered.load(Ordering::Relaxed),
                    failed: s.failed.load(Ordering::Relaxed),
                })
            })
            .collect();
        stats.sort_by_key(|s| s.id);
        stats
    }

    /// Snapshot of the dead-letter log, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.lock().snapshot()
    }

    /// Re-enqueue up to `limit` dead letters (all when `None`), oldest first.
    pub fn replay_dead_letters(&self, limit: Option<usize>) -> usize {
        let letters = self.inner.dead_letters.lock().take(limit);
        let count = letters.len();
        for letter in letters {
            self.inner.enqueue(letter.message);
        }
        if count > 0 {
            info!(count, "Replayed dead letters");
        }
        count
    }

    /// Current counters.
    pub fn metrics(&self) -> BusMetrics {
        let c = &self.inner.counters;
        let dispatched = c.dispatched.load(Ordering::Relaxed);
        let avg = if dispatched == 0 {
            0.0
        } else {
            c.dispatch_micros.load(Ordering::Relaxed) as f64 / dispatched as f64 / 1000.0
        };
        let (dead_letter_depth, dead_letters_dropped) = {
            let log = self.inner.dead_letters.lock();
            (log.len(), log.dropped())
        };
        BusMetrics {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            dead_letters_dropped,
            evicted: c.evicted.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            queue_depth: self.inner.state.lock().queue.len(),
            dead_letter_depth,
            subscriptions: self.inner.subscriptions.read().values().map(Vec::len).sum(),
            avg_dispatch_latency_ms: avg,
        }
    }

    /// Resolve once the queue is empty and nothing is being dispatched.
    ///
    /// Returns immediately when the bus is not running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    fn is_idle(&self) -> bool {
        if *self.inner.health.lock() != BusHealth::Healthy {
            return true;
        }
        let state = self.inner.state.lock();
        state.queue.is_empty() && !state.dispatching
    }
}

impl BusInner {
    fn enqueue(&self, message: Message) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let id = message.id;
        let topic = message.topic.clone();
        let evicted = self.state.lock().queue.push(seq, Arc::new(message));
        self.published_ids.lock().insert(id);
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        debug!(message_id = %id, topic = %topic, seq, "Published");

        if let Some(dropped) = evicted {
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            warn!(
                message_id = %dropped.id,
                topic = %dropped.topic,
                priority = dropped.priority,
                "Queue over capacity, evicting message"
            );
            self.dead_letter(&dropped, DeadLetterReason::Evicted);
        }
        self.wakeup.notify_one();
        seq
    }

    fn dead_letter(&self, message: &Message, reason: DeadLetterReason) {
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.dead_letters.lock().record(message.clone(), reason);
    }

    fn is_running(&self) -> bool {
        *self.health.lock() == BusHealth::Healthy
    }

    async fn dispatch(&self, seq: u64, message: Arc<Message>) {
        let started = Instant::now();

        if message.is_expired(Utc::now()) {
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            warn!(message_id = %message.id, topic = %message.topic, "Message expired before delivery");
            self.dead_letter(&message, DeadLetterReason::Expired);
            return;
        }

        let subscribers: Vec<Subscription> = self
            .subscriptions
            .read()
            .get(&message.topic)
            .map(|list| {
                list.iter()
                    .filter(|s| s.filter.matches(&message))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if subscribers.is_empty() {
            warn!(message_id = %message.id, topic = %message.topic, "No subscribers, dead-lettering");
            self.dead_letter(&message, DeadLetterReason::NoSubscribers);
            return;
        }

        let timeout = Duration::from_millis(self.config.handler_timeout_ms);
        let mut handlers = JoinSet::new();
        for sub in subscribers {
            let msg = Arc::clone(&message);
            handlers.spawn(async move {
                let call = AssertUnwindSafe(sub.handler.handle(msg)).catch_unwind();
                let outcome = match tokio::time::timeout(timeout, call).await {
                    Ok(Ok(Ok(()))) => Ok(()),
                    Ok(Ok(Err(e))) => Err(e.to_string()),
                    Ok(Err(_)) => Err("handler panicked".to_string()),
                    Err(_) => Err(format!("handler exceeded {}ms", timeout.as_millis())),
                };
                (sub, outcome)
            });
        }

        while let Some(joined) = handlers.join_next().await {
            match joined {
                Ok((sub, Ok(()))) => {
                    sub.delivered.fetch_add(1, Ordering::Relaxed);
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok((sub, Err(reason))) => {
                    sub.failed.fetch_add(1, Ordering::Relaxed);
                    self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        message_id = %message.id,
                        topic = %message.topic,
                        subscription = %sub.id,
                        error = %reason,
                        "Handler failed"
                    );
                }
                Err(e) => {
                    self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(message_id = %message.id, error = %e, "Handler task aborted");
                }
            }
        }

        let micros = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        self.counters
            .dispatch_micros
            .fetch_add(micros, Ordering::Relaxed);
        debug!(message_id = %message.id, seq, micros, "Dispatched");
    }
}

async fn dispatch_loop(inner: Arc<BusInner>) {
    loop {
        if !inner.is_running() {
            break;
        }

        let next = {
            let mut state = inner.state.lock();
            let next = state.queue.pop();
            state.dispatching = next.is_some();
            next
        };

        match next {
            Some((seq, message)) => {
                inner.dispatch(seq, message).await;
                let idle = {
                    let mut state = inner.state.lock();
                    state.dispatching = false;
                    state.queue.is_empty()
                };
                if idle {
                    inner.idle.notify_waiters();
                }
            }
            None => {
                inner.idle.notify_waiters();
                inner.wakeup.notified().await;
            }
        }
    }
    inner.state.lock().dispatching = false;
    inner.idle.notify_waiters();
}
