use crate::agent::Agent;
use crate::tracker::CallStats;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use switchyard_bus::{handler_fn, MessageBus, SubscriptionId};
use switchyard_core::{
    ErrorClass, Message, MessageKind, SwitchyardError, SwitchyardResult,
};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Worker-pool sizing for an agent's inbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Messages handled concurrently by one agent.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Buffered inbox messages before the bus handler waits.
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_inbox_capacity() -> usize {
    256
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

/// Lifecycle of the runtime wrapper itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    /// Constructed, `initialize` not yet successful.
    Created,
    /// Initialized and accepting messages.
    Ready,
    /// Shut down.
    Stopped,
}

/// The most recent handling failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastError {
    pub message: String,
    pub class: ErrorClass,
    pub at: DateTime<Utc>,
}

/// Read-only metrics exposed to the health monitor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub processed: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
    pub last_error: Option<LastError>,
    #[serde(default)]
    pub external: Option<CallStats>,
}

struct Inbox {
    bus: MessageBus,
    topic: String,
    subscription: SubscriptionId,
    task: JoinHandle<()>,
}

/// Wraps an [`Agent`] with the behaviour every agent shares: idempotent
/// lifecycle, error containment, metrics, and a bounded inbox worker pool.
pub struct AgentRuntime {
    id: Uuid,
    agent: Arc<dyn Agent>,
    config: RuntimeConfig,
    state: Mutex<RuntimeState>,
    lifecycle: tokio::sync::Mutex<()>,
    processed: AtomicU64,
    errors: AtomicU64,
    total_micros: AtomicU64,
    last_error: Mutex<Option<LastError>>,
    inbox: Mutex<Option<Inbox>>,
}

impl AgentRuntime {
    pub fn new(id: Uuid, agent: Arc<dyn Agent>, config: RuntimeConfig) -> Self {
        Self {
            id,
            agent,
            config,
            state: Mutex::new(RuntimeState::Created),
            lifecycle: tokio::sync::Mutex::new(()),
            processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            total_micros: AtomicU64::new(0),
            last_error: Mutex::new(None),
            inbox: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        self.agent.name()
    }

    /// Identifier used as `sender` on messages this agent produces.
    pub fn sender(&self) -> String {
        format!("agent.{}", self.id)
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.lock()
    }

    /// Run the agent's init hook. Safe to call repeatedly, including after a
    /// failure or a shutdown.
    pub async fn initialize(&self) -> SwitchyardResult<()> {
        let _guard = self.lifecycle.lock().await;
        let result = AssertUnwindSafe(self.agent.initialize())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(SwitchyardError::Handler(format!(
                    "initialize panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });
        match result {
            Ok(()) => {
                *self.state.lock() = RuntimeState::Ready;
                info!(agent_id = %self.id, agent = %self.name(), "Agent initialized");
                Ok(())
            }
            Err(e) => {
                self.record_error(&e);
                warn!(agent_id = %self.id, error = %e, "Agent initialization failed");
                Err(e)
            }
        }
    }

    /// Handle one message. Never fails: handler errors and panics become an
    /// error-kind reply correlated to `message`.
    ///
    /// A request that names a `reply_to` topic always gets a reply; a handler
    /// returning `None` is acknowledged with a `null` payload.
    pub async fn process(&self, message: &Message) -> Option<Message> {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.agent.handle(message))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(SwitchyardError::Handler(format!(
                    "agent panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

        let micros = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);

        let wants_reply = message.kind == MessageKind::Request && message.reply_to.is_some();
        match outcome {
            Ok(Some(payload)) => Some(Message::response_to(message, self.sender(), payload)),
            Ok(None) if wants_reply => Some(Message::response_to(
                message,
                self.sender(),
                serde_json::Value::Null,
            )),
            Ok(None) => None,
            Err(e) => {
                self.record_error(&e);
                warn!(
                    agent_id = %self.id,
                    message_id = %message.id,
                    error = %e,
                    "Agent handler failed"
                );
                Some(Message::error_to(message, self.sender(), &e))
            }
        }
    }

    /// Probe the agent's liveness.
    pub async fn health_check(&self) -> SwitchyardResult<()> {
        AssertUnwindSafe(self.agent.health_check())
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(SwitchyardError::Handler("health check panicked".into())))
    }

    /// Subscribe the agent to `topic` on `bus` and process deliveries on a
    /// worker pool of `max_concurrency` tasks. Replies are published to the
    /// request's `reply_to` topic. Replaces any previous inbox.
    pub fn start_inbox(self: &Arc<Self>, bus: &MessageBus, topic: &str) -> SwitchyardResult<()> {
        self.stop_inbox();

        let (tx, mut rx) = mpsc::channel::<Arc<Message>>(self.config.inbox_capacity.max(1));
        let subscription = bus.subscribe(
            topic,
            handler_fn(move |msg: Arc<Message>| {
                let tx = tx.clone();
                async move {
                    tx.send(msg)
                        .await
                        .map_err(|_| SwitchyardError::Handler("agent inbox closed".into()))
                }
            }),
        )?;

        let runtime = Arc::clone(self);
        let reply_bus = bus.clone();
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let runtime = Arc::clone(&runtime);
                let bus = reply_bus.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let reply = runtime.process(&msg).await;
                    // Without a reply topic the reply would land back in this inbox.
                    match reply {
                        Some(reply) if msg.reply_to.is_some() => {
                            if let Err(e) = bus.publish(reply) {
                                warn!(agent_id = %runtime.id, error = %e, "Failed to publish reply");
                            }
                        }
                        Some(reply) => {
                            debug!(agent_id = %runtime.id, kind = %reply.kind, "Reply dropped, no reply_to");
                        }
                        None => {}
                    }
                });
            }
            debug!(agent_id = %runtime.id, "Inbox loop finished");
        });

        *self.inbox.lock() = Some(Inbox {
            bus: bus.clone(),
            topic: topic.to_string(),
            subscription,
            task,
        });
        debug!(agent_id = %self.id, topic = %topic, "Inbox started");
        Ok(())
    }

    /// Detach from the bus. Messages already in the inbox are still handled.
    pub fn stop_inbox(&self) {
        if let Some(inbox) = self.inbox.lock().take() {
            inbox.bus.unsubscribe(&inbox.topic, inbox.subscription);
            drop(inbox.task);
        }
    }

    /// Topic of the running inbox, if any.
    pub fn inbox_topic(&self) -> Option<String> {
        self.inbox.lock().as_ref().map(|i| i.topic.clone())
    }

    /// Shut the agent down. A second call is a no-op.
    pub async fn shutdown(&self) -> SwitchyardResult<()> {
        let _guard = self.lifecycle.lock().await;
        if *self.state.lock() == RuntimeState::Stopped {
            debug!(agent_id = %self.id, "Shutdown on stopped agent ignored");
            return Ok(());
        }
        self.stop_inbox();
        let result = AssertUnwindSafe(self.agent.shutdown())
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(SwitchyardError::Handler("shutdown panicked".into())));
        *self.state.lock() = RuntimeState::Stopped;
        if let Err(e) = &result {
            self.record_error(e);
            warn!(agent_id = %self.id, error = %e, "Agent shutdown reported an error");
        } else {
            info!(agent_id = %self.id, "Agent stopped");
        }
        result
    }

    pub fn metrics(&self) -> AgentMetrics {
        let processed = self.processed.load(Ordering::Relaxed);
        let avg_latency_ms = if processed == 0 {
            0.0
        } else {
            self.total_micros.load(Ordering::Relaxed) as f64 / processed as f64 / 1000.0
        };
        AgentMetrics {
            processed,
            errors: self.errors.load(Ordering::Relaxed),
            avg_latency_ms,
            last_error: self.last_error.lock().clone(),
            external: self.agent.external_calls().map(|t| t.stats()),
        }
    }

    fn record_error(&self, error: &SwitchyardError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(LastError {
            message: error.to_string(),
            class: error.class(),
            at: Utc::now(),
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use switchyard_bus::BusConfig;

    struct MockAgent {
        inits: AtomicU32,
        shutdowns: AtomicU32,
    }

    impl MockAgent {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inits: AtomicU32::new(0),
                shutdowns: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Agent for MockAgent {
        fn name(&self) -> &str {
            "mock"
        }

        async fn initialize(&self) -> SwitchyardResult<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn handle(&self, message: &Message) -> SwitchyardResult<Option<serde_json::Value>> {
            match message.payload["op"].as_str() {
                Some("echo") => Ok(Some(message.payload["value"].clone())),
                Some("fail") => Err(SwitchyardError::Handler("asked to fail".into())),
                Some("panic") => panic!("mock agent exploded"),
                _ => Ok(None),
            }
        }

        async fn shutdown(&self) -> SwitchyardResult<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn runtime(agent: Arc<MockAgent>) -> Arc<AgentRuntime> {
        Arc::new(AgentRuntime::new(
            Uuid::new_v4(),
            agent,
            RuntimeConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_initialize_is_retry_safe() {
        let agent = MockAgent::new();
        let rt = runtime(Arc::clone(&agent));
        assert_eq!(rt.state(), RuntimeState::Created);
        rt.initialize().await.unwrap();
        rt.initialize().await.unwrap();
        assert_eq!(rt.state(), RuntimeState::Ready);
        assert_eq!(agent.inits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_process_success() {
        let rt = runtime(MockAgent::new());
        let req = Message::request("agent.x", "test", json!({"op": "echo", "value": 42}));
        let reply = rt.process(&req).await.unwrap();
        assert_eq!(reply.kind, MessageKind::Response);
        assert_eq!(reply.payload, json!(42));
        assert_eq!(reply.correlation_id, Some(req.id));
        assert_eq!(rt.metrics().processed, 1);
        assert_eq!(rt.metrics().errors, 0);
    }

    #[tokio::test]
    async fn test_process_error_becomes_error_message() {
        let rt = runtime(MockAgent::new());
        let req = Message::request("agent.x", "test", json!({"op": "fail"}));
        let reply = rt.process(&req).await.unwrap();
        assert_eq!(reply.kind, MessageKind::Error);
        assert_eq!(reply.correlation_id, Some(req.id));
        let metrics = rt.metrics();
        assert_eq!(metrics.errors, 1);
        assert!(metrics
            .last_error
            .unwrap()
            .message
            .contains("asked to fail"));
    }

    #[tokio::test]
    async fn test_process_panic_is_contained() {
        let rt = runtime(MockAgent::new());
        let req = Message::request("agent.x", "test", json!({"op": "panic"}));
        let reply = rt.process(&req).await.unwrap();
        assert_eq!(reply.kind, MessageKind::Error);
        assert!(reply.payload["message"]
            .as_str()
            .unwrap()
            .contains("mock agent exploded"));
        assert_eq!(rt.metrics().errors, 1);
    }

    #[tokio::test]
    async fn test_none_without_reply_to_is_silent() {
        let rt = runtime(MockAgent::new());
        let req = Message::request("agent.x", "test", json!({"op": "noop"}));
        assert!(rt.process(&req).await.is_none());

        let req = req.with_reply_to("replies");
        let ack = rt.process(&req).await.unwrap();
        assert_eq!(ack.payload, serde_json::Value::Null);
        assert_eq!(ack.topic, "replies");
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let agent = MockAgent::new();
        let rt = runtime(Arc::clone(&agent));
        rt.initialize().await.unwrap();
        rt.shutdown().await.unwrap();
        rt.shutdown().await.unwrap();
        assert_eq!(rt.state(), RuntimeState::Stopped);
        assert_eq!(agent.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inbox_round_trip_over_bus() {
        let bus = MessageBus::new(BusConfig::default());
        bus.start().unwrap();
        let rt = runtime(MockAgent::new());
        rt.initialize().await.unwrap();
        rt.start_inbox(&bus, "agent.mock").unwrap();
        assert_eq!(rt.inbox_topic().as_deref(), Some("agent.mock"));

        let (tx, mut rx) = mpsc::channel(1);
        bus.subscribe(
            "replies",
            handler_fn(move |msg: Arc<Message>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(msg).await;
                    Ok::<(), SwitchyardError>(())
                }
            }),
        )
        .unwrap();

        let req = Message::request("agent.mock", "test", json!({"op": "echo", "value": "hi"}))
            .with_reply_to("replies");
        let req_id = req.id;
        bus.publish(req).unwrap();

        let reply = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.correlation_id, Some(req_id));
        assert_eq!(reply.payload, json!("hi"));

        rt.shutdown().await.unwrap();
        assert_eq!(bus.subscriber_count("agent.mock"), 0);
        bus.stop().await;
    }
}
