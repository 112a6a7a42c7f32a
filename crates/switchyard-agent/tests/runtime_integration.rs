//! Agent runtime behaviour as seen from the bus.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchyard_agent::*;
use switchyard_bus::{handler_fn, BusConfig, MessageBus};
use switchyard_core::{ErrorClass, Message, MessageKind, SwitchyardError, SwitchyardResult};
use tokio::sync::mpsc;
use uuid::Uuid;

struct SlowAgent {
    calls: AtomicU32,
    tracker: CallTracker,
}

#[async_trait]
impl Agent for SlowAgent {
    fn name(&self) -> &str {
        "slow"
    }

    async fn handle(&self, message: &Message) -> SwitchyardResult<Option<serde_json::Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tracker
            .track("sleep", async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<(), SwitchyardError>(())
            })
            .await?;
        if message.payload["fatal"].as_bool() == Some(true) {
            return Err(SwitchyardError::Fatal("disk gone".into()));
        }
        Ok(Some(json!({"ok": true})))
    }

    fn external_calls(&self) -> Option<&CallTracker> {
        Some(&self.tracker)
    }
}

fn reply_collector(bus: &MessageBus, topic: &str) -> mpsc::Receiver<Arc<Message>> {
    let (tx, rx) = mpsc::channel(64);
    bus.subscribe(
        topic,
        handler_fn(move |msg: Arc<Message>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg).await;
                Ok::<(), SwitchyardError>(())
            }
        }),
    )
    .unwrap();
    rx
}

#[tokio::test]
async fn inbox_worker_pool_runs_in_parallel() {
    let bus = MessageBus::new(BusConfig::default());
    bus.start().unwrap();
    let agent = Arc::new(SlowAgent {
        calls: AtomicU32::new(0),
        tracker: CallTracker::new(),
    });
    let runtime = Arc::new(AgentRuntime::new(
        Uuid::new_v4(),
        agent.clone(),
        RuntimeConfig {
            max_concurrency: 4,
            inbox_capacity: 16,
        },
    ));
    runtime.initialize().await.unwrap();
    runtime.start_inbox(&bus, "agent.slow").unwrap();
    let mut replies = reply_collector(&bus, "replies");

    let started = Instant::now();
    for _ in 0..4 {
        bus.publish(Message::request("agent.slow", "test", json!({})).with_reply_to("replies"))
            .unwrap();
    }
    for _ in 0..4 {
        let reply = tokio::time::timeout(Duration::from_secs(2), replies.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.kind, MessageKind::Response);
    }
    assert!(started.elapsed() < Duration::from_millis(350));

    let metrics = runtime.metrics();
    assert_eq!(metrics.processed, 4);
    assert_eq!(metrics.external.unwrap().calls, 4);
    runtime.shutdown().await.unwrap();
    bus.stop().await;
}

#[tokio::test]
async fn fatal_error_reply_keeps_its_class() {
    let runtime = AgentRuntime::new(
        Uuid::new_v4(),
        Arc::new(SlowAgent {
            calls: AtomicU32::new(0),
            tracker: CallTracker::new(),
        }),
        RuntimeConfig::default(),
    );
    let req = Message::request("agent.slow", "test", json!({"fatal": true})).with_reply_to("r");
    let reply = runtime.process(&req).await.unwrap();
    assert_eq!(reply.kind, MessageKind::Error);
    assert!(reply.as_error().unwrap().is_fatal());
    assert_eq!(
        runtime.metrics().last_error.unwrap().class,
        ErrorClass::Fatal
    );
}

#[tokio::test]
async fn shutdown_before_initialize_then_again() {
    let runtime = AgentRuntime::new(
        Uuid::new_v4(),
        Arc::new(SlowAgent {
            calls: AtomicU32::new(0),
            tracker: CallTracker::new(),
        }),
        RuntimeConfig::default(),
    );
    runtime.shutdown().await.unwrap();
    runtime.shutdown().await.unwrap();
    assert_eq!(runtime.state(), RuntimeState::Stopped);
}
