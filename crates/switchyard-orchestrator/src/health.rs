use crate::config::HealthConfig;
use crate::descriptor::{AgentDescriptor, AgentState};
use crate::orchestrator::Orchestrator;
use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use switchyard_bus::BusHealth;
use switchyard_core::{Message, SwitchyardError, SwitchyardResult};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Sender name on alert messages.
pub const HEALTH_MONITOR_SENDER: &str = "health-monitor";

/// What one monitoring pass observed and did.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthReport {
    pub checked: usize,
    pub missed: Vec<Uuid>,
    pub failed: Vec<Uuid>,
    pub restarted: Vec<Uuid>,
    pub alerted: Vec<Uuid>,
    pub bus: Option<BusHealth>,
}

/// Periodically probes agents, fails unresponsive ones and restarts failed
/// ones within a bounded budget.
pub struct HealthMonitor {
    orchestrator: Orchestrator,
    config: HealthConfig,
    alerted: Mutex<HashSet<Uuid>>,
    stop: Notify,
}

impl HealthMonitor {
    pub fn new(orchestrator: Orchestrator, config: HealthConfig) -> SwitchyardResult<Self> {
        config.validate()?;
        Ok(Self {
            orchestrator,
            config,
            alerted: Mutex::new(HashSet::new()),
            stop: Notify::new(),
        })
    }

    /// Run [`check_once`](Self::check_once) every `interval_ms` until
    /// [`stop`](Self::stop) is called.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(self.config.interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(interval_ms = self.config.interval_ms, "Health monitor started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.check_once().await;
                        debug!(checked = report.checked, missed = report.missed.len(), "Health pass done");
                    }
                    _ = self.stop.notified() => break,
                }
            }
            info!("Health monitor stopped");
        })
    }

    pub fn stop(&self) {
        self.stop.notify_one();
    }

    /// One monitoring pass: probe serving agents, then restart or alert on
    /// failed ones.
    pub async fn check_once(&self) -> HealthReport {
        let mut report = HealthReport::default();
        let registry = self.orchestrator.registry();
        let check_timeout = Duration::from_millis(self.config.check_timeout_ms);

        let serving: Vec<_> = registry
            .slots()
            .await
            .into_iter()
            .filter(|s| s.state().is_serving())
            .collect();
        let probes = join_all(serving.iter().map(|slot| async move {
            let result = match tokio::time::timeout(check_timeout, slot.runtime().health_check()).await {
                Ok(result) => result,
                Err(_) => Err(SwitchyardError::Timeout(format!(
                    "health check exceeded {}ms",
                    check_timeout.as_millis()
                ))),
            };
            (Arc::clone(slot), result)
        }))
        .await;

        for (slot, result) in probes {
            report.checked += 1;
            let id = slot.id();
            match result {
                Ok(()) => slot.update(|d| {
                    d.missed_health_checks = 0;
                    d.last_health_check = Some(Utc::now());
                }),
                Err(e) => {
                    let missed = slot.update(|d| {
                        d.missed_health_checks += 1;
                        d.last_health_check = Some(Utc::now());
                        d.missed_health_checks
                    });
                    warn!(agent_id = %id, missed, error = %e, "Health check missed");
                    report.missed.push(id);
                    if missed > self.config.miss_threshold {
                        let reason = format!("{missed} consecutive health checks missed: {e}");
                        match self.orchestrator.mark_failed(id, &reason).await {
                            Ok(()) => report.failed.push(id),
                            Err(e) => debug!(agent_id = %id, error = %e, "Could not mark agent failed"),
                        }
                    }
                }
            }
        }

        let policy = self.config.restart_policy();
        for slot in registry.slots().await {
            let d = slot.descriptor();
            if d.state != AgentState::Failed {
                continue;
            }
            if d.restart_attempts < self.config.max_restarts {
                let wait = policy.backoff(d.restart_attempts);
                let waited = (Utc::now() - d.state_changed_at).to_std().unwrap_or_default();
                if waited < wait {
                    continue;
                }
                match self.orchestrator.restart(d.id).await {
                    Ok(state) => {
                        report.restarted.push(d.id);
                        if state == AgentState::Ready {
                            self.alerted.lock().remove(&d.id);
                        }
                    }
                    Err(e) => warn!(agent_id = %d.id, error = %e, "Restart attempt failed"),
                }
            } else if self.alerted.lock().insert(d.id) {
                self.alert(&d);
                report.alerted.push(d.id);
            }
        }

        let bus = self.orchestrator.bus().health();
        if let BusHealth::Failed { reason } = &bus {
            error!(reason = %reason, "Message bus failed");
        }
        report.bus = Some(bus);
        report
    }

    fn alert(&self, d: &AgentDescriptor) {
        error!(
            agent_id = %d.id,
            agent = %d.name,
            restart_attempts = d.restart_attempts,
            last_error = d.last_error.as_deref().unwrap_or(""),
            "Agent restart budget exhausted, operator action required"
        );
        let alert = Message::status(
            self.config.alert_topic.clone(),
            HEALTH_MONITOR_SENDER,
            json!({
                "event": "restart_budget_exhausted",
                "agent_id": d.id,
                "agent": d.name,
                "restart_attempts": d.restart_attempts,
                "last_error": d.last_error,
            }),
        )
        .with_priority(10);
        if let Err(e) = self.orchestrator.bus().publish(alert) {
            warn!(error = %e, "Failed to publish alert");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use switchyard_agent::Agent;
    use switchyard_bus::{handler_fn, BusConfig, MessageBus};
    use switchyard_core::Capability;

    /// Healthy until `sick` is set; `initialize` fails while `broken`.
    struct Flaky {
        sick: Arc<AtomicBool>,
        broken: Arc<AtomicBool>,
        inits: AtomicU32,
    }

    #[async_trait]
    impl Agent for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn initialize(&self) -> SwitchyardResult<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            if self.broken.load(Ordering::SeqCst) {
                return Err(SwitchyardError::Handler("cannot connect".into()));
            }
            self.sick.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn handle(&self, _message: &Message) -> SwitchyardResult<Option<serde_json::Value>> {
            Ok(None)
        }

        async fn health_check(&self) -> SwitchyardResult<()> {
            if self.sick.load(Ordering::SeqCst) {
                Err(SwitchyardError::Handler("unwell".into()))
            } else {
                Ok(())
            }
        }
    }

    fn config() -> HealthConfig {
        HealthConfig {
            miss_threshold: 1,
            max_restarts: 2,
            restart_backoff_ms: 0,
            ..Default::default()
        }
    }

    async fn setup() -> (Orchestrator, Uuid, Arc<AtomicBool>, Arc<AtomicBool>) {
        let bus = MessageBus::new(BusConfig::default());
        bus.start().unwrap();
        let orch = Orchestrator::new(bus, OrchestratorConfig::default()).unwrap();
        let sick = Arc::new(AtomicBool::new(false));
        let broken = Arc::new(AtomicBool::new(false));
        let agent = Arc::new(Flaky {
            sick: Arc::clone(&sick),
            broken: Arc::clone(&broken),
            inits: AtomicU32::new(0),
        });
        let d = orch.register(agent, [Capability::Summarize]).await.unwrap();
        (orch, d.id, sick, broken)
    }

    #[tokio::test]
    async fn test_healthy_pass_resets_misses() {
        let (orch, id, _, _) = setup().await;
        let monitor = HealthMonitor::new(orch.clone(), config()).unwrap();
        let report = monitor.check_once().await;
        assert_eq!(report.checked, 1);
        assert!(report.missed.is_empty());
        let d = orch.descriptor(id).await.unwrap();
        assert!(d.last_health_check.is_some());
        assert_eq!(report.bus, Some(BusHealth::Healthy));
    }

    #[tokio::test]
    async fn test_misses_beyond_threshold_fail_then_restart() {
        let (orch, id, sick, _) = setup().await;
        let monitor = HealthMonitor::new(orch.clone(), config()).unwrap();
        sick.store(true, Ordering::SeqCst);

        let first = monitor.check_once().await;
        assert_eq!(first.missed, vec![id]);
        assert!(first.failed.is_empty());
        assert_eq!(orch.descriptor(id).await.unwrap().state, AgentState::Ready);

        // Second miss exceeds the threshold; zero backoff restarts in the same pass.
        let second = monitor.check_once().await;
        assert_eq!(second.failed, vec![id]);
        assert_eq!(second.restarted, vec![id]);
        let d = orch.descriptor(id).await.unwrap();
        assert_eq!(d.state, AgentState::Ready);
        assert_eq!(d.restart_attempts, 1);
    }

    #[tokio::test]
    async fn test_restart_waits_for_exponential_backoff() {
        let (orch, id, _, broken) = setup().await;
        let monitor = HealthMonitor::new(
            orch.clone(),
            HealthConfig {
                restart_backoff_ms: 150,
                restart_backoff_max_ms: 10_000,
                ..config()
            },
        )
        .unwrap();
        broken.store(true, Ordering::SeqCst);
        orch.mark_failed(id, "test").await.unwrap();

        // First restart waits 150ms.
        assert!(monitor.check_once().await.restarted.is_empty());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(monitor.check_once().await.restarted, vec![id]);
        let d = orch.descriptor(id).await.unwrap();
        assert_eq!(d.state, AgentState::Failed);
        assert_eq!(d.restart_attempts, 1);

        // Second restart waits 300ms, so 200ms in is still too early.
        assert!(monitor.check_once().await.restarted.is_empty());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(monitor.check_once().await.restarted.is_empty());
        assert_eq!(orch.descriptor(id).await.unwrap().restart_attempts, 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(monitor.check_once().await.restarted, vec![id]);
        assert_eq!(orch.descriptor(id).await.unwrap().restart_attempts, 2);
    }

    #[tokio::test]
    async fn test_exhausted_restarts_alert_once() {
        let (orch, id, _, broken) = setup().await;
        let alerts = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&alerts);
        orch.bus()
            .subscribe(
                "system.alerts",
                handler_fn(move |msg: Arc<Message>| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.lock().push(msg.payload.clone());
                        Ok::<(), SwitchyardError>(())
                    }
                }),
            )
            .unwrap();
        let monitor = HealthMonitor::new(orch.clone(), config()).unwrap();

        broken.store(true, Ordering::SeqCst);
        orch.mark_failed(id, "test").await.unwrap();
        for _ in 0..2 {
            let report = monitor.check_once().await;
            assert_eq!(report.restarted, vec![id]);
        }
        assert_eq!(orch.descriptor(id).await.unwrap().state, AgentState::Failed);

        let report = monitor.check_once().await;
        assert_eq!(report.alerted, vec![id]);
        let report = monitor.check_once().await;
        assert!(report.alerted.is_empty());

        orch.bus().wait_idle().await;
        assert_eq!(orch.health().await.agents.get(&AgentState::Failed), Some(&1));
        let alerts = alerts.lock();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0]["event"], "restart_budget_exhausted");
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (orch, id, _, _) = setup().await;
        let monitor = Arc::new(
            HealthMonitor::new(
                orch.clone(),
                HealthConfig {
                    interval_ms: 20,
                    ..config()
                },
            )
            .unwrap(),
        );
        let task = Arc::clone(&monitor).start();
        tokio::time::sleep(Duration::from_millis(80)).await;
        monitor.stop();
        task.await.unwrap();
        assert!(orch.descriptor(id).await.unwrap().last_health_check.is_some());
    }
}
