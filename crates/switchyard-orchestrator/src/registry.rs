use crate::descriptor::{AgentDescriptor, AgentState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use switchyard_agent::AgentRuntime;
use switchyard_core::{Capability, SwitchyardError, SwitchyardResult};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// One registered agent: its descriptor behind its own lock plus the runtime.
pub struct AgentSlot {
    id: Uuid,
    descriptor: Mutex<AgentDescriptor>,
    runtime: Arc<AgentRuntime>,
    idle: Notify,
}

impl AgentSlot {
    pub fn new(descriptor: AgentDescriptor, runtime: Arc<AgentRuntime>) -> Self {
        Self {
            id: descriptor.id,
            descriptor: Mutex::new(descriptor),
            runtime,
            idle: Notify::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn runtime(&self) -> &Arc<AgentRuntime> {
        &self.runtime
    }

    /// Copy of the current descriptor.
    pub fn descriptor(&self) -> AgentDescriptor {
        self.descriptor.lock().clone()
    }

    pub fn state(&self) -> AgentState {
        self.descriptor.lock().state
    }

    /// Mutate the descriptor under its lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut AgentDescriptor) -> R) -> R {
        f(&mut self.descriptor.lock())
    }

    /// Resolves once in-flight work may have finished.
    pub(crate) async fn idle_signal(&self) {
        self.idle.notified().await;
    }

    pub(crate) fn in_flight(&self) -> u32 {
        self.descriptor.lock().resource_usage.in_flight
    }
}

/// How a claimed call ended.
#[derive(Debug)]
pub enum CallOutcome<'a> {
    Succeeded,
    Failed(&'a SwitchyardError),
    /// The caller went away before a reply arrived.
    Abandoned,
}

/// Exclusive use of a `busy` agent for one routed call. Dropping an
/// unfinished claim returns the agent to `ready`.
pub struct Claim {
    slot: Arc<AgentSlot>,
    started: Instant,
    finished: bool,
}

impl Claim {
    pub fn slot(&self) -> &Arc<AgentSlot> {
        &self.slot
    }

    /// Release the agent, recording the call. Returns the state the agent
    /// ended in.
    pub fn finish(mut self, outcome: CallOutcome<'_>) -> AgentState {
        self.finished = true;
        release(&self.slot, self.started, outcome)
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.finished {
            release(&self.slot, self.started, CallOutcome::Abandoned);
        }
    }
}

fn release(slot: &AgentSlot, started: Instant, outcome: CallOutcome<'_>) -> AgentState {
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    let state = slot.update(|d| {
        d.resource_usage.in_flight = d.resource_usage.in_flight.saturating_sub(1);
        let mut fatal = false;
        match outcome {
            CallOutcome::Succeeded => d.resource_usage.record(latency_ms, false),
            CallOutcome::Failed(err) => {
                d.resource_usage.record(latency_ms, true);
                d.last_error = Some(err.to_string());
                fatal = err.is_fatal();
            }
            CallOutcome::Abandoned => {}
        }
        if fatal && d.transition(AgentState::Failed).is_ok() {
            warn!(agent_id = %d.id, "Agent reported a fatal error, marked failed");
        } else if d.state == AgentState::Busy {
            let _ = d.transition(AgentState::Ready);
        }
        d.state
    });
    slot.idle.notify_one();
    state
}

/// Authoritative table of live agents.
///
/// The table lock is taken for writing only by register and deregister;
/// routing reads the table and then locks one descriptor at a time.
pub struct AgentRegistry {
    slots: RwLock<HashMap<Uuid, Arc<AgentSlot>>>,
    cursors: Mutex<HashMap<Capability, usize>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, slot: Arc<AgentSlot>) {
        self.slots.write().await.insert(slot.id(), slot);
    }

    pub async fn remove(&self, id: Uuid) -> Option<Arc<AgentSlot>> {
        self.slots.write().await.remove(&id)
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<AgentSlot>> {
        self.slots.read().await.get(&id).cloned()
    }

    /// All slots in id order.
    pub async fn slots(&self) -> Vec<Arc<AgentSlot>> {
        let mut slots: Vec<_> = self.slots.read().await.values().cloned().collect();
        slots.sort_by_key(|s| s.id());
        slots
    }

    /// Descriptor snapshots in id order.
    pub async fn descriptors(&self) -> Vec<AgentDescriptor> {
        self.slots()
            .await
            .iter()
            .map(|s| s.descriptor())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    /// Whether some agent offering `capability` is serving right now.
    pub async fn is_resolvable(&self, capability: Capability) -> bool {
        self.slots.read().await.values().any(|slot| {
            let d = slot.descriptor.lock();
            d.offers(capability) && d.state.is_serving()
        })
    }

    /// Pick a `ready` agent offering `capability` and mark it `busy`.
    ///
    /// Least-recently-dispatched agents go first; agents tied on that (for
    /// example never dispatched) are rotated through a per-capability cursor.
    /// This is LRU-first with round-robin as the tie-break, the reverse of a
    /// cursor-first rotation: an agent that joins or recovers late is picked
    /// before agents that have already served.
    pub async fn claim(&self, capability: Capability) -> SwitchyardResult<Claim> {
        let mut candidates: Vec<(Option<DateTime<Utc>>, Uuid, Arc<AgentSlot>)> = {
            let slots = self.slots.read().await;
            slots
                .values()
                .filter_map(|slot| {
                    let d = slot.descriptor.lock();
                    if d.state == AgentState::Ready && d.offers(capability) {
                        Some((d.last_dispatched, d.id, Arc::clone(slot)))
                    } else {
                        None
                    }
                })
                .collect()
        };
        if candidates.is_empty() {
            return Err(SwitchyardError::NoCapableAgent(capability));
        }

        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        let oldest = candidates[0].0;
        let ties = candidates.iter().take_while(|c| c.0 == oldest).count();
        let start = {
            let mut cursors = self.cursors.lock();
            let cursor = cursors.entry(capability).or_insert(0);
            let start = *cursor % ties;
            *cursor = cursor.wrapping_add(1);
            start
        };
        candidates[..ties].rotate_left(start);

        // A candidate may have changed state since the scan; take the first
        // one still ready under its own lock.
        for (_, id, slot) in candidates {
            let claimed = slot.update(|d| {
                if d.state != AgentState::Ready || d.transition(AgentState::Busy).is_err() {
                    return false;
                }
                d.last_dispatched = Some(Utc::now());
                d.resource_usage.in_flight += 1;
                true
            });
            if claimed {
                debug!(agent_id = %id, capability = %capability, "Agent claimed");
                return Ok(Claim {
                    slot,
                    started: Instant::now(),
                    finished: false,
                });
            }
        }
        Err(SwitchyardError::NoCapableAgent(capability))
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
