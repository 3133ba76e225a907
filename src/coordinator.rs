use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::planner::{PlanRequest, PlanResponse, PlanSource, PlannerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanOrigin {
    /// Fetched by the coordinator itself
    Poll,
    /// Supplied from outside, e.g. by the create_plan action
    Push,
}

impl std::fmt::Display for PlanOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanOrigin::Poll => write!(f, "poll"),
            PlanOrigin::Push => write!(f, "push"),
        }
    }
}

/// Sent to subscribers every time the cached plan is (re)confirmed
#[derive(Debug, Clone, PartialEq)]
pub struct PlanUpdate {
    pub sequence: u64,
    pub origin: PlanOrigin,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorPhase {
    Uninitialized,
    Ready,
    /// Initial refresh failed; the owner has to build a new coordinator
    SetupFailed,
}

#[derive(Debug, Clone)]
struct Snapshot {
    plan: Arc<PlanResponse>,
    update: PlanUpdate,
}

#[derive(Debug)]
struct CoordinatorState {
    phase: CoordinatorPhase,
    current: Option<Snapshot>,
    /// A pushed plan that the next refresh should serve instead of fetching
    push_pending: bool,
    next_sequence: u64,
}

impl CoordinatorState {
    fn reserve_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    fn current_plan(&self) -> Option<Arc<PlanResponse>> {
        self.current.as_ref().map(|s| s.plan.clone())
    }
}

/// Owns the single cached plan for one configured system and tells subscribers
/// whenever it changes.
pub struct PlanCoordinator {
    source: Arc<dyn PlanSource>,
    request: PlanRequest,
    state: RwLock<CoordinatorState>,
    updates: broadcast::Sender<PlanUpdate>,
}

impl PlanCoordinator {
    pub fn new(source: Arc<dyn PlanSource>, request: PlanRequest) -> Self {
        let (updates, _) = broadcast::channel(16);
        Self {
            source,
            request,
            state: RwLock::new(CoordinatorState {
                phase: CoordinatorPhase::Uninitialized,
                current: None,
                push_pending: false,
                next_sequence: 1,
            }),
            updates,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlanUpdate> {
        self.updates.subscribe()
    }

    pub async fn current(&self) -> Option<Arc<PlanResponse>> {
        self.state.read().await.current_plan()
    }

    pub async fn last_update(&self) -> Option<PlanUpdate> {
        self.state.read().await.current.as_ref().map(|s| s.update.clone())
    }

    pub async fn phase(&self) -> CoordinatorPhase {
        self.state.read().await.phase
    }

    /// First fetch after setup. An error here means the system is not ready.
    pub async fn initial_refresh(&self) -> Result<Arc<PlanResponse>, PlannerError> {
        let sequence = self.state.write().await.reserve_sequence();

        match self.source.request_plan(&self.request).await {
            Ok(plan) => {
                let mut state = self.state.write().await;
                // A push applied before setup finished wins over this fetch
                Ok(self
                    .accept(&mut state, plan, PlanOrigin::Poll, sequence)
                    .unwrap_or_else(|newer| newer))
            }
            Err(e) => {
                let mut state = self.state.write().await;
                if state.current.is_none() {
                    state.phase = CoordinatorPhase::SetupFailed;
                }
                Err(e)
            }
        }
    }

    /// Fetch a new plan, or serve a freshly pushed one. Failures keep the last good plan.
    pub async fn refresh(&self) -> Option<Arc<PlanResponse>> {
        let sequence = {
            let mut state = self.state.write().await;
            if state.phase == CoordinatorPhase::SetupFailed {
                warn!("Refresh requested on a coordinator whose setup failed");
                return None;
            }
            if state.push_pending {
                state.push_pending = false;
                if let Some(snapshot) = state.current.clone() {
                    debug!(
                        "Serving pushed plan #{} instead of fetching",
                        snapshot.update.sequence
                    );
                    self.notify(snapshot.update);
                    return Some(snapshot.plan);
                }
            }
            state.reserve_sequence()
        };

        match self.source.request_plan(&self.request).await {
            Ok(plan) => {
                let mut state = self.state.write().await;
                match self.accept(&mut state, plan, PlanOrigin::Poll, sequence) {
                    Ok(plan) => Some(plan),
                    Err(newer) => {
                        debug!("Discarded plan #{} superseded while in flight", sequence);
                        Some(newer)
                    }
                }
            }
            Err(e) => {
                warn!("Failed to refresh battery plan, keeping previous plan: {}", e);
                self.current().await
            }
        }
    }

    /// Replace the cached plan with one obtained elsewhere. Ignored once setup
    /// has failed.
    pub async fn apply_external(&self, plan: PlanResponse) -> Option<Arc<PlanResponse>> {
        let mut state = self.state.write().await;
        if state.phase == CoordinatorPhase::SetupFailed {
            warn!("Pushed plan ignored, coordinator setup failed");
            return None;
        }
        let sequence = state.reserve_sequence();
        state.push_pending = true;
        let plan = Arc::new(plan);
        self.store(&mut state, plan.clone(), PlanOrigin::Push, sequence);
        Some(plan)
    }

    /// Store `plan` unless a newer payload has already been accepted, in which
    /// case that newer plan is returned as the error.
    fn accept(
        &self,
        state: &mut CoordinatorState,
        plan: PlanResponse,
        origin: PlanOrigin,
        sequence: u64,
    ) -> Result<Arc<PlanResponse>, Arc<PlanResponse>> {
        if let Some(current) = &state.current {
            if current.update.sequence > sequence {
                return Err(current.plan.clone());
            }
        }
        let plan = Arc::new(plan);
        self.store(state, plan.clone(), origin, sequence);
        Ok(plan)
    }

    fn store(
        &self,
        state: &mut CoordinatorState,
        plan: Arc<PlanResponse>,
        origin: PlanOrigin,
        sequence: u64,
    ) {
        let update = PlanUpdate {
            sequence,
            origin,
            received_at: Utc::now(),
        };
        info!(
            "Battery plan #{} accepted from {}: {} schedule entries, cost delta {:?}",
            sequence,
            origin,
            plan.schedule.len(),
            plan.cost_delta()
        );
        state.phase = CoordinatorPhase::Ready;
        state.current = Some(Snapshot {
            plan,
            update: update.clone(),
        });
        self.notify(update);
    }

    fn notify(&self, update: PlanUpdate) {
        // No subscribers is fine, projections read lazily
        let _ = self.updates.send(update);
    }
}
