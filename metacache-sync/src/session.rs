//! Sync session management.
//!
//! Each session runs as its own tokio task. The manager tracks active
//! sessions, enforces one running session per environment, and moves
//! finished sessions into a bounded FIFO history.

use crate::engine::{SmartSyncEngine, SyncOutcome, SyncRequest, SyncStrategy};
use crate::error::{SyncError, SyncResult};
use crate::progress::{ActivityStatus, PhaseEvent, ProgressSink, SyncActivity};
use chrono::{DateTime, Utc};
use metacache_store::{LabelCache, SweepReport};
use metacache_types::{EnvironmentId, GlobalVersionId, SessionId, SyncPhase};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a session: pending → running → {completed, failed, cancelled}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Failed | Self::Cancelled)
                | (Self::Running, Self::Completed | Self::Failed | Self::Cancelled)
        )
    }
}

/// Snapshot of a sync session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSession {
    pub id: SessionId,
    pub environment_id: EnvironmentId,
    pub base_url: String,
    pub strategy: SyncStrategy,
    pub state: SessionState,
    pub global_version_id: Option<GlobalVersionId>,
    pub activities: Vec<SyncActivity>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub failed_phase: Option<SyncPhase>,
    pub outcome: Option<SyncOutcome>,
}

impl SyncSession {
    fn new(engine: &SmartSyncEngine, strategy: SyncStrategy) -> Self {
        let env = engine.environment();
        Self {
            id: SessionId::new(),
            environment_id: env.id,
            base_url: env.base_url.clone(),
            strategy,
            state: SessionState::Pending,
            global_version_id: None,
            activities: activities(strategy),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            failed_phase: None,
            outcome: None,
        }
    }

    /// Switches to the strategy the engine settled on.
    fn plan(&mut self, strategy: SyncStrategy) {
        if self.strategy == strategy {
            return;
        }
        info!(session = %self.id, requested = %self.strategy, effective = %strategy, "sync strategy changed");
        self.strategy = strategy;
        self.activities = activities(strategy);
    }

    fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(session = %self.id, from = ?self.state, to = ?next, "ignored session transition");
            return false;
        }
        debug!(session = %self.id, from = ?self.state, to = ?next, "session transition");
        self.state = next;
        let now = Utc::now();
        match next {
            SessionState::Running => self.started_at = Some(now),
            s if s.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        true
    }

    /// Phase currently running, if any.
    pub fn current_phase(&self) -> Option<SyncPhase> {
        self.activities
            .iter()
            .find(|a| a.status == ActivityStatus::Running)
            .map(|a| a.phase)
    }

    /// Overall percentage across phases.
    pub fn percent(&self) -> u8 {
        if self.state == SessionState::Completed {
            return 100;
        }
        if self.activities.is_empty() {
            return 0;
        }
        let sum: u32 = self
            .activities
            .iter()
            .map(|a| match a.status {
                ActivityStatus::Completed | ActivityStatus::Skipped => 100,
                _ => u32::from(a.percent),
            })
            .sum();
        (sum / self.activities.len() as u32).min(99) as u8
    }
}

fn activities(strategy: SyncStrategy) -> Vec<SyncActivity> {
    strategy.phases().iter().copied().map(SyncActivity::new).collect()
}

struct ActiveSession {
    session: SyncSession,
    cancel: CancellationToken,
    done: watch::Sender<Option<SyncSession>>,
}

struct Inner {
    active: Mutex<HashMap<SessionId, ActiveSession>>,
    history: Mutex<VecDeque<SyncSession>>,
    capacity: usize,
    shutdown: CancellationToken,
}

impl Inner {
    fn active(&self) -> MutexGuard<'_, HashMap<SessionId, ActiveSession>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn history(&self) -> MutexGuard<'_, VecDeque<SyncSession>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push_history(&self, session: SyncSession) {
        let mut history = self.history();
        history.push_back(session);
        while history.len() > self.capacity {
            history.pop_front();
        }
    }
}

/// Routes engine events into the owning session's activities.
struct SessionProgress {
    inner: Arc<Inner>,
    id: SessionId,
}

impl ProgressSink for SessionProgress {
    fn on_event(&self, event: &PhaseEvent) {
        let mut active = self.inner.active();
        let Some(entry) = active.get_mut(&self.id) else {
            return;
        };
        if let Some(activity) = entry
            .session
            .activities
            .iter_mut()
            .find(|a| a.phase == event.phase())
            && !activity.apply(event)
        {
            debug!(session = %self.id, ?event, "ignored out-of-order phase event");
        }
    }

    fn on_plan(&self, strategy: SyncStrategy) {
        if let Some(entry) = self.inner.active().get_mut(&self.id) {
            entry.session.plan(strategy);
        }
    }
}

/// Tracks sync sessions across environments.
#[derive(Clone)]
pub struct SyncSessionManager {
    inner: Arc<Inner>,
}

impl SyncSessionManager {
    /// Creates a manager keeping at most `history_capacity` finished sessions.
    pub fn new(history_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                active: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
                capacity: history_capacity.max(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Starts a sync session for the engine's environment. The session
    /// always reaches a terminal state, even if the sync task panics.
    ///
    /// Fails with [`SyncError::SessionConflict`] when a session is already
    /// pending or running for that environment.
    pub fn start(&self, engine: Arc<SmartSyncEngine>, request: SyncRequest) -> SyncResult<SessionId> {
        let env = engine.environment();
        let cancel = self.inner.shutdown.child_token();
        let session = SyncSession::new(&engine, request.strategy);
        let id = session.id;
        {
            let mut active = self.inner.active();
            if active
                .values()
                .any(|a| a.session.environment_id == env.id)
            {
                return Err(SyncError::SessionConflict {
                    environment: env.base_url.clone(),
                });
            }
            let (done, _) = watch::channel(None);
            active.insert(
                id,
                ActiveSession {
                    session,
                    cancel: cancel.clone(),
                    done,
                },
            );
        }
        info!(session = %id, environment = %env.base_url, strategy = %request.strategy, "sync session started");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Some(entry) = inner.active().get_mut(&id) {
                entry.session.transition(SessionState::Running);
            }
            let sink = SessionProgress {
                inner: Arc::clone(&inner),
                id,
            };
            let run = tokio::spawn(async move { engine.sync(&request, &cancel, &sink).await });
            let result = match run.await {
                Ok(result) => result,
                Err(e) => {
                    error!(session = %id, error = %e, "sync task aborted");
                    Err(SyncError::from(e))
                }
            };
            finish(&inner, id, result);
        });
        Ok(id)
    }

    /// Current snapshot of an active or finished session.
    pub fn get_progress(&self, id: SessionId) -> Option<SyncSession> {
        if let Some(entry) = self.inner.active().get(&id) {
            return Some(entry.session.clone());
        }
        self.inner.history().iter().find(|s| s.id == id).cloned()
    }

    /// Requests cancellation. Returns `false` when the session is not active.
    pub fn cancel(&self, id: SessionId) -> bool {
        match self.inner.active().get(&id) {
            Some(entry) => {
                info!(session = %id, "cancellation requested");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Active sessions, oldest first.
    pub fn list(&self) -> Vec<SyncSession> {
        let mut sessions: Vec<_> = self
            .inner
            .active()
            .values()
            .map(|a| a.session.clone())
            .collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Finished sessions, newest first.
    pub fn history(&self, limit: usize) -> Vec<SyncSession> {
        self.inner
            .history()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Waits until a session reaches a terminal state and returns its final
    /// snapshot.
    pub async fn wait(&self, id: SessionId) -> SyncResult<SyncSession> {
        let receiver = self.inner.active().get(&id).map(|a| a.done.subscribe());
        if let Some(mut rx) = receiver
            && let Ok(done) = rx.wait_for(Option::is_some).await
            && let Some(session) = done.clone()
        {
            return Ok(session);
        }
        self.inner
            .history()
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| SyncError::SessionNotFound(id.to_string()))
    }

    /// Trims history to capacity, sweeps expired labels and, when
    /// `current` is given, promotes temporary labels to it.
    pub async fn sweep_once(
        &self,
        labels: &LabelCache,
        current: Option<GlobalVersionId>,
    ) -> SyncResult<SweepReport> {
        {
            let mut history = self.inner.history();
            while history.len() > self.inner.capacity {
                history.pop_front();
            }
        }
        let labels = labels.clone();
        Ok(tokio::task::spawn_blocking(move || labels.sweep(current)).await??)
    }

    /// Runs [`sweep_once`](Self::sweep_once) against the engine's bound
    /// version every `interval` until [`shutdown`](Self::shutdown).
    pub fn spawn_sweeper(
        &self,
        engine: Arc<SmartSyncEngine>,
        labels: LabelCache,
        interval: Duration,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let swept: SyncResult<SweepReport> = async {
                            let current = engine.bound_version().await?;
                            manager.sweep_once(&labels, current).await
                        }
                        .await;
                        match swept {
                            Ok(report) => debug!(?report, "maintenance sweep finished"),
                            Err(e) => warn!(error = %e, "maintenance sweep failed"),
                        }
                    }
                }
            }
            debug!("maintenance sweeper stopped");
        })
    }

    /// Cancels every active session and stops the sweeper.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

fn finish(inner: &Inner, id: SessionId, result: SyncResult<SyncOutcome>) {
    let Some(mut entry) = inner.active().remove(&id) else {
        return;
    };
    let session = &mut entry.session;
    match result {
        Ok(outcome) => {
            session.global_version_id = Some(outcome.global_version_id);
            session.outcome = Some(outcome);
            session.transition(SessionState::Completed);
            info!(session = %id, "sync session completed");
        }
        Err(SyncError::Cancelled) => {
            for activity in &mut session.activities {
                activity.apply(&PhaseEvent::Cancelled {
                    phase: activity.phase,
                });
            }
            session.transition(SessionState::Cancelled);
            info!(session = %id, "sync session cancelled");
        }
        Err(e) => {
            session.failed_phase = e.phase().or_else(|| {
                session
                    .activities
                    .iter()
                    .find(|a| a.status == ActivityStatus::Failed)
                    .map(|a| a.phase)
            });
            session.error = Some(e.to_string());
            session.transition(SessionState::Failed);
            warn!(session = %id, error = %e, "sync session failed");
        }
    }
    let snapshot = entry.session.clone();
    inner.push_history(snapshot.clone());
    entry.done.send_replace(Some(snapshot));
}
