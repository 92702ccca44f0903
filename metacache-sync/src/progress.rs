//! Per-phase progress tracking.
//!
//! The engine reports every phase transition as a [`PhaseEvent`] to a
//! [`ProgressSink`]. [`SyncActivity::apply`] folds events into an activity
//! record, enforcing the status transition table and keeping
//! `items_processed` monotonic.

use crate::engine::SyncStrategy;
use chrono::{DateTime, Utc};
use metacache_types::SyncPhase;
use serde::{Deserialize, Serialize};

/// Status of one phase within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
    Cancelled,
}

impl ActivityStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Allowed transitions: pending → running | skipped | cancelled,
    /// running → completed | failed | cancelled. Terminal states are final.
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Skipped | Self::Cancelled)
                | (Self::Running, Self::Completed | Self::Failed | Self::Cancelled)
        )
    }
}

/// A typed phase transition reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PhaseEvent {
    Started {
        phase: SyncPhase,
        total: Option<u64>,
    },
    Progress {
        phase: SyncPhase,
        processed: u64,
        total: Option<u64>,
    },
    Completed {
        phase: SyncPhase,
        processed: u64,
    },
    Skipped {
        phase: SyncPhase,
        reason: String,
    },
    Failed {
        phase: SyncPhase,
        message: String,
    },
    Cancelled {
        phase: SyncPhase,
    },
}

impl PhaseEvent {
    pub fn phase(&self) -> SyncPhase {
        match self {
            Self::Started { phase, .. }
            | Self::Progress { phase, .. }
            | Self::Completed { phase, .. }
            | Self::Skipped { phase, .. }
            | Self::Failed { phase, .. }
            | Self::Cancelled { phase } => *phase,
        }
    }
}

/// Receiver of engine progress events.
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: &PhaseEvent);

    /// Called once per sync with the strategy actually run, before any
    /// phase event. It differs from the requested one when detection fails.
    fn on_plan(&self, _strategy: SyncStrategy) {}
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn on_event(&self, _event: &PhaseEvent) {}
}

impl<F> ProgressSink for F
where
    F: Fn(&PhaseEvent) + Send + Sync,
{
    fn on_event(&self, event: &PhaseEvent) {
        self(event)
    }
}

/// Progress of one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncActivity {
    pub phase: SyncPhase,
    pub status: ActivityStatus,
    pub items_processed: u64,
    pub items_total: Option<u64>,
    /// Completion percentage; stays at or below 99 until the phase completes.
    pub percent: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

impl SyncActivity {
    pub fn new(phase: SyncPhase) -> Self {
        Self {
            phase,
            status: ActivityStatus::Pending,
            items_processed: 0,
            items_total: None,
            percent: 0,
            started_at: None,
            completed_at: None,
            message: None,
        }
    }

    fn transition(&mut self, next: ActivityStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        let now = Utc::now();
        match next {
            ActivityStatus::Running => self.started_at = Some(now),
            s if s.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        true
    }

    fn record(&mut self, processed: u64, total: Option<u64>) {
        if total.is_some() {
            self.items_total = total;
        }
        self.items_processed = self.items_processed.max(processed);
        if let Some(total) = self.items_total.filter(|t| *t > 0) {
            let pct = (self.items_processed.saturating_mul(100) / total).min(99);
            self.percent = self.percent.max(pct as u8);
        }
    }

    /// Folds an event into the activity. Returns `false` when the event
    /// belongs to another phase or breaks the transition table.
    pub fn apply(&mut self, event: &PhaseEvent) -> bool {
        if event.phase() != self.phase {
            return false;
        }
        match event {
            PhaseEvent::Started { total, .. } => {
                let ok = self.transition(ActivityStatus::Running);
                if ok {
                    self.record(0, *total);
                }
                ok
            }
            PhaseEvent::Progress {
                processed, total, ..
            } => {
                if self.status != ActivityStatus::Running {
                    return false;
                }
                self.record(*processed, *total);
                true
            }
            PhaseEvent::Completed { processed, .. } => {
                let ok = self.transition(ActivityStatus::Completed);
                if ok {
                    self.items_processed = self.items_processed.max(*processed);
                    self.percent = 100;
                }
                ok
            }
            PhaseEvent::Skipped { reason, .. } => {
                let ok = self.transition(ActivityStatus::Skipped);
                if ok {
                    self.message = Some(reason.clone());
                }
                ok
            }
            PhaseEvent::Failed { message, .. } => {
                let ok = self.transition(ActivityStatus::Failed);
                if ok {
                    self.message = Some(message.clone());
                }
                ok
            }
            PhaseEvent::Cancelled { .. } => self.transition(ActivityStatus::Cancelled),
        }
    }
}
