//! Failover state machine
//!
//! The collector's replication mode is an explicit FSM. [`transition`] is the
//! whole table: given the current mode and an event it returns the next mode
//! and the side effects the owner must perform, or `None` when the event
//! does not apply in that mode.
//!
//! ```text
//!              connection failure                    recovery succeeded
//!   hybrid ─────────────────────────► local_only ───────────────────────► hybrid
//!     │                                   ▲
//!     │ service degradation               │ connection failure
//!     ▼                                   │
//!  degraded ──────────────────────────────┘
//!     │ recovery succeeded
//!     ▼
//!   hybrid
//! ```
//!
//! `remote_only` reacts like `hybrid`. A forced transition is accepted from
//! any mode.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::client::RemoteSink;
use crate::config::SyncMode;
use crate::error::RemoteError;

/// Transitions kept in the in-memory log
const HISTORY_LIMIT: usize = 100;
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverMode {
    Hybrid,
    LocalOnly,
    RemoteOnly,
    Degraded,
}

impl FailoverMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverMode::Hybrid => "hybrid",
            FailoverMode::LocalOnly => "local_only",
            FailoverMode::RemoteOnly => "remote_only",
            FailoverMode::Degraded => "degraded",
        }
    }

    /// Whether replication may be attempted in this mode
    pub fn allows_remote(&self) -> bool {
        !matches!(self, FailoverMode::LocalOnly)
    }
}

impl std::fmt::Display for FailoverMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<SyncMode> for FailoverMode {
    fn from(mode: SyncMode) -> Self {
        match mode {
            SyncMode::Hybrid => FailoverMode::Hybrid,
            SyncMode::LocalOnly => FailoverMode::LocalOnly,
            SyncMode::RemoteOnly => FailoverMode::RemoteOnly,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverEvent {
    ConnectionFailure { reason: String },
    ServiceDegradation { reason: String },
    RecoverySucceeded,
    RecoveryFailed { reason: String },
    Force { mode: FailoverMode, reason: String },
}

impl FailoverEvent {
    fn reason(&self) -> String {
        match self {
            FailoverEvent::ConnectionFailure { reason }
            | FailoverEvent::ServiceDegradation { reason }
            | FailoverEvent::RecoveryFailed { reason } => reason.clone(),
            FailoverEvent::RecoverySucceeded => "remote recovered".to_string(),
            FailoverEvent::Force { reason, .. } => format!("forced: {}", reason),
        }
    }
}

/// Side effects requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    ScheduleRecovery,
    CancelRecovery,
    /// Replay queued events now that the remote is usable
    DrainQueue,
}

/// The transition table
pub fn transition(mode: FailoverMode, event: &FailoverEvent) -> Option<(FailoverMode, Vec<Effect>)> {
    use FailoverEvent::*;
    use FailoverMode::*;

    match (mode, event) {
        (Hybrid | RemoteOnly, ConnectionFailure { .. }) => {
            Some((LocalOnly, vec![Effect::ScheduleRecovery]))
        }
        (Hybrid | RemoteOnly, ServiceDegradation { .. }) => {
            Some((Degraded, vec![Effect::ScheduleRecovery]))
        }
        (Degraded, ConnectionFailure { .. }) => Some((LocalOnly, vec![])),
        (LocalOnly | Degraded, RecoverySucceeded) => {
            Some((Hybrid, vec![Effect::CancelRecovery, Effect::DrainQueue]))
        }
        (current, Force { mode: target, .. }) if current != *target => {
            let effects = match target {
                Hybrid | RemoteOnly => vec![Effect::CancelRecovery, Effect::DrainQueue],
                Degraded => vec![Effect::ScheduleRecovery],
                LocalOnly => vec![Effect::CancelRecovery],
            };
            Some((*target, effects))
        }
        _ => None,
    }
}

/// One applied transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionRecord {
    pub timestamp: DateTime<Utc>,
    pub from: FailoverMode,
    pub to: FailoverMode,
    pub reason: String,
    pub effects: Vec<Effect>,
}

impl TransitionRecord {
    pub fn requests(&self, effect: Effect) -> bool {
        self.effects.contains(&effect)
    }
}

/// Result of one recovery attempt
#[derive(Debug)]
pub enum RecoveryAttempt {
    /// No recovery was scheduled
    NotNeeded,
    Recovered {
        latency: Duration,
        transition: Option<TransitionRecord>,
    },
    Failed(RemoteError),
}

#[derive(Debug)]
struct Inner {
    mode: FailoverMode,
    recovery_pending: bool,
    history: VecDeque<TransitionRecord>,
}

/// Owns the replication mode and its audit trail.
#[derive(Debug)]
pub struct FailoverHandler {
    inner: Mutex<Inner>,
    events: broadcast::Sender<TransitionRecord>,
}

impl FailoverHandler {
    pub fn new(initial: FailoverMode) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                mode: initial,
                recovery_pending: false,
                history: VecDeque::new(),
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mode(&self) -> FailoverMode {
        self.lock().mode
    }

    pub fn allows_remote(&self) -> bool {
        self.mode().allows_remote()
    }

    pub fn recovery_pending(&self) -> bool {
        self.lock().recovery_pending
    }

    /// Receive every future transition
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionRecord> {
        self.events.subscribe()
    }

    /// Most recent transitions, oldest first
    pub fn history(&self) -> Vec<TransitionRecord> {
        self.lock().history.iter().cloned().collect()
    }

    /// Apply an event; returns the transition if the mode changed
    pub fn handle(&self, event: FailoverEvent) -> Option<TransitionRecord> {
        let record = {
            let mut inner = self.lock();
            let (to, effects) = transition(inner.mode, &event)?;

            for effect in &effects {
                match effect {
                    Effect::ScheduleRecovery => inner.recovery_pending = true,
                    Effect::CancelRecovery => inner.recovery_pending = false,
                    Effect::DrainQueue => {}
                }
            }

            let record = TransitionRecord {
                timestamp: Utc::now(),
                from: inner.mode,
                to,
                reason: event.reason(),
                effects,
            };
            inner.mode = to;
            inner.history.push_back(record.clone());
            while inner.history.len() > HISTORY_LIMIT {
                inner.history.pop_front();
            }
            record
        };

        tracing::warn!(
            from = %record.from,
            to = %record.to,
            reason = %record.reason,
            "Collector mode changed"
        );
        // No subscribers is fine.
        let _ = self.events.send(record.clone());
        Some(record)
    }

    pub fn handle_connection_failure(&self, reason: impl Into<String>) -> Option<TransitionRecord> {
        self.handle(FailoverEvent::ConnectionFailure {
            reason: reason.into(),
        })
    }

    pub fn handle_service_degradation(&self, reason: impl Into<String>) -> Option<TransitionRecord> {
        self.handle(FailoverEvent::ServiceDegradation {
            reason: reason.into(),
        })
    }

    pub fn force_failover(&self, mode: FailoverMode, reason: impl Into<String>) -> Option<TransitionRecord> {
        self.handle(FailoverEvent::Force {
            mode,
            reason: reason.into(),
        })
    }

    /// Probe the remote if a recovery is scheduled; return to hybrid on success
    pub async fn attempt_recovery(&self, remote: &dyn RemoteSink) -> RecoveryAttempt {
        if !self.recovery_pending() {
            return RecoveryAttempt::NotNeeded;
        }

        let started = Instant::now();
        match remote.health().await {
            Ok(()) => RecoveryAttempt::Recovered {
                latency: started.elapsed(),
                transition: self.handle(FailoverEvent::RecoverySucceeded),
            },
            Err(e) => {
                tracing::debug!(error = %e, mode = %self.mode(), "Recovery probe failed");
                self.handle(FailoverEvent::RecoveryFailed {
                    reason: e.to_string(),
                });
                RecoveryAttempt::Failed(e)
            }
        }
    }
}
