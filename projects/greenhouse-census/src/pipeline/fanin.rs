//! Join barrier for per-container units, keyed by session id.
//!
//! `open` registers how many units were dispatched. Each unit reports
//! exactly one terminal outcome through `signal`. When the last outcome
//! arrives the collected outcomes are handed to the single waiter.

use crate::error::{IsolatedFailure, PipelineError, Result};
use crate::pipeline::types::ContainerReport;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// Terminal outcome of one container unit.
#[derive(Debug, Clone)]
pub enum UnitOutcome {
    Done(ContainerReport),
    Failed(IsolatedFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Recorded; more outcomes are still pending.
    Accepted,
    /// Recorded and it was the last one; the waiter has been released.
    Completed,
    /// This unit already reported; ignored.
    Duplicate,
    /// No open barrier for the session, or index out of range.
    Unknown,
}

struct Pending {
    expected: usize,
    outcomes: BTreeMap<usize, UnitOutcome>,
    waiter: Option<oneshot::Sender<Vec<UnitOutcome>>>,
}

impl Pending {
    fn is_complete(&self) -> bool {
        self.outcomes.len() == self.expected
    }

    fn release(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            let outcomes = std::mem::take(&mut self.outcomes).into_values().collect();
            let _ = waiter.send(outcomes);
        }
    }
}

#[derive(Default)]
pub struct FanInRegistry {
    sessions: Mutex<HashMap<String, Pending>>,
}

impl FanInRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Pending>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a fan-out of `expected` units. Fails if the session already
    /// has an open barrier.
    pub fn open(&self, session_id: &str, expected: usize) -> Result<Barrier> {
        let (tx, rx) = oneshot::channel();
        let mut sessions = self.lock();
        if sessions.contains_key(session_id) {
            return Err(PipelineError::validation(format!(
                "session {session_id} already has units in flight"
            )));
        }
        let mut pending = Pending {
            expected,
            outcomes: BTreeMap::new(),
            waiter: Some(tx),
        };
        if expected == 0 {
            pending.release();
        } else {
            sessions.insert(session_id.to_string(), pending);
        }
        Ok(Barrier {
            session_id: session_id.to_string(),
            expected,
            rx,
        })
    }

    pub fn signal(&self, session_id: &str, index: usize, outcome: UnitOutcome) -> Signal {
        let mut sessions = self.lock();
        let Some(pending) = sessions.get_mut(session_id) else {
            return Signal::Unknown;
        };
        if index >= pending.expected {
            return Signal::Unknown;
        }
        if pending.outcomes.contains_key(&index) {
            return Signal::Duplicate;
        }
        pending.outcomes.insert(index, outcome);
        if pending.is_complete() {
            pending.release();
            sessions.remove(session_id);
            Signal::Completed
        } else {
            Signal::Accepted
        }
    }

    /// Whether every dispatched unit has reported. A session with no open
    /// barrier counts as complete.
    pub fn is_complete(&self, session_id: &str) -> bool {
        self.lock()
            .get(session_id)
            .map(Pending::is_complete)
            .unwrap_or(true)
    }

    /// Outcomes still missing for an open barrier.
    pub fn outstanding(&self, session_id: &str) -> Option<usize> {
        self.lock()
            .get(session_id)
            .map(|p| p.expected - p.outcomes.len())
    }

    /// Drop an open barrier; late signals are then ignored.
    pub fn abandon(&self, session_id: &str) {
        self.lock().remove(session_id);
    }
}

/// The waiting side of one fan-out.
pub struct Barrier {
    session_id: String,
    expected: usize,
    rx: oneshot::Receiver<Vec<UnitOutcome>>,
}

impl Barrier {
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Wait for all outcomes, ordered by unit index. On timeout the barrier
    /// is abandoned in `registry`.
    pub async fn wait(self, registry: &FanInRegistry, timeout: Duration) -> Result<Vec<UnitOutcome>> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(outcomes)) => Ok(outcomes),
            Ok(Err(_)) => Err(PipelineError::Timeout(format!(
                "fan-in for session {} was abandoned",
                self.session_id
            ))),
            Err(_) => {
                let missing = registry.outstanding(&self.session_id).unwrap_or(0);
                registry.abandon(&self.session_id);
                Err(PipelineError::Timeout(format!(
                    "{} of {} container units still running after {:?}",
                    missing, self.expected, timeout
                )))
            }
        }
    }
}
