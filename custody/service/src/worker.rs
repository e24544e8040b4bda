// Copyright (c) 2024 The Botho Foundation

//! Worker state machine and the scheduler that drives it.
//!
//! Each worker cycles `idle -> fetching -> processing -> persisting -> idle`.
//! The scheduler can stop a worker while it is waiting for work or sleeping
//! between cycles; a cycle that is already processing runs to completion.

use std::time::Duration;

use async_trait::async_trait;
use custody_core::{CustodyError, WorkerPhase, WorkerRole};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{error, info, trace, warn};

/// Shutdown signal type.
pub type ShutdownSignal = broadcast::Receiver<()>;

/// Minimum pause after a failed cycle.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// One kind of long-running worker.
#[async_trait]
pub trait Worker: Send {
    /// What `fetch` hands to `process`.
    type Work: Send;

    fn role(&self) -> WorkerRole;

    /// Pause between cycles.
    fn cycle_delay(&self) -> Duration;

    /// Wait for or look up the next piece of work. `None` means nothing to
    /// do this cycle. Cancelled on shutdown.
    async fn fetch(&mut self) -> Result<Option<Self::Work>, CustodyError>;

    /// Act on the work and commit the results. Never cancelled.
    async fn process(
        &mut self,
        work: Self::Work,
        phase: &mut PhaseTracker,
    ) -> Result<(), CustodyError>;
}

/// Current phase of a worker, with transitions traced.
#[derive(Debug)]
pub struct PhaseTracker {
    role: WorkerRole,
    phase: WorkerPhase,
}

impl PhaseTracker {
    pub fn new(role: WorkerRole) -> Self {
        Self {
            role,
            phase: WorkerPhase::Idle,
        }
    }

    pub fn enter(&mut self, phase: WorkerPhase) {
        if self.phase != phase {
            trace!(role = %self.role, from = %self.phase, to = %phase, "Phase change");
            self.phase = phase;
        }
    }

    pub fn current(&self) -> WorkerPhase {
        self.phase
    }
}

/// Counts consecutive failed cycles and escalates the log level once the
/// alert threshold is reached.
#[derive(Debug)]
pub struct FailureTracker {
    consecutive: u32,
    alert_after: u32,
}

impl FailureTracker {
    pub fn new(alert_after: u32) -> Self {
        Self {
            consecutive: 0,
            alert_after,
        }
    }

    /// Record a failed cycle. Returns true once the alert threshold is hit.
    pub fn record(&mut self, role: WorkerRole, e: &CustodyError) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        let alerting = self.alert_after > 0 && self.consecutive >= self.alert_after;
        if alerting {
            error!(
                %role,
                failures = self.consecutive,
                "Cycle keeps failing, will retry: {}",
                e
            );
        } else {
            warn!(%role, failures = self.consecutive, "Cycle failed, will retry: {}", e);
        }
        alerting
    }

    pub fn reset(&mut self, role: WorkerRole) {
        if self.consecutive > 0 {
            info!(%role, failures = self.consecutive, "Recovered after failed cycles");
        }
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Drives a [`Worker`] until shutdown or a fatal error.
#[derive(Debug, Clone)]
pub struct WorkerScheduler {
    alert_after_failures: u32,
    retry_delay: Duration,
}

impl WorkerScheduler {
    pub fn new(alert_after_failures: u32) -> Self {
        Self {
            alert_after_failures,
            retry_delay: RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Run cycles until `shutdown` fires (or its sender is dropped).
    ///
    /// Only configuration errors end the loop with an error; every other
    /// failure is logged and the cycle is retried after the delay.
    pub async fn run<W: Worker>(
        &self,
        mut worker: W,
        mut shutdown: ShutdownSignal,
    ) -> Result<(), CustodyError> {
        let role = worker.role();
        let mut phase = PhaseTracker::new(role);
        let mut failures = FailureTracker::new(self.alert_after_failures);
        info!(%role, "Worker started");

        loop {
            phase.enter(WorkerPhase::Fetching);
            let fetched = tokio::select! {
                _ = shutdown.recv() => break,
                fetched = worker.fetch() => fetched,
            };

            let outcome = match fetched {
                Ok(Some(work)) => {
                    phase.enter(WorkerPhase::Processing);
                    worker.process(work, &mut phase).await
                }
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            phase.enter(WorkerPhase::Idle);

            let delay = match outcome {
                Ok(()) => {
                    failures.reset(role);
                    worker.cycle_delay()
                }
                Err(e) if e.is_fatal() => {
                    error!(%role, "Worker stopping on fatal error: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    failures.record(role, &e);
                    worker.cycle_delay().max(self.retry_delay)
                }
            };

            if delay.is_zero() {
                if !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)) {
                    break;
                }
                continue;
            }
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(%role, "Worker stopped");
        Ok(())
    }
}
