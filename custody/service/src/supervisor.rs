// Copyright (c) 2024 The Botho Foundation

//! Process supervisor.
//!
//! Runs one child process per worker slot and replaces any child that dies
//! unexpectedly, without limit. On shutdown every live child receives
//! SIGTERM; children that exit because of it are not replaced.

use std::{
    collections::HashMap,
    ffi::OsString,
    future::Future,
    io,
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::ExitStatus,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use custody_core::{roles::GRACEFUL_EXIT_CODE, RestartBackoff, WorkerEnv};
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::{
    process::{Child, Command},
    sync::broadcast,
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

use crate::worker::ShutdownSignal;

/// A child that ran at least this long resets the consecutive restart count.
const STABLE_RUN: Duration = Duration::from_secs(60);

/// How long children get to exit after SIGTERM before being killed.
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Delay policy between restarts of one slot.
pub trait BackoffStrategy: Send + Sync {
    /// Delay before consecutive restart number `restarts` (starting at 1).
    fn delay(&self, restarts: u32) -> Duration;
}

impl BackoffStrategy for RestartBackoff {
    fn delay(&self, restarts: u32) -> Duration {
        RestartBackoff::delay(self, restarts)
    }
}

/// Starts worker processes.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, env: &WorkerEnv) -> io::Result<Child>;
}

/// Launches workers by re-running an executable with fixed arguments and
/// the worker identity in the environment.
#[derive(Debug, Clone)]
pub struct ExeLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ExeLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-run the current executable.
    pub fn current_exe(args: Vec<OsString>) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, args))
    }
}

impl WorkerLauncher for ExeLauncher {
    fn launch(&self, env: &WorkerEnv) -> io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .envs(env.to_env())
            .spawn()
    }
}

/// How a child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Terminated by SIGTERM, or exited with the graceful status
    Graceful,
    Unexpected,
}

pub fn classify_exit(status: ExitStatus) -> ExitKind {
    if status.signal() == Some(Signal::SIGTERM as i32) || status.code() == Some(GRACEFUL_EXIT_CODE)
    {
        ExitKind::Graceful
    } else {
        ExitKind::Unexpected
    }
}

/// Launch and restart counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    pub launched: u32,
    pub restarts: u32,
}

impl SupervisorReport {
    fn absorb(&mut self, other: SupervisorReport) {
        self.launched += other.launched;
        self.restarts += other.restarts;
    }
}

/// Live children by worker id.
#[derive(Debug, Default)]
struct Registry {
    pids: HashMap<u32, u32>,
    stopping: bool,
}

#[derive(Clone, Default)]
struct SharedRegistry(Arc<Mutex<Registry>>);

impl SharedRegistry {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a live child. Returns false once shutdown has begun.
    fn register(&self, id: u32, pid: u32) -> bool {
        let mut registry = self.lock();
        if registry.stopping {
            return false;
        }
        registry.pids.insert(id, pid);
        true
    }

    fn remove(&self, id: u32) {
        self.lock().pids.remove(&id);
    }

    fn is_stopping(&self) -> bool {
        self.lock().stopping
    }

    /// Mark shutdown and signal every live child.
    fn signal_all(&self, signal: Signal) {
        let mut registry = self.lock();
        registry.stopping = true;
        for (id, pid) in &registry.pids {
            debug!(worker = id, pid, ?signal, "Signalling worker");
            send_signal(*pid, signal);
        }
    }

    fn snapshot(&self) -> Vec<(u32, u32)> {
        let mut pids: Vec<_> = self.lock().pids.iter().map(|(id, pid)| (*id, *pid)).collect();
        pids.sort_unstable();
        pids
    }
}

fn send_signal(pid: u32, signal: Signal) {
    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        debug!(pid, ?signal, "Signal not delivered: {}", e);
    }
}

pub struct ProcessSupervisor {
    launcher: Arc<dyn WorkerLauncher>,
    backoff: Arc<dyn BackoffStrategy>,
    grace_period: Duration,
    registry: SharedRegistry,
}

impl ProcessSupervisor {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, backoff: Arc<dyn BackoffStrategy>) -> Self {
        Self {
            launcher,
            backoff,
            grace_period: DEFAULT_GRACE_PERIOD,
            registry: SharedRegistry::default(),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// `(worker id, pid)` of every live child.
    pub fn live_workers(&self) -> Vec<(u32, u32)> {
        self.registry.snapshot()
    }

    /// Supervise `workers` until `shutdown` completes or every slot has
    /// ended gracefully.
    pub async fn run(
        &self,
        workers: Vec<WorkerEnv>,
        shutdown: impl Future<Output = ()>,
    ) -> SupervisorReport {
        let (stop_tx, _) = broadcast::channel(1);
        let mut slots = JoinSet::new();

        info!(count = workers.len(), "Starting workers");
        for env in workers {
            slots.spawn(supervise_slot(
                env,
                self.launcher.clone(),
                self.backoff.clone(),
                self.registry.clone(),
                stop_tx.subscribe(),
            ));
        }

        let mut report = SupervisorReport::default();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                joined = slots.join_next() => match joined {
                    Some(result) => absorb_slot(&mut report, result),
                    None => {
                        info!("All workers exited");
                        return report;
                    }
                }
            }
        }

        info!("Shutdown requested, stopping workers");
        let _ = stop_tx.send(());
        self.registry.signal_all(Signal::SIGTERM);

        let drained = tokio::time::timeout(self.grace_period, drain(&mut slots, &mut report)).await;
        if drained.is_err() {
            warn!(grace = ?self.grace_period, "Workers still running, killing");
            self.registry.signal_all(Signal::SIGKILL);
            drain(&mut slots, &mut report).await;
        }

        info!(launched = report.launched, restarts = report.restarts, "Supervisor stopped");
        report
    }
}

async fn drain(
    slots: &mut JoinSet<SupervisorReport>,
    report: &mut SupervisorReport,
) {
    while let Some(result) = slots.join_next().await {
        absorb_slot(report, result);
    }
}

fn absorb_slot(
    report: &mut SupervisorReport,
    result: Result<SupervisorReport, tokio::task::JoinError>,
) {
    match result {
        Ok(slot) => report.absorb(slot),
        Err(e) => error!("Supervisor slot failed: {}", e),
    }
}

/// Sleep for `delay` unless shutdown arrives first. Returns true on
/// shutdown.
async fn sleep_or_stop(delay: Duration, stop: &mut ShutdownSignal) -> bool {
    tokio::select! {
        _ = stop.recv() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

/// Keep one worker slot running until it exits gracefully or shutdown.
async fn supervise_slot(
    env: WorkerEnv,
    launcher: Arc<dyn WorkerLauncher>,
    backoff: Arc<dyn BackoffStrategy>,
    registry: SharedRegistry,
    mut stop: ShutdownSignal,
) -> SupervisorReport {
    let mut report = SupervisorReport::default();
    let mut consecutive = 0u32;

    loop {
        let started = Instant::now();
        match launcher.launch(&env) {
            Ok(mut child) => {
                report.launched += 1;
                let pid = child.id();

                if let Some(pid) = pid {
                    if !registry.register(env.id, pid) {
                        send_signal(pid, Signal::SIGTERM);
                        let _ = child.wait().await;
                        break;
                    }
                }
                info!(worker = %env, pid = ?pid, "Worker started");

                let status = child.wait().await;
                registry.remove(env.id);

                match status {
                    Ok(status) if classify_exit(status) == ExitKind::Graceful => {
                        info!(worker = %env, %status, "Worker exited gracefully");
                        break;
                    }
                    Ok(status) => {
                        warn!(worker = %env, %status, "Worker exited unexpectedly");
                    }
                    Err(e) => error!(worker = %env, "Failed to wait for worker: {}", e),
                }
            }
            Err(e) => error!(worker = %env, "Failed to launch worker: {}", e),
        }

        if registry.is_stopping() {
            break;
        }
        if started.elapsed() >= STABLE_RUN {
            consecutive = 0;
        }
        consecutive = consecutive.saturating_add(1);
        let delay = backoff.delay(consecutive);
        info!(worker = %env, restarts = consecutive, delay = ?delay, "Restarting worker");
        report.restarts += 1;

        if sleep_or_stop(delay, &mut stop).await {
            break;
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use custody_core::{ChainId, WorkerRole};
    use std::process::Command as StdCommand;

    /// Runs a shell script as the worker.
    struct ShellLauncher {
        script: &'static str,
    }

    impl WorkerLauncher for ShellLauncher {
        fn launch(&self, env: &WorkerEnv) -> io::Result<Child> {
            Command::new("sh")
                .arg("-c")
                .arg(self.script)
                .envs(env.to_env())
                .spawn()
        }
    }

    fn supervisor(script: &'static str, backoff: RestartBackoff) -> ProcessSupervisor {
        ProcessSupervisor::new(Arc::new(ShellLauncher { script }), Arc::new(backoff))
            .with_grace_period(Duration::from_secs(5))
    }

    fn env(id: u32, role: WorkerRole) -> WorkerEnv {
        WorkerEnv {
            id,
            role,
            chain: Some(ChainId::Solana),
        }
    }

    fn status_of(script: &str) -> ExitStatus {
        StdCommand::new("sh").arg("-c").arg(script).status().unwrap()
    }

    #[test]
    fn test_classify_exit() {
        assert_eq!(classify_exit(status_of("exit 143")), ExitKind::Graceful);
        assert_eq!(classify_exit(status_of("kill -TERM $$")), ExitKind::Graceful);
        assert_eq!(classify_exit(status_of("exit 1")), ExitKind::Unexpected);
        assert_eq!(classify_exit(status_of("exit 0")), ExitKind::Unexpected);
        assert_eq!(classify_exit(status_of("kill -KILL $$")), ExitKind::Unexpected);
    }

    #[tokio::test]
    async fn test_crashing_worker_is_restarted() {
        let supervisor = supervisor("exit 1", RestartBackoff::Fixed { delay_ms: 20 });
        let report = supervisor
            .run(
                vec![env(1, WorkerRole::BlockProcessor)],
                tokio::time::sleep(Duration::from_millis(400)),
            )
            .await;

        assert!(report.restarts >= 2, "{:?}", report);
        assert!(report.launched >= report.restarts);
    }

    #[tokio::test]
    async fn test_graceful_exit_is_not_restarted() {
        let supervisor = supervisor(
            r#"test "$CUSTODY_WORKER_ROLE" = block-processor && exit 143; exit 1"#,
            RestartBackoff::Immediate,
        );
        let report = supervisor
            .run(
                vec![env(1, WorkerRole::BlockProcessor)],
                futures::future::pending(),
            )
            .await;

        assert_eq!(
            report,
            SupervisorReport {
                launched: 1,
                restarts: 0
            }
        );
    }

    #[tokio::test]
    async fn test_shutdown_terminates_workers() {
        let supervisor = supervisor("exec sleep 30", RestartBackoff::Immediate);
        let (tx, mut rx) = broadcast::channel::<()>(1);

        let run = supervisor.run(
            vec![env(1, WorkerRole::BlockFetcher), env(2, WorkerRole::BlockProcessor)],
            async move {
                let _ = rx.recv().await;
            },
        );
        let trigger = async {
            for _ in 0..200 {
                if supervisor.live_workers().len() == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(supervisor.live_workers().len(), 2);
            tx.send(()).unwrap();
        };

        let (report, ()) = tokio::join!(run, trigger);
        assert_eq!(report.launched, 2);
        assert_eq!(report.restarts, 0);
        assert!(supervisor.live_workers().is_empty());
    }

    #[test]
    fn test_backoff_strategy() {
        let backoff: Arc<dyn BackoffStrategy> = Arc::new(RestartBackoff::Exponential {
            initial_ms: 100,
            max_ms: 1_000,
        });
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(10), Duration::from_millis(1_000));
    }
}
