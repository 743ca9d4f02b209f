//! Cooperative scheduler for the worker's recurring duties.
//!
//! One future drives everything: it waits for the earliest armed timer (or a
//! control command), runs that duty to completion, and re-arms. Duties
//! therefore never overlap.
//!
//! ```text
//!            ┌──────────── schedule() ◄──────────────┐
//!            │                                       │
//!            ├─► arm ConsumeIncoming  (now)          │
//!            ├─► arm GenerateBatch    (+batch delay) │ on success
//!            ├─► arm ConsumeScoring   (now)          │
//!            └─► arm Reschedule       (+5s) ─────────┤ watchdog
//!                                                    │
//! timer fires ─► disarm ─► DutyRunner::run_duty ─────┘
//! ```
//!
//! # Coalescing
//!
//! Arming a task that is already armed is a no-op: a duty has at most one
//! pending invocation, never a queue of them. The armed flag is cleared right
//! before the duty runs, so a duty's own completion can re-arm it.
//!
//! # Liveness
//!
//! A failed duty does not re-arm anything itself. The watchdog re-arms every
//! enabled duty within one interval, so a fault delays a duty but never
//! stops it.
//!
//! # Lifecycle
//!
//! `Running → Draining → Stopped`. Draining is entered on
//! [`ControlCommand::Drain`]: the pending batch and the watchdog are
//! cancelled, armed consumption duties run one last time, and nothing new is
//! armed. Once no
//! duty is armed the scheduler stops and [`Scheduler::run`] returns.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bus::find_fatal;

/// Default delay between batch generation cycles.
pub const DEFAULT_NEW_BATCH_DELAY: Duration = Duration::from_secs(60);

/// Interval of the watchdog reschedule.
pub const RESCHEDULE_INTERVAL: Duration = Duration::from_secs(5);

const CONTROL_CHANNEL_CAPACITY: usize = 32;

// =============================================================================
// Duties
// =============================================================================

/// A recurring unit of work run by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Duty {
    ConsumeIncoming,
    ConsumeScoring,
    GenerateBatch,
}

impl Duty {
    pub const ALL: [Duty; 3] = [Duty::ConsumeIncoming, Duty::ConsumeScoring, Duty::GenerateBatch];

    /// Short name used by the control surface.
    pub fn name(&self) -> &'static str {
        match self {
            Duty::ConsumeIncoming => "incoming",
            Duty::ConsumeScoring => "scoring",
            Duty::GenerateBatch => "batches",
        }
    }
}

impl fmt::Display for Duty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown duty: {0} (expected incoming, scoring or batches)")]
pub struct UnknownDuty(pub String);

impl FromStr for Duty {
    type Err = UnknownDuty;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incoming" => Ok(Duty::ConsumeIncoming),
            "scoring" => Ok(Duty::ConsumeScoring),
            "batches" => Ok(Duty::GenerateBatch),
            other => Err(UnknownDuty(other.to_string())),
        }
    }
}

/// Which duties may be armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DutySwitches {
    pub incoming: bool,
    pub scoring: bool,
    pub batches: bool,
}

impl Default for DutySwitches {
    fn default() -> Self {
        Self {
            incoming: true,
            scoring: true,
            batches: true,
        }
    }
}

impl DutySwitches {
    pub fn is_enabled(&self, duty: Duty) -> bool {
        match duty {
            Duty::ConsumeIncoming => self.incoming,
            Duty::ConsumeScoring => self.scoring,
            Duty::GenerateBatch => self.batches,
        }
    }

    pub fn set(&mut self, duty: Duty, enabled: bool) {
        match duty {
            Duty::ConsumeIncoming => self.incoming = enabled,
            Duty::ConsumeScoring => self.scoring = enabled,
            Duty::GenerateBatch => self.batches = enabled,
        }
    }
}

/// Successful duty run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DutyReport {
    pub duty: Duty,
    /// Items the duty handled (messages consumed, requests attempted).
    pub processed: usize,
}

/// Failed duty run, carrying the duty it came from.
#[derive(Debug, Error)]
#[error("duty {duty} failed")]
pub struct DutyError {
    pub duty: Duty,
    #[source]
    pub source: anyhow::Error,
}

impl DutyError {
    pub fn new(duty: Duty, source: anyhow::Error) -> Self {
        Self { duty, source }
    }
}

/// Executes duties on behalf of the scheduler.
#[async_trait]
pub trait DutyRunner: Send {
    async fn run_duty(&mut self, duty: Duty) -> Result<DutyReport, DutyError>;
}

// =============================================================================
// Timers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Task {
    Duty(Duty),
    Reschedule,
}

/// Armed tasks and when they are due. Presence in the map is the armed flag.
#[derive(Debug, Default)]
struct TimerRegistry {
    armed: HashMap<Task, (Instant, u64)>,
    seq: u64,
}

impl TimerRegistry {
    /// Arm `task` after `delay`. Returns false if it was already armed.
    fn arm(&mut self, task: Task, delay: Duration) -> bool {
        if self.armed.contains_key(&task) {
            return false;
        }
        self.seq += 1;
        self.armed.insert(task, (Instant::now() + delay, self.seq));
        true
    }

    fn disarm(&mut self, task: Task) -> bool {
        self.armed.remove(&task).is_some()
    }

    fn is_armed(&self, task: Task) -> bool {
        self.armed.contains_key(&task)
    }

    /// Earliest deadline; ties go to whichever was armed first.
    fn next_due(&self) -> Option<(Task, Instant)> {
        self.armed
            .iter()
            .min_by_key(|(_, (deadline, seq))| (*deadline, *seq))
            .map(|(task, (deadline, _))| (*task, *deadline))
    }

    fn has_duties(&self) -> bool {
        self.armed.keys().any(|task| matches!(task, Task::Duty(_)))
    }
}

// =============================================================================
// Control
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Running,
    Draining,
    Stopped,
}

/// Commands accepted between duty runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Enable(Duty),
    Disable(Duty),
    Drain,
}

/// Read-only view of the scheduler published after every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub lifecycle: Lifecycle,
    pub duties: DutySwitches,
}

#[derive(Debug, Error)]
#[error("scheduler is no longer running")]
pub struct SchedulerGone;

/// Cloneable handle for sending commands and reading status.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<ControlCommand>,
    status: watch::Receiver<SchedulerStatus>,
}

impl SchedulerHandle {
    pub async fn send(&self, command: ControlCommand) -> Result<(), SchedulerGone> {
        self.commands.send(command).await.map_err(|_| SchedulerGone)
    }

    pub async fn enable(&self, duty: Duty) -> Result<(), SchedulerGone> {
        self.send(ControlCommand::Enable(duty)).await
    }

    pub async fn disable(&self, duty: Duty) -> Result<(), SchedulerGone> {
        self.send(ControlCommand::Disable(duty)).await
    }

    pub async fn drain(&self) -> Result<(), SchedulerGone> {
        self.send(ControlCommand::Drain).await
    }

    pub fn status(&self) -> SchedulerStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status change.
    pub fn watch(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.clone()
    }
}

// =============================================================================
// Scheduler
// =============================================================================

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub new_batch_delay: Duration,
    pub reschedule_interval: Duration,
    pub duties: DutySwitches,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            new_batch_delay: DEFAULT_NEW_BATCH_DELAY,
            reschedule_interval: RESCHEDULE_INTERVAL,
            duties: DutySwitches::default(),
        }
    }
}

enum Wake {
    Command(Option<ControlCommand>),
    Timer(Task),
}

pub struct Scheduler<R> {
    runner: R,
    config: SchedulerConfig,
    timers: TimerRegistry,
    lifecycle: Lifecycle,
    commands: mpsc::Receiver<ControlCommand>,
    control_open: bool,
    status: watch::Sender<SchedulerStatus>,
}

impl<R: DutyRunner> Scheduler<R> {
    pub fn new(runner: R, config: SchedulerConfig) -> (Self, SchedulerHandle) {
        let (commands_tx, commands) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (status, status_rx) = watch::channel(SchedulerStatus {
            lifecycle: Lifecycle::Running,
            duties: config.duties,
        });

        let scheduler = Self {
            runner,
            config,
            timers: TimerRegistry::default(),
            lifecycle: Lifecycle::Running,
            commands,
            control_open: true,
            status,
        };
        let handle = SchedulerHandle {
            commands: commands_tx,
            status: status_rx,
        };
        (scheduler, handle)
    }

    /// Run until stopped. Returns an error only when a duty hit a fatal bus
    /// failure.
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!(
            incoming = self.config.duties.incoming,
            scoring = self.config.duties.scoring,
            batches = self.config.duties.batches,
            batch_delay_secs = self.config.new_batch_delay.as_secs_f64(),
            "scheduler starting"
        );

        if self.config.duties.batches {
            self.timers.arm(Task::Duty(Duty::GenerateBatch), Duration::ZERO);
        }
        self.schedule();

        loop {
            if self.lifecycle == Lifecycle::Draining && !self.timers.has_duties() {
                self.set_lifecycle(Lifecycle::Stopped);
            }
            if self.lifecycle == Lifecycle::Stopped {
                break;
            }

            let Some((task, deadline)) = self.timers.next_due() else {
                // The watchdog stays armed while running.
                warn!("no task armed, stopping");
                self.set_lifecycle(Lifecycle::Stopped);
                break;
            };

            let wake = tokio::select! {
                biased;
                command = self.commands.recv(), if self.control_open => Wake::Command(command),
                _ = tokio::time::sleep_until(deadline) => Wake::Timer(task),
            };

            match wake {
                Wake::Command(Some(command)) => self.handle_command(command),
                Wake::Command(None) => {
                    debug!("control channel closed");
                    self.control_open = false;
                }
                Wake::Timer(task) => {
                    self.timers.disarm(task);
                    self.fire(task).await?;
                }
            }
        }

        info!("scheduler stopped");
        Ok(())
    }

    async fn fire(&mut self, task: Task) -> anyhow::Result<()> {
        let duty = match task {
            Task::Reschedule => {
                self.schedule();
                return Ok(());
            }
            Task::Duty(duty) => duty,
        };

        if !self.config.duties.is_enabled(duty) {
            debug!(%duty, "skipping disabled duty");
            return Ok(());
        }

        let started = Instant::now();
        let outcome = self.runner.run_duty(duty).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(report) => {
                debug!(
                    duty = %report.duty,
                    processed = report.processed,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "duty completed"
                );
                self.schedule();
                Ok(())
            }
            Err(e) => self.handle_failure(e),
        }
    }

    /// Central error handler: log and continue, or escalate on a fatal bus
    /// error.
    fn handle_failure(&mut self, failure: DutyError) -> anyhow::Result<()> {
        if let Some(bus) = find_fatal(&failure.source) {
            error!(duty = %failure.duty, error = %bus, "bus connection lost, stopping worker");
            self.set_lifecycle(Lifecycle::Stopped);
            return Err(failure.into());
        }
        error!(
            duty = %failure.duty,
            error = ?failure.source,
            "duty failed, watchdog will re-arm it"
        );
        Ok(())
    }

    /// Arm every enabled duty (coalesced), then the watchdog. Arms nothing
    /// once draining.
    fn schedule(&mut self) {
        if self.lifecycle != Lifecycle::Running {
            return;
        }
        let duties = self.config.duties;
        if duties.incoming {
            self.timers.arm(Task::Duty(Duty::ConsumeIncoming), Duration::ZERO);
        }
        if duties.batches {
            self.timers
                .arm(Task::Duty(Duty::GenerateBatch), self.config.new_batch_delay);
        }
        if duties.scoring {
            self.timers.arm(Task::Duty(Duty::ConsumeScoring), Duration::ZERO);
        }
        self.timers
            .arm(Task::Reschedule, self.config.reschedule_interval);
    }

    fn handle_command(&mut self, command: ControlCommand) {
        info!(?command, "control command");
        match command {
            ControlCommand::Enable(duty) => {
                self.config.duties.set(duty, true);
                self.schedule();
            }
            ControlCommand::Disable(duty) => {
                self.config.duties.set(duty, false);
                self.timers.disarm(Task::Duty(duty));
            }
            ControlCommand::Drain => {
                if self.lifecycle == Lifecycle::Running {
                    self.timers.disarm(Task::Duty(Duty::GenerateBatch));
                    self.timers.disarm(Task::Reschedule);
                    self.set_lifecycle(Lifecycle::Draining);
                }
            }
        }
        self.publish_status();
    }

    fn set_lifecycle(&mut self, lifecycle: Lifecycle) {
        if self.lifecycle != lifecycle {
            info!(from = ?self.lifecycle, to = ?lifecycle, "lifecycle change");
            self.lifecycle = lifecycle;
            self.publish_status();
        }
    }

    fn publish_status(&self) {
        self.status.send_replace(SchedulerStatus {
            lifecycle: self.lifecycle,
            duties: self.config.duties,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusError;
    use anyhow::anyhow;
    use std::sync::{Arc, Mutex};

    /// Records (duty, time since start) and can be told to fail.
    #[derive(Clone, Default)]
    struct FakeRunner {
        log: Arc<Mutex<Vec<(Duty, Duration)>>>,
        running: Arc<Mutex<Option<Duty>>>,
        fail: Arc<Mutex<HashMap<Duty, usize>>>,
        fatal: Arc<Mutex<Option<Duty>>>,
        started: Option<Instant>,
        work: Duration,
    }

    impl FakeRunner {
        fn new(work: Duration) -> Self {
            Self {
                started: Some(Instant::now()),
                work,
                ..Default::default()
            }
        }

        fn fail_times(&self, duty: Duty, times: usize) {
            self.fail.lock().unwrap().insert(duty, times);
        }

        fn runs(&self, duty: Duty) -> Vec<Duration> {
            self.log
                .lock()
                .unwrap()
                .iter()
                .filter(|(d, _)| *d == duty)
                .map(|(_, at)| *at)
                .collect()
        }
    }

    #[async_trait]
    impl DutyRunner for FakeRunner {
        async fn run_duty(&mut self, duty: Duty) -> Result<DutyReport, DutyError> {
            {
                let mut running = self.running.lock().unwrap();
                assert!(running.is_none(), "{duty} overlapped {:?}", *running);
                *running = Some(duty);
            }
            let at = self.started.map(|s| s.elapsed()).unwrap_or_default();
            self.log.lock().unwrap().push((duty, at));

            // Consumption duties block like a bounded poll.
            if duty != Duty::GenerateBatch {
                tokio::time::sleep(self.work).await;
            }
            *self.running.lock().unwrap() = None;

            if *self.fatal.lock().unwrap() == Some(duty) {
                return Err(DutyError::new(
                    duty,
                    anyhow::Error::new(BusError::Disconnected("gone".into())).context("fetch"),
                ));
            }
            let mut fail = self.fail.lock().unwrap();
            if let Some(remaining) = fail.get_mut(&duty) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(DutyError::new(duty, anyhow!("backend exploded")));
                }
            }
            Ok(DutyReport { duty, processed: 0 })
        }
    }

    fn config(duties: DutySwitches) -> SchedulerConfig {
        SchedulerConfig {
            duties,
            ..Default::default()
        }
    }

    #[test]
    fn test_timer_registry_coalesces() {
        let mut timers = TimerRegistry::default();
        let task = Task::Duty(Duty::GenerateBatch);

        assert!(timers.arm(task, Duration::from_secs(60)));
        let (_, first_deadline) = timers.next_due().unwrap();
        assert!(!timers.arm(task, Duration::ZERO));
        assert_eq!(timers.next_due().unwrap().1, first_deadline);

        assert!(timers.disarm(task));
        assert!(!timers.is_armed(task));
        assert!(timers.arm(task, Duration::ZERO));
    }

    #[test]
    fn test_timer_registry_orders_by_deadline_then_arming() {
        let mut timers = TimerRegistry::default();
        timers.arm(Task::Reschedule, Duration::from_secs(5));
        timers.arm(Task::Duty(Duty::ConsumeScoring), Duration::ZERO);
        timers.arm(Task::Duty(Duty::ConsumeIncoming), Duration::ZERO);

        assert_eq!(timers.next_due().unwrap().0, Task::Duty(Duty::ConsumeScoring));
        assert!(timers.has_duties());
        timers.disarm(Task::Duty(Duty::ConsumeScoring));
        timers.disarm(Task::Duty(Duty::ConsumeIncoming));
        assert!(!timers.has_duties());
        assert_eq!(timers.next_due().unwrap().0, Task::Reschedule);
    }

    #[test]
    fn test_duty_names_parse() {
        for duty in Duty::ALL {
            assert_eq!(duty.name().parse::<Duty>(), Ok(duty));
        }
        assert!("everything".parse::<Duty>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_runs_at_start_then_every_delay() {
        let runner = FakeRunner::new(Duration::from_secs(1));
        let (scheduler, handle) = Scheduler::new(runner.clone(), config(DutySwitches::default()));
        let task = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_secs(250)).await;
        handle.drain().await.unwrap();
        task.await.unwrap().unwrap();

        let batches = runner.runs(Duty::GenerateBatch);
        assert_eq!(batches[0], Duration::ZERO);
        // Re-armed by the next completion after each run, so consecutive runs
        // are at least the delay apart and never much more.
        assert!(batches.len() >= 4, "{batches:?}");
        for pair in batches.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= DEFAULT_NEW_BATCH_DELAY, "{gap:?}");
            assert!(gap <= DEFAULT_NEW_BATCH_DELAY + Duration::from_secs(2), "{gap:?}");
        }
        assert!(runner.runs(Duty::ConsumeIncoming).len() > 100);
        assert!(runner.runs(Duty::ConsumeScoring).len() > 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_alone_kept_alive_by_watchdog() {
        let runner = FakeRunner::new(Duration::from_secs(1));
        let duties = DutySwitches {
            incoming: false,
            scoring: false,
            batches: true,
        };
        let (scheduler, handle) = Scheduler::new(runner.clone(), config(duties));
        let task = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_secs(600)).await;
        handle.drain().await.unwrap();
        task.await.unwrap().unwrap();

        let batches = runner.runs(Duty::GenerateBatch);
        assert!(batches.len() >= 9, "{batches:?}");
        assert!(runner.runs(Duty::ConsumeIncoming).is_empty());
        assert!(runner.runs(Duty::ConsumeScoring).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_duty_resurrected_by_watchdog() {
        let runner = FakeRunner::new(Duration::from_millis(100));
        runner.fail_times(Duty::ConsumeIncoming, 3);
        let duties = DutySwitches {
            incoming: true,
            scoring: false,
            batches: false,
        };
        let (scheduler, handle) = Scheduler::new(runner.clone(), config(duties));
        let task = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_secs(30)).await;
        handle.drain().await.unwrap();
        task.await.unwrap().unwrap();

        let runs = runner.runs(Duty::ConsumeIncoming);
        // Three failures, each followed by a watchdog re-arm, then steady state.
        assert!(runs.len() > 10, "{runs:?}");
        assert!(runs[1] - runs[0] >= Duration::from_secs(4), "{runs:?}");
        assert!(runs[3] <= Duration::from_secs(16), "{runs:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_and_enable_at_runtime() {
        let runner = FakeRunner::new(Duration::from_millis(500));
        let (scheduler, handle) = Scheduler::new(runner.clone(), config(DutySwitches::default()));
        let task = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.disable(Duty::ConsumeScoring).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        let scoring_before = runner.runs(Duty::ConsumeScoring).len();
        assert!(!handle.status().duties.scoring);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runner.runs(Duty::ConsumeScoring).len(), scoring_before);

        handle.enable(Duty::ConsumeScoring).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(runner.runs(Duty::ConsumeScoring).len() > scoring_before);

        handle.drain().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_stops_without_new_batches() {
        let runner = FakeRunner::new(Duration::from_millis(200));
        let (scheduler, handle) = Scheduler::new(runner.clone(), config(DutySwitches::default()));
        let mut status = handle.watch();
        let task = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_secs(1)).await;
        let batches = runner.runs(Duty::GenerateBatch).len();
        handle.drain().await.unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(status.borrow_and_update().lifecycle, Lifecycle::Stopped);
        assert_eq!(runner.runs(Duty::GenerateBatch).len(), batches);
        assert!(matches!(handle.drain().await, Err(SchedulerGone)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_bus_error_escalates() {
        let runner = FakeRunner::new(Duration::from_millis(10));
        *runner.fatal.lock().unwrap() = Some(Duty::ConsumeIncoming);
        let (scheduler, handle) = Scheduler::new(runner.clone(), config(DutySwitches::default()));

        let err = scheduler.run().await.unwrap_err();
        assert!(find_fatal(&err).is_some());
        assert_eq!(handle.status().lifecycle, Lifecycle::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_without_control_handle() {
        let runner = FakeRunner::new(Duration::from_millis(100));
        let (scheduler, handle) = Scheduler::new(runner.clone(), config(DutySwitches::default()));
        drop(handle);

        let result = tokio::time::timeout(Duration::from_secs(20), scheduler.run()).await;
        // Still running when the timeout elapses.
        assert!(result.is_err());
        assert!(runner.runs(Duty::ConsumeIncoming).len() > 10);
    }
}
