//! Worker fleet supervision
//!
//! The supervisor owns a fixed table of `max_workers` slots. Each slot is
//! either running one child or waiting out its restart delay. Liveness comes
//! only from this table: a child counts as running until `try_wait` on its own
//! handle reports an exit, and that call also reaps it. The OS process list is
//! never consulted.
//!
//! Children start in their own process group. Stopping sends SIGTERM to the
//! group, waits up to `stop_timeout`, then sends SIGKILL and reaps. Dropping
//! the [`Supervisor`] kills and reaps whatever is still in the table. On Linux
//! children also get a parent-death signal, covering a supervisor that is
//! killed outright.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SupervisorError};

/// Environment variable carrying the slot index into each child.
pub const SLOT_ENV: &str = "ZEN_SUPERVISOR_SLOT";

/// Program and arguments started in every slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from a program-plus-arguments list.
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SupervisorError::Config("no worker command given".into()))?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub max_workers: usize,
    pub reap_interval: Duration,
    /// Time between SIGTERM and SIGKILL at shutdown
    pub stop_timeout: Duration,
    /// Delay before restarting a slot after a clean exit or a first crash
    pub restart_backoff: Duration,
    pub max_restart_backoff: Duration,
    /// A child that ran this long resets its slot's crash streak
    pub stability_window: Duration,
    /// At most one crash is logged at warn level per interval
    pub crash_log_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            reap_interval: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(30),
            restart_backoff: Duration::from_secs(1),
            max_restart_backoff: Duration::from_secs(60),
            stability_window: Duration::from_secs(60),
            crash_log_interval: Duration::from_secs(10),
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(SupervisorError::Config("max workers must be at least 1".into()));
        }
        if self.reap_interval.is_zero() {
            return Err(SupervisorError::Config("reap interval must be greater than 0".into()));
        }
        if self.max_restart_backoff < self.restart_backoff {
            return Err(SupervisorError::Config(format!(
                "max restart backoff ({:?}) is below the base backoff ({:?})",
                self.max_restart_backoff, self.restart_backoff
            )));
        }
        Ok(())
    }

    /// Restart delay after the `streak`-th consecutive crash of a slot.
    pub fn crash_delay(&self, streak: u32) -> Duration {
        let factor = 2u32.saturating_pow(streak.saturating_sub(1).min(20));
        self.restart_backoff
            .saturating_mul(factor)
            .min(self.max_restart_backoff)
    }
}

/// Fleet counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FleetSummary {
    pub spawned: u64,
    pub clean_exits: u64,
    pub crashes: u64,
    pub spawn_failures: u64,
    /// Children that ignored SIGTERM and were killed
    pub force_killed: u64,
    /// Crash reports folded into a later log line
    pub suppressed_crash_logs: u64,
    pub running: usize,
}

enum SlotState {
    Waiting { until: Instant },
    Running { child: Child, pid: u32, started: Instant },
}

struct Slot {
    index: usize,
    state: SlotState,
    crash_streak: u32,
}

impl Slot {
    fn pid(&self) -> Option<u32> {
        match self.state {
            SlotState::Running { pid, .. } => Some(pid),
            SlotState::Waiting { .. } => None,
        }
    }
}

struct CrashLog {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl CrashLog {
    /// Returns the number of crashes folded into this report, or `None` when
    /// this one should be suppressed.
    fn admit(&mut self, now: Instant) -> Option<u64> {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed += 1;
                None
            },
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            },
        }
    }
}

struct FleetTable {
    slots: Vec<Slot>,
    summary: FleetSummary,
    crash_log: CrashLog,
    stopping: bool,
}

/// Keeps up to `max_workers` copies of a worker command running
pub struct Supervisor {
    config: SupervisorConfig,
    command: WorkerCommand,
    table: Mutex<FleetTable>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, command: WorkerCommand) -> Result<Self> {
        config.validate()?;
        let now = Instant::now();
        let slots = (0..config.max_workers)
            .map(|index| Slot {
                index,
                state: SlotState::Waiting { until: now },
                crash_streak: 0,
            })
            .collect();

        Ok(Self {
            table: Mutex::new(FleetTable {
                slots,
                summary: FleetSummary::default(),
                crash_log: CrashLog {
                    interval: config.crash_log_interval,
                    last: None,
                    suppressed: 0,
                },
                stopping: false,
            }),
            config,
            command,
        })
    }

    fn table(&self) -> MutexGuard<'_, FleetTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reap finished children and start children in slots whose delay is
    /// over. Returns the number of running children afterwards.
    pub fn tick(&self) -> usize {
        let now = Instant::now();
        let mut table = self.table();
        self.reap(&mut table, now);
        if !table.stopping {
            self.fill(&mut table, now);
        }
        count_running(&table)
    }

    /// Children currently alive, after reaping any that have exited.
    pub fn running(&self) -> usize {
        let mut table = self.table();
        self.reap(&mut table, Instant::now());
        count_running(&table)
    }

    /// Process ids of the running children.
    pub fn pids(&self) -> Vec<u32> {
        self.table().slots.iter().filter_map(Slot::pid).collect()
    }

    pub fn summary(&self) -> FleetSummary {
        let table = self.table();
        FleetSummary {
            running: count_running(&table),
            ..table.summary
        }
    }

    /// Supervise until `shutdown` fires, then stop every child.
    pub async fn run(&self, shutdown: CancellationToken) -> FleetSummary {
        info!(
            program = %self.command.program,
            max_workers = self.config.max_workers,
            "Supervisor started"
        );

        let mut ticker = tokio::time::interval(self.config.reap_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {},
            }
            self.tick();
        }

        self.stop_all().await;
        let summary = self.summary();
        info!(
            spawned = summary.spawned,
            clean_exits = summary.clean_exits,
            crashes = summary.crashes,
            force_killed = summary.force_killed,
            "Supervisor stopped"
        );
        summary
    }

    /// SIGTERM every child, wait up to `stop_timeout`, then SIGKILL the rest.
    pub async fn stop_all(&self) {
        let targets = {
            let mut table = self.table();
            table.stopping = true;
            self.reap(&mut table, Instant::now());
            table.slots.iter().filter_map(Slot::pid).collect::<Vec<_>>()
        };
        if targets.is_empty() {
            return;
        }

        info!(children = targets.len(), timeout_secs = self.config.stop_timeout.as_secs(), "Stopping workers");
        for pid in &targets {
            signal_group(*pid, Signal::SIGTERM);
        }

        let deadline = Instant::now() + self.config.stop_timeout;
        let poll = self.config.reap_interval.min(Duration::from_millis(50));
        while self.running() > 0 && Instant::now() < deadline {
            tokio::time::sleep(poll).await;
        }

        let mut table = self.table();
        let mut killed = 0;
        for slot in table.slots.iter_mut() {
            if let SlotState::Running { child, pid, .. } = &mut slot.state {
                warn!(slot = slot.index, pid = *pid, "Worker ignored SIGTERM, killing");
                kill_and_reap(child, *pid);
                slot.state = SlotState::Waiting {
                    until: Instant::now(),
                };
                killed += 1;
            }
        }
        table.summary.force_killed += killed;
    }

    fn reap(&self, table: &mut FleetTable, now: Instant) {
        let FleetTable {
            slots,
            summary,
            crash_log,
            stopping,
        } = table;

        for slot in slots.iter_mut() {
            let SlotState::Running { child, pid, started } = &mut slot.state else {
                continue;
            };
            let (pid, started) = (*pid, *started);

            let status = match child.try_wait() {
                Ok(Some(status)) => status,
                Ok(None) => continue,
                Err(e) => {
                    warn!(slot = slot.index, pid, error = %e, "Failed to poll worker");
                    continue;
                },
            };

            let uptime = now.saturating_duration_since(started);
            let delay = if status.success() || *stopping {
                summary.clean_exits += 1;
                slot.crash_streak = 0;
                info!(slot = slot.index, pid, uptime_secs = uptime.as_secs(), "Worker exited");
                self.config.restart_backoff
            } else {
                summary.crashes += 1;
                if uptime >= self.config.stability_window {
                    slot.crash_streak = 0;
                }
                slot.crash_streak += 1;
                let delay = self.config.crash_delay(slot.crash_streak);

                match crash_log.admit(now) {
                    Some(folded) => warn!(
                        slot = slot.index,
                        pid,
                        status = %describe(status),
                        streak = slot.crash_streak,
                        restart_in_ms = delay.as_millis() as u64,
                        suppressed = folded,
                        "Worker crashed"
                    ),
                    None => {
                        summary.suppressed_crash_logs += 1;
                        debug!(slot = slot.index, pid, status = %describe(status), "Worker crashed");
                    },
                }
                delay
            };

            slot.state = SlotState::Waiting { until: now + delay };
        }
    }

    fn fill(&self, table: &mut FleetTable, now: Instant) {
        let FleetTable { slots, summary, .. } = table;

        for slot in slots.iter_mut() {
            let SlotState::Waiting { until } = slot.state else {
                continue;
            };
            if until > now {
                continue;
            }

            match self.spawn_child(slot.index) {
                Ok(child) => {
                    let pid = child.id();
                    debug!(slot = slot.index, pid, "Worker started");
                    summary.spawned += 1;
                    slot.state = SlotState::Running {
                        child,
                        pid,
                        started: now,
                    };
                },
                Err(e) => {
                    summary.spawn_failures += 1;
                    slot.crash_streak += 1;
                    let delay = self.config.crash_delay(slot.crash_streak);
                    error!(slot = slot.index, error = %e, restart_in_ms = delay.as_millis() as u64, "Failed to start worker");
                    slot.state = SlotState::Waiting { until: now + delay };
                },
            }
        }
    }

    fn spawn_child(&self, slot: usize) -> Result<Child> {
        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .env(SLOT_ENV, slot.to_string())
            .stdin(Stdio::null())
            .process_group(0);

        #[cfg(target_os = "linux")]
        // SAFETY: prctl is async-signal-safe and touches no parent state.
        // The signal fires when the spawning thread exits; runtime worker
        // threads live as long as the supervisor.
        unsafe {
            command.pre_exec(|| nix::sys::prctl::set_pdeathsig(Signal::SIGTERM).map_err(std::io::Error::from));
        }

        command.spawn().map_err(|source| SupervisorError::Spawn {
            program: self.command.program.clone(),
            source,
        })
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let table = self.table.get_mut().unwrap_or_else(PoisonError::into_inner);
        for slot in table.slots.iter_mut() {
            if let SlotState::Running { child, pid, .. } = &mut slot.state {
                warn!(slot = slot.index, pid = *pid, "Killing worker left running at supervisor exit");
                kill_and_reap(child, *pid);
            }
        }
    }
}

fn count_running(table: &FleetTable) -> usize {
    table
        .slots
        .iter()
        .filter(|s| matches!(s.state, SlotState::Running { .. }))
        .count()
}

fn group_of(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().map(Pid::from_raw)
}

fn signal_group(pid: u32, signal: Signal) {
    let Some(pgid) = group_of(pid) else { return };
    match killpg(pgid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {},
        Err(e) => warn!(pid, signal = %signal, error = %e, "Failed to signal worker"),
    }
}

fn kill_and_reap(child: &mut Child, pid: u32) {
    signal_group(pid, Signal::SIGKILL);
    if let Err(e) = child.wait() {
        warn!(pid, error = %e, "Failed to reap worker");
    }
}

fn describe(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        _ => status.to_string(),
    }
}
