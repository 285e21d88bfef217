//! Supervisor master role: the worker pool controller and signal router.
use std::env;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::launcher::Launcher;
use crate::pidfile::PidFile;
use crate::{Error, ExitCode, Result, RoleLog, WORKER_SLOT};

/// Ceiling on ungraceful worker exits for one master lifetime.
///
/// Once exceeded no further respawns happen; the pool runs permanently
/// short rather than forking indefinitely through a crash loop.
const RETRY_LIMIT: u32 = 10;

/// Immutable supervisor options, supplied once by the configuration
/// layer.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Number of worker processes in the pool.
    pub workers: usize,
    /// Path of the pidfile registry.
    pub pidfile: PathBuf,
    /// Standard output sink for the daemon, opened in append mode.
    pub stdout: Option<PathBuf>,
    /// Standard error sink for the daemon, opened in append mode.
    pub stderr: Option<PathBuf>,
}

/// Build a supervisor configuration.
pub struct SupervisorBuilder {
    workers: usize,
    pidfile: PathBuf,
    stdout: Option<PathBuf>,
    stderr: Option<PathBuf>,
}

impl SupervisorBuilder {
    /// Create a new builder with a single worker and a pidfile in the
    /// system temporary directory.
    pub fn new() -> Self {
        Self {
            workers: 1,
            pidfile: env::temp_dir().join("dmon.pid"),
            stdout: None,
            stderr: None,
        }
    }

    /// Set the worker pool size.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the pidfile path.
    pub fn pidfile(mut self, path: impl AsRef<Path>) -> Self {
        self.pidfile = path.as_ref().to_path_buf();
        self
    }

    /// Set the standard output sink path.
    pub fn stdout(mut self, path: impl AsRef<Path>) -> Self {
        self.stdout = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the standard error sink path.
    pub fn stderr(mut self, path: impl AsRef<Path>) -> Self {
        self.stderr = Some(path.as_ref().to_path_buf());
        self
    }

    /// Return the configuration, clamping the pool size to at least
    /// one worker.
    pub fn build(self) -> SupervisorConfig {
        SupervisorConfig {
            workers: self.workers.max(1),
            pidfile: self.pidfile,
            stdout: self.stdout,
            stderr: self.stderr,
        }
    }
}

impl Default for SupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Role of the current process, resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The detached daemon that owns the pidfile and forks workers.
    Master,
    /// A forked child executing the user-supplied function.
    Worker(usize),
    /// A command invocation outside the daemon.
    Control,
}

/// Resolve the role of the current process.
///
/// A worker is recognised by the slot environment variable set when
/// the master forked it; the master recognises itself because the
/// launcher recorded its pid before it started running.
pub fn resolve_role(pidfile: &PidFile) -> Role {
    if let Ok(slot) = env::var(WORKER_SLOT) {
        if let Ok(slot) = slot.parse::<usize>() {
            return Role::Worker(slot);
        }
    }
    if pidfile.load().pid == Some(process::id()) {
        return Role::Master;
    }
    Role::Control
}

/// One worker exit, emitted by the waiter task and consumed exactly
/// once by the pool controller.
#[derive(Debug)]
struct ExitEvent {
    slot: usize,
    pid: u32,
    code: Option<i32>,
    signal: Option<i32>,
}

/// Occupied pool position.
#[derive(Debug, Clone, Copy)]
struct SlotState {
    pid: u32,
    /// Set when the worker was deliberately disconnected; its exit is
    /// then graceful, not a crash.
    disconnected: bool,
}

#[derive(Debug, Default)]
struct GracefulTally {
    count: usize,
}

impl GracefulTally {
    /// Record one graceful exit; true when the last expected worker
    /// has now exited.
    fn record(&mut self, expected: usize) -> bool {
        self.count += 1;
        self.count == expected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RespawnDecision {
    Respawn,
    RetryExhausted,
    Systemic(i32),
}

/// Decide whether a crashed slot is refilled.
///
/// `retries` is the total of ungraceful exits seen so far, including
/// the one being classified. The ceiling is checked first, then the
/// sentinel exit codes that indicate a systematic application bug.
fn respawn_decision(retries: u32, code: Option<i32>) -> RespawnDecision {
    if retries > RETRY_LIMIT {
        return RespawnDecision::RetryExhausted;
    }
    match code {
        Some(code)
            if code == ExitCode::UnhandledRejection.code()
                || code == ExitCode::UnhandledException.code() =>
        {
            RespawnDecision::Systemic(code)
        }
        _ => RespawnDecision::Respawn,
    }
}

fn describe_exit(event: &ExitEvent) -> String {
    match (event.code, event.signal) {
        (Some(code), _) => format!("code {}", code),
        (None, Some(signal)) => format!("signal {}", signal),
        (None, None) => "unknown status".to_string(),
    }
}

struct Pool<'a> {
    config: &'a SupervisorConfig,
    slots: Vec<Option<SlotState>>,
    retries: u32,
    graceful: GracefulTally,
    tx: mpsc::UnboundedSender<ExitEvent>,
    log: RoleLog,
}

impl<'a> Pool<'a> {
    /// Fork a worker into the given slot by re-executing the current
    /// program with the slot number in the environment.
    fn fork(&mut self, slot: usize) -> Result<()> {
        let exe = env::current_exe()?;
        let mut child = Command::new(exe)
            .args(env::args_os().skip(1))
            .env(WORKER_SLOT, slot.to_string())
            .spawn()?;
        let pid = child.id().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "worker exited before its pid could be captured",
            ))
        })?;
        self.log
            .info(format_args!("forked worker slot {} (pid {})", slot, pid));
        self.slots[slot] = Some(SlotState {
            pid,
            disconnected: false,
        });

        let tx = self.tx.clone();
        tokio::spawn(async move {
            let (code, signal) = match child.wait().await {
                Ok(status) => (status.code(), status.signal()),
                Err(_) => (None, None),
            };
            let _ = tx.send(ExitEvent {
                slot,
                pid,
                code,
                signal,
            });
        });
        Ok(())
    }

    /// Classify one worker exit and apply the respawn policy.
    fn handle_exit(&mut self, event: ExitEvent) {
        let state = match self.slots.get_mut(event.slot).and_then(|s| s.take()) {
            Some(state) => state,
            None => {
                self.log
                    .warn(format_args!("stale exit event for slot {}", event.slot));
                return;
            }
        };

        if state.disconnected {
            self.log
                .info(format_args!("worker {} exited gracefully", event.pid));
            if self.graceful.record(self.config.workers) {
                self.log.info("all workers exited gracefully");
            }
            return;
        }

        self.retries += 1;
        let detail = describe_exit(&event);
        match respawn_decision(self.retries, event.code) {
            RespawnDecision::Respawn => {
                self.log.warn(format_args!(
                    "worker {} died ({}), respawning slot {}",
                    event.pid, detail, event.slot
                ));
                if let Err(e) = self.fork(event.slot) {
                    self.log
                        .error(format_args!("failed to respawn slot {}: {}", event.slot, e));
                }
            }
            RespawnDecision::RetryExhausted => {
                self.log.error(format_args!(
                    "worker {} died ({}) after {} respawns, leaving slot {} vacant",
                    event.pid, detail, RETRY_LIMIT, event.slot
                ));
            }
            RespawnDecision::Systemic(code) => {
                self.log.error(format_args!(
                    "worker {} exited with sentinel code {}, not respawning slot {}",
                    event.pid, code, event.slot
                ));
            }
        }
    }

    /// Mark every worker disconnected and ask it to finish.
    fn disconnect_all(&mut self) {
        let pids: Vec<u32> = self
            .slots
            .iter_mut()
            .flatten()
            .map(|state| {
                state.disconnected = true;
                state.pid
            })
            .collect();
        for pid in pids {
            self.deliver(pid, Signal::SIGINT);
        }
    }

    /// Forcibly kill every worker still occupying a slot.
    fn kill_all(&self) {
        for state in self.slots.iter().flatten() {
            self.deliver(state.pid, Signal::SIGKILL);
        }
    }

    fn deliver(&self, pid: u32, signal: Signal) {
        // A worker that already exited is fine here.
        if let Err(err) = kill(Pid::from_raw(pid as i32), signal) {
            if err != Errno::ESRCH {
                self.log.warn(format_args!(
                    "failed to deliver {:?} to worker {}: {}",
                    signal, pid, err
                ));
            }
        }
    }

    /// Hang-up: replace the whole pool with a fresh master generation.
    ///
    /// The launcher overwrites the pidfile with the new master's pid,
    /// so pidfile ownership carries over without dropping.
    fn reload(&mut self) -> ! {
        self.log.info("hangup received, starting a new generation");
        self.disconnect_all();
        self.kill_all();
        match Launcher::new(self.config).spawn(false) {
            Ok(pid) => {
                self.log
                    .info(format_args!("new master generation (pid {})", pid));
                process::exit(ExitCode::Ok.code());
            }
            Err(e) => {
                self.log
                    .error(format_args!("failed to launch new generation: {}", e));
                process::exit(ExitCode::Failure.code());
            }
        }
    }

    /// Interrupt: soft stop, in-flight work may or may not finish.
    fn shutdown(&mut self) -> ! {
        self.log.info("interrupt received, disconnecting workers");
        self.disconnect_all();
        process::exit(ExitCode::Ok.code());
    }

    /// Terminate: hard stop with the dedicated terminated status.
    fn terminate(&mut self) -> ! {
        self.log.info("terminate received, killing workers");
        self.disconnect_all();
        self.kill_all();
        process::exit(ExitCode::Terminated.code());
    }
}

/// Run the master role: fork the pool, then react to worker exits and
/// operator signals until a signal ends the process.
pub(crate) async fn run_master(config: &SupervisorConfig) -> Result<()> {
    let log = RoleLog::master();
    log.info(format_args!(
        "master online, forking {} worker(s)",
        config.workers
    ));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut pool = Pool {
        config,
        slots: (0..config.workers).map(|_| None).collect(),
        retries: 0,
        graceful: GracefulTally::default(),
        tx,
        log,
    };
    for slot in 0..config.workers {
        pool.fork(slot)?;
    }

    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    // Exit events and signals share this single control flow, so they
    // are handled one at a time in delivery order.
    loop {
        tokio::select! {
            Some(event) = rx.recv() => pool.handle_exit(event),
            _ = hangup.recv() => pool.reload(),
            _ = interrupt.recv() => pool.shutdown(),
            _ = terminate.recv() => pool.terminate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respawns_until_retry_ceiling() {
        for retries in 1..=RETRY_LIMIT {
            assert_eq!(respawn_decision(retries, Some(1)), RespawnDecision::Respawn);
        }
        assert_eq!(
            respawn_decision(RETRY_LIMIT + 1, Some(1)),
            RespawnDecision::RetryExhausted
        );
    }

    #[test]
    fn sentinel_codes_suppress_respawn() {
        assert_eq!(
            respawn_decision(1, Some(ExitCode::UnhandledRejection.code())),
            RespawnDecision::Systemic(131)
        );
        assert_eq!(
            respawn_decision(5, Some(ExitCode::UnhandledException.code())),
            RespawnDecision::Systemic(132)
        );
    }

    #[test]
    fn ceiling_wins_over_sentinel_codes() {
        assert_eq!(
            respawn_decision(RETRY_LIMIT + 1, Some(ExitCode::UnhandledException.code())),
            RespawnDecision::RetryExhausted
        );
    }

    #[test]
    fn signal_deaths_are_respawned() {
        assert_eq!(respawn_decision(3, None), RespawnDecision::Respawn);
    }

    #[test]
    fn graceful_completion_fires_exactly_once() {
        let mut tally = GracefulTally::default();
        assert!(!tally.record(3));
        assert!(!tally.record(3));
        assert!(tally.record(3));
        assert!(!tally.record(3));
    }

    #[test]
    fn builder_clamps_pool_size() {
        let config = SupervisorBuilder::new().workers(0).build();
        assert_eq!(config.workers, 1);
        let config = SupervisorBuilder::new().workers(4).build();
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn role_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = PidFile::new(dir.path().join("role.pid"));

        // No record and no slot variable: plain command invocation.
        assert_eq!(resolve_role(&pidfile), Role::Control);

        // A record of some other process is still a command invocation.
        pidfile.write(Some(1)).unwrap();
        assert_eq!(resolve_role(&pidfile), Role::Control);

        // Our own pid on record: we are the spawned master.
        pidfile.write(Some(process::id())).unwrap();
        assert_eq!(resolve_role(&pidfile), Role::Master);

        // The slot variable wins over everything else.
        env::set_var(WORKER_SLOT, "3");
        assert_eq!(resolve_role(&pidfile), Role::Worker(3));
        env::remove_var(WORKER_SLOT);
    }
}
