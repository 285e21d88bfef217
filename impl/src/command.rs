//! The start/stop/restart command state machine.
//!
//! Each command captures one pidfile snapshot and one liveness probe,
//! then drives the launcher, the signal router of the running master,
//! or the registry. Failures surface as errors the caller converts to
//! exit codes; `stop` and `restart` are fire-and-forget signal
//! deliveries with no wait-and-confirm step.
use std::process;

use futures::Future;
use log::info;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::launcher::Launcher;
use crate::pidfile::PidFile;
use crate::probe::probe;
use crate::supervisor::{self, resolve_role, Role, SupervisorConfig};
use crate::worker::Worker;
use crate::{Error, Result, RoleLog};

/// Start the daemon, or take the master/worker role when invoked from
/// inside the spawned daemon.
///
/// The same entry point is re-executed by the launcher; the spawned
/// process finds its own pid on record and proceeds straight to the
/// pool controller instead of spawning again. A forked worker is
/// recognised by its slot environment variable and runs the
/// user-supplied body, terminating with the matching exit code.
pub async fn start<H, F>(config: &SupervisorConfig, handler: H, debug: bool) -> Result<()>
where
    H: FnOnce(RoleLog) -> F,
    F: Future<Output = Result<()>> + Send + 'static,
{
    let registry = PidFile::new(&config.pidfile);
    match resolve_role(&registry) {
        Role::Worker(slot) => {
            let code = Worker::new(handler).run().await;
            info!("worker slot {} exiting with status {}", slot, code.code());
            process::exit(code.code());
        }
        Role::Master => supervisor::run_master(config).await,
        Role::Control => {
            let record = registry.load();
            if let Some(pid) = record.pid {
                if probe(Some(pid)).is_running() {
                    return Err(Error::AlreadyRunning(pid));
                }
            }
            let pid = Launcher::new(config).spawn(debug)?;
            info!("started (pid {})", pid);
            Ok(())
        }
    }
}

/// Stop the running daemon.
///
/// Sends interrupt for a soft stop, or terminate with `force`. The
/// pidfile is re-asserted with the known pid before signalling.
pub fn stop(config: &SupervisorConfig, force: bool) -> Result<()> {
    let signal = if force {
        Signal::SIGTERM
    } else {
        Signal::SIGINT
    };
    signal_running(config, signal)
}

/// Restart the running daemon in place by delivering hang-up.
///
/// The master's signal router reacts by replacing its pool with a new
/// generation; the pidfile ends up holding the new master's pid.
pub fn restart(config: &SupervisorConfig) -> Result<()> {
    if !cfg!(unix) {
        return Err(Error::Unsupported);
    }
    signal_running(config, Signal::SIGHUP)
}

fn signal_running(config: &SupervisorConfig, signal: Signal) -> Result<()> {
    let registry = PidFile::new(&config.pidfile);
    let record = registry.load();
    let pid = match record.pid {
        Some(pid) if probe(Some(pid)).is_running() => pid,
        _ => return Err(Error::NotRunning),
    };
    // Idempotent re-assertion of ownership before signalling.
    registry.write(Some(pid))?;
    kill(Pid::from_raw(pid as i32), signal)?;
    info!("sent {:?} to daemon (pid {})", signal, pid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::SupervisorBuilder;

    fn config(dir: &tempfile::TempDir) -> SupervisorConfig {
        SupervisorBuilder::new()
            .pidfile(dir.path().join("cmd.pid"))
            .build()
    }

    #[test]
    fn stop_without_pidfile_is_a_precondition_error() {
        let dir = tempfile::tempdir().unwrap();
        match stop(&config(&dir), false) {
            Err(Error::NotRunning) => {}
            other => panic!("expected NotRunning, got {:?}", other),
        }
    }

    #[test]
    fn stop_with_empty_record_is_a_precondition_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        PidFile::new(&config.pidfile).write(None).unwrap();
        assert!(matches!(stop(&config, true), Err(Error::NotRunning)));
    }

    #[test]
    fn restart_without_daemon_is_a_precondition_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(restart(&config(&dir)), Err(Error::NotRunning)));
    }
}
