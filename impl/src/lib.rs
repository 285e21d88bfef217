#![deny(missing_docs)]
//! Turns a long-running callable into a supervised *nix service.
//!
//! A detached master process owns a pidfile and forks a fixed-size pool
//! of worker processes, each running the user-supplied function. The
//! master respawns crashed workers (bounded by a retry ceiling) and
//! maps incoming signals to pool-wide actions: `SIGHUP` performs a
//! rolling restart, `SIGINT` a graceful stop and `SIGTERM` a forced
//! stop. The `start`, `stop` and `restart` commands drive the lifecycle
//! from the outside, using the pidfile as the single source of truth
//! for "is a daemon already running".
//!
//! The same executable serves as both the control CLI and the daemon
//! body: `start` re-executes the current program detached, records the
//! new pid, and the spawned process recognises itself by comparing its
//! own pid against the pidfile before taking the master role.
//!
//! ```no_run
//! use dmon_impl::{Error, Result, RoleLog, SupervisorBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = SupervisorBuilder::new()
//!         .workers(2)
//!         .pidfile(std::env::temp_dir().join("app.pid"))
//!         .build();
//!     dmon_impl::start(&config, |log: RoleLog| async move {
//!         log.info("worker body running");
//!         Ok::<(), Error>(())
//!     }, false).await
//! }
//! ```

use std::fmt;

use log::{debug, error, info, warn};

/// Enumeration of errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A live daemon already owns the pidfile.
    #[error("already started (pid {0})")]
    AlreadyRunning(u32),

    /// No live process matches the pidfile record.
    #[error("not started")]
    NotRunning,

    /// Signal-based control is unavailable on this platform.
    #[error("signal control is not supported on this platform")]
    Unsupported,

    /// Input/output errors.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Errors probing or signalling a process.
    #[error(transparent)]
    Signal(#[from] nix::Error),

    /// Generic variant for errors created in user code.
    #[error(transparent)]
    Boxed(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Helper function to `Box` an error implementation.
    ///
    /// Worker bodies can call `map_err(Error::boxed)?` to propagate
    /// foreign errors.
    pub fn boxed(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        let err: Box<dyn std::error::Error + Send + Sync> = Box::new(e);
        Error::from(err)
    }
}

/// Result type returned by the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Exit statuses forming the wire contract with operators and service
/// managers.
///
/// `Interrupted` is the conventional status of a process killed by
/// `SIGINT`; the remaining values are produced by sites in this crate.
/// `UnhandledRejection` and `UnhandledException` are the sentinel codes
/// that suppress worker respawn, since they indicate a systematic bug
/// rather than a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Command completed.
    Ok,
    /// Generic failure.
    Failure,
    /// Precondition violation, the command cannot execute.
    CannotExecute,
    /// Killed by interrupt.
    Interrupted,
    /// Worker body returned an error.
    UnhandledRejection,
    /// Worker body panicked.
    UnhandledException,
    /// Master stopped by the terminate signal.
    Terminated,
}

impl ExitCode {
    /// Numeric process exit status.
    pub fn code(self) -> i32 {
        match self {
            ExitCode::Ok => 0,
            ExitCode::Failure => 1,
            ExitCode::CannotExecute => 126,
            ExitCode::Interrupted => 130,
            ExitCode::UnhandledRejection => 131,
            ExitCode::UnhandledException => 132,
            ExitCode::Terminated => 255,
        }
    }

    /// Exit status for a failed command invocation.
    ///
    /// Precondition violations map to `CannotExecute`, everything else
    /// to the generic failure status.
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::AlreadyRunning(_) | Error::NotRunning | Error::Unsupported => {
                ExitCode::CannotExecute
            }
            _ => ExitCode::Failure,
        }
    }
}

/// Logger tagged with the process role and pid.
///
/// Passed explicitly into the pool controller and the worker body so
/// operator output can be disambiguated without mutating any ambient
/// global.
#[derive(Debug, Clone)]
pub struct RoleLog {
    prefix: String,
}

impl RoleLog {
    /// Logger for the master role.
    pub fn master() -> Self {
        Self::tagged("master")
    }

    /// Logger for the worker role.
    pub fn worker() -> Self {
        Self::tagged("worker")
    }

    fn tagged(role: &str) -> Self {
        Self {
            prefix: format!("{}[{}]", role, std::process::id()),
        }
    }

    /// Log at info level.
    pub fn info(&self, msg: impl fmt::Display) {
        info!("{} {}", self.prefix, msg);
    }

    /// Log at warn level.
    pub fn warn(&self, msg: impl fmt::Display) {
        warn!("{} {}", self.prefix, msg);
    }

    /// Log at error level.
    pub fn error(&self, msg: impl fmt::Display) {
        error!("{} {}", self.prefix, msg);
    }

    /// Log at debug level.
    pub fn debug(&self, msg: impl fmt::Display) {
        debug!("{} {}", self.prefix, msg);
    }
}

pub(crate) const WORKER_SLOT: &str = "DMON_WORKER_SLOT";

mod command;
mod launcher;
mod pidfile;
mod probe;
mod supervisor;
mod worker;

pub use command::{restart, start, stop};
pub use launcher::Launcher;
pub use pidfile::{PidFile, ProcessRecord};
pub use probe::{probe, Liveness};
pub use supervisor::{resolve_role, Role, SupervisorBuilder, SupervisorConfig};
pub use worker::Worker;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_wire_contract() {
        assert_eq!(ExitCode::Ok.code(), 0);
        assert_eq!(ExitCode::Failure.code(), 1);
        assert_eq!(ExitCode::CannotExecute.code(), 126);
        assert_eq!(ExitCode::Interrupted.code(), 130);
        assert_eq!(ExitCode::UnhandledRejection.code(), 131);
        assert_eq!(ExitCode::UnhandledException.code(), 132);
        assert_eq!(ExitCode::Terminated.code(), 255);
    }

    #[test]
    fn preconditions_map_to_cannot_execute() {
        assert_eq!(
            ExitCode::from_error(&Error::AlreadyRunning(1)),
            ExitCode::CannotExecute
        );
        assert_eq!(
            ExitCode::from_error(&Error::NotRunning),
            ExitCode::CannotExecute
        );
        assert_eq!(
            ExitCode::from_error(&Error::Unsupported),
            ExitCode::CannotExecute
        );
        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "io"));
        assert_eq!(ExitCode::from_error(&io), ExitCode::Failure);
    }
}
