//! Launches the detached master process.
use std::env;
use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

use log::info;

use crate::pidfile::PidFile;
use crate::supervisor::SupervisorConfig;
use crate::{Result, WORKER_SLOT};

/// Spawns a new master generation by re-executing the current program.
pub struct Launcher<'a> {
    config: &'a SupervisorConfig,
}

impl<'a> Launcher<'a> {
    /// Create a launcher for the given configuration.
    pub fn new(config: &'a SupervisorConfig) -> Self {
        Self { config }
    }

    /// Spawn the detached master and record its pid.
    ///
    /// The new process re-runs the caller's own command line in its own
    /// process group, so signals to the caller do not propagate and the
    /// spawned process re-enters `start` where it recognises itself by
    /// pid. Output goes to the configured sinks in append mode, or is
    /// piped back and discarded so the caller's terminal stays free.
    /// The pid is written to the registry before this returns; the
    /// caller does not wait for the daemon's lifetime.
    pub fn spawn(&self, debug: bool) -> Result<u32> {
        let exe = env::current_exe()?;
        let mut cmd = Command::new(exe);
        cmd.args(env::args_os().skip(1))
            .env_remove(WORKER_SLOT)
            .stdin(Stdio::null())
            .stdout(sink(self.config.stdout.as_deref())?)
            .stderr(sink(self.config.stderr.as_deref())?)
            .process_group(0);
        if debug {
            cmd.env("RUST_LOG", "debug");
        }
        let child = cmd.spawn()?;
        let pid = child.id();

        let registry = PidFile::new(&self.config.pidfile);
        registry.write(Some(pid))?;
        info!("daemon spawned (pid {})", pid);
        Ok(pid)
    }
}

/// Open a sink path in append mode, or pipe when no path is set.
fn sink(path: Option<&Path>) -> Result<Stdio> {
    Ok(match path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Stdio::from(file)
        }
        None => Stdio::piped(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_creates_append_mode_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        std::fs::write(&path, "existing\n").unwrap();
        let _stdio = sink(Some(&path)).unwrap();
        // Opening for append must not truncate prior content.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "existing\n");
    }

    #[test]
    fn missing_sink_is_piped_not_inherited() {
        // No path configured still yields a usable stdio handle.
        assert!(sink(None).is_ok());
    }
}
