#![deny(missing_docs)]
//! Binary for the dmon(1) service supervisor; for the library use the
//! dmon-impl crate.
use std::io;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use log::error;
use serde::{Deserialize, Serialize};

use dmon_impl::{Error, ExitCode, RoleLog, SupervisorBuilder, SupervisorConfig};

/// Settings deserialized from the configuration file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Settings {
    /// Command executed by each worker.
    main: String,
    /// Arguments for the worker command.
    args: Option<Vec<String>>,
    /// Number of worker processes.
    workers: Option<usize>,
    /// Path of the pidfile.
    pidfile: PathBuf,
    /// Standard output sink for the daemon.
    stdout: Option<PathBuf>,
    /// Standard error sink for the daemon.
    stderr: Option<PathBuf>,
}

impl Settings {
    /// Convert the file settings into the supervisor configuration.
    fn supervisor(&self) -> SupervisorConfig {
        let mut builder = SupervisorBuilder::new()
            .workers(self.workers.unwrap_or(1))
            .pidfile(&self.pidfile);
        if let Some(stdout) = &self.stdout {
            builder = builder.stdout(stdout);
        }
        if let Some(stderr) = &self.stderr {
            builder = builder.stderr(stderr);
        }
        builder.build()
    }
}

fn verbosity(matches: &ArgMatches<'_>) -> u64 {
    let sub = matches
        .subcommand()
        .1
        .map(|m| m.occurrences_of("verbose"))
        .unwrap_or(0);
    matches.occurrences_of("verbose").max(sub)
}

async fn run() -> Result<()> {
    let matches = App::new("dmon")
        .version("0.1")
        .about("Service supervisor")
        .long_about(
            "Turns the command from the configuration file into a *nix \
             service: a detached master forks a pool of workers, respawns \
             crashes and reacts to stop/restart signals.",
        )
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Configuration file")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .global(true)
                .help("Increase log verbosity"),
        )
        .subcommand(
            SubCommand::with_name("start")
                .about("Start the daemon")
                .arg(
                    Arg::with_name("inspect")
                        .short("d")
                        .long("inspect")
                        .help("Run the daemon with debug logging"),
                ),
        )
        .subcommand(
            SubCommand::with_name("stop")
                .about("Stop the running daemon")
                .arg(
                    Arg::with_name("force")
                        .short("f")
                        .long("force")
                        .help("Deliver terminate instead of interrupt"),
                ),
        )
        .subcommand(SubCommand::with_name("restart").about("Restart the running daemon in place"))
        .get_matches();

    if std::env::var("RUST_LOG").ok().is_none() {
        let level = match verbosity(&matches) {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }
    pretty_env_logger::init();

    let config = matches
        .value_of("config")
        .ok_or_else(|| anyhow!("Configuration file is required!"))?;
    let config = std::fs::read_to_string(config)
        .map_err(|e| anyhow!("Failed to read configuration {} ({})", config, e.to_string()))?;
    let settings: Settings = toml::from_str(&config)?;
    let supervisor = settings.supervisor();

    match matches.subcommand() {
        ("start", Some(sub)) => {
            let main = settings.main.clone();
            let args = settings.args.clone().unwrap_or_default();
            let body = move |log: RoleLog| async move {
                log.info(format!("exec {} {}", main, args.join(" ")));
                let status = tokio::process::Command::new(&main)
                    .args(&args)
                    .status()
                    .await
                    .map_err(Error::from)?;
                if status.success() {
                    Ok(())
                } else {
                    Err(Error::Io(io::Error::new(
                        io::ErrorKind::Other,
                        format!("worker command exited with {}", status),
                    )))
                }
            };
            dmon_impl::start(&supervisor, body, sub.is_present("inspect")).await?;
        }
        ("stop", Some(sub)) => dmon_impl::stop(&supervisor, sub.is_present("force"))?,
        ("restart", _) => dmon_impl::restart(&supervisor)?,
        _ => unreachable!("subcommand is required"),
    }
    Ok(())
}

/// Executable entry point.
#[doc(hidden)]
#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => ExitCode::Ok,
        Err(err) => {
            error!("{}", err);
            match err.downcast_ref::<Error>() {
                Some(err) => ExitCode::from_error(err),
                None => ExitCode::Failure,
            }
        }
    };
    std::process::exit(code.code());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_parse_with_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            main = "sleep"
            args = ["600"]
            pidfile = "/tmp/app.pid"
        "#,
        )
        .unwrap();
        assert_eq!(settings.main, "sleep");
        let config = settings.supervisor();
        assert_eq!(config.workers, 1);
        assert_eq!(config.pidfile, PathBuf::from("/tmp/app.pid"));
        assert!(config.stdout.is_none());
        assert!(config.stderr.is_none());
    }

    #[test]
    fn settings_parse_full() {
        let settings: Settings = toml::from_str(
            r#"
            main = "server"
            workers = 4
            pidfile = "/var/run/app.pid"
            stdout = "/var/log/app.out"
            stderr = "/var/log/app.err"
        "#,
        )
        .unwrap();
        let config = settings.supervisor();
        assert_eq!(config.workers, 4);
        assert_eq!(config.stdout, Some(PathBuf::from("/var/log/app.out")));
        assert_eq!(config.stderr, Some(PathBuf::from("/var/log/app.err")));
    }
}
