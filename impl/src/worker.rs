//! Worker is a process performing a long-running task.
use futures::Future;

use crate::{ExitCode, Result, RoleLog};

/// Worker process handler.
///
/// Runs the user-supplied function exactly once and reports the
/// outcome through the process exit code, which is the only signal the
/// master observes. A body that returns an error maps to the unhandled
/// rejection sentinel, a body that panics to the unhandled exception
/// sentinel; both suppress respawn in the master.
pub struct Worker<H, F>
where
    H: FnOnce(RoleLog) -> F,
    F: Future<Output = Result<()>> + Send + 'static,
{
    handler: H,
}

impl<H, F> Worker<H, F>
where
    H: FnOnce(RoleLog) -> F,
    F: Future<Output = Result<()>> + Send + 'static,
{
    /// Create a worker around the user-supplied function.
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    /// Invoke the body once, awaiting its result, and return the exit
    /// code this process should terminate with.
    pub async fn run(self) -> ExitCode {
        let log = RoleLog::worker();
        log.info("worker online");
        let body = (self.handler)(log.clone());
        match tokio::spawn(body).await {
            Ok(Ok(())) => {
                log.info("worker body completed");
                ExitCode::Ok
            }
            Ok(Err(e)) => {
                log.error(format_args!("worker body failed: {}", e));
                ExitCode::UnhandledRejection
            }
            Err(join) if join.is_panic() => {
                log.error("worker body panicked");
                ExitCode::UnhandledException
            }
            Err(_) => ExitCode::Failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[tokio::test]
    async fn completed_body_exits_ok() {
        let worker = Worker::new(|_log: RoleLog| async move { Ok(()) });
        assert_eq!(worker.run().await, ExitCode::Ok);
    }

    #[tokio::test]
    async fn failed_body_maps_to_rejection_sentinel() {
        let worker = Worker::new(|_log: RoleLog| async move { Err(Error::NotRunning) });
        assert_eq!(worker.run().await, ExitCode::UnhandledRejection);
    }

    #[tokio::test]
    async fn panicking_body_maps_to_exception_sentinel() {
        let worker = Worker::new(|_log: RoleLog| async move { panic!("boom") });
        assert_eq!(worker.run().await, ExitCode::UnhandledException);
    }
}
