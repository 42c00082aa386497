use std::future::Future;

use log::{debug, error};
use tokio_util::sync::CancellationToken;

/// How a supervised task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed,
    Panicked,
}

/// Runs `future` on its own task, logs how it ended and cancels `token`.
///
/// The token is cancelled on success, error and panic alike.
pub async fn task_completion_handler<F>(
    future: F,
    token: CancellationToken,
    task_name: &str,
) -> TaskOutcome
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let outcome = match tokio::spawn(future).await {
        Ok(Ok(())) => {
            debug!("{} completed successfully", task_name);
            TaskOutcome::Completed
        }
        Ok(Err(err)) => {
            error!("{} failed: {:#}", task_name, err);
            TaskOutcome::Failed
        }
        Err(join_error) => {
            error!("{} panicked or was cancelled: {:?}", task_name, join_error);
            TaskOutcome::Panicked
        }
    };

    token.cancel();
    outcome
}
