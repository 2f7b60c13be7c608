//! Supervised join-all over spawned tasks.

use futures_util::future::join_all;
use std::future::Future;
use tracing::error;

/// How one supervised task ended.
#[derive(Debug)]
pub struct TaskOutcome<T> {
    pub label: String,
    /// `Err` holds the panic or cancellation message.
    pub result: Result<T, String>,
}

impl<T> TaskOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Spawn every task and wait for all of them to finish.
///
/// Never short-circuits: a panicking task becomes a failed outcome and the
/// remaining tasks still run to completion. Outcomes keep the input order.
pub async fn supervise<T, F>(tasks: Vec<(String, F)>) -> Vec<TaskOutcome<T>>
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    let (labels, handles): (Vec<String>, Vec<_>) = tasks
        .into_iter()
        .map(|(label, task)| (label, tokio::spawn(task)))
        .unzip();

    join_all(handles)
        .await
        .into_iter()
        .zip(labels)
        .map(|(joined, label)| {
            let result = joined.map_err(|e| {
                error!(task = %label, error = %e, "Supervised task did not finish");
                e.to_string()
            });
            TaskOutcome { label, result }
        })
        .collect()
}

/// Split outcomes into successes and failures, keeping labels.
#[allow(clippy::type_complexity)]
pub fn partition<T>(outcomes: Vec<TaskOutcome<T>>) -> (Vec<(String, T)>, Vec<(String, String)>) {
    let mut successes = Vec::new();
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome.result {
            Ok(value) => successes.push((outcome.label, value)),
            Err(reason) => failures.push((outcome.label, reason)),
        }
    }
    (successes, failures)
}
