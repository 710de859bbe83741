use crate::task::tree::TaskHandle;
use crate::task::types::TaskState;
use std::fmt::Display;
use std::future::Future;
use tracing::debug;

/// Options for `task_function`
#[derive(Clone, Debug)]
pub struct TaskFunctionOptions {
    /// Record the error on the task and swallow it instead of returning it
    pub catch_errors: bool,
    /// Set the terminal state on success. When false the caller manages state.
    pub set_state: bool,
    /// Derive the terminal state from the children instead of assuming success
    pub set_state_based_on_children: bool,
}

impl Default for TaskFunctionOptions {
    fn default() -> Self {
        Self {
            catch_errors: false,
            set_state: true,
            set_state_based_on_children: false,
        }
    }
}

impl TaskFunctionOptions {
    pub fn catch_errors() -> Self {
        Self {
            catch_errors: true,
            ..Self::default()
        }
    }

    pub fn from_children() -> Self {
        Self {
            set_state_based_on_children: true,
            ..Self::default()
        }
    }

    pub fn manual_state() -> Self {
        Self {
            set_state: false,
            ..Self::default()
        }
    }
}

/// Run `body` under `task`, translating its outcome into task state.
///
/// Returns `Ok(Some(value))` on success, `Ok(None)` when the error was
/// caught (`catch_errors`), and `Err` otherwise. An error is always
/// recorded on the task before it is returned or swallowed.
pub async fn task_function<T, E, Fut>(
    task: &TaskHandle,
    options: TaskFunctionOptions,
    body: Fut,
) -> Result<Option<T>, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    match run_in_task(task, &options, body).await {
        Ok(value) => Ok(Some(value)),
        Err(e) if options.catch_errors => {
            debug!("Caught error in task {}: {}", task.id(), e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Same as `task_function` but never swallows: the error is recorded on
/// the task and handed back to the caller.
pub async fn run_in_task<T, E, Fut>(
    task: &TaskHandle,
    options: &TaskFunctionOptions,
    body: Fut,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    if task.state().await == TaskState::Pending {
        task.set_state(TaskState::Running).await;
    }

    match body.await {
        Ok(value) => {
            if options.set_state {
                if options.set_state_based_on_children {
                    task.set_state_from_children().await;
                } else if !matches!(task.state().await, TaskState::Error | TaskState::Warning) {
                    task.set_state(TaskState::Success).await;
                }
            }
            Ok(value)
        }
        Err(e) => {
            task.set_error(&e).await;
            Err(e)
        }
    }
}
