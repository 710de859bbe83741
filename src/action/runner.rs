use crate::action::kinds::ActionOutcome;
use crate::action::registry::Action;
use crate::action::types::*;
use crate::portal::{Client, PortalFetcher, Session, TaxTypeId};
use crate::task::{
    DEFAULT_MAX_CONCURRENT, TaskFunctionOptions, TaskHandle, TaskId, TaskOptions, TaskState,
    run_in_task, task_function,
};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-instance settings handed over by the orchestrator
#[derive(Debug, Clone)]
pub struct ActionConfig {
    /// Upper bound on concurrent page or item fetches
    pub max_concurrent: usize,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

/// What an instance gets to work with during `run`
#[derive(Clone, Copy)]
pub struct RunContext<'a> {
    pub parent_task: &'a TaskHandle,
    pub session: Option<&'a Session>,
    pub fetcher: &'a dyn PortalFetcher,
    /// Tax types of the client, when they could be fetched
    pub tax_types: Option<&'a [TaxTypeId]>,
}

impl<'a> RunContext<'a> {
    pub fn session(&self) -> Result<&'a Session, ActionError> {
        self.session
            .ok_or_else(|| ActionError::Session("Not logged in".to_string()))
    }
}

/// not started -> running -> success | warning | error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    NotStarted,
    Running,
    Success,
    Warning,
    Error,
}

impl RunnerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunnerState::Success | RunnerState::Warning | RunnerState::Error)
    }
}

/// Behaviour shared by every action instance
#[async_trait]
pub trait ActionRunner: Send {
    /// Validate the input and do the work. Only validation errors escape.
    async fn run(&mut self, ctx: RunContext<'_>) -> Result<(), ActionError>;

    /// True if a retry run has anything to redo for this instance
    fn should_retry(&self) -> bool;

    /// Input fragment that requests exactly the failed sub-work
    fn retry_input(&self) -> RetryInput;

    /// Combine outputs of this (client, action) pair from the first run onwards
    fn merge_outputs(&self, outputs: &[ActionOutput]) -> ActionOutput {
        merge_all_run_outputs(outputs)
    }
}

/// One execution of an action for one client within one run
#[derive(Debug)]
pub struct ActionInstance {
    pub id: InstanceId,
    pub action: Arc<Action>,
    pub input: ActionInput,
    pub output: Option<ActionOutput>,
    pub error: Option<ActionError>,
    pub failures: FailedWork,
    client: Option<Client>,
    config: ActionConfig,
    state: RunnerState,
    task_id: Option<TaskId>,
}

impl ActionInstance {
    pub fn new(action: Arc<Action>, input: ActionInput) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            input,
            output: None,
            error: None,
            failures: FailedWork::None,
            client: None,
            config: ActionConfig::default(),
            state: RunnerState::NotStarted,
            task_id: None,
        }
    }

    /// Bind the instance to its client. Later calls are ignored.
    pub fn init(&mut self, client: Client, config: ActionConfig) {
        if self.client.is_some() {
            debug!("Instance {} already initialised", self.id);
            return;
        }
        self.client = Some(client);
        self.config = config;
    }

    pub fn client(&self) -> Option<&Client> {
        self.client.as_ref()
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client.as_ref().map(|c| c.id.as_str())
    }

    pub fn action_id(&self) -> &str {
        &self.action.id
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.task_id
    }

    /// Fail the instance without running it, e.g. when login failed.
    ///
    /// A task is still created so the failure shows up in the tree.
    pub async fn fail(&mut self, parent_task: &TaskHandle, error: ActionError) {
        if let Ok(task) = parent_task
            .create_child(self.action.name.clone(), TaskOptions::default())
            .await
        {
            let skipped = std::future::ready(Err::<(), _>(error.clone()));
            let _ = task_function(&task, TaskFunctionOptions::catch_errors(), skipped).await;
            self.task_id = Some(task.id());
        }
        warn!("{} skipped: {}", self.action.name, error);
        self.error = Some(error);
        self.state = RunnerState::Error;
    }

    /// Reject invalid input. No task is created for a rejected instance.
    pub fn reject(&mut self, error: ValidationError) {
        warn!("{} rejected: {}", self.action.name, error);
        self.error = Some(error.into());
        self.state = RunnerState::Error;
    }

    fn finish(&mut self, outcome: ActionOutcome) -> RunnerState {
        let ActionOutcome { output, failures } = outcome;
        let state = if failures.is_empty() {
            RunnerState::Success
        } else if output.is_empty() {
            self.error = Some(ActionError::Fetch("Every request failed".to_string()));
            RunnerState::Error
        } else {
            RunnerState::Warning
        };
        self.output = Some(output);
        self.failures = failures;
        state
    }
}

#[async_trait]
impl ActionRunner for ActionInstance {
    async fn run(&mut self, ctx: RunContext<'_>) -> Result<(), ActionError> {
        if self.client.is_none() {
            return Err(ActionError::Internal(format!(
                "Instance {} run before init",
                self.id
            )));
        }
        if let Err(e) = self.action.validate_input(&self.input) {
            self.reject(e.clone());
            return Err(e.into());
        }

        let task = match ctx
            .parent_task
            .create_child(self.action.name.clone(), TaskOptions::default())
            .await
        {
            Ok(task) => task,
            Err(e) => {
                let error = ActionError::from(e);
                self.error = Some(error);
                self.state = RunnerState::Error;
                return Ok(());
            }
        };
        self.task_id = Some(task.id());
        self.state = RunnerState::Running;
        info!("Running {} for {:?}", self.action.name, self.client_id());

        let kind = self.action.kind;
        let result = run_in_task(
            &task,
            &TaskFunctionOptions::manual_state(),
            kind.execute(&ctx, &task, &self.input, &self.config),
        )
        .await;

        self.state = match result {
            Ok(outcome) => self.finish(outcome),
            // already recorded on the task by the wrapper
            Err(e) => {
                self.error = Some(e);
                RunnerState::Error
            }
        };

        match self.state {
            RunnerState::Warning => {
                task.set_status(format!("{} requests failed", self.failed_count()))
                    .await;
                task.set_state(TaskState::Warning).await;
            }
            RunnerState::Error => {
                if task.state().await != TaskState::Error
                    && let Some(error) = &self.error
                {
                    task.set_error(error).await;
                }
            }
            _ => {
                task.set_status("Done").await;
                task.set_state(TaskState::Success).await;
            }
        }

        info!(
            "{} for {:?} finished: {:?}",
            self.action.name,
            self.client_id(),
            self.state
        );
        Ok(())
    }

    fn should_retry(&self) -> bool {
        let retryable_error = self.error.as_ref().is_some_and(ActionError::is_retryable);
        retryable_error || !self.failures.is_empty()
    }

    fn retry_input(&self) -> RetryInput {
        self.failures.retry_input()
    }
}

impl ActionInstance {
    fn failed_count(&self) -> usize {
        match &self.failures {
            FailedWork::None => 0,
            FailedWork::Pages(missing) => missing_count(missing),
            FailedWork::TaxTypes(by_tax_type) => by_tax_type.values().map(missing_count).sum(),
            FailedWork::Items(items) => items.len(),
        }
    }
}

fn missing_count(missing: &MissingPages) -> usize {
    match missing {
        MissingPages::All => 1,
        MissingPages::Pages(pages) => pages.len(),
    }
}

/// Merge outputs of one (client, action) pair, oldest run first.
///
/// Each unit is taken from the first output that has it, so retries only
/// fill the gaps left by earlier runs.
pub fn merge_all_run_outputs(outputs: &[ActionOutput]) -> ActionOutput {
    let mut units = BTreeMap::new();
    for output in outputs {
        for unit in &output.units {
            units
                .entry(unit.unit.clone())
                .or_insert_with(|| unit.records.clone());
        }
    }
    ActionOutput::from_units(units)
}
