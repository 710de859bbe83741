use crate::action::{
    ActionConfig, ActionError, ActionId, ActionInput, ActionInstance, ActionOutput, ActionRegistry,
    ActionRunner, RunContext, RunnerState, merge_all_run_outputs,
};
use crate::portal::{Client, ClientId, PortalFetcher, Session, SessionProvider, TaxTypeId};
use crate::run::store::{RunId, RunStore};
use crate::task::{
    DEFAULT_MAX_CONCURRENT, LoggingEventHandler, SharedTaskTree, TaskFunctionOptions, TaskHandle,
    TaskId, TaskOptions, TaskState, run_in_task, task_function,
};
use anyhow::{Result, anyhow};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Configuration for the orchestrator
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Concurrent page or item fetches per action
    pub max_concurrent_requests: usize,
    pub max_login_attempts: u32,
    /// Used when a plan does not specify a from date
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_from_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_to_date: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT,
            max_login_attempts: 3,
            default_from_date: None,
            default_to_date: None,
        }
    }
}

/// One action to run for a client, with its input
#[derive(Debug, Clone, PartialEq)]
pub struct ActionPlan {
    pub action_id: ActionId,
    pub input: ActionInput,
}

/// Actions of one client that can be retried
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientFailures {
    pub client_id: ClientId,
    pub action_ids: Vec<ActionId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub root_task: TaskId,
    pub root_state: TaskState,
    pub client_states: Vec<(ClientId, TaskState)>,
    pub retryable: Vec<ClientFailures>,
}

/// Merged output of one (client, action) pair across a run and its retries
#[derive(Debug, Clone, Serialize)]
pub struct MergedOutput {
    pub client_id: ClientId,
    pub action_id: ActionId,
    pub output: ActionOutput,
}

/// Events that can occur while the orchestrator runs
#[derive(Debug, Clone)]
pub enum RunEvent {
    NoClients,
    RunStarted {
        run_id: RunId,
        retry_of: Option<RunId>,
        client_count: usize,
    },
    ClientStarted {
        run_id: RunId,
        client_id: ClientId,
    },
    ClientFinished {
        run_id: RunId,
        client_id: ClientId,
        state: TaskState,
    },
    BatchComplete {
        run_id: RunId,
        root_state: TaskState,
        retryable_clients: usize,
    },
}

/// Handler for run events
pub trait RunEventHandler {
    fn handle_event(&self, event: &RunEvent) -> Result<()>;
}

/// Runs actions across clients: one client at a time, one login per
/// client, the client's actions concurrently.
pub struct RunOrchestrator {
    config: RunnerConfig,
    registry: ActionRegistry,
    clients: Vec<Client>,
    sessions: Arc<dyn SessionProvider>,
    fetcher: Arc<dyn PortalFetcher>,
    tasks: SharedTaskTree,
    store: RunStore,
    event_handlers: Vec<Box<dyn RunEventHandler + Send + Sync>>,
}

impl RunOrchestrator {
    pub fn new(
        config: RunnerConfig,
        registry: ActionRegistry,
        clients: Vec<Client>,
        sessions: Arc<dyn SessionProvider>,
        fetcher: Arc<dyn PortalFetcher>,
    ) -> Self {
        Self {
            config,
            registry,
            clients,
            sessions,
            fetcher,
            tasks: SharedTaskTree::new(),
            store: RunStore::new(),
            event_handlers: Vec::new(),
        }
    }

    pub fn add_event_handler(&mut self, handler: Box<dyn RunEventHandler + Send + Sync>) {
        self.event_handlers.push(handler);
    }

    pub fn tasks(&self) -> &SharedTaskTree {
        &self.tasks
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn emit_event(&self, event: RunEvent) {
        for handler in &self.event_handlers {
            if let Err(e) = handler.handle_event(&event) {
                error!("Run event handler error: {}", e);
            }
        }
    }

    /// Run the same plans on every listed client
    pub async fn run_selected(
        &mut self,
        client_ids: &[ClientId],
        plans: &[ActionPlan],
    ) -> Result<Option<RunSummary>> {
        let plans = plans.to_vec();
        self.run(client_ids, None, move |_| plans.clone()).await
    }

    /// Re-run only the failed actions of the current run, each seeded with
    /// the input of the work that is still missing
    pub async fn retry_failures(&mut self) -> Result<Option<RunSummary>> {
        let Some(current) = self.store.current_run_id() else {
            return Ok(None);
        };

        let mut client_ids: Vec<ClientId> = Vec::new();
        let mut plans: HashMap<ClientId, Vec<ActionPlan>> = HashMap::new();
        for instance in self.store.instances_in_run(current) {
            if !instance.should_retry() {
                continue;
            }
            let Some(client_id) = instance.client_id() else {
                continue;
            };
            if !client_ids.iter().any(|id| id == client_id) {
                client_ids.push(client_id.to_string());
            }
            plans
                .entry(client_id.to_string())
                .or_default()
                .push(ActionPlan {
                    action_id: instance.action_id().to_string(),
                    input: instance.input.with_retry(&instance.retry_input()),
                });
        }

        if client_ids.is_empty() {
            info!("Nothing to retry in run {}", current);
            return Ok(None);
        }

        info!("Retrying failures of run {} for {} clients", current, client_ids.len());
        self.run(&client_ids, Some(current), move |client| {
            plans.get(&client.id).cloned().unwrap_or_default()
        })
        .await
    }

    /// Run the whole batch. `select` decides per client which actions run
    /// and with what input.
    pub async fn run<F>(
        &mut self,
        client_ids: &[ClientId],
        retry_of: Option<RunId>,
        select: F,
    ) -> Result<Option<RunSummary>>
    where
        F: Fn(&Client) -> Vec<ActionPlan>,
    {
        let clients: Vec<Client> = client_ids
            .iter()
            .filter_map(|id| {
                let client = self.clients.iter().find(|c| &c.id == id).cloned();
                if client.is_none() {
                    warn!("Unknown client {}", id);
                }
                client
            })
            .collect();

        if clients.is_empty() {
            warn!("No clients selected");
            self.emit_event(RunEvent::NoClients);
            return Ok(None);
        }

        let run_id = self.store.start_new_run(retry_of);
        self.emit_event(RunEvent::RunStarted {
            run_id,
            retry_of,
            client_count: clients.len(),
        });

        let root = self
            .tasks
            .create_root(
                format!("Run #{}", run_id),
                TaskOptions::default()
                    .with_progress_max(clients.len())
                    .sequential(),
            )
            .await?;
        root.set_state(TaskState::Running).await;
        self.store.set_root_task(run_id, root.id())?;

        let mut client_states = Vec::with_capacity(clients.len());
        for client in &clients {
            self.emit_event(RunEvent::ClientStarted {
                run_id,
                client_id: client.id.clone(),
            });
            let plans = select(client);
            let (instances, state) = self.process_client(&root, client, plans).await;
            for instance in instances {
                self.store.add_instance(run_id, instance)?;
            }
            client_states.push((client.id.clone(), state));
            self.emit_event(RunEvent::ClientFinished {
                run_id,
                client_id: client.id.clone(),
                state,
            });
        }

        let root_state = overall_state(client_states.iter().map(|(_, state)| *state));
        root.set_status(format!("Processed {} clients", clients.len())).await;
        root.set_state(root_state).await;

        let retryable = self.retryable_failures();
        self.emit_event(RunEvent::BatchComplete {
            run_id,
            root_state,
            retryable_clients: retryable.len(),
        });

        Ok(Some(RunSummary {
            run_id,
            root_task: root.id(),
            root_state,
            client_states,
            retryable,
        }))
    }

    /// Login, tax types, actions and logout for one client.
    ///
    /// Never fails: whatever goes wrong ends up on the instances and the
    /// client task.
    async fn process_client(
        &self,
        root: &TaskHandle,
        client: &Client,
        plans: Vec<ActionPlan>,
    ) -> (Vec<ActionInstance>, TaskState) {
        let mut instances = Vec::with_capacity(plans.len());
        for plan in plans {
            let Some(action) = self.registry.get(&plan.action_id) else {
                warn!("Unknown action {} for {}", plan.action_id, client);
                continue;
            };
            let config_dates = ActionInput {
                from_date: self.config.default_from_date.clone(),
                to_date: self.config.default_to_date.clone(),
                ..ActionInput::default()
            };
            let input = plan
                .input
                .or_defaults(&action.default_input)
                .or_defaults(&config_dates);
            let mut instance = ActionInstance::new(action, input);
            instance.init(
                client.clone(),
                ActionConfig {
                    max_concurrent: self.config.max_concurrent_requests,
                },
            );
            instances.push(instance);
        }

        let needs_tax_types = instances.iter().any(|i| i.action.requires_tax_types);
        let steps = instances.len() + 2 + usize::from(needs_tax_types);
        let client_task = match root
            .create_child(client.name.clone(), TaskOptions::default().with_progress_max(steps))
            .await
        {
            Ok(task) => task,
            Err(e) => {
                error!("Could not create task for {}: {}", client, e);
                for instance in &mut instances {
                    instance.fail(root, ActionError::Internal(e.to_string())).await;
                }
                return (instances, TaskState::Error);
            }
        };
        client_task.set_state(TaskState::Running).await;

        if instances.is_empty() {
            client_task.set_status("Nothing to do").await;
            client_task.set_state(TaskState::Success).await;
            return (instances, TaskState::Success);
        }

        let outcome = task_function(
            &client_task,
            TaskFunctionOptions::catch_errors(),
            self.run_client(client, &client_task, &mut instances),
        )
        .await;
        if !matches!(outcome, Ok(Some(()))) {
            let reason = format!("{} was not processed", client);
            for instance in instances.iter_mut().filter(|i| !i.state().is_terminal()) {
                instance
                    .fail(&client_task, ActionError::Internal(reason.clone()))
                    .await;
            }
        }

        let state = client_task.state().await;
        (instances, state)
    }

    /// Errors returned here are recorded on the client task by the caller
    async fn run_client(
        &self,
        client: &Client,
        client_task: &TaskHandle,
        instances: &mut [ActionInstance],
    ) -> Result<()> {
        let mut rejected = Vec::new();
        for instance in instances.iter_mut() {
            if let Err(e) = instance.action.validate_input(&instance.input) {
                rejected.push(format!("{}: {}", instance.action.name, e));
                instance.reject(e);
            }
        }
        if !rejected.is_empty() {
            client_task
                .set_status(format!("Invalid input ({})", rejected.join("; ")))
                .await;
        }
        if instances.iter().all(|i| i.state().is_terminal()) {
            return finish_client_task(client_task, instances, true).await;
        }

        let login_task = client_task
            .create_child("Logging in", TaskOptions::default().indeterminate())
            .await?;
        let login = run_in_task(
            &login_task,
            &TaskFunctionOptions::default(),
            self.sessions.login(client, self.config.max_login_attempts),
        )
        .await;
        let session = match login {
            Ok(session) => session,
            Err(e) => {
                warn!("Login failed for {}: {}", client, e);
                for instance in instances.iter_mut().filter(|i| !i.state().is_terminal()) {
                    instance.fail(client_task, ActionError::Session(e.to_string())).await;
                }
                return Err(anyhow!("Login failed: {}", e));
            }
        };

        let keep_session_open = instances.iter().any(|i| i.action.uses_logged_in_tab);
        let work = self.run_actions(client_task, &session, instances).await;
        let logout_ok = self
            .end_session(client_task, &session, keep_session_open)
            .await;
        work?;

        finish_client_task(client_task, instances, logout_ok).await
    }

    /// Fetch tax types if needed, then run every runnable instance concurrently
    async fn run_actions(
        &self,
        client_task: &TaskHandle,
        session: &Session,
        instances: &mut [ActionInstance],
    ) -> Result<()> {
        let needs_tax_types = instances
            .iter()
            .any(|i| i.action.requires_tax_types && !i.state().is_terminal());
        let mut tax_types: Option<Vec<TaxTypeId>> = None;
        if needs_tax_types {
            let tax_task = client_task
                .create_child("Getting tax types", TaskOptions::default().indeterminate())
                .await?;
            match run_in_task(
                &tax_task,
                &TaskFunctionOptions::default(),
                self.fetcher.fetch_tax_types(session),
            )
            .await
            {
                Ok(found) => tax_types = Some(found),
                Err(e) => {
                    warn!("Could not get tax types: {}", e);
                    let error =
                        ActionError::MissingPrerequisite(format!("Could not get tax types: {}", e));
                    for instance in instances
                        .iter_mut()
                        .filter(|i| i.action.requires_tax_types && !i.state().is_terminal())
                    {
                        instance.fail(client_task, error.clone()).await;
                    }
                }
            }
        }

        let ctx = RunContext {
            parent_task: client_task,
            session: Some(session),
            fetcher: self.fetcher.as_ref(),
            tax_types: tax_types.as_deref(),
        };
        let results = join_all(
            instances
                .iter_mut()
                .filter(|i| !i.state().is_terminal())
                .map(|instance| instance.run(ctx)),
        )
        .await;
        for e in results.into_iter().filter_map(Result::err) {
            warn!("Action rejected: {}", e);
        }
        Ok(())
    }

    /// Log out. The session is also closed when an action asked to keep it
    /// open or logout failed; this happens even if logout errors.
    async fn end_session(&self, client_task: &TaskHandle, session: &Session, keep_session_open: bool) -> bool {
        let logout = self.sessions.logout(session);
        let logout_ok = match client_task.create_child("Logging out", TaskOptions::default()).await {
            Ok(task) => run_in_task(&task, &TaskFunctionOptions::default(), logout)
                .await
                .is_ok(),
            Err(e) => {
                warn!("Could not create logout task: {}", e);
                logout.await.is_ok()
            }
        };
        if keep_session_open || !logout_ok {
            self.sessions.close_session(session).await;
        }
        logout_ok
    }

    /// Clients of the current run with actions that should be retried
    pub fn retryable_failures(&self) -> Vec<ClientFailures> {
        let Some(run_id) = self.store.current_run_id() else {
            return Vec::new();
        };
        let mut failures: Vec<ClientFailures> = Vec::new();
        for instance in self.store.instances_in_run(run_id) {
            if !instance.should_retry() {
                continue;
            }
            let Some(client_id) = instance.client_id() else {
                continue;
            };
            let action_id = instance.action_id().to_string();
            match failures.iter_mut().find(|f| f.client_id == client_id) {
                Some(entry) => entry.action_ids.push(action_id),
                None => failures.push(ClientFailures {
                    client_id: client_id.to_string(),
                    action_ids: vec![action_id],
                }),
            }
        }
        failures
    }

    /// Output of one (client, action) pair merged over the current run and
    /// every run it retries
    pub fn merged_output(&self, client_id: &str, action_id: &str) -> Option<ActionOutput> {
        let run_id = self.store.current_run_id()?;
        let outputs: Vec<ActionOutput> = self
            .store
            .outputs_for(run_id, client_id, action_id)
            .into_iter()
            .cloned()
            .collect();
        if outputs.is_empty() {
            return None;
        }
        Some(merge_all_run_outputs(&outputs))
    }

    pub fn merged_outputs(&self) -> Vec<MergedOutput> {
        let Some(run_id) = self.store.current_run_id() else {
            return Vec::new();
        };
        self.store
            .pairs_in_chain(run_id)
            .into_iter()
            .filter_map(|(client_id, action_id)| {
                let output = self.merged_output(&client_id, &action_id)?;
                Some(MergedOutput {
                    client_id,
                    action_id,
                    output,
                })
            })
            .collect()
    }
}

/// A lone failing action fails the client; with several actions failures
/// only warn. A successful client is left for the wrapper to mark.
async fn finish_client_task(
    client_task: &TaskHandle,
    instances: &[ActionInstance],
    logout_ok: bool,
) -> Result<()> {
    if let [only] = instances
        && only.state() == RunnerState::Error
    {
        let message = only
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| format!("{} failed", only.action.name));
        return Err(anyhow!(message));
    }

    let unsuccessful = instances
        .iter()
        .filter(|i| i.state() != RunnerState::Success)
        .count();
    if unsuccessful > 0 || !logout_ok {
        let mut status = format!("{} of {} actions incomplete", unsuccessful, instances.len());
        if !logout_ok {
            status.push_str(", logout failed");
        }
        client_task.set_status(status).await;
        client_task.set_state(TaskState::Warning).await;
    } else {
        client_task.set_status("Done").await;
    }
    Ok(())
}

/// Error only when every client errored; any other failure is a warning
fn overall_state(states: impl Iterator<Item = TaskState>) -> TaskState {
    let counts: crate::task::ChildStateCounts = states.collect();
    if counts.total() > 0 && counts.error == counts.total() {
        TaskState::Error
    } else if counts.error > 0 || counts.warning > 0 {
        TaskState::Warning
    } else {
        TaskState::Success
    }
}

impl RunEventHandler for LoggingEventHandler {
    fn handle_event(&self, event: &RunEvent) -> Result<()> {
        match event {
            RunEvent::NoClients => warn!("No clients to run"),
            RunEvent::RunStarted {
                run_id,
                retry_of,
                client_count,
            } => match retry_of {
                Some(original) => info!(
                    "Run {} started: retrying run {} for {} clients",
                    run_id, original, client_count
                ),
                None => info!("Run {} started for {} clients", run_id, client_count),
            },
            RunEvent::ClientStarted { run_id, client_id } => {
                info!("Run {}: processing client {}", run_id, client_id);
            }
            RunEvent::ClientFinished {
                run_id,
                client_id,
                state,
            } => {
                info!("Run {}: client {} finished ({:?})", run_id, client_id, state);
            }
            RunEvent::BatchComplete {
                run_id,
                root_state,
                retryable_clients,
            } => {
                info!(
                    "Run {} complete ({:?}), {} clients with retryable failures",
                    run_id, root_state, retryable_clients
                );
            }
        }
        Ok(())
    }
}
