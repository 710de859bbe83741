use crate::action::{ActionId, ActionInstance, ActionOutput, InstanceId};
use crate::task::TaskId;
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Incrementing identifier of a run
pub type RunId = u32;

/// One top-level invocation of the orchestrator
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: RunId,
    /// The run whose failures this run retries
    pub retry_of: Option<RunId>,
    pub started_at: DateTime<Utc>,
    pub root_task: Option<TaskId>,
    /// Instances in execution order
    pub instances: Vec<InstanceId>,
    pub instances_by_action: BTreeMap<ActionId, Vec<InstanceId>>,
}

/// Append-only table of runs and action instances
#[derive(Debug, Default)]
pub struct RunStore {
    runs: Vec<Run>,
    instances: HashMap<InstanceId, ActionInstance>,
    current_run: Option<RunId>,
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a run and make it the current one
    pub fn start_new_run(&mut self, retry_of: Option<RunId>) -> RunId {
        let id = self.runs.last().map(|r| r.id + 1).unwrap_or(1);
        self.runs.push(Run {
            id,
            retry_of,
            started_at: Utc::now(),
            root_task: None,
            instances: Vec::new(),
            instances_by_action: BTreeMap::new(),
        });
        self.current_run = Some(id);
        debug!("Started run {} (retry of {:?})", id, retry_of);
        id
    }

    pub fn current_run_id(&self) -> Option<RunId> {
        self.current_run
    }

    pub fn current_run(&self) -> Option<&Run> {
        self.current_run.and_then(|id| self.get_run(id))
    }

    pub fn get_run(&self, run_id: RunId) -> Option<&Run> {
        self.runs.iter().find(|r| r.id == run_id)
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    pub fn set_root_task(&mut self, run_id: RunId, task_id: TaskId) -> Result<()> {
        let run = self.run_mut(run_id)?;
        run.root_task = Some(task_id);
        Ok(())
    }

    fn run_mut(&mut self, run_id: RunId) -> Result<&mut Run> {
        self.runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or_else(|| anyhow!("Run {} not found", run_id))
    }

    pub fn add_instance(&mut self, run_id: RunId, instance: ActionInstance) -> Result<InstanceId> {
        let instance_id = instance.id;
        let run = self.run_mut(run_id)?;
        run.instances.push(instance_id);
        run.instances_by_action
            .entry(instance.action.id.clone())
            .or_default()
            .push(instance_id);
        self.instances.insert(instance_id, instance);
        Ok(instance_id)
    }

    pub fn get_instance(&self, instance_id: InstanceId) -> Option<&ActionInstance> {
        self.instances.get(&instance_id)
    }

    /// Instances of a run in execution order
    pub fn instances_in_run(&self, run_id: RunId) -> Vec<&ActionInstance> {
        self.get_run(run_id)
            .map(|run| {
                run.instances
                    .iter()
                    .filter_map(|id| self.instances.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `run_id` and the runs it retries, oldest first
    pub fn run_chain(&self, run_id: RunId) -> Vec<RunId> {
        let mut chain = Vec::new();
        let mut next = Some(run_id);
        while let Some(id) = next {
            let Some(run) = self.get_run(id) else { break };
            if chain.contains(&id) {
                break;
            }
            chain.push(id);
            next = run.retry_of;
        }
        chain.reverse();
        chain
    }

    /// Outputs of one (client, action) pair along the run chain, oldest first
    pub fn outputs_for(&self, run_id: RunId, client_id: &str, action_id: &str) -> Vec<&ActionOutput> {
        self.run_chain(run_id)
            .into_iter()
            .flat_map(|id| self.instances_in_run(id))
            .filter(|i| i.client_id() == Some(client_id) && i.action_id() == action_id)
            .filter_map(|i| i.output.as_ref())
            .collect()
    }

    /// (client, action) pairs seen anywhere along the run chain, in first-seen order
    pub fn pairs_in_chain(&self, run_id: RunId) -> Vec<(String, ActionId)> {
        let mut pairs: Vec<(String, ActionId)> = Vec::new();
        for instance in self
            .run_chain(run_id)
            .into_iter()
            .flat_map(|id| self.instances_in_run(id))
        {
            let Some(client_id) = instance.client_id() else {
                continue;
            };
            let pair = (client_id.to_string(), instance.action_id().to_string());
            if !pairs.contains(&pair) {
                pairs.push(pair);
            }
        }
        pairs
    }
}
