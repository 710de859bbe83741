use crate::task::types::*;
use anyhow::{Result, anyhow};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Task tree for managing hierarchical task relationships
#[derive(Serialize, Clone, Debug, Default)]
pub struct TaskTree {
    /// All tasks indexed by ID
    pub tasks: HashMap<TaskId, Task>,
    /// Root task IDs (tasks with no parent)
    pub roots: Vec<TaskId>,
}

/// Events emitted whenever a task in the tree changes
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Created {
        task_id: TaskId,
        parent_id: Option<TaskId>,
        title: String,
    },
    StateChanged {
        task_id: TaskId,
        old_state: TaskState,
        new_state: TaskState,
    },
    StatusChanged {
        task_id: TaskId,
        status: String,
    },
    ProgressChanged {
        task_id: TaskId,
        current: f64,
        max: Option<f64>,
    },
}

/// Handler for task events
pub trait TaskEventHandler {
    fn handle_event(&self, event: &TaskEvent) -> Result<()>;
}

impl TaskTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a task. Only run roots may be created without a parent.
    pub fn create_task(
        &mut self,
        parent_id: Option<TaskId>,
        title: impl Into<String>,
        options: &TaskOptions,
    ) -> Result<TaskId> {
        let task = Task::new(title, parent_id, options);
        let task_id = task.id;

        match parent_id {
            Some(parent_id) => {
                let parent = self
                    .tasks
                    .get_mut(&parent_id)
                    .ok_or_else(|| anyhow!("Parent task {} does not exist", parent_id))?;
                parent.children.push(task_id);
                parent.touch();
            }
            None => self.roots.push(task_id),
        }

        self.tasks.insert(task_id, task);
        debug!("Added task {} to tree", task_id);
        Ok(task_id)
    }

    pub fn get_task(&self, task_id: TaskId) -> Result<&Task> {
        self.tasks
            .get(&task_id)
            .ok_or_else(|| anyhow!("Task {} not found", task_id))
    }

    pub fn get_task_mut(&mut self, task_id: TaskId) -> Result<&mut Task> {
        self.tasks
            .get_mut(&task_id)
            .ok_or_else(|| anyhow!("Task {} not found", task_id))
    }

    pub fn get_children(&self, task_id: TaskId) -> Result<Vec<&Task>> {
        let task = self.get_task(task_id)?;
        task.children
            .iter()
            .map(|&child_id| self.get_task(child_id))
            .collect()
    }

    pub fn child_state_counts(&self, task_id: TaskId) -> Result<ChildStateCounts> {
        Ok(self
            .get_children(task_id)?
            .into_iter()
            .map(|child| child.state)
            .collect())
    }

    /// State a task would get from its children: error > warning > success
    pub fn state_from_children(&self, task_id: TaskId) -> Result<TaskState> {
        Ok(self.child_state_counts(task_id)?.aggregate())
    }

    /// Progress including the contribution of children.
    ///
    /// A terminal child counts as one unit. In a non-sequential parent a
    /// running child also contributes its completed fraction.
    pub fn effective_progress(&self, task_id: TaskId) -> Result<TaskProgress> {
        let task = self.get_task(task_id)?;
        if task.children.is_empty() {
            let mut progress = task.progress.clone();
            if task.is_terminal() {
                let max = progress.max.unwrap_or(1.0);
                progress.current = max;
                progress.max = Some(max);
            }
            return Ok(progress);
        }

        let mut current = task.progress.current;
        for &child_id in &task.children {
            let child = self.get_task(child_id)?;
            if child.is_terminal() {
                current += 1.0;
            } else if !task.sequential {
                let fraction = self.effective_progress(child_id)?.fraction().unwrap_or(0.0);
                current += fraction;
            }
        }

        let max = task.progress.max.unwrap_or(task.children.len() as f64);
        Ok(TaskProgress {
            current: current.min(max),
            max: Some(max),
            indeterminate: task.progress.indeterminate && !task.is_terminal(),
        })
    }

    /// Walk the subtree below `task_id` depth-first, including the task itself
    pub fn subtree(&self, task_id: TaskId) -> Result<Vec<&Task>> {
        let mut out = Vec::new();
        let mut stack = vec![task_id];
        while let Some(id) = stack.pop() {
            let task = self.get_task(id)?;
            stack.extend(task.children.iter().rev());
            out.push(task);
        }
        Ok(out)
    }
}

/// Task tree shared between concurrently running work.
///
/// The lock is only held for the duration of a single mutation.
#[derive(Clone, Default)]
pub struct SharedTaskTree {
    tree: Arc<RwLock<TaskTree>>,
    event_handlers: Arc<RwLock<Vec<Box<dyn TaskEventHandler + Send + Sync>>>>,
}

impl SharedTaskTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_event_handler(&self, handler: Box<dyn TaskEventHandler + Send + Sync>) {
        self.event_handlers.write().await.push(handler);
    }

    /// Create a parentless task (the root of one run)
    pub async fn create_root(&self, title: impl Into<String>, options: TaskOptions) -> Result<TaskHandle> {
        self.create(None, title.into(), options).await
    }

    async fn create(
        &self,
        parent_id: Option<TaskId>,
        title: String,
        options: TaskOptions,
    ) -> Result<TaskHandle> {
        let task_id = {
            let mut tree = self.tree.write().await;
            tree.create_task(parent_id, title.clone(), &options)?
        };
        self.emit_event(TaskEvent::Created {
            task_id,
            parent_id,
            title,
        })
        .await;
        Ok(TaskHandle {
            id: task_id,
            tree: self.clone(),
        })
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Task> {
        let tree = self.tree.read().await;
        Ok(tree.get_task(task_id)?.clone())
    }

    pub async fn effective_progress(&self, task_id: TaskId) -> Result<TaskProgress> {
        self.tree.read().await.effective_progress(task_id)
    }

    pub async fn snapshot(&self) -> TaskTree {
        self.tree.read().await.clone()
    }

    async fn emit_event(&self, event: TaskEvent) {
        for handler in self.event_handlers.read().await.iter() {
            if let Err(e) = handler.handle_event(&event) {
                error!("Task event handler error: {}", e);
            }
        }
    }

    /// Apply `f` to one task and report the events it produced
    async fn mutate<F>(&self, task_id: TaskId, f: F)
    where
        F: FnOnce(&mut Task) -> Vec<TaskEvent>,
    {
        let events = {
            let mut tree = self.tree.write().await;
            match tree.get_task_mut(task_id) {
                Ok(task) => {
                    let events = f(task);
                    task.touch();
                    events
                }
                Err(e) => {
                    warn!("Ignoring update: {}", e);
                    Vec::new()
                }
            }
        };
        for event in events {
            self.emit_event(event).await;
        }
    }
}

/// Mutable handle onto one task of a `SharedTaskTree`
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    tree: SharedTaskTree,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn tree(&self) -> &SharedTaskTree {
        &self.tree
    }

    pub async fn create_child(&self, title: impl Into<String>, options: TaskOptions) -> Result<TaskHandle> {
        self.tree.create(Some(self.id), title.into(), options).await
    }

    pub async fn snapshot(&self) -> Result<Task> {
        self.tree.get_task(self.id).await
    }

    pub async fn state(&self) -> TaskState {
        self.snapshot().await.map(|t| t.state).unwrap_or_default()
    }

    pub async fn set_state(&self, state: TaskState) {
        let task_id = self.id;
        self.tree
            .mutate(task_id, |task| {
                let old_state = task.state;
                task.state = state;
                if old_state == state {
                    Vec::new()
                } else {
                    vec![TaskEvent::StateChanged {
                        task_id,
                        old_state,
                        new_state: state,
                    }]
                }
            })
            .await;
    }

    pub async fn set_status(&self, status: impl Into<String>) {
        let task_id = self.id;
        let status = status.into();
        self.tree
            .mutate(task_id, |task| {
                task.status = status.clone();
                vec![TaskEvent::StatusChanged { task_id, status }]
            })
            .await;
    }

    /// Advance own progress by one unit and show `label` as status
    pub async fn add_step(&self, label: impl Into<String>) {
        let task_id = self.id;
        let label = label.into();
        self.tree
            .mutate(task_id, |task| {
                task.progress.current += 1.0;
                task.status = label.clone();
                vec![
                    TaskEvent::StatusChanged {
                        task_id,
                        status: label,
                    },
                    TaskEvent::ProgressChanged {
                        task_id,
                        current: task.progress.current,
                        max: task.progress.max,
                    },
                ]
            })
            .await;
    }

    pub async fn set_progress_max(&self, max: Option<f64>) {
        let task_id = self.id;
        self.tree
            .mutate(task_id, |task| {
                task.progress.max = max;
                vec![TaskEvent::ProgressChanged {
                    task_id,
                    current: task.progress.current,
                    max,
                }]
            })
            .await;
    }

    /// Mark the task failed and keep the error for display
    pub async fn set_error<E: Display + ?Sized>(&self, err: &E) {
        let message = err.to_string();
        let task_id = self.id;
        self.tree
            .mutate(task_id, |task| {
                task.error = Some(message);
                task.status = "Error".to_string();
                let old_state = task.state;
                task.state = TaskState::Error;
                let mut events = vec![TaskEvent::StatusChanged {
                    task_id,
                    status: task.status.clone(),
                }];
                if old_state != TaskState::Error {
                    events.push(TaskEvent::StateChanged {
                        task_id,
                        old_state,
                        new_state: TaskState::Error,
                    });
                }
                events
            })
            .await;
    }

    /// Derive state from children (error > warning > success) and store it
    pub async fn set_state_from_children(&self) -> TaskState {
        let state = {
            let tree = self.tree.tree.read().await;
            tree.state_from_children(self.id).unwrap_or(TaskState::Success)
        };
        self.set_state(state).await;
        state
    }

    pub async fn child_state_counts(&self) -> ChildStateCounts {
        let tree = self.tree.tree.read().await;
        tree.child_state_counts(self.id).unwrap_or_default()
    }

    pub async fn effective_progress(&self) -> Result<TaskProgress> {
        self.tree.effective_progress(self.id).await
    }
}

/// Event handler that logs task events
pub struct LoggingEventHandler;

impl TaskEventHandler for LoggingEventHandler {
    fn handle_event(&self, event: &TaskEvent) -> Result<()> {
        match event {
            TaskEvent::Created {
                task_id,
                parent_id,
                title,
            } => {
                debug!("Task created: {} '{}' (parent: {:?})", task_id, title, parent_id);
            }
            TaskEvent::StateChanged {
                task_id,
                old_state,
                new_state,
            } => match new_state {
                TaskState::Error => warn!("Task {} state: {:?} -> {:?}", task_id, old_state, new_state),
                _ => debug!("Task {} state: {:?} -> {:?}", task_id, old_state, new_state),
            },
            TaskEvent::StatusChanged { task_id, status } => {
                debug!("Task {} status: {}", task_id, status);
            }
            TaskEvent::ProgressChanged {
                task_id,
                current,
                max,
            } => {
                debug!("Task {} progress: {}/{:?}", task_id, current, max);
            }
        }
        Ok(())
    }
}
