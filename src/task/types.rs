use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for tasks
pub type TaskId = Uuid;

/// A node in the progress/state tree
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    /// Free-text status line shown next to the title
    pub status: String,
    pub state: TaskState,
    pub progress: TaskProgress,
    pub parent_id: Option<TaskId>,
    pub children: Vec<TaskId>,
    /// Children complete one after another; the parent advances one unit per finished child
    pub sequential: bool,
    /// Error recorded by `set_error`, kept for display
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Task state. `Success`, `Warning` and `Error` are terminal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Success,
    Warning,
    Error,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Warning | TaskState::Error)
    }
}

/// Progress of a single task.
///
/// `max` is `None` when the total is not known yet (for instance a paged
/// fetch that has not seen its first page). A parent without a max uses
/// its child count.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskProgress {
    pub current: f64,
    pub max: Option<f64>,
    /// Spinner-style progress: no fraction is reported until the task finishes
    pub indeterminate: bool,
}

impl TaskProgress {
    /// Completed fraction in `[0, 1]`, if one can be computed
    pub fn fraction(&self) -> Option<f64> {
        if self.indeterminate {
            return None;
        }
        match self.max {
            Some(max) if max > 0.0 => Some((self.current / max).clamp(0.0, 1.0)),
            _ => None,
        }
    }
}

/// Options accepted by `TaskTree::create_task`
#[derive(Clone, Debug, Default)]
pub struct TaskOptions {
    pub progress_max: Option<f64>,
    pub unknown_max_progress: bool,
    pub sequential: bool,
    pub indeterminate: bool,
}

impl TaskOptions {
    pub fn with_progress_max(mut self, max: usize) -> Self {
        self.progress_max = Some(max as f64);
        self
    }

    pub fn sequential(mut self) -> Self {
        self.sequential = true;
        self
    }

    pub fn indeterminate(mut self) -> Self {
        self.indeterminate = true;
        self
    }

    pub fn unknown_max_progress(mut self) -> Self {
        self.unknown_max_progress = true;
        self
    }
}

/// Counts of child states, used for bottom-up aggregation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChildStateCounts {
    pub pending: usize,
    pub running: usize,
    pub success: usize,
    pub warning: usize,
    pub error: usize,
}

impl ChildStateCounts {
    pub fn record(&mut self, state: TaskState) {
        match state {
            TaskState::Pending => self.pending += 1,
            TaskState::Running => self.running += 1,
            TaskState::Success => self.success += 1,
            TaskState::Warning => self.warning += 1,
            TaskState::Error => self.error += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.success + self.warning + self.error
    }

    /// error > warning > success
    pub fn aggregate(&self) -> TaskState {
        if self.error > 0 {
            TaskState::Error
        } else if self.warning > 0 {
            TaskState::Warning
        } else {
            TaskState::Success
        }
    }
}

impl FromIterator<TaskState> for ChildStateCounts {
    fn from_iter<I: IntoIterator<Item = TaskState>>(iter: I) -> Self {
        let mut counts = Self::default();
        for state in iter {
            counts.record(state);
        }
        counts
    }
}

impl Task {
    /// Create a new task under `parent_id`
    pub fn new(title: impl Into<String>, parent_id: Option<TaskId>, options: &TaskOptions) -> Self {
        let now = Utc::now();
        let max = if options.unknown_max_progress {
            None
        } else {
            options.progress_max
        };
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            status: String::new(),
            state: TaskState::Pending,
            progress: TaskProgress {
                current: 0.0,
                max,
                indeterminate: options.indeterminate,
            },
            parent_id,
            children: Vec::new(),
            sequential: options.sequential,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
