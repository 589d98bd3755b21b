//! Re-check task types and their admission order

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task priority. Higher priorities are admitted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Urgent = 4,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
            Self::Urgent => "URGENT",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// What a finished task reports to its callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { message: String },
    Failed { error: String },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Invoked once when a task reaches Completed or Failed
pub type TaskCallback = Arc<dyn Fn(&ScheduledTask, &TaskOutcome) -> anyhow::Result<()> + Send + Sync>;

/// A request to re-check one model
#[derive(Clone, Default)]
pub struct TaskRequest {
    pub model_name: String,
    pub priority: TaskPriority,
    /// Zero lets adaptive scheduling pick the time
    pub delay: Duration,
    pub data: serde_json::Value,
    pub callback: Option<TaskCallback>,
}

impl TaskRequest {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ScheduledTask, &TaskOutcome) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for TaskRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRequest")
            .field("model_name", &self.model_name)
            .field("priority", &self.priority)
            .field("delay", &self.delay)
            .field("data", &self.data)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// A task owned by the scheduler
#[derive(Clone)]
pub struct ScheduledTask {
    pub task_id: String,
    pub model_name: String,
    pub priority: TaskPriority,
    pub scheduled_time: DateTime<Utc>,
    pub status: TaskStatus,
    pub estimated_duration: Duration,
    pub actual_duration: Option<Duration>,
    pub execution_count: u32,
    pub failure_count: u32,
    pub last_execution: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub data: serde_json::Value,
    pub(crate) callback: Option<TaskCallback>,
    /// Submission order, breaks ties between equal priority and time
    pub(crate) sequence: u64,
}

impl ScheduledTask {
    pub(crate) fn from_request(
        request: TaskRequest,
        task_id: String,
        scheduled_time: DateTime<Utc>,
        estimated_duration: Duration,
        sequence: u64,
    ) -> Self {
        Self {
            task_id,
            model_name: request.model_name,
            priority: request.priority,
            scheduled_time,
            status: TaskStatus::Pending,
            estimated_duration,
            actual_duration: None,
            execution_count: 0,
            failure_count: 0,
            last_execution: None,
            last_error: None,
            data: request.data,
            callback: request.callback,
            sequence,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("task_id", &self.task_id)
            .field("model_name", &self.model_name)
            .field("priority", &self.priority)
            .field("scheduled_time", &self.scheduled_time)
            .field("status", &self.status)
            .field("estimated_duration", &self.estimated_duration)
            .field("actual_duration", &self.actual_duration)
            .field("execution_count", &self.execution_count)
            .field("failure_count", &self.failure_count)
            .field("last_execution", &self.last_execution)
            .field("last_error", &self.last_error)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Order in which pending tasks are admitted.
///
/// `Less` means `a` goes before `b`: higher priority first, then earlier
/// scheduled time, then earlier submission.
pub fn admission_order(a: &ScheduledTask, b: &ScheduledTask) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.scheduled_time.cmp(&b.scheduled_time))
        .then_with(|| a.sequence.cmp(&b.sequence))
}

/// Max-heap entry whose greatest element is the next task to admit
pub(crate) struct QueueEntry(pub(crate) ScheduledTask);

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        admission_order(&other.0, &self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    fn task(priority: TaskPriority, offset_secs: i64, sequence: u64) -> ScheduledTask {
        let base = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        ScheduledTask::from_request(
            TaskRequest::new("jane").with_priority(priority),
            format!("jane_{}", sequence),
            base + chrono::Duration::seconds(offset_secs),
            Duration::from_secs(300),
            sequence,
        )
    }

    #[test]
    fn test_priority_beats_time() {
        let urgent_late = task(TaskPriority::Urgent, 60, 1);
        let low_early = task(TaskPriority::Low, 0, 0);
        assert_eq!(admission_order(&urgent_late, &low_early), Ordering::Less);
    }

    #[test]
    fn test_time_then_sequence() {
        let early = task(TaskPriority::Normal, 0, 5);
        let late = task(TaskPriority::Normal, 10, 1);
        assert_eq!(admission_order(&early, &late), Ordering::Less);

        let first = task(TaskPriority::Normal, 0, 1);
        let second = task(TaskPriority::Normal, 0, 2);
        assert_eq!(admission_order(&first, &second), Ordering::Less);
        assert_eq!(admission_order(&first, &first), Ordering::Equal);
    }

    #[test]
    fn test_heap_pops_in_admission_order() {
        let mut heap = BinaryHeap::new();
        heap.push(QueueEntry(task(TaskPriority::Low, 0, 0)));
        heap.push(QueueEntry(task(TaskPriority::High, 0, 1)));
        heap.push(QueueEntry(task(TaskPriority::Normal, 0, 2)));
        heap.push(QueueEntry(task(TaskPriority::High, 0, 3)));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|e| e.0.sequence)).collect();
        assert_eq!(order, vec![1, 3, 2, 0]);
    }

    #[test]
    fn test_priority_display_and_ordering() {
        assert!(TaskPriority::Urgent > TaskPriority::High);
        assert!(TaskPriority::Normal > TaskPriority::Low);
        assert_eq!(TaskPriority::default(), TaskPriority::Normal);
        assert_eq!(TaskPriority::High.to_string(), "HIGH");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }
}
