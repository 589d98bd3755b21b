//! Priority- and load-aware re-check scheduler
//!
//! Tasks wait in a priority queue until their scheduled time. Each admission
//! pass moves due tasks into the running table, bounded by the concurrency
//! cap, and spawns one tokio task per admitted task. A background loop runs
//! the admission pass on a fixed interval until stopped.

use std::any::Any;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::runner::TaskRunner;
use super::task::{QueueEntry, ScheduledTask, TaskOutcome, TaskRequest, TaskStatus};
use crate::services::history::ExecutionHistory;
use crate::services::load_monitor::LoadMonitor;

/// Sleep after a panicking admission pass
pub const PANIC_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_tasks: usize,
    /// How often the background loop runs an admission pass
    pub check_interval: Duration,
    /// Pick the start hour from history for requests without a delay
    pub adaptive_scheduling: bool,
    /// Defer or shrink admission when the host is loaded
    pub load_aware: bool,
    /// Deadline per task run
    pub task_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            check_interval: Duration::from_secs(30),
            adaptive_scheduling: true,
            load_aware: true,
            task_timeout: None,
        }
    }
}

/// Task counts by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Default)]
struct SchedulerState {
    queue: BinaryHeap<QueueEntry>,
    running: HashMap<String, ScheduledTask>,
    /// Terminal tasks in the order they finished
    finished: Vec<ScheduledTask>,
    /// Workers that have not returned yet, including cancelled ones
    in_flight: usize,
}

struct BackgroundLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    history: Arc<ExecutionHistory>,
    monitor: Arc<LoadMonitor>,
    runner: Arc<dyn TaskRunner>,
    sequence: AtomicU64,
    background: Mutex<Option<BackgroundLoop>>,
}

/// Cheap-to-clone handle to a scheduler
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl TaskScheduler {
    pub fn new(
        config: SchedulerConfig,
        runner: Arc<dyn TaskRunner>,
        history: Arc<ExecutionHistory>,
        monitor: Arc<LoadMonitor>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(SchedulerState::default()),
                history,
                monitor,
                runner,
                sequence: AtomicU64::new(0),
                background: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn history(&self) -> &Arc<ExecutionHistory> {
        &self.inner.history
    }

    /// Queue a task and return its id
    pub fn schedule(&self, request: TaskRequest) -> String {
        let now = Utc::now();
        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        let history = &self.inner.history;

        let scheduled_time = if request.delay.is_zero() && self.inner.config.adaptive_scheduling {
            let hour = history.best_execution_hour(&request.model_name);
            next_local_hour(now.with_timezone(&Local), hour)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or(now)
        } else {
            chrono::Duration::from_std(request.delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        };

        let estimated_duration = history.predict_duration(&request.model_name);
        let task_id = format!(
            "{}_{}_{}",
            request.model_name,
            now.timestamp_millis(),
            sequence
        );

        let task = ScheduledTask::from_request(
            request,
            task_id.clone(),
            scheduled_time,
            estimated_duration,
            sequence,
        );

        info!(
            task_id = %task_id,
            model = %task.model_name,
            priority = %task.priority,
            scheduled_time = %task.scheduled_time,
            estimated_secs = estimated_duration.as_secs(),
            "Scheduled re-check task"
        );

        self.inner.state.lock().queue.push(QueueEntry(task));
        task_id
    }

    /// Cancel a pending or running task.
    ///
    /// A running worker is not interrupted; its result is discarded and its
    /// slot stays taken until it returns.
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut state = self.inner.state.lock();

        let mut cancelled = None;
        state.queue.retain(|entry| {
            if entry.0.task_id == task_id {
                cancelled = Some(entry.0.clone());
                false
            } else {
                true
            }
        });

        let cancelled = cancelled.or_else(|| state.running.remove(task_id));
        match cancelled {
            Some(mut task) => {
                let was = task.status;
                task.status = TaskStatus::Cancelled;
                info!(task_id = %task_id, previous = ?was, "Cancelled task");
                state.finished.push(task);
                true
            }
            None => {
                debug!(task_id = %task_id, "Cancel ignored, task unknown or finished");
                false
            }
        }
    }

    /// Pending tasks in admission order
    pub fn pending(&self) -> Vec<ScheduledTask> {
        let state = self.inner.state.lock();
        let mut entries: Vec<&QueueEntry> = state.queue.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| e.0.clone()).collect()
    }

    pub fn running(&self) -> Vec<ScheduledTask> {
        let state = self.inner.state.lock();
        let mut tasks: Vec<ScheduledTask> = state.running.values().cloned().collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    /// Terminal tasks (completed, failed or cancelled) in the order they finished
    pub fn completed(&self) -> Vec<ScheduledTask> {
        self.inner.state.lock().finished.clone()
    }

    pub fn task(&self, task_id: &str) -> Option<ScheduledTask> {
        let state = self.inner.state.lock();
        state
            .queue
            .iter()
            .map(|e| &e.0)
            .chain(state.running.values())
            .chain(state.finished.iter())
            .find(|t| t.task_id == task_id)
            .cloned()
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock();
        let mut stats = SchedulerStats {
            pending: state.queue.len(),
            running: state.running.len(),
            ..Default::default()
        };
        for task in &state.finished {
            match task.status {
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
                TaskStatus::Pending | TaskStatus::Running => {}
            }
        }
        stats
    }

    /// One admission pass. Returns how many tasks were started.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run_due(&self) -> usize {
        let now = Utc::now();

        {
            let state = self.inner.state.lock();
            if !state.queue.iter().any(|e| e.0.scheduled_time <= now) {
                return 0;
            }
        }

        let Some(slot_cap) = self.slot_cap() else {
            return 0;
        };

        let admitted = {
            let mut state = self.inner.state.lock();
            let free = slot_cap.saturating_sub(state.in_flight);

            let mut admitted = Vec::new();
            let mut deferred = Vec::new();
            while let Some(QueueEntry(mut task)) = state.queue.pop() {
                if task.scheduled_time > now || admitted.len() >= free {
                    deferred.push(QueueEntry(task));
                    continue;
                }

                task.status = TaskStatus::Running;
                task.execution_count += 1;
                task.last_execution = Some(now);
                state.running.insert(task.task_id.clone(), task.clone());
                state.in_flight += 1;
                admitted.push(task);
            }
            state.queue.extend(deferred);
            admitted
        };

        for task in &admitted {
            info!(
                task_id = %task.task_id,
                model = %task.model_name,
                priority = %task.priority,
                "Starting re-check task"
            );
            tokio::spawn(execute(self.inner.clone(), task.clone()));
        }

        admitted.len()
    }

    /// Slots available this pass, or `None` when the host is too busy
    fn slot_cap(&self) -> Option<usize> {
        let max = self.inner.config.max_concurrent_tasks.max(1);
        if !self.inner.config.load_aware {
            return Some(max);
        }

        let sample = self.inner.monitor.sample();
        if sample.exceeds(&self.inner.monitor.thresholds()) {
            debug!(
                cpu = sample.cpu_percent,
                memory = sample.memory_percent,
                "Host busy, deferring due tasks"
            );
            return None;
        }

        let scaled = (max as f64 * sample.available_capacity()).floor() as usize;
        Some(scaled.clamp(1, max))
    }

    /// Start the background admission loop. Returns false if it is already running.
    pub fn start(&self) -> bool {
        let mut background = self.inner.background.lock();
        if background.is_some() {
            warn!("Scheduler loop already running");
            return false;
        }

        let token = CancellationToken::new();
        let scheduler = self.clone();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move { scheduler.run_loop(loop_token).await });

        *background = Some(BackgroundLoop { token, handle });
        info!(
            interval_secs = self.inner.config.check_interval.as_secs(),
            max_concurrent = self.inner.config.max_concurrent_tasks,
            "Scheduler started"
        );
        true
    }

    /// Stop the loop and wait up to `join_timeout` for it to exit.
    ///
    /// Returns false if the loop was not running or did not exit in time.
    /// Tasks already running are left to finish.
    pub async fn stop(&self, join_timeout: Duration) -> bool {
        let Some(background) = self.inner.background.lock().take() else {
            return false;
        };

        background.token.cancel();
        match tokio::time::timeout(join_timeout, background.handle).await {
            Ok(Ok(())) => {
                info!("Scheduler stopped");
                true
            }
            Ok(Err(e)) => {
                error!(error = %e, "Scheduler loop ended abnormally");
                false
            }
            Err(_) => {
                warn!(timeout_secs = join_timeout.as_secs(), "Scheduler loop did not stop in time");
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.background.lock().is_some()
    }

    async fn run_loop(self, token: CancellationToken) {
        loop {
            let wait = match catch_unwind(AssertUnwindSafe(|| self.run_due())) {
                Ok(_) => self.inner.config.check_interval,
                Err(panic) => {
                    error!(panic = %panic_message(panic.as_ref()), "Scheduler pass panicked, backing off");
                    PANIC_BACKOFF
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!("Scheduler loop exited");
    }
}

/// Run one admitted task to completion and record the result
async fn execute(inner: Arc<Inner>, task: ScheduledTask) {
    let started = Instant::now();
    let start_time = Utc::now();

    let runner = inner.runner.clone();
    let snapshot = task.clone();
    let worker = tokio::spawn(async move { runner.run(&snapshot).await });
    let abort = worker.abort_handle();

    let joined = match inner.config.task_timeout {
        Some(limit) => match tokio::time::timeout(limit, worker).await {
            Ok(joined) => Some(joined),
            Err(_) => {
                abort.abort();
                None
            }
        },
        None => Some(worker.await),
    };

    let result: Result<String, String> = match joined {
        None => Err("timed out".to_string()),
        Some(Ok(Ok(message))) => Ok(message),
        Some(Ok(Err(e))) => Err(format!("{:#}", e)),
        Some(Err(e)) if e.is_panic() => Err(format!("panicked: {}", panic_message(e.into_panic().as_ref()))),
        Some(Err(e)) => Err(format!("worker aborted: {}", e)),
    };

    let elapsed = started.elapsed();
    inner
        .history
        .record_execution(&task.model_name, elapsed, result.is_ok(), start_time, Utc::now());

    let finished = {
        let mut state = inner.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);

        state.running.remove(&task.task_id).map(|mut finished| {
            finished.actual_duration = Some(elapsed);
            match &result {
                Ok(_) => finished.status = TaskStatus::Completed,
                Err(error) => {
                    finished.status = TaskStatus::Failed;
                    finished.failure_count += 1;
                    finished.last_error = Some(error.clone());
                }
            }
            state.finished.push(finished.clone());
            finished
        })
    };

    let Some(finished) = finished else {
        debug!(task_id = %task.task_id, "Cancelled task returned, result discarded");
        return;
    };

    let outcome = match result {
        Ok(message) => {
            info!(task_id = %finished.task_id, elapsed_ms = elapsed.as_millis() as u64, "Re-check task completed");
            TaskOutcome::Completed { message }
        }
        Err(error) => {
            warn!(task_id = %finished.task_id, error = %error, "Re-check task failed");
            TaskOutcome::Failed { error }
        }
    };

    if let Some(callback) = &finished.callback {
        match catch_unwind(AssertUnwindSafe(|| callback(&finished, &outcome))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(task_id = %finished.task_id, error = %e, "Task callback failed"),
            Err(panic) => error!(
                task_id = %finished.task_id,
                panic = %panic_message(panic.as_ref()),
                "Task callback panicked"
            ),
        }
    }
}

/// Next `hour:00` in local time that is still ahead of `now`
pub fn next_local_hour(now: DateTime<Local>, hour: u32) -> Option<DateTime<Local>> {
    let at = |date: NaiveDate| {
        date.and_hms_opt(hour, 0, 0)
            .and_then(|naive| Local.from_local_datetime(&naive).earliest())
    };

    match at(now.date_naive()) {
        Some(today) if today > now => Some(today),
        _ => now.date_naive().succ_opt().and_then(at),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::runner::FnRunner;
    use crate::jobs::task::TaskPriority;
    use crate::services::load_monitor::{LoadThresholds, SystemLoadSample};
    use chrono::Timelike;

    fn idle() -> Arc<LoadMonitor> {
        Arc::new(LoadMonitor::fixed(
            SystemLoadSample {
                cpu_percent: 0.0,
                memory_percent: 0.0,
                disk_io_bytes: 0,
                network_io_bytes: 0,
            },
            LoadThresholds::default(),
        ))
    }

    fn scheduler(config: SchedulerConfig, monitor: Arc<LoadMonitor>) -> TaskScheduler {
        let runner = Arc::new(FnRunner::new(|_task: ScheduledTask| async { Ok("done".to_string()) }));
        TaskScheduler::new(config, runner, Arc::new(ExecutionHistory::new()), monitor)
    }

    fn immediate() -> SchedulerConfig {
        SchedulerConfig {
            adaptive_scheduling: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_next_local_hour() {
        let now = Local.with_ymd_and_hms(2024, 3, 10, 15, 30, 0).earliest().unwrap();

        let later_today = next_local_hour(now, 18).unwrap();
        assert_eq!(later_today.date_naive(), now.date_naive());
        assert_eq!(later_today.hour(), 18);

        let tomorrow = next_local_hour(now, 2).unwrap();
        assert_eq!(tomorrow.date_naive(), now.date_naive().succ_opt().unwrap());
        assert_eq!(tomorrow.hour(), 2);

        // The current hour has already started, so it rolls over
        let same_hour = next_local_hour(now, 15).unwrap();
        assert_eq!(same_hour.date_naive(), now.date_naive().succ_opt().unwrap());
    }

    #[tokio::test]
    async fn test_adaptive_only_without_delay() {
        let scheduler = scheduler(SchedulerConfig::default(), idle());

        let adaptive = scheduler.schedule(TaskRequest::new("jane"));
        let delayed = scheduler.schedule(TaskRequest::new("jane").with_delay(Duration::from_secs(60)));

        let adaptive = scheduler.task(&adaptive).unwrap();
        let local = adaptive.scheduled_time.with_timezone(&Local);
        assert_eq!(local.hour(), 2);
        assert_eq!(local.minute(), 0);
        assert!(adaptive.scheduled_time > Utc::now());

        let delayed = scheduler.task(&delayed).unwrap();
        let diff = delayed.scheduled_time - Utc::now();
        assert!(diff.num_seconds() <= 60 && diff.num_seconds() >= 55);
        assert_eq!(delayed.estimated_duration, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_future_tasks_are_not_admitted() {
        let scheduler = scheduler(immediate(), idle());
        scheduler.schedule(TaskRequest::new("jane").with_delay(Duration::from_secs(3600)));

        assert_eq!(scheduler.run_due(), 0);
        assert_eq!(scheduler.stats().pending, 1);
    }

    #[tokio::test]
    async fn test_busy_host_defers_admission() {
        let busy = Arc::new(LoadMonitor::fixed(
            SystemLoadSample {
                cpu_percent: 99.0,
                memory_percent: 10.0,
                disk_io_bytes: 0,
                network_io_bytes: 0,
            },
            LoadThresholds::default(),
        ));
        let scheduler = scheduler(immediate(), busy);
        scheduler.schedule(TaskRequest::new("jane"));

        assert_eq!(scheduler.run_due(), 0);
        assert_eq!(scheduler.stats().pending, 1);
    }

    #[tokio::test]
    async fn test_capacity_limits_slots() {
        let loaded = Arc::new(LoadMonitor::fixed(
            SystemLoadSample {
                cpu_percent: 70.0,
                memory_percent: 20.0,
                disk_io_bytes: 0,
                network_io_bytes: 0,
            },
            LoadThresholds::default(),
        ));
        let config = SchedulerConfig {
            max_concurrent_tasks: 4,
            ..immediate()
        };
        let scheduler = scheduler(config, loaded);
        for _ in 0..4 {
            scheduler.schedule(TaskRequest::new("jane"));
        }

        // floor(4 * 0.3) = 1
        assert_eq!(scheduler.run_due(), 1);
    }

    #[tokio::test]
    async fn test_cancel_pending_and_unknown() {
        let scheduler = scheduler(immediate(), idle());
        let id = scheduler.schedule(TaskRequest::new("jane").with_delay(Duration::from_secs(600)));

        assert!(scheduler.cancel(&id));
        assert!(!scheduler.cancel(&id));
        assert!(!scheduler.cancel("nope"));

        let stats = scheduler.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(scheduler.task(&id).unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_pending_in_admission_order() {
        let scheduler = scheduler(immediate(), idle());
        let delay = Duration::from_secs(600);
        let low = scheduler.schedule(TaskRequest::new("a").with_priority(TaskPriority::Low).with_delay(delay));
        let urgent = scheduler.schedule(TaskRequest::new("b").with_priority(TaskPriority::Urgent).with_delay(delay));
        let normal = scheduler.schedule(TaskRequest::new("c").with_delay(delay));

        let ids: Vec<String> = scheduler.pending().into_iter().map(|t| t.task_id).collect();
        assert_eq!(ids, vec![urgent, normal, low]);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
