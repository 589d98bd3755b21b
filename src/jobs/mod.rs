//! Re-check task scheduling and workers

pub mod recheck;
pub mod runner;
pub mod scheduler;
pub mod task;

use std::sync::Arc;

use tracing::info;

pub use recheck::{EXPEDITED_DELAY, is_recheck_active, schedule_recheck, task_cache_key};
pub use runner::{CommandRunner, FnRunner, TaskRunner};
pub use scheduler::{SchedulerConfig, SchedulerStats, TaskScheduler};
pub use task::{
    ScheduledTask, TaskCallback, TaskOutcome, TaskPriority, TaskRequest, TaskStatus,
    admission_order,
};

use crate::config::Config;
use crate::services::{ExecutionHistory, LoadMonitor};

/// Build the scheduler described by `config` and start its admission loop
pub fn start_scheduler(config: &Config, history: Arc<ExecutionHistory>) -> TaskScheduler {
    let runner = Arc::new(CommandRunner::new(config.sync_command.clone()));
    let monitor = Arc::new(LoadMonitor::new(config.load_thresholds));

    let scheduler = TaskScheduler::new(config.scheduler.clone(), runner, history, monitor);
    scheduler.start();

    info!(
        sync_command = ?config.sync_command,
        adaptive = config.scheduler.adaptive_scheduling,
        load_aware = config.scheduler.load_aware,
        "Re-check scheduler ready"
    );
    scheduler
}
