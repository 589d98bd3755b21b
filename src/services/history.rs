//! Execution history per model
//!
//! Bounded log of past re-check runs, used to predict how long the next one
//! takes and to pick the hour of day where runs tend to succeed quickly.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Local, Timelike, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::db::change_cache::normalize_model_name;

/// Records kept per model before pruning
pub const MAX_RECORDS_PER_MODEL: usize = 100;

/// Records left after pruning
pub const PRUNED_RECORDS_PER_MODEL: usize = 50;

/// Prediction when a model has no successful runs
pub const DEFAULT_DURATION: Duration = Duration::from_secs(300);

/// Hour returned when there is nothing to learn from
pub const DEFAULT_EXECUTION_HOUR: u32 = 2;

/// Duration at which the speed component of the hour score reaches zero
const SCORE_DURATION_SCALE_SECS: f64 = 600.0;
const SUCCESS_WEIGHT: f64 = 0.7;
const SPEED_WEIGHT: f64 = 0.3;

/// One finished run
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub duration: Duration,
    pub success: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Local hour (0..23) the run started in
    pub hour_of_day: u32,
}

impl ExecutionRecord {
    pub fn new(
        duration: Duration,
        success: bool,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            duration,
            success,
            start_time,
            end_time,
            hour_of_day: start_time.with_timezone(&Local).hour(),
        }
    }
}

/// Per-model execution log
#[derive(Debug, Default)]
pub struct ExecutionHistory {
    records: RwLock<HashMap<String, VecDeque<ExecutionRecord>>>,
}

impl ExecutionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a run. Over the cap, only the most recent records are kept.
    pub fn record_execution(
        &self,
        model_name: &str,
        duration: Duration,
        success: bool,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) {
        let record = ExecutionRecord::new(duration, success, start_time, end_time);
        let mut records = self.records.write();
        let log = records.entry(normalize_model_name(model_name)).or_default();
        log.push_back(record);

        if log.len() > MAX_RECORDS_PER_MODEL {
            let excess = log.len() - PRUNED_RECORDS_PER_MODEL;
            log.drain(..excess);
            debug!(model = %model_name, kept = log.len(), "Pruned execution history");
        }
    }

    /// Mean duration of successful runs, or the default when there are none
    pub fn average_duration(&self, model_name: &str) -> Duration {
        let records = self.records.read();
        let Some(log) = records.get(&normalize_model_name(model_name)) else {
            return DEFAULT_DURATION;
        };

        let successes: Vec<Duration> = log.iter().filter(|r| r.success).map(|r| r.duration).collect();
        if successes.is_empty() {
            return DEFAULT_DURATION;
        }

        let total: Duration = successes.iter().sum();
        total / successes.len() as u32
    }

    /// Expected duration of the next run
    pub fn predict_duration(&self, model_name: &str) -> Duration {
        self.average_duration(model_name)
    }

    /// Hour of day with the best blend of success rate and speed.
    ///
    /// Hours without a single success are ignored. Ties go to the earliest hour.
    pub fn best_execution_hour(&self, model_name: &str) -> u32 {
        let records = self.records.read();
        let Some(log) = records.get(&normalize_model_name(model_name)) else {
            return DEFAULT_EXECUTION_HOUR;
        };

        #[derive(Default, Clone, Copy)]
        struct Bucket {
            total: u32,
            successes: u32,
            success_secs: f64,
        }

        let mut buckets = [Bucket::default(); 24];
        for record in log {
            let bucket = &mut buckets[(record.hour_of_day % 24) as usize];
            bucket.total += 1;
            if record.success {
                bucket.successes += 1;
                bucket.success_secs += record.duration.as_secs_f64();
            }
        }

        let mut best: Option<(u32, f64)> = None;
        for (hour, bucket) in buckets.iter().enumerate() {
            if bucket.successes == 0 {
                continue;
            }

            let success_rate = bucket.successes as f64 / bucket.total as f64;
            let avg_secs = bucket.success_secs / bucket.successes as f64;
            let score = success_rate * SUCCESS_WEIGHT
                + (1.0 - avg_secs / SCORE_DURATION_SCALE_SECS) * SPEED_WEIGHT;

            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((hour as u32, score)),
            }
        }

        best.map(|(hour, _)| hour).unwrap_or(DEFAULT_EXECUTION_HOUR)
    }

    /// Snapshot of a model's records, oldest first
    pub fn records(&self, model_name: &str) -> Vec<ExecutionRecord> {
        self.records
            .read()
            .get(&normalize_model_name(model_name))
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Models with at least one record, sorted
    pub fn models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.records.read().keys().cloned().collect();
        models.sort();
        models
    }
}
