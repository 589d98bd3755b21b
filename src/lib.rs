//! Archivist: decides when a tracked model's remote catalogue needs a re-check
//! and schedules those re-checks around host load and past run times.

pub mod config;
pub mod db;
pub mod jobs;
pub mod services;
