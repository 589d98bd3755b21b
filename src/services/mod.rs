//! Change detection services

pub mod archive;
pub mod detector;
pub mod history;
pub mod load_monitor;
pub mod logging;
pub mod signature;

pub use archive::ArchiveFacts;
pub use detector::{
    CatalogSource, ChangeDetector, ProbeResult, RemoteTitle, StaticCatalog, WatchTarget,
    suggested_priority,
};
pub use history::{ExecutionHistory, ExecutionRecord};
pub use load_monitor::{LoadMonitor, LoadThresholds, SystemLoadSample};
pub use logging::init_tracing;
pub use signature::{
    check_url_available, local_signature, local_signature_from_facts, normalize_title,
    remote_signature, remote_signature_full,
};
