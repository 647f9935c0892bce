//! Extraction runtime: bounded executor, dedup registry, incremental and
//! export trackers, run statistics, and the extraction/export passes built
//! on top of them.

pub mod config;
pub mod dedup;
pub mod executor;
pub mod export;
pub mod pipeline;
pub mod stats;
pub mod trackers;

pub use config::{SourceConfig, SourceRegistry, SyncConfig};
pub use dedup::{DeckSignature, DedupOutcome, DeduplicationRegistry, SourcePriority};
pub use executor::{deserialize_record, Executor, ExecutorError, Flow, RunReport, TaskError};
pub use export::{flatten_record, ExportPass, ExportRow, ExportSummary};
pub use pipeline::{
    collection_key, collections_prefix, rebuild_dedup_registry, DedupRebuild, ExtractionPipeline,
    ExtractionSummary,
};
pub use stats::{ErrorRecord, ExtractStats, ProgressReporter, StatsSnapshot};
pub use trackers::{ExportTracker, IncrementalTracker, TrackerError};

pub const CRATE_NAME: &str = "deckhive-sync";
