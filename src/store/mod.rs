//! Per-queue message storage backed by an append-only log.

pub mod queue_store;
pub mod record;

pub use queue_store::{log_file_name, CompactionReport, QueueStats, QueueStore};
pub use record::{scan_log, RecordHeader, ScanSummary};
