// ABOUTME: Trigger-queue replication between the local and remote booking instances
// ABOUTME: Capture, queue, key resolution, apply engine, window reconciler and entry points

pub mod engine;
pub mod guard;
pub mod hooks;
pub mod ledger;
pub mod queue;
pub mod reconciler;
pub mod resolver;
pub mod scheduler;
pub mod triggers;
pub mod writer;

pub use engine::{ApplyEngine, DirectionStats, RunOptions, SyncRun};
pub use hooks::{force_sync_latest, sync_on_page_load};
pub use ledger::RunLedger;
pub use queue::{Operation, QueueEntry, QueueHealth, QueueStatus};
pub use scheduler::{Scheduler, SchedulerConfig};
