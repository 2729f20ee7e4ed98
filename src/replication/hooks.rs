// ABOUTME: Entry points called by the rest of the booking system: the inline page-load hook
// ABOUTME: and the operator's force-sync of recent changes

use tokio::time::timeout;
use tracing::{debug, warn};

use super::engine::{ApplyEngine, RunOptions, SyncRun};
use crate::instance::Connector;

/// Best-effort sync run from a request handler, right after a write.
///
/// Uses the inline batch size, never retries a connection and stops taking
/// entries once the inline budget is spent. A hard timeout of budget plus
/// connect timeout bounds the call; whatever it leaves behind (pending or
/// claimed entries) is picked up by the next run. Never fails the caller:
/// returns `None` when the hard timeout cut the run short.
pub async fn sync_on_page_load<C: Connector>(engine: &ApplyEngine<C>, label: &str) -> Option<SyncRun> {
    let settings = engine.settings();
    let options = RunOptions::inline(settings);
    let hard_limit = settings.inline_budget() + settings.connect_timeout();

    match timeout(hard_limit, engine.run_sync_with_options(label, &options)).await {
        Ok(run) => {
            if !run.errors.is_empty() {
                debug!("Inline sync '{}' finished with {} errors", label, run.errors.len());
            }
            Some(run)
        }
        Err(_) => {
            warn!(
                "Inline sync '{}' exceeded {:?}; remaining entries are left for the next run",
                label, hard_limit
            );
            None
        }
    }
}

/// Manual repair: converge rows changed in the last `hours`, optionally for
/// one table, regardless of queue state.
pub async fn force_sync_latest<C: Connector>(
    engine: &ApplyEngine<C>,
    hours: u32,
    table: Option<&str>,
) -> SyncRun {
    engine.force_window_sync(table, hours).await
}
