// ABOUTME: Scoped loop guard: sets the session flag that capture triggers check before queueing
// ABOUTME: Released explicitly after the destination write; a guard dropped while armed poisons the session

use anyhow::{Context, Result};
use tracing::warn;

use crate::instance::Instance;

/// Holds the loop-guard flag on one destination session.
///
/// While the guard is held every write issued through [`LoopGuard::session`]
/// is invisible to the destination's capture triggers. Call
/// [`LoopGuard::release`] on every path; if the guard is dropped without a
/// successful release (a cancelled future, a failed clear) the session is
/// poisoned so nothing else can write through it with the flag still set.
pub struct LoopGuard<'a> {
    session: &'a mut dyn Instance,
    flag: &'a str,
    armed: bool,
}

impl<'a> LoopGuard<'a> {
    pub async fn acquire(session: &'a mut dyn Instance, flag: &'a str) -> Result<LoopGuard<'a>> {
        if let Err(e) = session.set_session_flag(flag).await {
            // The flag may or may not have been set before the error.
            session.poison();
            return Err(e).with_context(|| format!("Failed to set loop guard @{}", flag));
        }
        Ok(LoopGuard {
            session,
            flag,
            armed: true,
        })
    }

    /// The guarded session, for destination writes.
    pub fn session(&mut self) -> &mut dyn Instance {
        &mut *self.session
    }

    pub async fn release(mut self) -> Result<()> {
        self.session
            .clear_session_flag(self.flag)
            .await
            .with_context(|| format!("Failed to clear loop guard @{}", self.flag))?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(
                "Loop guard @{} on {} session was not released; discarding the session",
                self.flag,
                self.session.side()
            );
            self.session.poison();
        }
    }
}
