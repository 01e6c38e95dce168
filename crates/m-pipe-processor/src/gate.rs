//! ---
//! mpipe_section: "04-consumer-orchestration"
//! mpipe_subsection: "module"
//! mpipe_type: "source"
//! mpipe_scope: "code"
//! mpipe_description: "Metrics processor service coordinating consumers and persistence."
//! mpipe_version: "v0.0.0-prealpha"
//! mpipe_owner: "tbd"
//! ---
use tokio::sync::{Mutex, MutexGuard};

/// Non-blocking single-owner gate in front of the persistence pass.
///
/// At most one holder exists at any time; losers of `try_acquire` do not
/// wait. The guard releases the gate when dropped, so the gate is freed
/// on every exit path of the holder.
#[derive(Debug, Default)]
pub struct PersistGate {
    inner: Mutex<()>,
}

/// Exclusive hold on a [`PersistGate`]; dropping it releases the gate.
#[derive(Debug)]
pub struct PersistGuard<'a> {
    _held: MutexGuard<'a, ()>,
}

impl PersistGate {
    /// Create a released gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to take the gate without waiting.
    pub fn try_acquire(&self) -> Option<PersistGuard<'_>> {
        self.inner
            .try_lock()
            .ok()
            .map(|held| PersistGuard { _held: held })
    }
}
