//! Periodic store health probe.
//!
//! Drives `StoreHealthMonitor::probe`, which is where unsolicited loss is
//! detected and where a lost connection is reopened. A failed initial
//! `connect()` is never retried here.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::shutdown;
use crate::state::SharedState;

const POLL_SLICE: Duration = Duration::from_millis(100);

pub fn spawn_health_probe(state: Arc<SharedState>, interval: Duration) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut next_run = Instant::now() + interval;
        while !shutdown::requested() {
            if Instant::now() < next_run {
                thread::sleep(POLL_SLICE);
                continue;
            }
            next_run = Instant::now() + interval;
            if panic::catch_unwind(AssertUnwindSafe(|| run_probe(&state))).is_err() {
                warn!("Health probe round panicked; continuing");
            }
        }
        debug!("Health probe stopped");
    })
}

fn run_probe(state: &SharedState) {
    let current = state.monitor.probe();
    if !state.monitor.is_healthy() {
        debug!(state = %current, "Store unhealthy after probe");
        return;
    }

    match state.store.prune_expired() {
        Ok(0) => {}
        Ok(pruned) => debug!(pruned, "Pruned expired sessions"),
        Err(err) => warn!(error = %err, "Failed to prune expired sessions"),
    }
}
