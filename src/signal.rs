//! Signal handling for graceful shutdown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Wire SIGINT/SIGTERM to the shared shutdown flag the reactors poll.
///
/// The first signal requests a graceful stop. Further signals mean the grace
/// period is being ignored, so the process aborts.
pub fn listen_for_shutdown(shutdown: &Arc<AtomicBool>) {
    let flag = shutdown.clone();
    let signals_seen = AtomicUsize::new(0);

    ctrlc::set_handler(move || {
        if signals_seen.fetch_add(1, Ordering::SeqCst) > 0 {
            tracing::warn!("shutdown already in progress, aborting");
            std::process::abort();
        }
        flag.store(true, Ordering::SeqCst);
        tracing::info!("shutdown requested, draining workers");
    })
    .expect("failed to set signal handler");
}
