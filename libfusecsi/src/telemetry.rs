//! Logging setup and teardown-failure accounting.
//!
//! Unpublish and unstage never fail towards the orchestrator, so a failed
//! unmount or bridge pod deletion would otherwise only exist as a log line.
//! [`TeardownCounters`] keeps a running count next to the structured
//! `cleanup_failed = true` warnings so both can be scraped.

use std::sync::Once;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// Honors `RUST_LOG` (default `info`).  Set `FUSECSI_LOG_FORMAT=json` for
/// flattened JSON events.  Calling this more than once is harmless.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let json = std::env::var("FUSECSI_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let result = if json {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .flatten_event(true)
                .try_init()
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .compact()
                .try_init()
        };
        if let Err(e) = result {
            eprintln!("tracing subscriber already installed: {e}");
        }
    });
}

/// Counters for teardown work that failed but was not reported to the caller.
#[derive(Debug, Default)]
pub struct TeardownCounters {
    mount_cleanup_failures: AtomicU64,
    bridge_teardown_failures: AtomicU64,
}

impl TeardownCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_mount_cleanup_failure(&self) {
        self.mount_cleanup_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bridge_teardown_failure(&self) {
        self.bridge_teardown_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Unmounts or directory removals that failed during teardown.
    pub fn mount_cleanup_failures(&self) -> u64 {
        self.mount_cleanup_failures.load(Ordering::Relaxed)
    }

    /// Unstage calls whose bridge pod could not be resolved or deleted.
    pub fn bridge_teardown_failures(&self) -> u64 {
        self.bridge_teardown_failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let counters = TeardownCounters::new();
        assert_eq!(counters.mount_cleanup_failures(), 0);
        counters.record_mount_cleanup_failure();
        counters.record_mount_cleanup_failure();
        counters.record_bridge_teardown_failure();
        assert_eq!(counters.mount_cleanup_failures(), 2);
        assert_eq!(counters.bridge_teardown_failures(), 1);
    }
}
