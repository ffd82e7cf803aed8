//! Shared support for the launcher's integration tests.
//!
//! `builders` assembles task containers, initializers and a launcher
//! configuration rooted in a temporary scratch directory. `fakes` holds the
//! stand-ins for the collaborators a launcher talks to: notification sinks,
//! executors and dataspace factories with configurable latency.

pub mod builders;
pub mod fakes;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use tasklaunch::logging::LOG_ENV;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Route launcher logs into the test harness.
///
/// Reads the same variable as the binary, so `TASKLAUNCH_LOG=debug` shows
/// the pipeline of a failing test. Launcher logs stay silent below `warn`
/// otherwise.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));

        // A second subscriber from another test binary sharing this process
        // would fail; ignore it.
        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(false)
            .try_init();
    });
}

/// Await `fut`, failing with a message naming `what` once `bound` elapses.
pub async fn within<F>(bound: Duration, what: &str, fut: F) -> Result<F::Output, String>
where
    F: Future,
{
    tokio::time::timeout(bound, fut)
        .await
        .map_err(|_| format!("{what} did not happen within {bound:?}"))
}
