//! # Termination signals and grace-bounded joins.
//!
//! [`wait_for_shutdown_signal`] completes when the process receives a
//! termination signal. [`join_with_grace`] waits for stopped component actors
//! and aborts the ones still running at the deadline.
//!
//! ## Signals
//! **Unix platforms:**
//! - `SIGINT` (Ctrl-C in terminal)
//! - `SIGTERM` (default kill signal)
//! - `SIGQUIT`
//!
//! **Windows platforms:**
//! - `Ctrl-C` via [`tokio::signal::ctrl_c`]

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::warn;

use crate::component::ComponentId;

/// Waits for a termination signal.
///
/// Returns `Err` if signal registration fails.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

/// Waits for a termination signal.
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Joins every handle within `grace` (one deadline for all of them).
///
/// Returns the components that were still running and had to be aborted.
pub async fn join_with_grace(
    handles: Vec<(ComponentId, JoinHandle<()>)>,
    grace: Duration,
) -> Vec<ComponentId> {
    let deadline = Instant::now() + grace;
    let mut stuck = Vec::new();
    for (id, mut h) in handles {
        if grace.is_zero() && !h.is_finished() {
            h.abort();
            stuck.push(id);
            continue;
        }
        if timeout_at(deadline, &mut h).await.is_err() {
            warn!(component = %id, ?grace, "component did not stop in time; aborting");
            h.abort();
            stuck.push(id);
        }
    }
    stuck
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_finished_actors_are_not_stuck() {
        let h = tokio::spawn(async {});
        let stuck = join_with_grace(
            vec![(ComponentId::new("s", "Quick"), h)],
            Duration::from_millis(200),
        )
        .await;
        assert!(stuck.is_empty());
    }

    #[tokio::test]
    async fn test_stuck_actor_is_reported_and_aborted() {
        let id = ComponentId::new("s", "Stuck");
        let h = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let started = std::time::Instant::now();
        let stuck = join_with_grace(vec![(id.clone(), h)], Duration::from_millis(50)).await;
        assert_eq!(stuck, vec![id]);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_zero_grace_aborts_immediately() {
        let id = ComponentId::new("s", "Stuck");
        let h = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let stuck = join_with_grace(vec![(id.clone(), h)], Duration::ZERO).await;
        assert_eq!(stuck, vec![id]);
    }
}
