//! Tokio re-exports used across the project, plus a named task spawner.
//!
//! Spawning through [`spawn_task`] gives every long-lived task a name that
//! shows up in logs when it starts and exits, which is the only reliable way
//! to notice a loop that died early.

use std::future::Future;

use log::trace;

pub use tokio::{select, sync, task, time};

pub use tokio::task::JoinHandle;

/// Spawn a named task.
///
/// The name is logged on spawn and on exit at trace level.
pub fn spawn_task<F>(name: impl Into<String>, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let name = name.into();
    if log::log_enabled!(log::Level::Trace) {
        trace!("Spawning task '{}'", name);
    }

    tokio::spawn(async move {
        let output = future.await;
        if log::log_enabled!(log::Level::Trace) {
            trace!("Task '{}' has exited", name);
        }
        output
    })
}
