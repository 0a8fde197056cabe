//! Background runtime for request timers and listener callbacks.
//!
//! Timers sleep on the runtime's timer wheel and fire their action on the
//! blocking pool, since an expiring request may write an Abandon to the socket.
//! Unsolicited notifications are handed to listeners on the same bounded pool,
//! so a slow listener can't stall the reader thread.

use std::io;
use std::sync::LazyLock;
use std::time::Duration;

use tokio::runtime::{self, Runtime};
use tokio::task::JoinHandle;

const MAX_BLOCKING_THREADS: usize = 16;

static RUNTIME: LazyLock<io::Result<Runtime>> = LazyLock::new(|| {
    runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .max_blocking_threads(MAX_BLOCKING_THREADS)
        .thread_name("ldapconn-dispatch")
        .enable_time()
        .build()
});

fn runtime() -> io::Result<&'static Runtime> {
    RUNTIME
        .as_ref()
        .map_err(|e| io::Error::new(e.kind(), e.to_string()))
}

/// Handle of a pending one-shot timer.
#[derive(Debug)]
pub(crate) struct Timer(JoinHandle<()>);

impl Timer {
    /// Run `action` once after `delay`, unless cancelled first.
    pub(crate) fn start<F>(delay: Duration, action: F) -> io::Result<Timer>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = runtime()?.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = tokio::task::spawn_blocking(action).await {
                warn!("timer action failed: {}", e);
            }
        });
        Ok(Timer(handle))
    }

    /// Stop the timer. An action that has already started runs to completion.
    pub(crate) fn cancel(self) {
        self.0.abort();
    }
}

/// Run `task` on the blocking pool without waiting for it.
pub(crate) fn spawn_detached<F>(task: F) -> io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    runtime()?.spawn_blocking(task);
    Ok(())
}
