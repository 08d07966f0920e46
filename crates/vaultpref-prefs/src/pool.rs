use std::{cell::Cell, fmt, num::NonZeroUsize, thread};

use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

use crate::error::PreferenceError;

const THREAD_NAME: &str = "vaultpref-pool";
const CALLBACK_THREAD_NAME: &str = "vaultpref-callback";

thread_local! {
    static IN_POOL: Cell<bool> = const { Cell::new(false) };
}

/// Bounded worker pool shared by every preference of a context.
///
/// Backed by a tokio runtime; queued operations are blocking store calls, so
/// they go through `spawn_blocking` and the blocking pool is capped at
/// `threads`. `get_async` callbacks run on a second, unbounded set of
/// threads, so a callback that blocks on its preference never holds a slot
/// the queued operations need. Dropping the pool stops operations that have
/// not started yet; they still run when something waits for them.
pub struct TaskPool {
    runtime: Option<Runtime>,
    callbacks: Option<Runtime>,
    handle: Handle,
    callback_handle: Handle,
    threads: usize,
}

impl TaskPool {
    pub fn new(threads: usize) -> Result<Self, PreferenceError> {
        let threads = threads.max(1);
        let runtime = build_runtime(THREAD_NAME, Some(threads))?;
        let callbacks = build_runtime(CALLBACK_THREAD_NAME, None)?;
        debug!(threads, "task pool started");
        Ok(Self {
            handle: runtime.handle().clone(),
            callback_handle: callbacks.handle().clone(),
            runtime: Some(runtime),
            callbacks: Some(callbacks),
            threads,
        })
    }

    /// One thread per available core.
    pub fn with_default_size() -> Result<Self, PreferenceError> {
        let threads = thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        Self::new(threads)
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    pub(crate) fn callback_handle(&self) -> &Handle {
        &self.callback_handle
    }
}

fn build_runtime(name: &'static str, blocking: Option<usize>) -> Result<Runtime, PreferenceError> {
    let mut builder = Builder::new_multi_thread();
    builder
        .worker_threads(1)
        .thread_name(name)
        .on_thread_start(|| IN_POOL.with(|flag| flag.set(true)));
    if let Some(threads) = blocking {
        builder.max_blocking_threads(threads);
    }
    builder.build().map_err(|err| PreferenceError::Pool {
        reason: err.to_string(),
    })
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        // Callbacks are user code; never wait for them.
        if let Some(callbacks) = self.callbacks.take() {
            callbacks.shutdown_background();
        }
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        // A pool thread cannot wait for itself to finish.
        if IN_POOL.with(Cell::get) {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("threads", &self.threads)
            .finish()
    }
}
