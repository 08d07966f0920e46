use std::{
    cell::Cell,
    collections::VecDeque,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures::{
    channel::oneshot,
    executor::block_on,
    future::{BoxFuture, FutureExt, Shared},
};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::warn;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Id of the queue whose operation is running on this thread, 0 if none.
    static ACTIVE_QUEUE: Cell<u64> = const { Cell::new(0) };
}

type Job = Box<dyn FnOnce() + Send + 'static>;
type Completion = Shared<BoxFuture<'static, ()>>;
type Backlog = Arc<Mutex<VecDeque<Arc<Operation>>>>;

/// One queued job. It runs exactly once, on whichever thread takes it first:
/// a pool thread, or a thread waiting for the queue to drain.
struct Operation {
    queue_id: u64,
    job: Mutex<Option<Job>>,
    done: Mutex<Option<oneshot::Sender<()>>>,
    completion: Completion,
}

impl Operation {
    fn new(queue_id: u64, job: Job) -> Self {
        let (done, finished) = oneshot::channel();
        Self {
            queue_id,
            job: Mutex::new(Some(job)),
            done: Mutex::new(Some(done)),
            completion: finished.map(|_| ()).boxed().shared(),
        }
    }

    fn is_resolved(&self) -> bool {
        self.done.lock().is_none()
    }

    /// Runs the job here unless another thread already took it.
    fn try_run(&self) -> bool {
        let Some(job) = self.job.lock().take() else {
            return false;
        };
        let outcome = {
            let _active = ActiveQueue::enter(self.queue_id);
            panic::catch_unwind(AssertUnwindSafe(job))
        };
        if outcome.is_err() {
            warn!("queued preference operation panicked");
        }
        if let Some(done) = self.done.lock().take() {
            let _ = done.send(());
        }
        true
    }

    /// Returns once the job has run, running it on this thread if nobody
    /// has started it yet. Callers settle operations in queue order.
    fn settle(&self) {
        if !self.try_run() {
            block_on(self.completion.clone());
        }
    }
}

/// Unresolved operations of `backlog`, oldest first, up to and including
/// `until` when given. Empty when `until` has already resolved.
fn outstanding(backlog: &Backlog, until: Option<&Arc<Operation>>) -> Vec<Arc<Operation>> {
    let mut backlog = backlog.lock();
    backlog.retain(|op| !op.is_resolved());
    let Some(until) = until else {
        return backlog.iter().cloned().collect();
    };
    match backlog.iter().position(|op| Arc::ptr_eq(op, until)) {
        Some(index) => backlog.iter().take(index + 1).cloned().collect(),
        None => Vec::new(),
    }
}

/// Handle to an operation queued on a preference; resolved once the
/// operation (and everything queued before it) has finished.
#[derive(Clone)]
pub struct PendingOperation {
    operation: Arc<Operation>,
    backlog: Backlog,
}

impl PendingOperation {
    pub fn is_resolved(&self) -> bool {
        self.operation.is_resolved()
    }

    /// Blocks the calling thread until the operation has run. Operations the
    /// pool has not reached yet are run on the calling thread, in order.
    ///
    /// Waiting from inside an earlier operation of the same preference never
    /// returns.
    pub fn wait(&self) {
        for operation in outstanding(&self.backlog, Some(&self.operation)) {
            operation.settle();
        }
    }
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// FIFO of outstanding asynchronous operations on one preference instance.
///
/// Every submitted job starts only after its predecessor has finished, so
/// jobs apply in submission order even on a multi-threaded pool. Waiting for
/// a predecessor happens on the runtime's scheduler, never on a blocking
/// thread. `drain` waits for everything submitted before the call and runs
/// jobs itself when the pool is busy, so a drain issued from a pool thread
/// cannot starve.
pub(crate) struct OperationQueue {
    id: u64,
    backlog: Backlog,
}

impl OperationQueue {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            backlog: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub(crate) fn submit<F>(&self, pool: &Handle, job: F) -> PendingOperation
    where
        F: FnOnce() + Send + 'static,
    {
        let operation = Arc::new(Operation::new(self.id, Box::new(job)));
        let previous = {
            let mut backlog = self.backlog.lock();
            backlog.retain(|op| !op.is_resolved());
            // Operations resolve in order, so the newest unresolved one is the
            // only predecessor left to wait for.
            let previous = backlog.back().map(|op| op.completion.clone());
            backlog.push_back(Arc::clone(&operation));
            previous
        };

        let runner = Arc::clone(&operation);
        pool.spawn(async move {
            if let Some(previous) = previous {
                previous.await;
            }
            let joined = tokio::task::spawn_blocking(move || {
                runner.try_run();
            })
            .await;
            if let Err(err) = joined {
                warn!(error = %err, "queued preference operation did not complete");
            }
        });

        PendingOperation {
            operation,
            backlog: Arc::clone(&self.backlog),
        }
    }

    /// Waits for every operation submitted before this call. Returns at once
    /// when called from one of this queue's own operations, whose predecessors
    /// have all completed already.
    pub(crate) fn drain(&self) {
        if ACTIVE_QUEUE.with(Cell::get) == self.id {
            return;
        }
        for operation in outstanding(&self.backlog, None) {
            operation.settle();
        }
    }

    pub(crate) fn pending(&self) -> usize {
        let mut backlog = self.backlog.lock();
        backlog.retain(|op| !op.is_resolved());
        backlog.len()
    }
}

struct ActiveQueue {
    previous: u64,
}

impl ActiveQueue {
    fn enter(id: u64) -> Self {
        Self {
            previous: ACTIVE_QUEUE.with(|active| active.replace(id)),
        }
    }
}

impl Drop for ActiveQueue {
    fn drop(&mut self) {
        ACTIVE_QUEUE.with(|active| active.set(self.previous));
    }
}
