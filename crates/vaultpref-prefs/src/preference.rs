use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use tracing::{instrument, warn};
use vaultpref_storage::EncryptedStore;

use crate::{
    error::PreferenceError,
    observable::Observable,
    pool::TaskPool,
    queue::{OperationQueue, PendingOperation},
    transform::Transform,
};

/// Anything whose cached state the owning context can drop in bulk.
pub(crate) trait Invalidate: Send + Sync {
    fn invalidate(&self);
}

enum CacheSlot<T> {
    Stale,
    Fresh(Option<T>),
}

/// State shared by every handle to one preference: the logical key, how to
/// reach and convert its stored value, observers, the operation queue and the
/// optional in-memory copy.
pub(crate) struct Binding<T> {
    key: String,
    store: Arc<EncryptedStore>,
    transform: Box<dyn Transform<T>>,
    observers: Observable<T>,
    queue: OperationQueue,
    cache: Option<Mutex<CacheSlot<T>>>,
}

impl<T> Binding<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn new(
        key: &str,
        store: Arc<EncryptedStore>,
        transform: Box<dyn Transform<T>>,
        backed: bool,
    ) -> Self {
        Self {
            key: key.to_string(),
            store,
            transform,
            observers: Observable::new(),
            queue: OperationQueue::new(),
            cache: backed.then(|| Mutex::new(CacheSlot::Stale)),
        }
    }

    fn read(&self) -> Result<Option<T>, PreferenceError> {
        match self.store.get_string(&self.key, None)? {
            Some(stored) => Ok(Some(self.transform.decode(&stored)?)),
            None => Ok(None),
        }
    }

    fn load(&self) -> Result<Option<T>, PreferenceError> {
        let Some(cache) = &self.cache else {
            return self.read();
        };
        let mut slot = cache.lock();
        if let CacheSlot::Fresh(value) = &*slot {
            return Ok(value.clone());
        }
        let value = self.read()?;
        *slot = CacheSlot::Fresh(value.clone());
        Ok(value)
    }

    #[instrument(level = "trace", skip_all, fields(store = %self.store.name()))]
    fn write(&self, value: Option<T>) -> Result<(), PreferenceError> {
        let encoded = value
            .as_ref()
            .map(|value| self.transform.encode(value))
            .transpose()?;

        match &self.cache {
            Some(cache) => {
                let mut slot = cache.lock();
                if let Err(err) = self.store.put_string(&self.key, encoded.as_deref()) {
                    *slot = CacheSlot::Stale;
                    return Err(err.into());
                }
                *slot = CacheSlot::Fresh(value.clone());
            }
            None => self.store.put_string(&self.key, encoded.as_deref())?,
        }

        self.observers.notify(value.as_ref());
        Ok(())
    }

    fn submit_store(self: &Arc<Self>, pool: &TaskPool, value: Option<T>) -> PendingOperation {
        let binding = Arc::clone(self);
        self.queue.submit(pool.handle(), move || {
            if let Err(err) = binding.write(value) {
                warn!(
                    store = %binding.store.name(),
                    error = %err,
                    "asynchronous preference write failed"
                );
            }
        })
    }

    fn submit_load<F>(self: &Arc<Self>, pool: &TaskPool, callback: F) -> PendingOperation
    where
        F: FnOnce(Result<Option<T>, PreferenceError>) + Send + 'static,
    {
        let binding = Arc::clone(self);
        let callbacks = pool.callback_handle().clone();
        self.queue.submit(pool.handle(), move || {
            let loaded = binding.load();
            callbacks.spawn_blocking(move || callback(loaded));
        })
    }
}

impl<T: Send> Invalidate for Binding<T> {
    fn invalidate(&self) {
        if let Some(cache) = &self.cache {
            *cache.lock() = CacheSlot::Stale;
        }
    }
}

/// Typed accessor for one logical key that falls back to a default when unset.
///
/// `get`, `put` and `remove` first wait for every asynchronous operation
/// previously queued on this preference, so program order on one instance is
/// preserved. Clones share the queue, observers and cache.
pub struct Preference<T> {
    binding: Arc<Binding<T>>,
    pool: Arc<TaskPool>,
    default: T,
}

impl<T> Preference<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn new(binding: Arc<Binding<T>>, pool: Arc<TaskPool>, default: T) -> Self {
        Self {
            binding,
            pool,
            default,
        }
    }

    pub fn key(&self) -> &str {
        &self.binding.key
    }

    pub fn default_value(&self) -> &T {
        &self.default
    }

    pub fn is_memory_backed(&self) -> bool {
        self.binding.cache.is_some()
    }

    pub fn observable(&self) -> &Observable<T> {
        &self.binding.observers
    }

    pub fn get(&self) -> Result<T, PreferenceError> {
        self.binding.queue.drain();
        Ok(self
            .binding
            .load()?
            .unwrap_or_else(|| self.default.clone()))
    }

    /// Writes `value` and notifies observers on the calling thread.
    pub fn put(&self, value: T) -> Result<(), PreferenceError> {
        self.binding.queue.drain();
        self.binding.write(Some(value))
    }

    /// Deletes the stored entry; later reads return the default.
    pub fn remove(&self) -> Result<(), PreferenceError> {
        self.binding.queue.drain();
        self.binding.write(None)
    }

    /// Queues a write on the shared pool. Failures are logged.
    pub fn put_async(&self, value: T) -> PendingOperation {
        self.binding.submit_store(&self.pool, Some(value))
    }

    /// Queues a read; `callback` runs on a callback thread once it completes
    /// and may itself call `get` or `put`.
    pub fn get_async<F>(&self, callback: F) -> PendingOperation
    where
        F: FnOnce(Result<T, PreferenceError>) + Send + 'static,
    {
        let default = self.default.clone();
        self.binding
            .submit_load(&self.pool, move |loaded| {
                callback(loaded.map(|value| value.unwrap_or(default)))
            })
    }

    /// Forgets the cached value so the next `get` reads the store.
    pub fn invalidate(&self) {
        self.binding.invalidate();
    }

    /// Queued operations that have not finished yet.
    pub fn pending_operations(&self) -> usize {
        self.binding.queue.pending()
    }
}

impl<T: Clone> Clone for Preference<T> {
    fn clone(&self) -> Self {
        Self {
            binding: Arc::clone(&self.binding),
            pool: Arc::clone(&self.pool),
            default: self.default.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Preference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Preference")
            .field("key", &self.binding.key)
            .field("default", &self.default)
            .field("backed", &self.binding.cache.is_some())
            .finish_non_exhaustive()
    }
}

/// Like [`Preference`], but `None` is a storable state: putting `None`
/// deletes the entry and an unset entry reads as the (optional) default.
pub struct NullablePreference<T> {
    binding: Arc<Binding<T>>,
    pool: Arc<TaskPool>,
    default: Option<T>,
}

impl<T> NullablePreference<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn new(binding: Arc<Binding<T>>, pool: Arc<TaskPool>, default: Option<T>) -> Self {
        Self {
            binding,
            pool,
            default,
        }
    }

    pub fn key(&self) -> &str {
        &self.binding.key
    }

    pub fn is_memory_backed(&self) -> bool {
        self.binding.cache.is_some()
    }

    pub fn observable(&self) -> &Observable<T> {
        &self.binding.observers
    }

    pub fn get(&self) -> Result<Option<T>, PreferenceError> {
        self.binding.queue.drain();
        Ok(self.binding.load()?.or_else(|| self.default.clone()))
    }

    pub fn put(&self, value: Option<T>) -> Result<(), PreferenceError> {
        self.binding.queue.drain();
        self.binding.write(value)
    }

    pub fn put_async(&self, value: Option<T>) -> PendingOperation {
        self.binding.submit_store(&self.pool, value)
    }

    pub fn get_async<F>(&self, callback: F) -> PendingOperation
    where
        F: FnOnce(Result<Option<T>, PreferenceError>) + Send + 'static,
    {
        let default = self.default.clone();
        self.binding
            .submit_load(&self.pool, move |loaded| {
                callback(loaded.map(|value| value.or(default)))
            })
    }

    pub fn invalidate(&self) {
        self.binding.invalidate();
    }

    /// Queued operations that have not finished yet.
    pub fn pending_operations(&self) -> usize {
        self.binding.queue.pending()
    }
}

impl<T: Clone> Clone for NullablePreference<T> {
    fn clone(&self) -> Self {
        Self {
            binding: Arc::clone(&self.binding),
            pool: Arc::clone(&self.pool),
            default: self.default.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for NullablePreference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NullablePreference")
            .field("key", &self.binding.key)
            .field("default", &self.default)
            .field("backed", &self.binding.cache.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc,
        },
        thread,
        time::Duration,
    };

    use vaultpref_core::{MemoryStore, RawStore};
    use vaultpref_storage::{AesGcmCipher, FixedKey, Sha256Hash};

    use super::*;
    use crate::{context::PreferenceContext, error::TransformError};

    fn context(raw: MemoryStore) -> PreferenceContext {
        context_with_pool(raw, 4)
    }

    fn context_with_pool(raw: MemoryStore, threads: usize) -> PreferenceContext {
        let store = EncryptedStore::open(
            "prefs",
            raw,
            AesGcmCipher,
            Sha256Hash,
            FixedKey::new("0123456789abcdef").expect("fixed key"),
        )
        .expect("open store");
        PreferenceContext::new(store, TaskPool::new(threads).expect("pool"))
    }

    #[test]
    fn unset_preference_reads_default() {
        let ctx = context(MemoryStore::new());
        let pref = ctx.int("launches", 7, false);
        assert_eq!(pref.get().expect("get"), 7);
        assert_eq!(*pref.default_value(), 7);
    }

    #[test]
    fn put_then_get_round_trips() {
        let ctx = context(MemoryStore::new());
        for backed in [false, true] {
            let pref = ctx.string(&format!("name-{backed}"), "anon", backed);
            pref.put("alice".to_string()).expect("put");
            assert_eq!(pref.get().expect("get"), "alice");
            assert_eq!(pref.is_memory_backed(), backed);
        }
    }

    #[test]
    fn remove_deletes_entry_and_restores_default() {
        let ctx = context(MemoryStore::new());
        let pref = ctx.long("counter", -1, true);
        pref.put(42).expect("put");
        assert!(ctx.store().contains("counter").expect("contains"));

        pref.remove().expect("remove");
        assert!(!ctx.store().contains("counter").expect("contains"));
        assert_eq!(pref.get().expect("get"), -1);
    }

    #[test]
    fn nullable_put_none_removes() {
        let ctx = context(MemoryStore::new());
        let pref = ctx.nullable_string("token", None, false);
        assert_eq!(pref.get().expect("get"), None);

        pref.put(Some("abc".to_string())).expect("put");
        assert_eq!(pref.get().expect("get").as_deref(), Some("abc"));

        pref.put(None).expect("put none");
        assert!(!ctx.store().contains("token").expect("contains"));
        assert_eq!(pref.get().expect("get"), None);

        let with_default = ctx.nullable_string("other", Some("fallback".into()), false);
        assert_eq!(with_default.get().expect("get").as_deref(), Some("fallback"));
    }

    #[test]
    fn get_waits_for_queued_put() {
        let ctx = context(MemoryStore::new());
        let pref = ctx.string("mode", "default", false);
        pref.put("default".to_string()).expect("put");
        pref.put_async("v1".to_string());
        assert_eq!(pref.get().expect("get"), "v1");
    }

    #[test]
    fn last_async_put_in_program_order_wins() {
        let ctx = context(MemoryStore::new());
        for backed in [false, true] {
            let pref = ctx.int(&format!("value-{backed}"), 0, backed);
            pref.put(0).expect("put");
            for value in 1..=64 {
                pref.put_async(value);
            }
            assert_eq!(pref.get().expect("get"), 64);
        }
    }

    #[test]
    fn put_async_handle_resolves() {
        let ctx = context(MemoryStore::new());
        let pref = ctx.boolean("flag", false, false);
        let pending = pref.put_async(true);
        pending.wait();
        assert!(pending.is_resolved());
        assert!(ctx.store().get_bool("flag", false).expect("get_bool"));
    }

    #[test]
    fn get_async_delivers_on_a_pool_thread() {
        let ctx = context(MemoryStore::new());
        let pref = ctx.string("greeting", "hi", false);
        pref.put_async("hello".to_string());

        let caller = thread::current().id();
        let (tx, rx) = mpsc::channel();
        pref.get_async(move |result| {
            let value = result.expect("get_async");
            tx.send((value, thread::current().id())).expect("send");
        });

        let (value, thread_id) = rx.recv_timeout(Duration::from_secs(5)).expect("callback");
        assert_eq!(value, "hello");
        assert_ne!(thread_id, caller);
    }

    #[test]
    fn nullable_get_async_reports_absence() {
        let ctx = context(MemoryStore::new());
        let pref = ctx.nullable_string("absent", None, true);
        let (tx, rx) = mpsc::channel();
        pref.get_async(move |result| tx.send(result.expect("get_async")).expect("send"));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).expect("callback"), None);
    }

    #[test]
    fn observers_see_puts_and_removals() {
        let ctx = context(MemoryStore::new());
        let pref = ctx.nullable_string("watched", None, false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        pref.observable()
            .observe(move |value: Option<&String>| sink.lock().push(value.cloned()));

        pref.put(Some("a".into())).expect("put");
        pref.put(None).expect("put none");
        pref.put_async(Some("b".into())).wait();

        assert_eq!(
            *seen.lock(),
            vec![Some("a".to_string()), None, Some("b".to_string())]
        );
    }

    #[test]
    fn deleted_observers_are_not_called() {
        let ctx = context(MemoryStore::new());
        let pref = ctx.int("silent", 0, false);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let observer = pref.observable().observe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        pref.observable().add_observer(Arc::clone(&observer));
        assert_eq!(pref.observable().count_observers(), 1);

        pref.put(1).expect("put");
        pref.observable().delete_observers();
        pref.put(2).expect("put");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn observer_may_read_back_during_async_put() {
        let ctx = context(MemoryStore::new());
        let pref = ctx.int("echo", 0, false);
        let (tx, rx) = mpsc::channel();
        let reader = pref.clone();
        pref.observable().observe(move |_| {
            tx.send(reader.get().expect("get")).expect("send");
        });

        pref.put_async(5);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).expect("observer"), 5);
    }

    #[test]
    fn memory_backed_value_survives_until_invalidated() {
        let ctx = context(MemoryStore::new());
        let cached = ctx.string("shared", "none", true);
        let direct = ctx.string("shared", "none", false);

        cached.put("first".to_string()).expect("put");
        direct.put("second".to_string()).expect("put");

        assert_eq!(cached.get().expect("get"), "first");
        cached.invalidate();
        assert_eq!(cached.get().expect("get"), "second");
    }

    #[test]
    fn malformed_value_is_a_transform_error() {
        let ctx = context(MemoryStore::new());
        ctx.string("age", "", false)
            .put("not a number".to_string())
            .expect("put");

        let err = ctx.int("age", 0, false).get().expect_err("should fail");
        assert!(matches!(
            err,
            PreferenceError::Transform(TransformError::Parse { .. })
        ));
    }

    #[test]
    fn tampered_value_is_surfaced_not_defaulted() {
        let raw = MemoryStore::new();
        let ctx = context(raw.clone());
        let pref = ctx.string("secret", "default", false);
        pref.put("value".to_string()).expect("put");

        let slot = ctx.store().storage_key("secret");
        raw.put(&slot, "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").expect("raw put");

        assert!(matches!(
            pref.get().expect_err("tampered"),
            PreferenceError::Store(_)
        ));
    }

    #[test]
    fn get_async_callback_may_read_while_pool_is_saturated() {
        let ctx = context_with_pool(MemoryStore::new(), 1);
        let pref = ctx.int("volume", 1, false);
        let reader = pref.clone();
        let (tx, rx) = mpsc::channel();
        pref.get_async(move |_| {
            thread::sleep(Duration::from_millis(200));
            tx.send(reader.get().expect("get")).expect("send");
        });

        thread::sleep(Duration::from_millis(50));
        pref.put_async(2);

        let seen = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("callback calling get() returned");
        assert_eq!(seen, 2);
    }

    #[test]
    fn observer_may_read_another_preference_with_queued_work() {
        let ctx = context_with_pool(MemoryStore::new(), 1);
        let trigger = ctx.int("trigger", 0, false);
        let target = ctx.int("target", 0, true);
        let reader = target.clone();
        let (tx, rx) = mpsc::channel();
        trigger.observable().observe(move |_| {
            thread::sleep(Duration::from_millis(100));
            tx.send(reader.get().expect("get")).expect("send");
        });

        trigger.put_async(1);
        thread::sleep(Duration::from_millis(20));
        target.put_async(5);

        let seen = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("observer calling get() returned");
        assert_eq!(seen, 5);
        assert_eq!(target.pending_operations(), 0);
    }

    #[test]
    fn concurrent_async_puts_apply_in_submission_order() {
        let ctx = context(MemoryStore::new());
        let pref = ctx.int("contended", -1, false);
        let applied = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&applied);
        pref.observable().observe(move |value: Option<&i32>| {
            sink.lock().extend(value.copied());
        });

        let submitted = Arc::new(Mutex::new(Vec::new()));
        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let pref = pref.clone();
                let submitted = Arc::clone(&submitted);
                thread::spawn(move || {
                    for n in 0..16 {
                        let value = worker * 100 + n;
                        // record and submit atomically to fix one total order
                        let mut order = submitted.lock();
                        pref.put_async(value);
                        order.push(value);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker");
        }

        let last = *submitted.lock().last().expect("submissions");
        assert_eq!(pref.get().expect("get"), last);
        assert_eq!(*applied.lock(), *submitted.lock());
        assert_eq!(pref.pending_operations(), 0);
    }
}
