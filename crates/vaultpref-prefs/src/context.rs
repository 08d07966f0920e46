use std::{
    fmt,
    str::FromStr,
    sync::{Arc, Weak},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, instrument};
use vaultpref_storage::EncryptedStore;

use crate::{
    error::PreferenceError,
    pool::TaskPool,
    preference::{Binding, Invalidate, NullablePreference, Preference},
    transform::{DateTransform, EnumTransform, Identity, JsonTransform, Scalar, Transform},
};

type Tracked = Mutex<Vec<Weak<dyn Invalidate>>>;

/// Creates preferences over one encrypted store and owns the pool their
/// asynchronous operations run on.
///
/// Every constructor takes a `backed` flag: memory-backed preferences keep
/// their decrypted value after the first read or write and are tracked here
/// so [`PreferenceContext::clear`] can drop those copies.
pub struct PreferenceContext {
    store: Arc<EncryptedStore>,
    pool: Arc<TaskPool>,
    backed: Tracked,
    nullable_backed: Tracked,
}

impl PreferenceContext {
    pub fn new(store: impl Into<Arc<EncryptedStore>>, pool: TaskPool) -> Self {
        Self {
            store: store.into(),
            pool: Arc::new(pool),
            backed: Mutex::new(Vec::new()),
            nullable_backed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_default_pool(store: impl Into<Arc<EncryptedStore>>) -> Result<Self, PreferenceError> {
        Ok(Self::new(store, TaskPool::with_default_size()?))
    }

    pub fn store(&self) -> &EncryptedStore {
        &self.store
    }

    pub fn pool(&self) -> &TaskPool {
        &self.pool
    }

    /// Number of memory-backed preferences still alive.
    pub fn tracked(&self) -> usize {
        [&self.backed, &self.nullable_backed]
            .into_iter()
            .map(|list| {
                let mut list = list.lock();
                list.retain(|weak| weak.strong_count() > 0);
                list.len()
            })
            .sum()
    }

    /// Drops every cached value, then empties the store (re-seeding its tag).
    #[instrument(skip_all, fields(store = %self.store.name()))]
    pub fn clear(&self) -> Result<(), PreferenceError> {
        invalidate_all(&self.backed);
        invalidate_all(&self.nullable_backed);
        self.store.clear()?;
        debug!("preferences cleared");
        Ok(())
    }

    fn bind<T>(
        &self,
        key: &str,
        transform: Box<dyn Transform<T>>,
        backed: bool,
        tracked: &Tracked,
    ) -> Arc<Binding<T>>
    where
        T: Clone + Send + 'static,
    {
        let binding = Arc::new(Binding::new(key, Arc::clone(&self.store), transform, backed));
        if backed {
            let weak = Arc::downgrade(&binding);
            let weak: Weak<dyn Invalidate> = weak;
            let mut tracked = tracked.lock();
            tracked.retain(|entry| entry.strong_count() > 0);
            tracked.push(weak);
        }
        binding
    }

    /// Preference converted through a caller-supplied transform.
    pub fn custom<T, X>(&self, key: &str, default: T, transform: X, backed: bool) -> Preference<T>
    where
        T: Clone + Send + 'static,
        X: Transform<T> + 'static,
    {
        let binding = self.bind(key, Box::new(transform), backed, &self.backed);
        Preference::new(binding, Arc::clone(&self.pool), default)
    }

    pub fn nullable_custom<T, X>(
        &self,
        key: &str,
        default: Option<T>,
        transform: X,
        backed: bool,
    ) -> NullablePreference<T>
    where
        T: Clone + Send + 'static,
        X: Transform<T> + 'static,
    {
        let binding = self.bind(key, Box::new(transform), backed, &self.nullable_backed);
        NullablePreference::new(binding, Arc::clone(&self.pool), default)
    }

    pub fn string(&self, key: &str, default: impl Into<String>, backed: bool) -> Preference<String> {
        self.custom(key, default.into(), Identity, backed)
    }

    pub fn nullable_string(
        &self,
        key: &str,
        default: Option<String>,
        backed: bool,
    ) -> NullablePreference<String> {
        self.nullable_custom(key, default, Identity, backed)
    }

    pub fn int(&self, key: &str, default: i32, backed: bool) -> Preference<i32> {
        self.custom(key, default, Scalar::new(), backed)
    }

    pub fn long(&self, key: &str, default: i64, backed: bool) -> Preference<i64> {
        self.custom(key, default, Scalar::new(), backed)
    }

    pub fn short(&self, key: &str, default: i16, backed: bool) -> Preference<i16> {
        self.custom(key, default, Scalar::new(), backed)
    }

    pub fn byte(&self, key: &str, default: i8, backed: bool) -> Preference<i8> {
        self.custom(key, default, Scalar::new(), backed)
    }

    pub fn boolean(&self, key: &str, default: bool, backed: bool) -> Preference<bool> {
        self.custom(key, default, Scalar::new(), backed)
    }

    pub fn double(&self, key: &str, default: f64, backed: bool) -> Preference<f64> {
        self.custom(key, default, Scalar::new(), backed)
    }

    pub fn float(&self, key: &str, default: f32, backed: bool) -> Preference<f32> {
        self.custom(key, default, Scalar::new(), backed)
    }

    pub fn char(&self, key: &str, default: char, backed: bool) -> Preference<char> {
        self.custom(key, default, Scalar::new(), backed)
    }

    pub fn date(&self, key: &str, default: DateTime<Utc>, backed: bool) -> Preference<DateTime<Utc>> {
        self.custom(key, default, DateTransform, backed)
    }

    pub fn nullable_date(
        &self,
        key: &str,
        default: Option<DateTime<Utc>>,
        backed: bool,
    ) -> NullablePreference<DateTime<Utc>> {
        self.nullable_custom(key, default, DateTransform, backed)
    }

    pub fn enumeration<E>(&self, key: &str, default: E, backed: bool) -> Preference<E>
    where
        E: FromStr + AsRef<str> + Clone + Send + 'static,
    {
        self.custom(key, default, EnumTransform::new(), backed)
    }

    pub fn nullable_enumeration<E>(
        &self,
        key: &str,
        default: Option<E>,
        backed: bool,
    ) -> NullablePreference<E>
    where
        E: FromStr + AsRef<str> + Clone + Send + 'static,
    {
        self.nullable_custom(key, default, EnumTransform::new(), backed)
    }

    pub fn json<T>(&self, key: &str, default: T, backed: bool) -> Preference<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
    {
        self.custom(key, default, JsonTransform::new(), backed)
    }

    pub fn nullable_json<T>(&self, key: &str, default: Option<T>, backed: bool) -> NullablePreference<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
    {
        self.nullable_custom(key, default, JsonTransform::new(), backed)
    }
}

fn invalidate_all(tracked: &Tracked) {
    tracked.lock().retain(|weak| match weak.upgrade() {
        Some(preference) => {
            preference.invalidate();
            true
        }
        None => false,
    });
}

impl fmt::Debug for PreferenceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreferenceContext")
            .field("store", &self.store.name())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}
