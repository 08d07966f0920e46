//! Typed, observable preferences on top of an encrypted store.
//!
//! A [`PreferenceContext`] hands out [`Preference`] and [`NullablePreference`]
//! accessors bound to one logical key each. Values go through a [`Transform`]
//! into the store; asynchronous operations run on the context's [`TaskPool`]
//! and stay ordered per preference.

pub mod context;
pub mod error;
pub mod observable;
pub mod pool;
pub mod preference;
pub mod queue;
pub mod transform;

pub use context::PreferenceContext;
pub use error::{PreferenceError, TransformError};
pub use observable::{Observable, Observer};
pub use pool::TaskPool;
pub use preference::{NullablePreference, Preference};
pub use queue::PendingOperation;
pub use transform::{
    DateTransform, Deflate, EnumTransform, Identity, JsonTransform, Scalar, Transform,
    MAX_INFLATED,
};
