//! Core contracts for Vaultpref: the raw string-keyed store every encrypted
//! store is layered on, plus an in-memory implementation for tests.
//! Nothing here knows about encryption; that lives in `vaultpref-storage`.

pub mod storage;

pub use storage::{MemoryStore, RawStore, RawStoreError};
