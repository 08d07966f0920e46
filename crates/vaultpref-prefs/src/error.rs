use thiserror::Error;
use vaultpref_storage::EncryptedStoreError;

/// Failure converting between a typed value and its stored string.
///
/// Messages name the target type only; the stored text is never echoed back.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("stored value is not a valid {target}: {reason}")]
    Parse { target: &'static str, reason: String },
    #[error("cannot encode {target}: {reason}")]
    Serialize { target: &'static str, reason: String },
}

impl TransformError {
    pub(crate) fn parse(target: &'static str, reason: impl Into<String>) -> Self {
        Self::Parse {
            target,
            reason: reason.into(),
        }
    }

    pub(crate) fn serialize(target: &'static str, reason: impl Into<String>) -> Self {
        Self::Serialize {
            target,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PreferenceError {
    #[error(transparent)]
    Store(#[from] EncryptedStoreError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error("task pool error: {reason}")]
    Pool { reason: String },
}
