//! Workspace error types.
//!
//! Two disjoint classes live here. [`WorkspaceError`] is returned from
//! lookups and is recoverable: a serving layer rejects the one request and
//! carries on. [`FatalError`] describes configuration mistakes and device
//! faults found while registering, building or tearing down; those are
//! never returned, they go through [`fatal`] and end the process (or the
//! test) with a panic.

use crate::backend::DeviceError;
use crate::memory::StackError;
use crate::model::ModelError;
use thiserror::Error;

/// Recoverable lookup failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkspaceError {
    #[error("no graph executor for model={name} bs={batch_size}")]
    GraphNotFound { name: String, batch_size: u32 },

    #[error("no device bindings for model: {name}")]
    BindingsNotFound { name: String },
}

/// Unrecoverable faults. See [`fatal`].
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("registration of new models is not allowed after graph creation (model={name})")]
    RegistrationClosed { name: String },

    #[error("batch size must be non-zero (model={name})")]
    ZeroBatchSize { name: String },

    #[error("batch size {batch_size} exceeds max batch size {max_batch_size} for model={name}")]
    BatchSizeExceeded {
        name: String,
        batch_size: u32,
        max_batch_size: u32,
    },

    #[error("model collision; model with name={name} and bs={batch_size} is already registered")]
    DuplicateModel { name: String, batch_size: u32 },

    #[error("name={name} is already bound to a different model")]
    ModelNameConflict { name: String },

    #[error("graphs have already been built for this workspace")]
    AlreadyBuilt,

    #[error("binding stack for model={name}: {source}")]
    BindingStack {
        name: String,
        #[source]
        source: StackError,
    },

    #[error("device failure during {op}: {source}")]
    Device {
        op: &'static str,
        #[source]
        source: DeviceError,
    },

    #[error("model={name}: {source}")]
    Model {
        name: String,
        #[source]
        source: ModelError,
    },
}

impl FatalError {
    pub(crate) fn device(op: &'static str) -> impl FnOnce(DeviceError) -> FatalError {
        move |source| FatalError::Device { op, source }
    }
}

/// Log `err` and abort the current operation by panicking.
///
/// Continuing after any of these faults would leave half-captured graphs
/// or a memory plan that no longer matches the registered models.
#[track_caller]
pub fn fatal(err: FatalError) -> ! {
    tracing::error!(error = %err, "fatal graph workspace error");
    panic!("{err}");
}

/// Unwrap a result whose error class is fatal.
pub(crate) trait OrFatal<T> {
    fn or_fatal(self) -> T;
}

impl<T> OrFatal<T> for Result<T, FatalError> {
    #[track_caller]
    fn or_fatal(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => fatal(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_errors_name_the_key() {
        let err = WorkspaceError::GraphNotFound {
            name: "resnet".into(),
            batch_size: 8,
        };
        assert_eq!(err.to_string(), "no graph executor for model=resnet bs=8");

        let err = WorkspaceError::BindingsNotFound { name: "bert".into() };
        assert!(err.to_string().contains("bert"));
    }

    #[test]
    #[should_panic(expected = "is already registered")]
    fn fatal_panics_with_display_text() {
        fatal(FatalError::DuplicateModel {
            name: "a".into(),
            batch_size: 1,
        });
    }

    #[test]
    fn or_fatal_passes_values_through() {
        let ok: Result<u32, FatalError> = Ok(7);
        assert_eq!(ok.or_fatal(), 7);
    }
}
