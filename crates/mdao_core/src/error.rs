use thiserror::Error;

/// Errors raised by the vector layer.
///
/// Every error is reported synchronously by the call that detects it. Messages
/// carry the owning system's `msginfo` prefix so the offending vector can be
/// located in a large model.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VectorError {
    #[error("{context}: Variable name '{name}' not found.")]
    NameNotFound { context: String, name: String },

    #[error("{context}: Attempt to set value of '{name}' in {kind} vector when it is read only.")]
    ReadOnlyViolation {
        context: String,
        name: String,
        kind: String,
    },

    #[error("{context}: Failed to set value of '{name}': {reason}.")]
    ShapeMismatch {
        context: String,
        name: String,
        reason: String,
    },

    #[error("{context}: {what} has size {actual} but expected size is {expected}.")]
    SizeMismatch {
        context: String,
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("{op} not defined for vector backend {backend}")]
    UnimplementedOperation { op: &'static str, backend: String },

    #[error("invalid index: {0}")]
    InvalidIndex(String),

    #[error("{context}: complex step requested on {kind} vector without complex storage.")]
    ComplexStepUnavailable { context: String, kind: String },

    #[error("{context}: {reason}")]
    LayoutMismatch { context: String, reason: String },

    #[error("{context}: buffer is held by an outstanding view.")]
    BufferBorrowed { context: String },
}

pub type Result<T> = std::result::Result<T, VectorError>;

impl VectorError {
    pub(crate) fn not_found(context: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NameNotFound {
            context: context.into(),
            name: name.into(),
        }
    }

    pub(crate) fn shape(
        context: impl Into<String>,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unimplemented(op: &'static str, backend: impl Into<String>) -> Self {
        Self::UnimplementedOperation {
            op,
            backend: backend.into(),
        }
    }
}
