//! Error types for the link crate.

use thiserror::Error;
use trellis_core::CoreError;

/// Errors raised by link arrays, sub-name resolution and copy-on-change.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Resolving or assigning the link would revisit an object.
    #[error("circular link through '{object}'")]
    CircularLink { object: String },

    /// Array slot outside the declared bounds of a fixed-size array.
    #[error("element index {index} out of range (element count {count})")]
    InvalidIndex { index: i64, count: usize },

    /// The linked object could not be duplicated for copy-on-change.
    #[error("object '{object}' does not support copy-on-change cloning")]
    CloneUnsupported { object: String },

    /// The object carries no link extension.
    #[error("object '{object}' is not a link")]
    NotALink { object: String },

    /// A sub-element path did not resolve.
    #[error("sub-element '{subname}' not found")]
    SubElementNotFound { subname: String },

    /// A sub-element path is syntactically invalid.
    #[error("invalid sub-name '{0}'")]
    InvalidSubname(String),

    /// A change handler was entered while it was already running.
    #[error("reentrant change of '{property}' on '{object}'")]
    ReentrantChange { object: String, property: String },

    /// The geometry kernel failed while resolving a sub-element.
    #[error("geometry kernel failure: {0}")]
    Kernel(String),

    /// Failure reported by the document layer.
    #[error(transparent)]
    Document(CoreError),
}

impl From<CoreError> for LinkError {
    fn from(err: CoreError) -> Self {
        match err.downcast_extension::<LinkError>() {
            Ok(link) => link,
            Err(other) => Self::Document(other),
        }
    }
}

impl From<LinkError> for CoreError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Document(inner) => inner,
            other => CoreError::extension(other),
        }
    }
}

impl From<trellis_core::PropertyError> for LinkError {
    fn from(err: trellis_core::PropertyError) -> Self {
        Self::Document(err.into())
    }
}

/// Result type for link operations.
pub type LinkResult<T> = Result<T, LinkError>;

/// Failures reported by a [`GeometryKernel`](crate::kernel::GeometryKernel).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// The object has no element with that name.
    #[error("sub-element '{0}' not found")]
    SubElementNotFound(String),

    /// The kernel failed to compute the geometry.
    #[error("geometry kernel failure: {0}")]
    Failed(String),
}

impl From<KernelError> for LinkError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::SubElementNotFound(subname) => Self::SubElementNotFound { subname },
            KernelError::Failed(message) => Self::Kernel(message),
        }
    }
}

/// Errors raised by the attachment engine.
#[derive(Error, Debug)]
pub enum AttachError {
    /// Positioning was requested while no engine is set.
    #[error("cannot position by support: no attach engine is set")]
    NoEngine,

    /// The engine type name is not registered.
    #[error("unknown attach engine type '{0}'")]
    UnknownEngineType(String),

    /// The attachment mode name is not known.
    #[error("unknown attachment mode '{0}'")]
    UnknownMode(String),

    /// The references do not (yet) determine a placement. Recoverable.
    #[error("attachment not computable: {0}")]
    NotComputable(String),

    /// The geometry kernel failed.
    #[error("kernel failure during attachment: {0}")]
    Kernel(String),

    /// Failure reported by the document layer.
    #[error(transparent)]
    Document(CoreError),
}

impl AttachError {
    /// Whether this is the recoverable "not yet computable" condition.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotComputable(_))
    }
}

impl From<CoreError> for AttachError {
    fn from(err: CoreError) -> Self {
        match err.downcast_extension::<AttachError>() {
            Ok(attach) => attach,
            Err(other) => Self::Document(other),
        }
    }
}

impl From<AttachError> for CoreError {
    fn from(err: AttachError) -> Self {
        match err {
            AttachError::Document(inner) => inner,
            other => CoreError::extension(other),
        }
    }
}

impl From<KernelError> for AttachError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::SubElementNotFound(subname) => {
                Self::NotComputable(format!("sub-element '{subname}' not found"))
            }
            KernelError::Failed(message) => Self::Kernel(message),
        }
    }
}

/// Result type for attachment operations.
pub type AttachResult<T> = Result<T, AttachError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_error_survives_core_round_trip() {
        let core: CoreError = LinkError::InvalidIndex { index: 5, count: 3 }.into();
        let back = LinkError::from(core);
        assert!(matches!(back, LinkError::InvalidIndex { index: 5, count: 3 }));
    }

    #[test]
    fn test_document_error_unwraps() {
        let core: CoreError = LinkError::Document(CoreError::Config("x".into())).into();
        assert!(matches!(core, CoreError::Config(_)));
    }

    #[test]
    fn test_kernel_error_mapping() {
        let attach = AttachError::from(KernelError::SubElementNotFound("Face9".into()));
        assert!(attach.is_recoverable());
        let attach = AttachError::from(KernelError::Failed("boom".into()));
        assert!(matches!(attach, AttachError::Kernel(_)));
    }
}
