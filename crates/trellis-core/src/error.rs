//! Error types for Trellis documents.

use std::fmt;

use crate::object::{ObjectError, ObjectId};
use crate::property::PropertyError;

/// The main error type for document operations.
#[derive(Debug)]
pub enum CoreError {
    /// Object-related error.
    Object(ObjectError),
    /// Property-related error.
    Property(PropertyError),
    /// Configuration could not be loaded.
    Config(String),
    /// An object failed during its recompute pass.
    Recompute {
        /// The failing object.
        object: ObjectId,
        /// Failure description.
        message: String,
    },
    /// An extension vetoed or failed while handling a change.
    Extension(Box<dyn std::error::Error + Send + Sync>),
}

impl CoreError {
    /// Wrap an extension error.
    pub fn extension<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Extension(Box::new(err))
    }

    /// Try to recover a typed extension error.
    pub fn downcast_extension<E>(self) -> Result<E, Self>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Self::Extension(inner) => match inner.downcast::<E>() {
                Ok(err) => Ok(*err),
                Err(inner) => Err(Self::Extension(inner)),
            },
            other => Err(other),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(err) => write!(f, "Object error: {err}"),
            Self::Property(err) => write!(f, "Property error: {err}"),
            Self::Config(msg) => write!(f, "Invalid configuration: {msg}"),
            Self::Recompute { object, message } => {
                write!(f, "Recompute of object {object:?} failed: {message}")
            }
            Self::Extension(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Object(err) => Some(err),
            Self::Property(err) => Some(err),
            Self::Extension(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<ObjectError> for CoreError {
    fn from(err: ObjectError) -> Self {
        match err {
            ObjectError::Property(err) => Self::Property(err),
            other => Self::Object(other),
        }
    }
}

impl From<PropertyError> for CoreError {
    fn from(err: PropertyError) -> Self {
        Self::Property(err)
    }
}

/// A specialized Result type for document operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Veto;

    impl fmt::Display for Veto {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "veto")
        }
    }

    impl std::error::Error for Veto {}

    #[test]
    fn test_extension_round_trip() {
        let err = CoreError::extension(Veto);
        assert_eq!(err.to_string(), "veto");
        assert_eq!(err.downcast_extension::<Veto>().unwrap(), Veto);
    }

    #[test]
    fn test_object_property_error_flattens() {
        let err: CoreError = ObjectError::Property(PropertyError::NotFound { name: "X".into() }).into();
        assert!(matches!(err, CoreError::Property(PropertyError::NotFound { .. })));
    }
}
