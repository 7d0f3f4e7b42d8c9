use crate::object::NativeHandle;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    NullArgument { name: String },
    InvalidArgument { name: String, reason: String },
    IneligibleType { type_name: String },
    UnresolvedConversion { index: usize, reason: String },
    UnresolvedType { handle: NativeHandle },
    ObjectDisposed { type_name: String },
    ArgumentCount { expected: usize, found: usize },
    UnsupportedSignature { reason: String },
    NotInstalled,
    Config { message: String },
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NullArgument { name } => {
                write!(f, "Argument '{}' must not be null", name)
            }
            Self::InvalidArgument { name, reason } => {
                write!(f, "Invalid argument '{}': {}", name, reason)
            }
            Self::IneligibleType { type_name } => {
                write!(f, "Type {} is not eligible for late binding", type_name)
            }
            Self::UnresolvedConversion { index, reason } => {
                write!(f, "No conversion for parameter {}: {}", index, reason)
            }
            Self::UnresolvedType { handle } => {
                write!(f, "No wrapper type can be constructed for {}", handle)
            }
            Self::ObjectDisposed { type_name } => {
                write!(f, "Wrapper {} no longer refers to a native object", type_name)
            }
            Self::ArgumentCount { expected, found } => {
                write!(f, "Expected {} arguments, got {}", expected, found)
            }
            Self::UnsupportedSignature { reason } => {
                write!(f, "Unsupported native signature: {}", reason)
            }
            Self::NotInstalled => {
                write!(f, "No bridge installed for native entry points")
            }
            Self::Config { message } => {
                write!(f, "Configuration error: {}", message)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeError {
    pub kind: ErrorKind,
    pub context: Option<String>,
}

impl BridgeError {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, context: None }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn null_argument(name: &str) -> Self {
        Self::new(ErrorKind::NullArgument { name: name.to_string() })
    }

    pub fn invalid_argument(name: &str, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument {
            name: name.to_string(),
            reason: reason.into(),
        })
    }

    pub fn unresolved_conversion(index: usize, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnresolvedConversion {
            index,
            reason: reason.into(),
        })
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedSignature { reason: reason.into() })
    }

    /// Errors from invalid input to registry or late-binding APIs
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::NullArgument { .. }
                | ErrorKind::InvalidArgument { .. }
                | ErrorKind::IneligibleType { .. }
        )
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(context) => write!(f, "{} ({})", self.kind, context),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<ErrorKind> for BridgeError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_context() {
        let err = BridgeError::null_argument("selector").with_context("connect_method");
        assert_eq!(
            err.to_string(),
            "Argument 'selector' must not be null (connect_method)"
        );
        assert!(err.is_argument_error());
    }

    #[test]
    fn test_conversion_error_is_not_argument_error() {
        let err = BridgeError::unresolved_conversion(2, "by-ref string");
        assert!(!err.is_argument_error());
        assert_eq!(err.to_string(), "No conversion for parameter 2: by-ref string");
    }
}
