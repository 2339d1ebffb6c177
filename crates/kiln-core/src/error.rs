use crate::shape::Shape;

/// Coarse classification of an [`Error`], for callers that need to branch
/// on the failure category without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed layer configuration detected during setup.
    Configuration,
    /// An accelerator operation was requested but is not available.
    UnsupportedPlatform,
    /// A native library call reported failure.
    NativeCall,
    /// Operand shapes do not fit together.
    Shape,
    /// Anything else.
    Other,
}

/// All errors that can occur within Kiln.
///
/// Setup-time problems are reported as [`Error::Configuration`] and always
/// name the offending layer. Runtime failures of the accelerator library are
/// [`Error::NativeCall`]. None of them are retried: the caller is expected to
/// abort the current step.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid shape, stride, pad, dilation or group parameters, an unsupported
    /// device/feature combination, or an inconsistent parameter binding.
    #[error("layer \"{layer}\": {message}")]
    Configuration { layer: String, message: String },

    /// Accelerator support was not compiled in or is not usable at runtime.
    #[error("{feature} support is not available in this build")]
    UnsupportedPlatform { feature: &'static str },

    /// A native accelerator call reported a failure status.
    #[error("native call {call} failed: {status}")]
    NativeCall { call: &'static str, status: String },

    /// Shape mismatch between two operands.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Matrix multiplication dimension mismatch (dims after transposition).
    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}], inner dims must match")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Configuration error attributed to the layer `layer`.
    pub fn configuration(layer: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Configuration {
            layer: layer.into(),
            message: message.into(),
        }
    }

    /// Failure status reported by the native call `call`.
    pub fn native(call: &'static str, status: impl std::fmt::Display) -> Self {
        Error::NativeCall {
            call,
            status: status.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration { .. } => ErrorKind::Configuration,
            Error::UnsupportedPlatform { .. } => ErrorKind::UnsupportedPlatform,
            Error::NativeCall { .. } => ErrorKind::NativeCall,
            Error::ShapeMismatch { .. } | Error::MatmulShapeMismatch { .. } => ErrorKind::Shape,
            Error::Msg(_) => ErrorKind::Other,
        }
    }
}

/// Convenience Result type used throughout Kiln.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
