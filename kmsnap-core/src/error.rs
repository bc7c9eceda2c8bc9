//! Error types for kmsnap

use thiserror::Error;

/// Result type alias using CaptureError
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Main error type for capture operations
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Device/environment error (open failure, missing capability)
    #[error("Device error: {0}")]
    Device(String),

    /// Framebuffer discovery error
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Buffer import or allocation failure with the underlying status code
    #[error("Import error: {context} (status {status})")]
    Import {
        context: String,
        status: i32,
    },

    /// GPU command submission or fence error
    #[error("GPU error: {0}")]
    Gpu(String),

    /// Unsupported format or operation
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<CaptureError>,
    },
}

impl CaptureError {
    /// Create a device error
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    /// Create a discovery error
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }

    /// Create an import/allocation error carrying a driver status code
    pub fn import(context: impl Into<String>, status: i32) -> Self {
        Self::Import {
            context: context.into(),
            status,
        }
    }

    /// Create a GPU execution error
    pub fn gpu(msg: impl Into<String>) -> Self {
        Self::Gpu(msg.into())
    }

    /// Create an unsupported-operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Get a user-friendly hint for how to resolve this error
    pub fn user_hint(&self) -> Option<&'static str> {
        match self {
            Self::Device(_) => Some(
                "Capturing the scanout requires read-write access to the DRM device.\n\
                 Run as root and check the --device path (try /dev/dri/card0 or card1).",
            ),
            Self::Discovery(_) => Some(
                "No active framebuffer was found on this device.\n\
                 Use --list to see planes, or try another --device node.",
            ),
            Self::Import { .. } | Self::Gpu(_) => Some(
                "GPU-side capture failed; the tool falls back to slower paths automatically.\n\
                 If every path failed, the scanout may live in memory this driver cannot export.",
            ),
            Self::Unsupported(_) => None,
            Self::Io(_) => Some("Check that the output path is writable."),
            Self::WithContext { source, .. } => source.user_hint(),
        }
    }

    /// Check if this error should trigger the next acquisition strategy
    pub fn is_fallthrough(&self) -> bool {
        matches!(self, Self::Import { .. } | Self::Gpu(_) | Self::Unsupported(_))
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_error_carries_status() {
        let err = CaptureError::import("bind source VA", -22);
        assert!(err.to_string().contains("-22"));
        assert!(err.is_fallthrough());
    }

    #[test]
    fn test_context_preserves_hint() {
        let err = CaptureError::device("open /dev/dri/card1").with_context("initializing");
        assert!(err.user_hint().unwrap().contains("root"));
    }

    #[test]
    fn test_host_io_is_fatal() {
        let err = CaptureError::from(std::io::Error::other("disk full"));
        assert!(!err.is_fallthrough());
    }
}
