//! Error types for script execution.

/// Why a script did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    /// The host was force-interrupted before the script finished.
    #[error("Script execution was interrupted")]
    Interrupted,

    /// The script raised an object carrying a string `code`.
    #[error("{code}: {message}")]
    Tenant {
        code: String,
        message: String,
        stack: Option<String>,
    },

    /// Any other exception, including syntax errors in the tenant source.
    #[error("JavaScript error: {message}")]
    Exception {
        message: String,
        stack: Option<String>,
    },

    /// The isolate or its thread could not be brought up.
    #[error("Failed to start script host: {0}")]
    Startup(String),
}

impl ScriptError {
    pub fn exception(message: impl Into<String>) -> Self {
        ScriptError::Exception {
            message: message.into(),
            stack: None,
        }
    }

    /// Check if this error came from a forced interruption
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ScriptError::Interrupted)
    }
}
