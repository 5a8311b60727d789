use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Pattern not found: {0}")]
    PatternNotFound(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Failed to change protection of {len} bytes at {address:#x}: {message}")]
    ProtectionChangeFailed {
        address: usize,
        len: usize,
        message: String,
    },

    #[error("Hook at {address:#x} overlaps an installed hook at {existing:#x}")]
    HookInstallConflict { address: usize, existing: usize },

    #[error("Hook at {address:#x} needs at least {required} bytes, got {byte_count}")]
    HookTooShort {
        address: usize,
        byte_count: usize,
        required: usize,
    },

    #[error("Range {address:#x}+{len:#x} is outside the mapped image")]
    OutOfBounds { address: usize, len: usize },

    #[error("Failed to allocate executable memory: {0}")]
    AllocationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether retrying later could succeed (the module may still be loading).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ModuleNotFound(_))
    }

    /// Check if this error is a "file not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}
