use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] gamefix_core::Error),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No fix registered for {0}")]
    NoMatchingFix(String),

    #[error("Timed out waiting for module {name} after {attempts} attempt(s)")]
    ModuleTimeout { name: String, attempts: u32 },

    #[error("Shutdown requested")]
    Shutdown,

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is a "file not found" error
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            Error::Core(e) => e.is_not_found(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_errors_pass_through() {
        let err: Error = gamefix_core::Error::PatternNotFound("D9 05".into()).into();
        assert_eq!(err.to_string(), "Pattern not found: D9 05");
    }

    #[test]
    fn test_is_not_found() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert!(Error::Io(io_err).is_not_found());

        let core: Error = gamefix_core::Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing",
        ))
        .into();
        assert!(core.is_not_found());
        assert!(!Error::Shutdown.is_not_found());
    }
}
