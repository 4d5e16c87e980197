use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Sample error: {0}")]
    Sample(String),

    #[error("Frame pool exhausted: {in_flight} frames held outside the free list")]
    FramePoolExhausted { in_flight: usize },

    #[error("Timing error: {0}")]
    Timing(String),
}

impl Error {
    /// Returns `true` for failures confined to a single send/receive iteration.
    ///
    /// The mode driver records these as invalid samples and keeps going; every
    /// other variant aborts the run.
    pub fn is_sample(&self) -> bool {
        matches!(self, Error::Sample(_) | Error::FramePoolExhausted { .. })
    }

    pub(crate) fn resource(context: &str, err: std::io::Error) -> Self {
        Error::Resource(format!("{}: {}", context, err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_errors_are_recoverable() {
        assert!(Error::Sample("short write".into()).is_sample());
        assert!(Error::FramePoolExhausted { in_flight: 4 }.is_sample());
        assert!(!Error::Config("bad".into()).is_sample());
        assert!(!Error::Timing("clock".into()).is_sample());
    }

    #[test]
    fn test_resource_context() {
        let err = Error::resource("bind", std::io::Error::from_raw_os_error(libc::EADDRINUSE));
        assert!(err.to_string().starts_with("Resource error: bind:"));
    }
}
