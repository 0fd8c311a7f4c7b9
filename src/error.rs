use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    /// Bad port or host. Raised before any file or process is created.
    #[error("invalid target: {reason}")]
    InvalidTarget { reason: String },

    #[error("failed to spawn {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: io::Error,
    },

    /// The prober exited with a non-zero (or missing) exit code.
    #[error("process failed with exit code {}: {}", display_code(.exit_code), .stderr)]
    ProcessFailed { exit_code: Option<i32>, stderr: String },

    #[error("process timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("result file does not exist: {}", .0.display())]
    MissingResultFile(PathBuf),

    #[error("malformed record at line {line}: {source}")]
    MalformedRecord {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to attach {protocol} record: {reason}")]
    AttachFailure { protocol: String, reason: String },

    #[error("config error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ScanError {
    pub fn invalid_target(reason: impl Into<String>) -> Self {
        ScanError::InvalidTarget { reason: reason.into() }
    }

    pub fn attach_failure(protocol: impl Into<String>, reason: impl Into<String>) -> Self {
        ScanError::AttachFailure {
            protocol: protocol.into(),
            reason: reason.into(),
        }
    }
}

fn display_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
}

pub type Result<T> = std::result::Result<T, ScanError>;
