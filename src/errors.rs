use thiserror::Error;

/// Failures that abort the current order-list entry.
///
/// Everything here is fatal to the running unit command; the binary catches
/// the error at the outermost boundary and logs a single summary line.
/// Idempotent no-ops (container already stopped, image already present) are
/// success paths and never reach this type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("no image to pull or build given")]
    NoImageSpecified,

    #[error("no build instructions for image {image}: {reason}")]
    NoBuildInstructions { image: String, reason: String },

    #[error("container {name} does not exist and could not be created: {reason}")]
    CreationError { name: String, reason: String },

    #[error(
        "backup target {name} already exists in {directory}; \
         add 'overwrite: true' to the orders to replace it"
    )]
    BackupConflict { name: String, directory: String },

    #[error("volume manipulation {command:?} failed with exit code {code}:\n{stderr}")]
    VolumeOperationFailed {
        command: Vec<String>,
        code: i64,
        stderr: String,
    },

    #[error("execution of {command:?} failed with exit code {code} (cwd={cwd})")]
    ExecutionFailed {
        command: Vec<String>,
        code: i32,
        cwd: String,
    },

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// An error reported by the runtime endpoint for a single API call.
    /// Creation retries after a build only when the message names a missing
    /// image (see `ContainerLifecycle::create`).
    #[error("runtime error: {0}")]
    Runtime(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
