use thiserror::Error;

/// Exit code the supervisor process uses for fatal pre-run failures
/// (dependency install failed, a child could not be spawned).
pub const EXIT_FATAL: i32 = 1;

/// Error types for supervisor operations
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("dependency install failed with exit code {code:?}")]
    InstallFailed { code: Option<i32> },

    #[error("failed to run installer command '{command}': {source}")]
    InstallSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn {role} process '{command}': {source}")]
    SpawnFailed {
        role: &'static str,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SupervisorError {
    /// All variants abort the run; none are retryable (this is a best-effort
    /// developer convenience tool, not a resilient service).
    pub fn exit_code(&self) -> i32 {
        EXIT_FATAL
    }
}
