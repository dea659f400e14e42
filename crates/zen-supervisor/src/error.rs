//! Error types for the supervisor

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Configuration error: {0}. Check the command line arguments.")]
    Config(String),

    /// The worker program could not be started
    #[error("Failed to start '{program}': {source}. Check that the program exists and is executable.")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}
