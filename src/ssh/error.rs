//! SSH error types

use thiserror::Error;

/// Errors produced by the SSH layer.
///
/// Startup-phase variants (`Spawn`, `AgentParse`, `AgentConnect`, `Key`) are
/// fatal before any session starts. `Dial`, `Listen` and `Accept` end a single
/// session; `RemoteDial` ends a single connection attempt. `Terminate` is
/// reported at shutdown but never escalated.
#[derive(Error, Debug)]
pub enum SshError {
    #[error("Dial failed: {0}")]
    Dial(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        source: std::io::Error,
    },

    #[error("Accept failed: {0}")]
    Accept(std::io::Error),

    #[error("Remote dial to {addr} failed: {reason}")]
    RemoteDial { addr: String, reason: String },

    #[error("Key error: {0}")]
    Key(String),

    #[error("Failed to spawn ssh-agent: {0}")]
    Spawn(String),

    #[error("Failed to parse ssh-agent output: {0}")]
    AgentParse(&'static str),

    #[error("Failed to connect to ssh-agent: {0}")]
    AgentConnect(String),

    #[error("Failed to terminate ssh-agent (pid {pid}): {reason}")]
    Terminate { pid: u32, reason: String },

    #[error("Dial timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::Dial(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::Key(err.to_string())
    }
}
