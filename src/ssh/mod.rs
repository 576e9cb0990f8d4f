//! SSH layer: authentication, agent lifecycle, and connection dialing.

pub mod agent;
mod auth;
mod client;
mod error;

pub use agent::{add_key, parse_agent_output, spawn_agent, AgentProcess};
pub use auth::{load_private_key, AuthContext};
pub use client::{dial, ClientHandler, DialConfig};
pub use error::SshError;
