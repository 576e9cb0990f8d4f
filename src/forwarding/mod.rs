//! Local port forwarding sessions.

mod session;

pub use session::{relay, run_tunnel};
