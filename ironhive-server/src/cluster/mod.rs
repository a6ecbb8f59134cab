//! Controller side of the cluster fabric: agent sessions, the websocket
//! endpoint they connect to, and the reconciliation sweep.

pub mod reconciler;
pub mod registry;
pub mod ws;

pub use registry::{AgentRegistry, AgentSession};
