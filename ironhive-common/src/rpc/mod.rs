//! Duplex RPC protocol between the controller and node agents
//!
//! A single persistent websocket per agent carries JSON text frames of four
//! kinds: request, response, notification, and stream. Either side may
//! originate requests; responses and stream frames reuse the id of the
//! request they answer.

pub mod conn;
pub mod error;
pub mod message;
pub mod methods;
pub mod router;
pub mod types;

pub use conn::RpcConnection;
pub use error::{RpcError, RpcErrorCode};
pub use message::{MessageType, RpcErrorInfo, RpcMessage, MAX_FRAME_BYTES};
pub use router::RpcRouter;
