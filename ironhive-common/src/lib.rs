//! Common types shared between the Ironhive controller and node agents

pub mod error;
pub mod rpc;

pub use error::{Error, Result};
