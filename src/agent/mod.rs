//! Device-side agent: a single cooperative loop that owns the device record
//! and initiates every exchange with the server.

pub mod board;
pub mod client;
pub mod config;
pub mod error;
pub mod record;
pub mod runtime;
pub mod store;
pub mod sync;

pub use config::AgentConfig;
pub use error::AgentError;
pub use runtime::{Agent, Mode};
