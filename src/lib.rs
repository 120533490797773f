//! A small remote-execution protocol and its async Rust implementation:
//! a server that spawns one child process per connection and streams its
//! stdio over a framed TCP protocol, and the client that drives it.

pub mod client;
pub mod cmdline;
pub mod command;
pub mod config;
pub mod error;
pub mod frame;
pub mod multiplexor;
pub mod pathsearch;
pub mod protocol;
pub mod session;

pub use config::ServerConfig;
pub use error::SessionError;
pub use frame::{CodecError, Frame, FrameCodec};
pub use multiplexor::Multiplexor;
pub use session::{Session, SessionState};
