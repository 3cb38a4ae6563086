//! ptyproxy: a pseudo-terminal proxy core
//!
//! Owns a child process attached to a pseudo-terminal, streams its output to
//! a consumer, accepts input and out-of-band resize requests, and releases
//! every OS resource in reverse order of acquisition.
//!
//! - `session`: session lifecycle and the public entry points
//! - `pty`: pseudo-console capability and its Unix implementation
//! - `pump`: output thread, double buffer and output sinks
//! - `coalescer`: ring buffer and write coalescing for input
//! - `control`: per-session resize socket
//! - `arena`: bump allocator for per-session setup data

pub mod arena;
pub mod coalescer;
pub mod config;
pub mod control;
pub mod error;
pub mod pty;
pub mod pump;
pub mod relay;
pub mod session;
pub mod spawn;

pub use config::ProxyConfig;
pub use error::{ClientError, SessionError, SetupError};
pub use pty::{ResizeOutcome, WindowSize};
pub use session::{SessionHandle, SessionOptions, SessionState};
