//! Error types for session setup, live session operations and the control client

use std::io;

use crate::arena::ArenaError;

/// Process exit codes reported by the `ptyproxy` binary
///
/// Each setup step has its own code so a supervisor can tell which resource
/// could not be acquired.
pub mod exit_code {
    /// Wrong number of arguments or an unparsable argument
    pub const INVALID_ARGS: u8 = 1;
    /// A live session already owns the requested id
    pub const DUPLICATE_ID: u8 = 2;
    /// The control socket could not be created
    pub const CONTROL_CHANNEL: u8 = 3;
    /// The pseudo-console facility is missing
    pub const BACKEND_UNAVAILABLE: u8 = 4;
    /// Width or height outside 1..=65535
    pub const INVALID_SIZE: u8 = 5;
    /// Creating a wake-up pipe failed
    pub const PIPE: u8 = 6;
    /// Creating the pseudo-console failed
    pub const CONSOLE: u8 = 7;
    /// Opening the input/output endpoints failed
    pub const ENDPOINTS: u8 = 8;
    /// Building the child's argument and environment lists failed
    pub const ATTRIBUTES: u8 = 9;
    /// Spawning the child failed
    pub const SPAWN: u8 = 10;
    /// Starting the output pump thread failed
    pub const PUMP_START: u8 = 11;
    /// The setup arena could not be created
    pub const ARENA: u8 = 12;
    /// `resize` named an id with no live session
    pub const UNKNOWN_SESSION: u8 = 13;
    /// Relay I/O failed after setup
    pub const IO: u8 = 14;
    /// The configuration file could not be loaded
    pub const CONFIG: u8 = 15;
}

/// Failure while creating a session
///
/// Every variant corresponds to one setup step. Resources acquired by earlier
/// steps have already been released, newest first, when this is returned.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("pseudo-console facility unavailable: {0}")]
    BackendUnavailable(#[source] io::Error),

    #[error("invalid console size {cols}x{rows}")]
    InvalidSize { cols: u32, rows: u32 },

    #[error("failed to allocate setup arena: {0}")]
    Arena(#[source] ArenaError),

    #[error("failed to create wake-up pipe: {0}")]
    Pipe(#[source] io::Error),

    #[error("failed to create pseudo-console: {0}")]
    Console(#[source] io::Error),

    #[error("failed to open console endpoints: {0}")]
    Endpoints(#[source] io::Error),

    #[error("failed to build child attribute list: {0}")]
    Attributes(#[source] ArenaError),

    #[error("failed to spawn child process: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to start output pump: {0}")]
    PumpStart(#[source] io::Error),

    #[error("failed to create control channel: {0}")]
    ControlChannel(#[source] io::Error),

    #[error("session id {0:?} is already in use")]
    DuplicateId(String),
}

impl SetupError {
    /// Exit code identifying the failed step
    pub fn exit_code(&self) -> u8 {
        match self {
            SetupError::InvalidArgs(_) => exit_code::INVALID_ARGS,
            SetupError::BackendUnavailable(_) => exit_code::BACKEND_UNAVAILABLE,
            SetupError::InvalidSize { .. } => exit_code::INVALID_SIZE,
            SetupError::Arena(_) => exit_code::ARENA,
            SetupError::Pipe(_) => exit_code::PIPE,
            SetupError::Console(_) => exit_code::CONSOLE,
            SetupError::Endpoints(_) => exit_code::ENDPOINTS,
            SetupError::Attributes(_) => exit_code::ATTRIBUTES,
            SetupError::Spawn(_) => exit_code::SPAWN,
            SetupError::PumpStart(_) => exit_code::PUMP_START,
            SetupError::ControlChannel(_) => exit_code::CONTROL_CHANNEL,
            SetupError::DuplicateId(_) => exit_code::DUPLICATE_ID,
        }
    }
}

/// Failure of an operation on a live session
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is not running")]
    NotRunning,

    #[error("invalid console size {cols}x{rows}")]
    InvalidSize { cols: u32, rows: u32 },

    #[error("failed to resize console: {0}")]
    Resize(#[source] io::Error),

    #[error("child input is closed")]
    InputClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure of the `resize` client talking to a running proxy
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid console size {cols}x{rows}")]
    InvalidSize { cols: u32, rows: u32 },

    #[error("invalid session id {0:?}")]
    InvalidId(String),

    #[error("no live session with id {id:?}: {source}")]
    UnknownSession {
        id: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// Exit code reported by the `resize` subcommand
    pub fn exit_code(&self) -> u8 {
        match self {
            ClientError::InvalidSize { .. } => exit_code::INVALID_SIZE,
            ClientError::InvalidId(_) => exit_code::INVALID_ARGS,
            ClientError::UnknownSession { .. } => exit_code::UNKNOWN_SESSION,
            ClientError::Io(_) => exit_code::IO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_exit_codes_are_distinct() {
        let errors = [
            SetupError::InvalidArgs(String::new()),
            SetupError::DuplicateId("a".into()),
            SetupError::ControlChannel(io::Error::other("x")),
            SetupError::BackendUnavailable(io::Error::other("x")),
            SetupError::InvalidSize { cols: 0, rows: 0 },
            SetupError::Pipe(io::Error::other("x")),
            SetupError::Console(io::Error::other("x")),
            SetupError::Endpoints(io::Error::other("x")),
            SetupError::Attributes(ArenaError::Overflow),
            SetupError::Spawn(io::Error::other("x")),
            SetupError::PumpStart(io::Error::other("x")),
            SetupError::Arena(ArenaError::OutOfMemory(8)),
        ];
        let mut codes: Vec<u8> = errors.iter().map(SetupError::exit_code).collect();
        assert!(codes.iter().all(|&c| c != 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_error_messages() {
        let err = SetupError::InvalidSize { cols: 0, rows: 24 };
        assert_eq!(err.to_string(), "invalid console size 0x24");

        let err = ClientError::UnknownSession {
            id: "s1".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(err.exit_code(), exit_code::UNKNOWN_SESSION);
        assert!(err.to_string().contains("\"s1\""));
    }
}
