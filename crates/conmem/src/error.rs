use thiserror::Error;

use crate::rpc::Command;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read console memory at {address:#010X} ({count} bytes): {message}")]
    MemoryReadFailed {
        address: u32,
        count: usize,
        message: String,
    },

    #[error("Failed to write console memory at {address:#010X} ({count} bytes): {message}")]
    MemoryWriteFailed {
        address: u32,
        count: usize,
        message: String,
    },

    #[error("Address range {address:#010X}+{count:#X} overflows the 32-bit address space")]
    AddressOverflow { address: u32, count: usize },

    #[error("Invalid memory address: {0}")]
    InvalidAddress(String),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Already busy performing another operation on this connection")]
    ConcurrentOperation,

    #[error("Protocol violation in {command}: {message}")]
    Protocol { command: Command, message: String },

    #[error("Surrogate reported failure for {command} (code {code})")]
    RemoteFailure { command: Command, code: i32 },

    #[error("Timed out {0}")]
    Timeout(String),

    #[error("Another action is already queued on the transport worker")]
    ActionAlreadyQueued,

    #[error("Transport has failed: {0}")]
    TransportFailed(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Busy token does not belong to this lock")]
    ForeignBusyToken,

    #[error("Failed to launch surrogate process: {0}")]
    LaunchFailed(String),

    #[error("Surrogate self-test failed: {0}")]
    SelfTestFailed(String),

    #[error("Surrogate failed to initialise the native library")]
    InitFailed,

    #[error("Could not connect to console {0}")]
    ConsoleConnectFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is a "file not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Errors after which a transport session cannot be used again
    pub fn is_fatal_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Protocol { .. }
                | Error::RemoteFailure { .. }
                | Error::Timeout(_)
                | Error::TransportFailed(_)
        )
    }

    pub(crate) fn protocol(command: Command, message: impl Into<String>) -> Self {
        Error::Protocol {
            command,
            message: message.into(),
        }
    }
}
