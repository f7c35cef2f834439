//! Binary RPC to a surrogate process that hosts the native console library.
//!
//! The host launches the surrogate with a loopback port, connects over TCP, verifies the
//! link with a self-test and asks the surrogate to initialise. From then on every request
//! is a single framed packet answered by a single response, serialised on one worker
//! thread.

mod connection;
mod launcher;
mod protocol;
pub mod server;
mod session;
mod stream;
mod worker;

pub use connection::SurrogateConnection;
pub use launcher::{ProcessLauncher, SurrogateLauncher, SurrogateProcess};
pub use protocol::{
    CHUNK_ERROR_FLAG, Command, MAX_PACKET_PAYLOAD, MAX_REQUEST_PAYLOAD, READ_CHUNK_SIZE,
    WRITE_CHUNK_SIZE,
};
pub use server::{ImageBackend, SurrogateBackend};
pub use session::SurrogateSession;
