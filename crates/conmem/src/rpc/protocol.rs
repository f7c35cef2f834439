//! Wire format shared by the host and the surrogate.
//!
//! ```text
//! request   u32 command | u32 payload_len | payload
//! response  u8 argc | argc values (command specific)
//! ```
//!
//! All integers are little-endian. Strings in requests carry a `u16` length prefix,
//! strings in responses an `i32` length prefix, both followed by ASCII bytes.

use strum::{Display, FromRepr, IntoStaticStr};

use crate::error::{Error, Result};

/// Largest payload for ordinary requests
pub const MAX_REQUEST_PAYLOAD: usize = 0x1000;

/// Largest payload the surrogate accepts at all; only write-memory uses more than
/// `MAX_REQUEST_PAYLOAD`
pub const MAX_PACKET_PAYLOAD: usize = 0x10000;

/// Data bytes per write-memory request (packet cap minus the 4-byte address)
pub const WRITE_CHUNK_SIZE: usize = MAX_PACKET_PAYLOAD - 4;

/// Largest data chunk in a read-memory response
pub const READ_CHUNK_SIZE: usize = 0x7FFF;

/// Set in a read chunk header when the console read failed; no data follows
pub const CHUNK_ERROR_FLAG: u16 = 0x8000;

pub const SELF_TEST_TEXT: &str = "hello!!!";
pub const SELF_TEST_PARAM: &str = "This is param 1!!!";
pub const SELF_TEST_VALUE: i32 = 1_234_567;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, FromRepr)]
#[repr(u32)]
pub enum Command {
    #[strum(serialize = "init")]
    Init = 1,
    #[strum(serialize = "exit")]
    Exit = 2,
    #[strum(serialize = "self-test")]
    SelfTest = 3,
    #[strum(serialize = "connect")]
    Connect = 4,
    #[strum(serialize = "disconnect")]
    Disconnect = 5,
    #[strum(serialize = "write-memory")]
    WriteMemory = 9,
    #[strum(serialize = "read-memory")]
    ReadMemory = 10,
    #[strum(serialize = "attach-process")]
    AttachProcess = 22,
    #[strum(serialize = "find-game-process")]
    FindGameProcess = 23,
    #[strum(serialize = "enumerate-processes")]
    EnumerateProcesses = 24,
}

impl Command {
    pub fn id(self) -> u32 {
        self as u32
    }

    /// Payload cap enforced by the sender
    pub fn payload_limit(self) -> usize {
        match self {
            Command::WriteMemory => MAX_PACKET_PAYLOAD,
            _ => MAX_REQUEST_PAYLOAD,
        }
    }
}

pub fn encode_header(command: Command, payload_len: usize) -> [u8; 8] {
    let mut header = [0u8; 8];
    header[..4].copy_from_slice(&command.id().to_le_bytes());
    header[4..].copy_from_slice(&(payload_len as u32).to_le_bytes());
    header
}

/// `u16` length followed by the bytes
pub fn u16_tagged(command: Command, bytes: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(bytes.len())
        .map_err(|_| Error::protocol(command, format!("{} byte argument too long", bytes.len())))?;
    let mut out = Vec::with_capacity(2 + bytes.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(out)
}

/// Parse a `u16`-tagged argument from the start of a request payload
pub fn read_u16_tagged(command: Command, payload: &[u8]) -> Result<&[u8]> {
    let Some((len, rest)) = payload.split_first_chunk::<2>() else {
        return Err(Error::protocol(command, "missing length prefix"));
    };
    let len = u16::from_le_bytes(*len) as usize;
    rest.get(..len)
        .ok_or_else(|| Error::protocol(command, format!("argument truncated, wanted {} bytes", len)))
}

/// `i32` length followed by the bytes
pub fn push_i32_tagged(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as i32).to_le_bytes());
    out.extend_from_slice(bytes);
}

pub fn ascii_lossy(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '?' })
        .collect()
}
