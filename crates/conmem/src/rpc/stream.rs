//! Blocking request/response framing over the surrogate socket.

use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use super::protocol::{Command, encode_header};
use crate::error::{Error, Result};

/// Host side of the protocol, driven only from the transport worker thread.
///
/// Socket read timeouts are treated as poll ticks; the real bound is an explicit
/// deadline per `read_fully`.
pub struct ProtocolStream<S> {
    inner: S,
    deadline: Duration,
    poll_interval: Duration,
}

impl<S: Read + Write> ProtocolStream<S> {
    pub fn new(inner: S, deadline: Duration, poll_interval: Duration) -> Self {
        Self {
            inner,
            deadline,
            poll_interval,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Send one request made of the concatenation of `parts`
    pub fn write_packet(&mut self, command: Command, parts: &[&[u8]]) -> Result<()> {
        let len: usize = parts.iter().map(|p| p.len()).sum();
        if len > command.payload_limit() {
            return Err(Error::protocol(
                command,
                format!("payload of {} bytes exceeds {}", len, command.payload_limit()),
            ));
        }

        self.inner.write_all(&encode_header(command, len))?;
        for part in parts.iter().filter(|p| !p.is_empty()) {
            self.inner.write_all(part)?;
        }
        self.inner.flush()?;
        Ok(())
    }

    /// Fill `buffer` completely.
    ///
    /// A zero-byte read is retried once after a short sleep; a second consecutive one
    /// means the peer is gone. Timed-out reads are retried until the deadline passes.
    pub fn read_fully(&mut self, command: Command, buffer: &mut [u8]) -> Result<()> {
        let started = Instant::now();
        let mut filled = 0;
        let mut zero_reads = 0;

        while filled < buffer.len() {
            match self.inner.read(&mut buffer[filled..]) {
                Ok(0) => {
                    zero_reads += 1;
                    if zero_reads >= 2 {
                        return Err(Error::Timeout(format!(
                            "reading {} response: peer sent no data ({} of {} bytes)",
                            command,
                            filled,
                            buffer.len()
                        )));
                    }
                    thread::sleep(self.poll_interval);
                }
                Ok(n) => {
                    filled += n;
                    zero_reads = 0;
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }

            if filled < buffer.len() && started.elapsed() >= self.deadline {
                return Err(Error::Timeout(format!(
                    "reading {} response after {:?} ({} of {} bytes)",
                    command,
                    self.deadline,
                    filled,
                    buffer.len()
                )));
            }
        }
        Ok(())
    }

    pub fn read_u8(&mut self, command: Command) -> Result<u8> {
        let mut raw = [0u8; 1];
        self.read_fully(command, &mut raw)?;
        Ok(raw[0])
    }

    pub fn read_u16(&mut self, command: Command) -> Result<u16> {
        let mut raw = [0u8; 2];
        self.read_fully(command, &mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }

    pub fn read_u32(&mut self, command: Command) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.read_fully(command, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn read_i32(&mut self, command: Command) -> Result<i32> {
        let mut raw = [0u8; 4];
        self.read_fully(command, &mut raw)?;
        Ok(i32::from_le_bytes(raw))
    }

    /// `i32` length followed by ASCII text
    pub fn read_tagged_string(&mut self, command: Command) -> Result<String> {
        let len = self.read_i32(command)?;
        let len = usize::try_from(len)
            .ok()
            .filter(|&len| len <= u16::MAX as usize)
            .ok_or_else(|| Error::protocol(command, format!("bad string length {}", len)))?;
        let mut raw = vec![0u8; len];
        self.read_fully(command, &mut raw)?;
        Ok(super::protocol::ascii_lossy(&raw))
    }

    /// Read the argument count and require it to be `expected`
    pub fn expect_argc(&mut self, command: Command, expected: u8) -> Result<()> {
        let argc = self.read_u8(command)?;
        if argc != expected {
            return Err(Error::protocol(
                command,
                format!("expected {} response values, got {}", expected, argc),
            ));
        }
        Ok(())
    }
}
