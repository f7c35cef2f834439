//! Surrogate side of the protocol.
//!
//! The real surrogate wraps a native console library; here the console is abstracted as a
//! [`SurrogateBackend`]. [`ImageBackend`] serves a memory image, which is enough to run
//! the host against a file without any hardware.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpListener;

use tracing::{debug, info, warn};

use super::protocol::{
    CHUNK_ERROR_FLAG, Command, MAX_PACKET_PAYLOAD, READ_CHUNK_SIZE, SELF_TEST_PARAM,
    SELF_TEST_VALUE, ascii_lossy, push_i32_tagged, read_u16_tagged,
};
use crate::connection::ProcessInfo;
use crate::error::{Error, Result};

/// The console operations a surrogate exposes
pub trait SurrogateBackend: Send {
    /// Load the native library; `false` on failure
    fn init(&mut self) -> bool;

    /// Connect to the console at `ip`; 0 on success
    fn connect(&mut self, ip: &str) -> i32;

    fn disconnect(&mut self) -> i32;

    /// Fill `buffer` from console memory; `false` if the read failed
    fn read_memory(&mut self, address: u32, buffer: &mut [u8]) -> bool;

    /// 0 on success
    fn write_memory(&mut self, address: u32, data: &[u8]) -> i32;

    fn attached_process(&self) -> u32;

    fn attach_process(&mut self, pid: u32);

    fn find_game_process(&mut self) -> Option<ProcessInfo>;

    /// `None` aborts the session, as the native library gives no partial list
    fn process_list(&mut self) -> Option<Vec<ProcessInfo>>;

    fn shutdown(&mut self) {}
}

/// Accept a single host connection on `listener` and serve it until it closes
pub fn serve<B: SurrogateBackend + ?Sized>(listener: &TcpListener, backend: &mut B) -> Result<()> {
    let (stream, peer) = listener.accept()?;
    stream.set_nodelay(true)?;
    info!("Surrogate host connected from {}", peer);
    serve_connection(stream, backend)
}

/// Run the command loop. Returns `Ok` when the host disconnects or sends exit.
pub fn serve_connection<S, B>(mut stream: S, backend: &mut B) -> Result<()>
where
    S: Read + Write,
    B: SurrogateBackend + ?Sized,
{
    let mut payload = vec![0u8; MAX_PACKET_PAYLOAD];
    loop {
        let mut header = [0u8; 8];
        match stream.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                debug!("Host closed the connection");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let id = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let Some(command) = Command::from_repr(id) else {
            return Err(invalid_data(format!("unknown command id {}", id)));
        };
        if len > MAX_PACKET_PAYLOAD {
            return Err(Error::protocol(command, format!("payload of {} bytes", len)));
        }
        stream.read_exact(&mut payload[..len])?;
        debug!("Processing {} with {} payload bytes", command, len);

        let mut response = Vec::new();
        let keep_running = dispatch(command, &payload[..len], backend, &mut response)?;
        stream.write_all(&response)?;
        stream.flush()?;

        if !keep_running {
            info!("Host requested surrogate exit");
            return Ok(());
        }
    }
}

fn invalid_data(message: String) -> Error {
    Error::Io(std::io::Error::new(ErrorKind::InvalidData, message))
}

fn require_len(command: Command, payload: &[u8], min: usize) -> Result<()> {
    if payload.len() < min {
        return Err(Error::protocol(
            command,
            format!("expected at least {} payload bytes, got {}", min, payload.len()),
        ));
    }
    Ok(())
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(raw)
}

/// Append the response for one request; `false` ends the loop
fn dispatch<B: SurrogateBackend + ?Sized>(
    command: Command,
    payload: &[u8],
    backend: &mut B,
    out: &mut Vec<u8>,
) -> Result<bool> {
    match command {
        Command::Init => {
            let ok = backend.init();
            out.extend_from_slice(&[1, ok as u8]);
        }
        Command::Exit => {
            backend.shutdown();
            out.push(0);
            return Ok(false);
        }
        Command::SelfTest => {
            if payload.is_empty() {
                out.push(2);
            } else {
                out.push(3);
                push_i32_tagged(out, read_u16_tagged(command, payload)?);
            }
            push_i32_tagged(out, SELF_TEST_PARAM.as_bytes());
            out.extend_from_slice(&SELF_TEST_VALUE.to_le_bytes());
        }
        Command::Connect => {
            require_len(command, payload, 2)?;
            let ip = ascii_lossy(read_u16_tagged(command, payload)?);
            out.push(1);
            out.extend_from_slice(&backend.connect(&ip).to_le_bytes());
        }
        Command::Disconnect => {
            out.push(1);
            out.extend_from_slice(&backend.disconnect().to_le_bytes());
        }
        Command::WriteMemory => {
            require_len(command, payload, 4)?;
            let address = le_u32(payload);
            out.push(1);
            out.extend_from_slice(&backend.write_memory(address, &payload[4..]).to_le_bytes());
        }
        Command::ReadMemory => {
            if payload.len() != 8 {
                return Err(Error::protocol(command, "expected 8 payload bytes"));
            }
            let address = le_u32(payload);
            let count = le_u32(&payload[4..]) as usize;
            write_read_response(backend, address, count, out);
        }
        Command::AttachProcess => {
            require_len(command, payload, 4)?;
            let previous = backend.attached_process();
            backend.attach_process(le_u32(payload));
            out.push(1);
            out.extend_from_slice(&previous.to_le_bytes());
        }
        Command::FindGameProcess => match backend.find_game_process() {
            Some(process) => {
                out.push(2);
                out.extend_from_slice(&process.pid.to_le_bytes());
                push_i32_tagged(out, process.name.as_bytes());
            }
            None => {
                out.push(1);
                out.extend_from_slice(&0u32.to_le_bytes());
            }
        },
        Command::EnumerateProcesses => {
            let Some(processes) = backend.process_list() else {
                return Err(Error::RemoteFailure { command, code: -1 });
            };
            let processes = &processes[..processes.len().min(u8::MAX as usize)];
            out.push(processes.len() as u8);
            for process in processes {
                out.extend_from_slice(&process.pid.to_le_bytes());
                push_i32_tagged(out, process.name.as_bytes());
            }
        }
    }
    Ok(true)
}

fn write_read_response<B: SurrogateBackend + ?Sized>(
    backend: &mut B,
    address: u32,
    count: usize,
    out: &mut Vec<u8>,
) {
    out.push(1);
    let mut chunk = vec![0u8; count.min(READ_CHUNK_SIZE)];
    let mut offset = 0usize;
    while offset < count {
        let size = (count - offset).min(READ_CHUNK_SIZE);
        let chunk_address = address.wrapping_add(offset as u32);
        if !backend.read_memory(chunk_address, &mut chunk[..size]) {
            warn!("Console read failed at {:#010X}", chunk_address);
            out.extend_from_slice(&CHUNK_ERROR_FLAG.to_le_bytes());
            return;
        }
        out.extend_from_slice(&(size as u16).to_le_bytes());
        out.extend_from_slice(&chunk[..size]);
        offset += size;
    }
}

/// Serves console memory from an in-memory image mapped at `base`
#[derive(Debug, Clone)]
pub struct ImageBackend {
    base: u32,
    image: Vec<u8>,
    processes: Option<Vec<ProcessInfo>>,
    attached: u32,
    initialised: bool,
    accept_console: bool,
    console: Option<String>,
}

impl ImageBackend {
    pub const DEFAULT_PID: u32 = 0x0100_0300;

    pub fn new(base: u32, image: Vec<u8>) -> Self {
        Self {
            base,
            image,
            processes: Some(vec![
                ProcessInfo {
                    pid: 0x0100_0100,
                    name: "/dev_flash/vsh/module/vsh.self".to_string(),
                },
                ProcessInfo {
                    pid: Self::DEFAULT_PID,
                    name: "/dev_hdd0/game/IMAGE0000/USRDIR/EBOOT.BIN".to_string(),
                },
            ]),
            attached: 0,
            initialised: false,
            accept_console: true,
            console: None,
        }
    }

    /// Replace the process table; `None` makes enumeration abort the session
    pub fn with_processes(mut self, processes: Option<Vec<ProcessInfo>>) -> Self {
        self.processes = processes;
        self
    }

    /// Whether console connect requests succeed
    pub fn accept_console(mut self, accept: bool) -> Self {
        self.accept_console = accept;
        self
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn console(&self) -> Option<&str> {
        self.console.as_deref()
    }

    fn span(&self, address: u32, count: usize) -> Option<std::ops::Range<usize>> {
        let start = address.checked_sub(self.base)? as usize;
        let end = start.checked_add(count)?;
        (end <= self.image.len()).then_some(start..end)
    }
}

impl SurrogateBackend for ImageBackend {
    fn init(&mut self) -> bool {
        self.initialised = true;
        true
    }

    fn connect(&mut self, ip: &str) -> i32 {
        if !self.initialised || !self.accept_console {
            return -1;
        }
        info!("Serving image as console {}", ip);
        self.console = Some(ip.to_string());
        0
    }

    fn disconnect(&mut self) -> i32 {
        self.console = None;
        0
    }

    fn read_memory(&mut self, address: u32, buffer: &mut [u8]) -> bool {
        match self.span(address, buffer.len()) {
            Some(span) => {
                buffer.copy_from_slice(&self.image[span]);
                true
            }
            None => false,
        }
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> i32 {
        match self.span(address, data.len()) {
            Some(span) => {
                self.image[span].copy_from_slice(data);
                0
            }
            None => 1,
        }
    }

    fn attached_process(&self) -> u32 {
        self.attached
    }

    fn attach_process(&mut self, pid: u32) {
        self.attached = pid;
    }

    fn find_game_process(&mut self) -> Option<ProcessInfo> {
        self.processes
            .as_ref()?
            .iter()
            .find(|p| !p.name.contains("dev_flash"))
            .cloned()
    }

    fn process_list(&mut self) -> Option<Vec<ProcessInfo>> {
        self.processes.clone()
    }
}
