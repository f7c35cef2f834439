//! A live connection to one surrogate process.

use std::net::{Ipv4Addr, Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::launcher::{ProcessLauncher, SurrogateLauncher, SurrogateProcess};
use super::protocol::{
    CHUNK_ERROR_FLAG, Command, SELF_TEST_PARAM, SELF_TEST_TEXT, SELF_TEST_VALUE,
    WRITE_CHUNK_SIZE, u16_tagged,
};
use super::stream::ProtocolStream;
use super::worker::Worker;
use crate::config::TransportConfig;
use crate::connection::{ProcessInfo, check_span};
use crate::error::{Error, Result};

type Transport = ProtocolStream<TcpStream>;

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);
const SOCKET_POLL: Duration = Duration::from_millis(50);

/// Host end of the surrogate protocol.
///
/// Every request runs on a dedicated worker thread that owns the socket, so callers on
/// any runtime thread just await the reply. Only one request may be queued behind the
/// one in flight. The first fatal failure (socket error, timeout, framing mismatch)
/// marks the session failed; watch [`subscribe_failure`](Self::subscribe_failure) to
/// react to it.
pub struct SurrogateSession {
    worker: Worker<Transport>,
    control: TcpStream,
    process: Mutex<Option<Box<dyn SurrogateProcess>>>,
    port: u16,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for SurrogateSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurrogateSession")
            .field("port", &self.port)
            .field("failure", &self.failure())
            .finish_non_exhaustive()
    }
}

impl SurrogateSession {
    /// Launch the configured surrogate executable and bring the session up
    pub async fn start(config: &TransportConfig, cancel: Option<&CancellationToken>) -> Result<Self> {
        Self::start_with(&ProcessLauncher::from_config(config), config, cancel).await
    }

    /// Launch a surrogate through `launcher`, connect, self-test and initialise.
    ///
    /// On any failure the launched process is killed before the error is returned.
    pub async fn start_with(
        launcher: &dyn SurrogateLauncher,
        config: &TransportConfig,
        cancel: Option<&CancellationToken>,
    ) -> Result<Self> {
        let process = launcher.launch(config.port).await?;
        Self::establish(config, cancel, Some(process)).await
    }

    /// Attach to a surrogate that is already listening on `config.port`
    pub async fn connect_existing(
        config: &TransportConfig,
        cancel: Option<&CancellationToken>,
    ) -> Result<Self> {
        Self::establish(config, cancel, None).await
    }

    async fn establish(
        config: &TransportConfig,
        cancel: Option<&CancellationToken>,
        mut process: Option<Box<dyn SurrogateProcess>>,
    ) -> Result<Self> {
        let stream = match connect_loopback(config.port, config.connect_timeout, cancel).await {
            Ok(stream) => stream,
            Err(e) => {
                kill_process(&mut process);
                return Err(e);
            }
        };

        let session = Self::from_stream(stream, process, config)?;
        if let Err(e) = session.bring_up(cancel).await {
            warn!("Surrogate bring-up on port {} failed: {}", config.port, e);
            session.shutdown();
            return Err(e);
        }

        info!("Surrogate session ready on port {}", config.port);
        Ok(session)
    }

    fn from_stream(
        stream: TcpStream,
        mut process: Option<Box<dyn SurrogateProcess>>,
        config: &TransportConfig,
    ) -> Result<Self> {
        let control = match prepare_socket(&stream, config) {
            Ok(control) => control,
            Err(e) => {
                kill_process(&mut process);
                return Err(e);
            }
        };

        let transport =
            ProtocolStream::new(stream, config.read_deadline, config.read_poll_interval);
        let worker = match Worker::spawn("surrogate-rpc", transport) {
            Ok(worker) => worker,
            Err(e) => {
                let _ = control.shutdown(Shutdown::Both);
                kill_process(&mut process);
                return Err(e);
            }
        };

        Ok(Self {
            worker,
            control,
            process: Mutex::new(process),
            port: config.port,
            shut_down: AtomicBool::new(false),
        })
    }

    async fn bring_up(&self, cancel: Option<&CancellationToken>) -> Result<()> {
        self.self_test(cancel.cloned()).await?;
        if !self.init(cancel.cloned()).await? {
            return Err(Error::InitFailed);
        }
        Ok(())
    }

    async fn self_test(&self, cancel: Option<CancellationToken>) -> Result<()> {
        self.worker
            .run(cancel, |io: &mut Transport| {
                let command = Command::SelfTest;
                io.write_packet(command, &[&u16_tagged(command, SELF_TEST_TEXT.as_bytes())?])?;

                let argc = io.read_u8(command)?;
                if argc != 3 {
                    return Err(Error::SelfTestFailed(format!(
                        "expected 3 values, got {}",
                        argc
                    )));
                }
                let echoed = io.read_tagged_string(command)?;
                if echoed != SELF_TEST_TEXT {
                    return Err(Error::SelfTestFailed(format!("echoed {:?}", echoed)));
                }
                let param = io.read_tagged_string(command)?;
                if param != SELF_TEST_PARAM {
                    return Err(Error::SelfTestFailed(format!("parameter {:?}", param)));
                }
                let value = io.read_i32(command)?;
                if value != SELF_TEST_VALUE {
                    return Err(Error::SelfTestFailed(format!("value {}", value)));
                }
                debug!("Surrogate self-test passed");
                Ok(())
            })
            .await
    }

    async fn init(&self, cancel: Option<CancellationToken>) -> Result<bool> {
        self.worker
            .run(cancel, |io: &mut Transport| {
                io.write_packet(Command::Init, &[])?;
                io.expect_argc(Command::Init, 1)?;
                Ok(io.read_u8(Command::Init)? == 1)
            })
            .await
    }

    /// Ask the surrogate to connect to the console at `ip`
    pub async fn connect_to_console(&self, ip: &str) -> Result<bool> {
        let payload = u16_tagged(Command::Connect, ip.as_bytes())?;
        self.worker
            .run(None, move |io: &mut Transport| {
                io.write_packet(Command::Connect, &[&payload])?;
                io.expect_argc(Command::Connect, 1)?;
                Ok(io.read_i32(Command::Connect)? == 0)
            })
            .await
    }

    /// Disconnect from the console.
    ///
    /// With `wait_reply` false the reply is left unread, which desynchronises the
    /// stream; only do that right before [`shutdown`](Self::shutdown).
    pub async fn disconnect_from_console(&self, wait_reply: bool) -> Result<bool> {
        self.worker
            .run(None, move |io: &mut Transport| {
                io.write_packet(Command::Disconnect, &[])?;
                if !wait_reply {
                    return Ok(true);
                }
                io.expect_argc(Command::Disconnect, 1)?;
                Ok(io.read_i32(Command::Disconnect)? == 0)
            })
            .await
    }

    /// Read `count` bytes of console memory.
    ///
    /// If the console fails part-way the rest of the buffer stays zeroed.
    pub async fn read_memory(&self, address: u32, count: usize) -> Result<Vec<u8>> {
        check_span(address, count)?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let wire_count =
            u32::try_from(count).map_err(|_| Error::AddressOverflow { address, count })?;

        self.worker
            .run(None, move |io: &mut Transport| {
                let command = Command::ReadMemory;
                io.write_packet(command, &[&address.to_le_bytes(), &wire_count.to_le_bytes()])?;
                io.expect_argc(command, 1)?;

                let mut data = vec![0u8; count];
                let mut filled = 0;
                while filled < count {
                    let header = io.read_u16(command)?;
                    if header & CHUNK_ERROR_FLAG != 0 {
                        debug!(
                            "Console read failed at {:#010X}, zero-filling {} bytes",
                            address.wrapping_add(filled as u32),
                            count - filled
                        );
                        break;
                    }
                    let size = header as usize;
                    if size == 0 || size > count - filled {
                        return Err(Error::protocol(
                            command,
                            format!("chunk of {} bytes with {} outstanding", size, count - filled),
                        ));
                    }
                    io.read_fully(command, &mut data[filled..filled + size])?;
                    filled += size;
                }
                Ok(data)
            })
            .await
    }

    /// Write `data` to console memory in protocol-sized chunks
    pub async fn write_memory(&self, address: u32, data: &[u8]) -> Result<()> {
        check_span(address, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        let data = data.to_vec();

        self.worker
            .run(None, move |io: &mut Transport| {
                let command = Command::WriteMemory;
                let mut chunk_address = address;
                for chunk in data.chunks(WRITE_CHUNK_SIZE) {
                    io.write_packet(command, &[&chunk_address.to_le_bytes(), chunk])?;
                    io.expect_argc(command, 1)?;
                    let code = io.read_u32(command)?;
                    if code != 0 {
                        return Err(Error::RemoteFailure {
                            command,
                            code: code as i32,
                        });
                    }
                    chunk_address = chunk_address.wrapping_add(chunk.len() as u32);
                }
                Ok(())
            })
            .await
    }

    /// Attach to `pid`, returning the previously attached process id
    pub async fn attach_to_process(&self, pid: u32) -> Result<u32> {
        self.worker
            .run(None, move |io: &mut Transport| {
                io.write_packet(Command::AttachProcess, &[&pid.to_le_bytes()])?;
                io.expect_argc(Command::AttachProcess, 1)?;
                io.read_u32(Command::AttachProcess)
            })
            .await
    }

    pub async fn find_game_process(&self) -> Result<Option<ProcessInfo>> {
        self.worker
            .run(None, |io: &mut Transport| {
                let command = Command::FindGameProcess;
                io.write_packet(command, &[])?;
                match io.read_u8(command)? {
                    1 => {
                        io.read_u32(command)?;
                        Ok(None)
                    }
                    2 => {
                        let pid = io.read_u32(command)?;
                        let name = io.read_tagged_string(command)?;
                        Ok(Some(ProcessInfo { pid, name }))
                    }
                    argc => Err(Error::protocol(
                        command,
                        format!("expected 1 or 2 response values, got {}", argc),
                    )),
                }
            })
            .await
    }

    pub async fn enumerate_processes(&self) -> Result<Vec<ProcessInfo>> {
        self.worker
            .run(None, |io: &mut Transport| {
                let command = Command::EnumerateProcesses;
                io.write_packet(command, &[])?;
                let count = io.read_u8(command)?;
                let mut processes = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let pid = io.read_u32(command)?;
                    let name = io.read_tagged_string(command)?;
                    processes.push(ProcessInfo { pid, name });
                }
                Ok(processes)
            })
            .await
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn process_id(&self) -> Option<u32> {
        self.process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|p| p.id())
    }

    /// Message of the failure that stopped the session, if any
    pub fn failure(&self) -> Option<String> {
        self.worker.failure()
    }

    pub fn is_failed(&self) -> bool {
        self.failure().is_some()
    }

    pub fn subscribe_failure(&self) -> watch::Receiver<Option<String>> {
        self.worker.subscribe_failure()
    }

    /// Stop the worker, close the socket and kill the surrogate. Safe to call twice.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.worker.close();
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            debug!("Surrogate socket shutdown: {}", e);
        }
        kill_process(&mut self.process.lock().unwrap_or_else(PoisonError::into_inner));
        info!("Surrogate session on port {} shut down", self.port);
    }
}

impl Drop for SurrogateSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn kill_process(process: &mut Option<Box<dyn SurrogateProcess>>) {
    if let Some(mut process) = process.take() {
        match process.kill() {
            Ok(()) => debug!("Killed surrogate process {:?}", process.id()),
            Err(e) => warn!("Failed to kill surrogate process {:?}: {}", process.id(), e),
        }
    }
}

/// Connect to the surrogate on loopback, retrying while it is still starting up
async fn connect_loopback(
    port: u16,
    timeout: Duration,
    cancel: Option<&CancellationToken>,
) -> Result<TcpStream> {
    let connect = async {
        loop {
            match tokio::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    debug!("Surrogate not listening on port {} yet", port);
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    };
    let cancelled = async {
        match cancel {
            Some(cancel) => cancel.cancelled().await,
            None => std::future::pending().await,
        }
    };

    let stream = tokio::select! {
        biased;
        _ = cancelled => return Err(Error::Cancelled),
        result = tokio::time::timeout(timeout, connect) => result.map_err(|_| {
            Error::Timeout(format!("connecting to surrogate on port {}", port))
        })??,
    };

    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    Ok(stream)
}

/// Configure the blocking socket and return a handle used only for shutdown
fn prepare_socket(stream: &TcpStream, config: &TransportConfig) -> Result<TcpStream> {
    stream.set_nodelay(true)?;
    let poll = SOCKET_POLL
        .min(config.read_deadline)
        .max(Duration::from_millis(1));
    stream.set_read_timeout(Some(poll))?;
    Ok(stream.try_clone()?)
}
