//! [`Connection`] over a surrogate session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::session::SurrogateSession;
use crate::connection::{
    AddressRange, Connection, FeatureSet, OperationGuard, ProcessControl, ProcessInfo,
};
use crate::error::{Error, Result};

/// Console memory reached through the surrogate.
///
/// The console is big-endian and its whole 32-bit space is addressable. When the session
/// fails the connection closes itself and the surrogate is killed.
pub struct SurrogateConnection {
    session: Arc<SurrogateSession>,
    console: String,
    connected: Arc<AtomicBool>,
    guard: OperationGuard,
    features: FeatureSet,
    watcher: CancellationToken,
}

impl SurrogateConnection {
    /// Connect `session` to the console at `ip`.
    ///
    /// Must be called within a tokio runtime. The session is shut down if the console
    /// refuses the connection.
    pub async fn connect(session: SurrogateSession, ip: &str) -> Result<Self> {
        let session = Arc::new(session);
        match session.connect_to_console(ip).await {
            Ok(true) => {}
            Ok(false) => {
                session.shutdown();
                return Err(Error::ConsoleConnectFailed(ip.to_string()));
            }
            Err(e) => {
                session.shutdown();
                return Err(e);
            }
        }
        info!("Connected to console {} via surrogate port {}", ip, session.port());

        let mut features = FeatureSet::new();
        features.insert::<dyn ProcessControl>(Arc::new(SessionProcesses(Arc::downgrade(
            &session,
        ))));

        let connected = Arc::new(AtomicBool::new(true));
        let watcher = CancellationToken::new();
        spawn_failure_watch(&session, Arc::clone(&connected), watcher.clone());

        Ok(Self {
            session,
            console: ip.to_string(),
            connected,
            guard: OperationGuard::new(),
            features,
            watcher,
        })
    }

    pub fn console(&self) -> &str {
        &self.console
    }

    pub fn session(&self) -> &SurrogateSession {
        &self.session
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::ConnectionClosed)
        }
    }

    fn lost(&self, e: &Error) {
        if e.is_fatal_transport() && self.connected.swap(false, Ordering::SeqCst) {
            warn!("Console connection to {} lost: {}", self.console, e);
        }
    }
}

/// Close the connection as soon as the session records a failure
fn spawn_failure_watch(
    session: &Arc<SurrogateSession>,
    connected: Arc<AtomicBool>,
    stop: CancellationToken,
) {
    let mut failures = session.subscribe_failure();
    let session = Arc::downgrade(session);
    tokio::spawn(async move {
        let failed = async move {
            failures
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|failure| failure.clone())
        };
        tokio::select! {
            _ = stop.cancelled() => {}
            failure = failed => {
                connected.store(false, Ordering::SeqCst);
                warn!(
                    "Surrogate session failed: {}",
                    failure.as_deref().unwrap_or("session dropped")
                );
                if let Some(session) = session.upgrade() {
                    session.shutdown();
                }
            }
        }
    });
}

/// Keeps `Error::Cancelled` and range errors as they are, everything else gains the
/// address context
fn with_context(e: Error, address: u32, count: usize, write: bool) -> Error {
    match e {
        Error::AddressOverflow { .. } | Error::ConnectionClosed | Error::Cancelled => e,
        other if write => Error::MemoryWriteFailed {
            address,
            count,
            message: other.to_string(),
        },
        other => Error::MemoryReadFailed {
            address,
            count,
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl Connection for SurrogateConnection {
    fn connection_type(&self) -> &'static str {
        "Surrogate"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_little_endian(&self) -> bool {
        false
    }

    fn addressable_range(&self) -> AddressRange {
        AddressRange::full()
    }

    async fn read_bytes(&self, address: u32, buffer: &mut [u8]) -> Result<()> {
        self.ensure_connected()?;
        let _scope = self.guard.begin()?;
        match self.session.read_memory(address, buffer.len()).await {
            Ok(data) => {
                buffer.copy_from_slice(&data);
                Ok(())
            }
            Err(e) => {
                self.lost(&e);
                Err(with_context(e, address, buffer.len(), false))
            }
        }
    }

    async fn write_bytes(&self, address: u32, data: &[u8]) -> Result<()> {
        self.ensure_connected()?;
        let _scope = self.guard.begin()?;
        self.session.write_memory(address, data).await.map_err(|e| {
            self.lost(&e);
            with_context(e, address, data.len(), true)
        })
    }

    async fn is_memory_invalid_or_protected(&self, _address: u32, _count: u32) -> Result<Option<bool>> {
        Ok(Some(false))
    }

    async fn close(&self) -> Result<()> {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        self.watcher.cancel();
        if was_connected && !self.session.is_failed() {
            if let Err(e) = self.session.disconnect_from_console(false).await {
                debug!("Disconnect from {} failed: {}", self.console, e);
            }
        }
        self.session.shutdown();
        Ok(())
    }

    fn features(&self) -> &FeatureSet {
        &self.features
    }
}

impl Drop for SurrogateConnection {
    fn drop(&mut self) {
        self.watcher.cancel();
    }
}

struct SessionProcesses(Weak<SurrogateSession>);

impl SessionProcesses {
    fn session(&self) -> Result<Arc<SurrogateSession>> {
        self.0.upgrade().ok_or(Error::ConnectionClosed)
    }
}

#[async_trait]
impl ProcessControl for SessionProcesses {
    async fn attach_to_process(&self, pid: u32) -> Result<u32> {
        self.session()?.attach_to_process(pid).await
    }

    async fn find_game_process(&self) -> Result<Option<ProcessInfo>> {
        self.session()?.find_game_process().await
    }

    async fn enumerate_processes(&self) -> Result<Vec<ProcessInfo>> {
        self.session()?.enumerate_processes().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::connection::{ConnectionExt, try_get_feature};
    use crate::rpc::server::ImageBackend;
    use crate::rpc::session::test_support::*;

    const BASE: u32 = 0x8200_0000;

    async fn connect(backend: ImageBackend) -> Result<(SurrogateConnection, FakeLauncher)> {
        let (port, _server) = spawn_server(backend);
        let launcher = FakeLauncher::default();
        let session = SurrogateSession::start_with(&launcher, &test_config(port), None).await?;
        let connection = SurrogateConnection::connect(session, "192.168.1.20").await?;
        Ok((connection, launcher))
    }

    #[tokio::test]
    async fn test_big_endian_reads_and_writes() {
        let image = vec![0x12, 0x34, 0x56, 0x78, 0, 0, 0, 0];
        let (conn, _) = connect(ImageBackend::new(BASE, image)).await.unwrap();

        assert!(!conn.is_little_endian());
        assert_eq!(conn.addressable_range(), AddressRange::full());
        assert_eq!(conn.read_u32(BASE).await.unwrap(), 0x1234_5678);

        conn.write_u32(BASE + 4, 0xDEAD_BEEF).await.unwrap();
        assert_eq!(conn.read_vec(BASE + 4, 4).await.unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(
            conn.is_memory_invalid_or_protected(BASE, 4).await.unwrap(),
            Some(false)
        );
    }

    #[tokio::test]
    async fn test_process_control_feature() {
        let (conn, _) = connect(ImageBackend::new(BASE, vec![])).await.unwrap();
        let control = try_get_feature::<dyn ProcessControl, _>(&conn).unwrap();
        let game = control.find_game_process().await.unwrap().unwrap();
        assert_eq!(control.attach_to_process(game.pid).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refused_console_shuts_down_surrogate() {
        let backend = ImageBackend::new(BASE, vec![]).accept_console(false);
        let (port, _server) = spawn_server(backend);
        let launcher = FakeLauncher::default();
        let session = SurrogateSession::start_with(&launcher, &test_config(port), None)
            .await
            .unwrap();

        let result = SurrogateConnection::connect(session, "10.0.0.9").await;
        assert!(matches!(result, Err(Error::ConsoleConnectFailed(ip)) if ip == "10.0.0.9"));
        assert!(launcher.killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_close_disconnects_and_kills() {
        let (conn, launcher) = connect(ImageBackend::new(BASE, vec![0; 4])).await.unwrap();
        conn.close().await.unwrap();

        assert!(!conn.is_connected());
        assert!(launcher.killed.load(Ordering::SeqCst));
        assert!(matches!(conn.read_vec(BASE, 4).await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_session_failure_closes_connection() {
        let backend = ImageBackend::new(BASE, vec![0; 4]).with_processes(None);
        let (conn, launcher) = connect(backend).await.unwrap();
        let control = try_get_feature::<dyn ProcessControl, _>(&conn).unwrap();
        assert!(control.enumerate_processes().await.is_err());

        for _ in 0..200 {
            if !conn.is_connected() && launcher.killed.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!conn.is_connected());
        assert!(launcher.killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_write_errors_carry_address() {
        let (conn, _) = connect(ImageBackend::new(BASE, vec![0; 4])).await.unwrap();
        let err = conn.write_bytes(BASE + 2, &[1; 8]).await.unwrap_err();
        assert!(matches!(err, Error::MemoryWriteFailed { address, count: 8, .. } if address == BASE + 2));
        assert!(!conn.is_connected());
    }
}
