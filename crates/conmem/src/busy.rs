//! Exclusive access to a single physical connection.
//!
//! Every consumer that touches the connection acquires a [`BusyToken`] first. Acquisition
//! waits asynchronously and gives up on timeout or cancellation by returning `None`, which
//! callers treat as "stale, try again later" rather than as a failure.

use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{Error, Result};

/// How long `begin_busy_operation` may wait
#[derive(Debug, Clone, Default)]
pub struct BusyRequest {
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
}

impl BusyRequest {
    /// Wait until the lock is free
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

impl From<Duration> for BusyRequest {
    fn from(timeout: Duration) -> Self {
        Self::new().timeout(timeout)
    }
}

impl From<CancellationToken> for BusyRequest {
    fn from(cancel: CancellationToken) -> Self {
        Self::new().cancel(cancel)
    }
}

struct Shared {
    permits: Arc<Semaphore>,
    busy: watch::Sender<bool>,
    release_requests: AtomicUsize,
    connection: Mutex<Option<Arc<dyn Connection>>>,
}

/// Single-slot arbiter guarding one connection. Cloning shares the same slot.
#[derive(Clone)]
pub struct BusyLock {
    shared: Arc<Shared>,
}

impl Default for BusyLock {
    fn default() -> Self {
        Self::new()
    }
}

impl BusyLock {
    pub fn new() -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                permits: Arc::new(Semaphore::new(1)),
                busy,
                release_requests: AtomicUsize::new(0),
                connection: Mutex::new(None),
            }),
        }
    }

    pub fn with_connection(connection: Arc<dyn Connection>) -> Self {
        let lock = Self::new();
        *lock.connection_slot() = Some(connection);
        lock
    }

    /// Racy hint for UI and back-off decisions
    pub fn is_busy(&self) -> bool {
        *self.shared.busy.borrow()
    }

    pub fn subscribe_busy(&self) -> watch::Receiver<bool> {
        self.shared.busy.subscribe()
    }

    /// Acquire only if nobody holds the lock right now
    pub fn try_begin_busy_operation(&self) -> Option<BusyToken> {
        let permit = self.shared.permits.clone().try_acquire_owned().ok()?;
        Some(self.issue(permit))
    }

    /// Wait for the lock. `None` means the timeout elapsed or the request was cancelled.
    pub async fn begin_busy_operation(&self, request: impl Into<BusyRequest>) -> Option<BusyToken> {
        let request = request.into();
        if request.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return None;
        }

        let acquire = self.shared.permits.clone().acquire_owned();
        let cancelled = async {
            match &request.cancel {
                Some(cancel) => cancel.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let permit = tokio::select! {
            biased;
            _ = cancelled => {
                debug!("Busy lock acquisition cancelled");
                return None;
            }
            permit = timeout_opt(request.timeout, acquire) => permit,
        };

        match permit {
            Some(Ok(permit)) => Some(self.issue(permit)),
            Some(Err(_)) => None,
            None => {
                debug!("Busy lock acquisition timed out");
                None
            }
        }
    }

    /// Like `begin_busy_operation`, but lets the current holder know someone is waiting
    /// so that long-running work can yield early.
    pub async fn begin_busy_operation_quick_release(
        &self,
        request: impl Into<BusyRequest>,
    ) -> Option<BusyToken> {
        let _pending = PendingRelease::new(&self.shared.release_requests);
        self.begin_busy_operation(request).await
    }

    /// Use `held` if it belongs to this lock, otherwise acquire a fresh token
    pub async fn acquire_or_borrow<'a>(
        &self,
        held: Option<&'a BusyToken>,
        request: impl Into<BusyRequest>,
    ) -> Option<HeldToken<'a>> {
        match held {
            Some(token) if self.is_token_valid(token) => Some(HeldToken::Borrowed(token)),
            _ => self
                .begin_busy_operation(request)
                .await
                .map(HeldToken::Owned),
        }
    }

    pub fn is_token_valid(&self, token: &BusyToken) -> bool {
        Arc::ptr_eq(&self.shared, &token.shared)
    }

    pub fn validate_token(&self, token: &BusyToken) -> Result<()> {
        if self.is_token_valid(token) {
            Ok(())
        } else {
            Err(Error::ForeignBusyToken)
        }
    }

    /// Snapshot of the guarded connection
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection_slot().clone()
    }

    /// Swap the guarded connection; only the current token holder may do this
    pub fn set_connection(
        &self,
        token: &BusyToken,
        connection: Option<Arc<dyn Connection>>,
    ) -> Result<Option<Arc<dyn Connection>>> {
        self.validate_token(token)?;
        Ok(std::mem::replace(&mut *self.connection_slot(), connection))
    }

    fn connection_slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn Connection>>> {
        self.shared
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn issue(&self, permit: OwnedSemaphorePermit) -> BusyToken {
        self.shared.busy.send_replace(true);
        BusyToken {
            shared: Arc::clone(&self.shared),
            _permit: permit,
        }
    }
}

async fn timeout_opt<F: Future>(timeout: Option<Duration>, future: F) -> Option<F::Output> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, future).await.ok(),
        None => Some(future.await),
    }
}

struct PendingRelease<'a>(&'a AtomicUsize);

impl<'a> PendingRelease<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for PendingRelease<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Permission to use the guarded connection; released on drop.
#[must_use = "the lock is released as soon as the token is dropped"]
pub struct BusyToken {
    shared: Arc<Shared>,
    _permit: OwnedSemaphorePermit,
}

impl BusyToken {
    /// Whether another caller asked for a quick release while this token is held
    pub fn is_release_requested(&self) -> bool {
        self.shared.release_requests.load(Ordering::Acquire) > 0
    }

    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.shared
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for BusyToken {
    fn drop(&mut self) {
        // the permit field is released after this body runs
        self.shared.busy.send_replace(false);
    }
}

impl std::fmt::Debug for BusyToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusyToken")
            .field("release_requested", &self.is_release_requested())
            .finish()
    }
}

/// A token either passed through from a caller that already holds the lock, or
/// acquired for the duration of one operation.
#[derive(Debug)]
pub enum HeldToken<'a> {
    Borrowed(&'a BusyToken),
    Owned(BusyToken),
}

impl Deref for HeldToken<'_> {
    type Target = BusyToken;

    fn deref(&self) -> &BusyToken {
        match self {
            HeldToken::Borrowed(token) => token,
            HeldToken::Owned(token) => token,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MockConnectionBuilder;

    #[tokio::test]
    async fn test_try_begin_is_exclusive() {
        let lock = BusyLock::new();
        let token = lock.try_begin_busy_operation().unwrap();
        assert!(lock.is_busy());
        assert!(lock.try_begin_busy_operation().is_none());

        drop(token);
        assert!(!lock.is_busy());
        assert!(lock.try_begin_busy_operation().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_none() {
        let lock = BusyLock::new();
        let _held = lock.try_begin_busy_operation().unwrap();

        let start = tokio::time::Instant::now();
        let token = lock
            .begin_busy_operation(Duration::from_millis(500))
            .await;
        assert!(token.is_none());
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_cancellation_returns_none() {
        let lock = BusyLock::new();
        let _held = lock.try_begin_busy_operation().unwrap();
        let cancel = CancellationToken::new();

        let waiter = {
            let lock = lock.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { lock.begin_busy_operation(cancel).await.is_some() })
        };
        tokio::task::yield_now().await;
        cancel.cancel();

        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_precancelled_request_never_acquires_free_lock() {
        let lock = BusyLock::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(lock.begin_busy_operation(cancel).await.is_none());
        assert!(!lock.is_busy());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_token_at_a_time() {
        let lock = BusyLock::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let lock = lock.clone();
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let _token = lock.begin_busy_operation(BusyRequest::new()).await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(!lock.is_busy());
    }

    #[tokio::test]
    async fn test_release_wakes_waiter() {
        let lock = BusyLock::new();
        let held = lock.try_begin_busy_operation().unwrap();
        let mut busy = lock.subscribe_busy();
        assert!(*busy.borrow_and_update());

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.begin_busy_operation(BusyRequest::new()).await.is_some() })
        };
        tokio::task::yield_now().await;
        drop(held);

        assert!(waiter.await.unwrap());
        assert!(busy.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_quick_release_request_is_visible_to_holder() {
        let lock = BusyLock::new();
        let held = lock.try_begin_busy_operation().unwrap();
        assert!(!held.is_release_requested());

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.begin_busy_operation_quick_release(BusyRequest::new())
                    .await
                    .is_some()
            })
        };
        while !held.is_release_requested() {
            tokio::task::yield_now().await;
        }

        drop(held);
        assert!(waiter.await.unwrap());

        let again = lock.try_begin_busy_operation().unwrap();
        assert!(!again.is_release_requested());
    }

    #[tokio::test]
    async fn test_tokens_are_bound_to_their_lock() {
        let lock = BusyLock::new();
        let other = BusyLock::new();
        let token = other.try_begin_busy_operation().unwrap();

        assert!(!lock.is_token_valid(&token));
        assert!(matches!(
            lock.validate_token(&token),
            Err(Error::ForeignBusyToken)
        ));
        assert!(lock.set_connection(&token, None).is_err());
    }

    #[tokio::test]
    async fn test_connection_swap_requires_token() {
        let lock = BusyLock::new();
        assert!(lock.connection().is_none());

        let token = lock.try_begin_busy_operation().unwrap();
        let conn: Arc<dyn Connection> = Arc::new(MockConnectionBuilder::new().build());
        let old = lock.set_connection(&token, Some(conn)).unwrap();
        assert!(old.is_none());
        assert_eq!(token.connection().unwrap().connection_type(), "Mock");
        assert_eq!(lock.connection().unwrap().connection_type(), "Mock");
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_token_passes_through_without_reacquiring() {
        let lock = BusyLock::new();
        let token = lock.try_begin_busy_operation().unwrap();

        let held = lock
            .acquire_or_borrow(Some(&token), Duration::from_millis(10))
            .await;
        assert!(matches!(held, Some(HeldToken::Borrowed(_))));

        let foreign = BusyLock::new().try_begin_busy_operation().unwrap();
        let held = lock
            .acquire_or_borrow(Some(&foreign), Duration::from_millis(10))
            .await;
        assert!(held.is_none());
    }
}
