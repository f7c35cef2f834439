//! One dedicated thread draining a single-slot action queue.

use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Runs on the worker thread; `Err` carries the message of a fatal failure
type Job<S> = Box<dyn FnOnce(&mut S) -> std::result::Result<(), String> + Send>;

/// Owns `S` on its own thread and runs submitted actions against it in order.
///
/// At most one action waits in the queue while another runs; submitting a further one
/// fails with [`Error::ActionAlreadyQueued`]. An action that fails with a fatal
/// transport error stops the worker for good and every later submission fails fast.
pub(crate) struct Worker<S> {
    sender: Mutex<Option<SyncSender<Job<S>>>>,
    failure: Arc<watch::Sender<Option<String>>>,
}

impl<S: Send + 'static> Worker<S> {
    pub fn spawn(name: &str, mut state: S) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<Job<S>>(1);
        let (failure, _) = watch::channel(None);
        let failure = Arc::new(failure);

        let thread_failure = Arc::clone(&failure);
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    if let Err(message) = job(&mut state) {
                        error!("Transport worker stopped: {}", message);
                        thread_failure.send_if_modified(|current| {
                            if current.is_some() {
                                return false;
                            }
                            *current = Some(message);
                            true
                        });
                        break;
                    }
                }
                debug!("Transport worker exiting");
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            failure,
        })
    }

    /// Queue `action`; the returned handle resolves once the worker has run it
    pub fn submit<T, F>(&self, cancel: Option<CancellationToken>, action: F) -> Result<Pending<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> Result<T> + Send + 'static,
    {
        if let Some(message) = self.failure() {
            return Err(Error::TransportFailed(message));
        }

        let (tx, rx) = oneshot::channel();
        let job: Job<S> = Box::new(move |state| {
            if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                let _ = tx.send(Err(Error::Cancelled));
                return Ok(());
            }

            match action(state) {
                Ok(value) => {
                    let _ = tx.send(Ok(value));
                    Ok(())
                }
                Err(e) if e.is_fatal_transport() => {
                    let message = e.to_string();
                    let _ = tx.send(Err(e));
                    Err(message)
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                    Ok(())
                }
            }
        });

        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            return Err(Error::TransportFailed("transport is shut down".to_string()));
        };
        match sender.try_send(job) {
            Ok(()) => Ok(Pending(rx)),
            Err(TrySendError::Full(_)) => Err(Error::ActionAlreadyQueued),
            Err(TrySendError::Disconnected(_)) => Err(Error::TransportFailed(
                self.failure()
                    .unwrap_or_else(|| "worker thread has exited".to_string()),
            )),
        }
    }

    pub async fn run<T, F>(&self, cancel: Option<CancellationToken>, action: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> Result<T> + Send + 'static,
    {
        self.submit(cancel, action)?.wait().await
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.borrow().clone()
    }

    pub fn subscribe_failure(&self) -> watch::Receiver<Option<String>> {
        self.failure.subscribe()
    }

    /// Stop accepting work; the thread exits after the queued action, if any
    pub fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

pub(crate) struct Pending<T>(oneshot::Receiver<Result<T>>);

impl<T> Pending<T> {
    pub async fn wait(self) -> Result<T> {
        self.0
            .await
            .map_err(|_| Error::TransportFailed("worker dropped the action".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[tokio::test]
    async fn test_actions_run_in_order_against_state() {
        let worker = Worker::spawn("test-worker", Vec::<u32>::new()).unwrap();
        for i in 0..5 {
            worker
                .run(None, move |log: &mut Vec<u32>| {
                    log.push(i);
                    Ok(())
                })
                .await
                .unwrap();
        }
        let log = worker.run(None, |log: &mut Vec<u32>| Ok(log.clone())).await.unwrap();
        assert_eq!(log, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_second_queued_action_is_rejected() {
        let worker = Worker::spawn("test-worker", ()).unwrap();
        let (started_tx, started_rx) = channel();
        let (release_tx, release_rx) = channel::<()>();

        let first = worker
            .submit(None, move |_: &mut ()| {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Ok(1)
            })
            .unwrap();
        started_rx.recv().unwrap();

        let second = worker.submit(None, |_: &mut ()| Ok(2)).unwrap();
        assert!(matches!(
            worker.submit(None, |_: &mut ()| Ok(3)),
            Err(Error::ActionAlreadyQueued)
        ));

        release_tx.send(()).unwrap();
        assert_eq!(first.wait().await.unwrap(), 1);
        assert_eq!(second.wait().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_fatal_failure_disables_worker() {
        let worker = Worker::spawn("test-worker", ()).unwrap();
        let mut failures = worker.subscribe_failure();

        let result: Result<()> = worker
            .run(None, |_: &mut ()| {
                Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "reset",
                )))
            })
            .await;
        assert!(matches!(result, Err(Error::Io(_))));

        failures.changed().await.unwrap();
        assert!(failures.borrow().as_deref().unwrap().contains("reset"));
        assert!(matches!(
            worker.run(None, |_: &mut ()| Ok(())).await,
            Err(Error::TransportFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_non_fatal_error_keeps_worker_alive() {
        let worker = Worker::spawn("test-worker", ()).unwrap();
        let result: Result<()> = worker
            .run(None, |_: &mut ()| Err(Error::InvalidAddress("x".into())))
            .await;
        assert!(result.is_err());
        assert_eq!(worker.run(None, |_: &mut ()| Ok(5)).await.unwrap(), 5);
        assert!(worker.failure().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_action_is_skipped() {
        let worker = Worker::spawn("test-worker", 0u32).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = worker
            .run(Some(cancel), |count: &mut u32| {
                *count += 1;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(worker.run(None, |count: &mut u32| Ok(*count)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closed_worker_rejects_work() {
        let worker = Worker::spawn("test-worker", ()).unwrap();
        worker.close();
        assert!(matches!(
            worker.run(None, |_: &mut ()| Ok(())).await,
            Err(Error::TransportFailed(_))
        ));
    }
}
