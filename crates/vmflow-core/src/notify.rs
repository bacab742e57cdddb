// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fire-and-forget notifications.
//!
//! Tasks must not block on, or fail because of, progress notifications. The
//! [`DetachedNotifier`] hands events to a bounded queue drained by a
//! background worker; delivery errors and a full queue are logged and
//! otherwise ignored.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Destination for detached notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    /// Event type delivered by this sink.
    type Event: Send + std::fmt::Debug + 'static;

    /// Deliver one event.
    async fn deliver(
        &self,
        event: Self::Event,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

enum Message<E> {
    Event(E),
    Flush(oneshot::Sender<()>),
}

/// Sending half of a background notification worker.
pub struct DetachedNotifier<E> {
    tx: mpsc::Sender<Message<E>>,
}

impl<E> Clone for DetachedNotifier<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E> std::fmt::Debug for DetachedNotifier<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetachedNotifier")
            .field("capacity", &self.tx.max_capacity())
            .finish()
    }
}

impl<E: Send + std::fmt::Debug + 'static> DetachedNotifier<E> {
    /// Spawn the background worker.
    ///
    /// The worker exits when `shutdown` is cancelled or every notifier
    /// handle has been dropped.
    pub fn spawn<K>(
        sink: Arc<K>,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>)
    where
        K: NotificationSink<Event = E>,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_worker(sink, rx, shutdown));
        (Self { tx }, handle)
    }

    /// Queue an event without waiting. Returns `false` if it was dropped.
    pub fn notify(&self, event: E) -> bool {
        match self.tx.try_send(Message::Event(event)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(Message::Event(event))) => {
                warn!(event = ?event, "Notification queue full, dropping event");
                false
            }
            Err(_) => {
                warn!("Notification worker stopped, dropping event");
                false
            }
        }
    }

    /// Wait until every event queued before this call has been handled.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Message::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run_worker<K: NotificationSink>(
    sink: Arc<K>,
    mut rx: mpsc::Receiver<Message<K::Event>>,
    shutdown: CancellationToken,
) {
    debug!("Notification worker started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Notification worker shutting down");
                break;
            }
            message = rx.recv() => {
                match message {
                    Some(Message::Event(event)) => {
                        if let Err(e) = sink.deliver(event).await {
                            warn!(error = %e, "Failed to deliver notification");
                        }
                    }
                    Some(Message::Flush(done)) => {
                        let _ = done.send(());
                    }
                    None => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        type Event = u32;

        async fn deliver(
            &self,
            event: u32,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            if event == 13 {
                return Err("unlucky".into());
            }
            self.delivered.lock().unwrap().push(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let (notifier, _handle) =
            DetachedNotifier::spawn(sink.clone(), 8, CancellationToken::new());

        assert!(notifier.notify(1));
        assert!(notifier.notify(13));
        assert!(notifier.notify(2));
        notifier.flush().await;

        // A failed delivery does not stop the worker
        assert_eq!(*sink.delivered.lock().unwrap(), vec![1, 2]);
    }

    struct BlockingSink {
        started: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl NotificationSink for BlockingSink {
        type Event = u32;

        async fn deliver(
            &self,
            _event: u32,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_event() {
        let sink = Arc::new(BlockingSink {
            started: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let (notifier, _handle) = DetachedNotifier::spawn(sink.clone(), 1, CancellationToken::new());

        assert!(notifier.notify(1));
        sink.started.notified().await;

        // Worker is busy with event 1; one slot left in the queue
        assert!(notifier.notify(2));
        assert!(!notifier.notify(3));

        sink.release.notify_one();
    }

    #[tokio::test]
    async fn test_stopped_worker_drops_events() {
        let sink = Arc::new(RecordingSink::default());
        let shutdown = CancellationToken::new();
        let (notifier, handle) = DetachedNotifier::spawn(sink.clone(), 4, shutdown.clone());
        shutdown.cancel();
        handle.await.unwrap();

        assert!(!notifier.notify(1));
        notifier.flush().await;
        assert!(sink.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_worker_exits_when_handles_dropped() {
        let sink = Arc::new(RecordingSink::default());
        let (notifier, handle) = DetachedNotifier::spawn(sink, 4, CancellationToken::new());
        drop(notifier);
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("worker should exit")
            .unwrap();
    }
}
