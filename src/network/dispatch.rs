//! Message Dispatcher
//!
//! Routes inbound cluster messages to the handler registered for their
//! subject. A fixed pool of workers processes ordinary messages from a
//! bounded queue; background subjects (anti-entropy) go to one dedicated
//! worker so periodic repair never competes with live updates.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::protocol::ClusterMessage;
use crate::error::Result;

/// Handler for messages of one or more subjects
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: ClusterMessage) -> Result<()>;
}

/// Per-subject message router with a bounded worker pool
pub struct MessageDispatcher {
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    background: RwLock<HashSet<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl MessageDispatcher {
    pub fn new() -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            background: RwLock::new(HashSet::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown,
        })
    }

    /// Register a handler for a subject, replacing any previous one
    pub fn register(&self, subject: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let subject = subject.into();
        tracing::debug!("Registered handler for {}", subject);
        self.handlers.write().insert(subject, handler);
    }

    /// Register a handler whose messages run on the background worker
    pub fn register_background(&self, subject: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let subject = subject.into();
        self.background.write().insert(subject.clone());
        self.register(subject, handler);
    }

    /// Remove the handler of a subject
    pub fn unregister(&self, subject: &str) {
        self.handlers.write().remove(subject);
        self.background.write().remove(subject);
    }

    /// Whether a handler is registered for the subject
    pub fn has_handler(&self, subject: &str) -> bool {
        self.handlers.read().contains_key(subject)
    }

    /// Run the handler of a message on the current task
    pub async fn dispatch(&self, message: ClusterMessage) {
        let handler = self.handlers.read().get(&message.subject).cloned();
        match handler {
            Some(handler) => {
                let subject = message.subject.clone();
                let sender = message.sender.clone();
                if let Err(e) = handler.handle(message).await {
                    tracing::warn!("Failed to handle {} from {}: {}", subject, sender, e);
                }
            }
            None => {
                tracing::debug!("No handler for {} from {}", message.subject, message.sender);
            }
        }
    }

    /// Start pulling from the inbound queue with `workers` workers
    pub fn start(self: &Arc<Self>, mut inbound: mpsc::Receiver<ClusterMessage>, workers: usize, queue_size: usize) {
        let workers = workers.max(1);
        let (work_tx, work_rx) = mpsc::channel::<ClusterMessage>(queue_size.max(1));
        let (bg_tx, mut bg_rx) = mpsc::channel::<ClusterMessage>(queue_size.max(1));
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let mut tasks = self.tasks.lock();

        // Router
        let dispatcher = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    message = inbound.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                    _ = shutdown_rx.changed() => break,
                };
                let target = if dispatcher.background.read().contains(&message.subject) {
                    &bg_tx
                } else {
                    &work_tx
                };
                if target.send(message).await.is_err() {
                    break;
                }
            }
            tracing::debug!("Message router stopped");
        }));

        for worker in 0..workers {
            let dispatcher = Arc::clone(self);
            let work_rx = Arc::clone(&work_rx);
            tasks.push(tokio::spawn(async move {
                loop {
                    let message = { work_rx.lock().await.recv().await };
                    match message {
                        Some(message) => dispatcher.dispatch(message).await,
                        None => break,
                    }
                }
                tracing::trace!("Message worker {} stopped", worker);
            }));
        }

        let dispatcher = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            while let Some(message) = bg_rx.recv().await {
                dispatcher.dispatch(message).await;
            }
            tracing::trace!("Background worker stopped");
        }));

        tracing::info!("Message dispatcher started with {} workers", workers);
    }

    /// Stop accepting inbound messages, drain queued work and wait for the
    /// workers to finish
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Message worker failed: {}", e);
            }
        }
        self.handlers.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodeId;
    use crate::network::subjects;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    #[async_trait]
    impl MessageHandler for Counter {
        async fn handle(&self, _message: ClusterMessage) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn msg(subject: &str) -> ClusterMessage {
        ClusterMessage::new(NodeId::from("node-2"), subject, &0u8).unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_by_subject() {
        let dispatcher = MessageDispatcher::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        dispatcher.register(subjects::LINK_UPDATE, counter.clone());

        dispatcher.dispatch(msg(subjects::LINK_UPDATE)).await;
        dispatcher.dispatch(msg(subjects::LINK_REMOVED)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        dispatcher.unregister(subjects::LINK_UPDATE);
        assert!(!dispatcher.has_handler(subjects::LINK_UPDATE));
    }

    #[tokio::test]
    async fn test_workers_drain_on_shutdown() {
        let dispatcher = MessageDispatcher::new();
        let live = Arc::new(Counter(AtomicUsize::new(0)));
        let background = Arc::new(Counter(AtomicUsize::new(0)));
        dispatcher.register(subjects::LINK_UPDATE, live.clone());
        dispatcher.register_background(subjects::LINK_ANTI_ENTROPY_ADVERTISEMENT, background.clone());

        let (tx, rx) = mpsc::channel(64);
        dispatcher.start(rx, 3, 64);
        for _ in 0..10 {
            tx.send(msg(subjects::LINK_UPDATE)).await.unwrap();
        }
        tx.send(msg(subjects::LINK_ANTI_ENTROPY_ADVERTISEMENT)).await.unwrap();
        drop(tx);

        // closing the inbound queue lets the router and workers run dry
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while live.0.load(Ordering::SeqCst) < 10 || background.0.load(Ordering::SeqCst) < 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        dispatcher.shutdown().await;
        assert_eq!(live.0.load(Ordering::SeqCst), 10);
        assert_eq!(background.0.load(Ordering::SeqCst), 1);
    }
}
