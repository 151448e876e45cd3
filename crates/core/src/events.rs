//! Scheduler event bus
//!
//! Events are published through a bounded broadcast channel. Publishing never
//! waits on consumers: a receiver that falls behind loses the oldest events
//! and is told how many it missed. Registered [`EventSubscriber`]s each run
//! on their own forwarding task, so a slow or panicking subscriber cannot
//! stall the publisher or its peers.

use crate::types::{Priority, TaskId};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

/// Lifecycle events published by the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchedulerEvent {
    TaskAdded {
        task_id: TaskId,
        priority: Priority,
    },
    TaskStarted {
        task_id: TaskId,
    },
    TaskProgress {
        task_id: TaskId,
        percent: f32,
        message: String,
    },
    TaskSucceeded {
        task_id: TaskId,
        duration_ms: u64,
        from_cache: bool,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
        exit_code: Option<i32>,
    },
    TaskCancelled {
        task_id: TaskId,
        reason: String,
    },
    Error {
        task_id: Option<TaskId>,
        message: String,
    },
    Warning {
        task_id: Option<TaskId>,
        message: String,
    },
    ManagerPaused,
    ManagerResumed,
}

impl SchedulerEvent {
    /// The task this event concerns, if any
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::TaskAdded { task_id, .. }
            | Self::TaskStarted { task_id }
            | Self::TaskProgress { task_id, .. }
            | Self::TaskSucceeded { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskCancelled { task_id, .. } => Some(*task_id),
            Self::Error { task_id, .. } | Self::Warning { task_id, .. } => *task_id,
            Self::ManagerPaused | Self::ManagerResumed => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskAdded { .. } => "task_added",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskProgress { .. } => "task_progress",
            Self::TaskSucceeded { .. } => "task_succeeded",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskCancelled { .. } => "task_cancelled",
            Self::Error { .. } => "error",
            Self::Warning { .. } => "warning",
            Self::ManagerPaused => "manager_paused",
            Self::ManagerResumed => "manager_resumed",
        }
    }

    /// Whether this event ends a task's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::TaskSucceeded { .. } | Self::TaskFailed { .. } | Self::TaskCancelled { .. }
        )
    }
}

/// An event stamped by the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedEvent {
    pub sequence: u64,
    pub timestamp: SystemTime,
    pub event: SchedulerEvent,
}

/// Consumer registered on the bus
#[async_trait::async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn handle_event(
        &self,
        event: &PublishedEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Subscriber name for logs
    fn name(&self) -> &'static str;

    fn is_interested(&self, event: &SchedulerEvent) -> bool {
        let _ = event;
        true
    }
}

/// Event statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventStats {
    pub events_published: u64,
    pub events_handled: u64,
    pub events_failed: u64,
    pub events_dropped: u64,
    pub subscriber_count: usize,
}

#[derive(Debug, Default)]
struct StatCounters {
    published: AtomicU64,
    handled: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    subscribers: AtomicUsize,
}

/// Multicast bus for [`SchedulerEvent`]s
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PublishedEvent>,
    sequence: Arc<AtomicU64>,
    stats: Arc<StatCounters>,
    forwarders: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.sender.receiver_count())
            .field("published", &self.stats.published.load(Ordering::Relaxed))
            .finish()
    }
}

impl EventBus {
    /// Create a bus that buffers up to `capacity` events per receiver
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
            stats: Arc::new(StatCounters::default()),
            forwarders: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Publish an event. Never blocks.
    pub fn publish(&self, event: SchedulerEvent) {
        let published = PublishedEvent {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp: SystemTime::now(),
            event,
        };
        self.stats.published.fetch_add(1, Ordering::Relaxed);

        if self.sender.send(published).is_err() {
            trace!("event published with no receivers");
        }
    }

    /// Subscribe to the raw stream
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Attach a subscriber on its own forwarding task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register_subscriber(&self, subscriber: Arc<dyn EventSubscriber>) {
        let mut rx = self.sender.subscribe();
        let stats = Arc::clone(&self.stats);
        let name = subscriber.name();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if !subscriber.is_interested(&event.event) {
                            continue;
                        }
                        let outcome = AssertUnwindSafe(subscriber.handle_event(&event))
                            .catch_unwind()
                            .await;
                        match outcome {
                            Ok(Ok(())) => {
                                stats.handled.fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(Err(e)) => {
                                stats.failed.fetch_add(1, Ordering::Relaxed);
                                error!(subscriber = name, error = %e, "Failed to handle event");
                            }
                            Err(_) => {
                                stats.failed.fetch_add(1, Ordering::Relaxed);
                                error!(subscriber = name, "Event subscriber panicked");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        stats.dropped.fetch_add(missed, Ordering::Relaxed);
                        warn!(subscriber = name, missed, "Event subscriber lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut forwarders = self.forwarders.lock();
        forwarders.retain(|h| !h.is_finished());
        forwarders.push(handle);
        let count = self.stats.subscribers.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            subscriber_name = name,
            total_subscribers = count,
            "Registered event subscriber"
        );
    }

    pub fn stats(&self) -> EventStats {
        EventStats {
            events_published: self.stats.published.load(Ordering::Relaxed),
            events_handled: self.stats.handled.load(Ordering::Relaxed),
            events_failed: self.stats.failed.load(Ordering::Relaxed),
            events_dropped: self.stats.dropped.load(Ordering::Relaxed),
            subscriber_count: self.stats.subscribers.load(Ordering::Relaxed),
        }
    }

    /// Stop every subscriber forwarding task
    pub fn shutdown(&self) {
        for handle in self.forwarders.lock().drain(..) {
            handle.abort();
        }
        self.stats.subscribers.store(0, Ordering::Relaxed);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
