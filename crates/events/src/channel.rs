//! Bounded one-way channel for progress and log messages.
//!
//! Senders never block: pushing takes a short lock on an in-memory queue.
//! When the queue is at capacity the oldest queued log line is dropped to
//! make room. Progress messages are never dropped; if the queue holds only
//! progress messages it is allowed to grow past capacity, which stays
//! bounded in practice because progress is emitted at a bounded rate.
//!
//! There is a single receiver, which may either await messages or poll
//! with [`EventReceiver::try_recv`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stagehand_core::profiler::ProgressSnapshot;
use stagehand_core::types::Phase;
use tokio::sync::Notify;

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A message for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEvent {
    /// Overall progress. Never dropped.
    Progress {
        percent: f64,
        phase: Option<Phase>,
        /// Remaining seconds, if an estimate exists.
        eta_secs: Option<f64>,
        timestamp: DateTime<Utc>,
    },
    /// A log line. Dropped (oldest first) under backpressure.
    Log {
        level: LogLevel,
        text: String,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn progress(percent: f64, phase: Option<Phase>, eta: Option<Duration>) -> Self {
        Self::Progress {
            percent,
            phase,
            eta_secs: eta.map(|d| d.as_secs_f64()),
            timestamp: Utc::now(),
        }
    }

    pub fn log(level: LogLevel, text: impl Into<String>) -> Self {
        Self::Log {
            level,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_log(&self) -> bool {
        matches!(self, Self::Log { .. })
    }
}

impl From<ProgressSnapshot> for JobEvent {
    fn from(snapshot: ProgressSnapshot) -> Self {
        Self::progress(snapshot.percent, snapshot.phase, snapshot.eta)
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

struct Shared {
    queue: Mutex<VecDeque<JobEvent>>,
    notify: Notify,
    capacity: usize,
    senders: AtomicUsize,
    receiver_alive: AtomicBool,
    dropped_logs: AtomicU64,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<JobEvent>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Create a channel holding up to `capacity` messages (minimum 1).
pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        notify: Notify::new(),
        capacity: capacity.max(1),
        senders: AtomicUsize::new(1),
        receiver_alive: AtomicBool::new(true),
        dropped_logs: AtomicU64::new(0),
    });
    (
        EventSender {
            shared: Arc::clone(&shared),
        },
        EventReceiver { shared },
    )
}

/// Producer handle. Cheap to clone; sending never blocks.
pub struct EventSender {
    shared: Arc<Shared>,
}

impl EventSender {
    /// Queue an event, applying the backpressure policy.
    ///
    /// If the receiver is gone the event is discarded.
    pub fn send(&self, event: JobEvent) {
        if !self.shared.receiver_alive.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.shared.queue();
            if queue.len() >= self.shared.capacity {
                if let Some(oldest_log) = queue.iter().position(JobEvent::is_log) {
                    queue.remove(oldest_log);
                    self.shared.dropped_logs.fetch_add(1, Ordering::Relaxed);
                } else if event.is_log() {
                    self.shared.dropped_logs.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
            queue.push_back(event);
        }
        self.shared.notify.notify_one();
    }

    pub fn progress(&self, snapshot: ProgressSnapshot) {
        self.send(snapshot.into());
    }

    pub fn log(&self, level: LogLevel, text: impl Into<String>) {
        self.send(JobEvent::log(level, text));
    }

    pub fn info(&self, text: impl Into<String>) {
        self.log(LogLevel::Info, text);
    }

    pub fn warn(&self, text: impl Into<String>) {
        self.log(LogLevel::Warn, text);
    }

    pub fn error(&self, text: impl Into<String>) {
        self.log(LogLevel::Error, text);
    }
}

impl Clone for EventSender {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for EventSender {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Last sender gone: wake the receiver so it can observe closure.
            self.shared.notify.notify_one();
        }
    }
}

/// Consumer handle.
pub struct EventReceiver {
    shared: Arc<Shared>,
}

impl EventReceiver {
    /// Wait for the next event. Returns `None` once every sender is dropped
    /// and the queue is drained.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.shared.senders.load(Ordering::Acquire) == 0 {
                return self.try_recv();
            }
            self.shared.notify.notified().await;
        }
    }

    /// Take the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<JobEvent> {
        self.shared.queue().pop_front()
    }

    /// Take every queued event without waiting.
    pub fn drain(&mut self) -> Vec<JobEvent> {
        self.shared.queue().drain(..).collect()
    }

    /// Number of log lines discarded under backpressure so far.
    pub fn dropped_logs(&self) -> u64 {
        self.shared.dropped_logs.load(Ordering::Relaxed)
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        self.shared.receiver_alive.store(false, Ordering::Release);
    }
}
