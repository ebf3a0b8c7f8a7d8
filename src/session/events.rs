//! Events and the state published to connection handlers
//!
//! The executor is the only writer. Handlers read the last committed session
//! snapshot and the bounded event buffer, and long-poll for new events.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;

use super::state::{Outcome, Session, SessionStatus, SessionSummary};
use crate::exec::OutputStream;

/// Something that happened in the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    SessionCreated {
        session_id: String,
        test_plan: String,
        jobs: usize,
    },
    StatusChanged {
        status: SessionStatus,
    },
    JobStarted {
        job_id: String,
        index: usize,
        attempt: u32,
    },
    OutputChunk {
        job_id: String,
        stream: OutputStream,
        data: String,
    },
    JobFinished {
        job_id: String,
        outcome: Outcome,
        reason: Option<String>,
    },
    VerdictRequested {
        job_id: String,
        prompt: String,
    },
    SessionFinished {
        summary: SessionSummary,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// A verdict the session is waiting for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictRequest {
    pub job_id: String,
    pub prompt: String,
}

/// Reply to an events poll
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<Event>,
    /// Seq of the newest event the agent knows about
    pub last_seq: u64,
    pub boot_id: String,
    /// Events were lost; fetch the state again instead of replaying
    pub resync: bool,
}

/// The committed session as seen by controllers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub boot_id: String,
    /// Seq of the last event reflected in `session`
    pub seq: u64,
    pub session: Option<Session>,
    pub awaiting_verdict: Option<VerdictRequest>,
}

#[derive(Default)]
struct Published {
    session: Option<Session>,
    awaiting_verdict: Option<VerdictRequest>,
    events: VecDeque<Event>,
    last_seq: u64,
}

pub struct SharedState {
    boot_id: String,
    max_events: usize,
    inner: Mutex<Published>,
    notify: Notify,
}

impl SharedState {
    pub fn new(boot_id: impl Into<String>, max_events: usize) -> Self {
        Self {
            boot_id: boot_id.into(),
            max_events: max_events.max(1),
            inner: Mutex::new(Published::default()),
            notify: Notify::new(),
        }
    }

    pub fn boot_id(&self) -> &str {
        &self.boot_id
    }

    /// Append an event, evicting the oldest ones past the limit
    pub fn push_event(&self, event: Event) {
        {
            let mut inner = self.inner.lock();
            inner.last_seq = inner.last_seq.max(event.seq);
            while inner.events.len() >= self.max_events {
                inner.events.pop_front();
            }
            inner.events.push_back(event);
        }
        self.notify.notify_waiters();
    }

    /// Publish a committed session
    pub fn publish(&self, session: &Session) {
        let mut inner = self.inner.lock();
        inner.last_seq = inner.last_seq.max(session.event_seq);
        inner.session = Some(session.clone());
    }

    pub fn set_awaiting_verdict(&self, request: Option<VerdictRequest>) {
        self.inner.lock().awaiting_verdict = request;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock();
        SessionSnapshot {
            boot_id: self.boot_id.clone(),
            seq: inner.session.as_ref().map(|s| s.event_seq).unwrap_or(0),
            session: inner.session.clone(),
            awaiting_verdict: inner.awaiting_verdict.clone(),
        }
    }

    /// Events newer than `after`, without waiting
    pub fn events_after(&self, after: u64, boot_id: Option<&str>) -> EventPage {
        let inner = self.inner.lock();
        let mut page = EventPage {
            events: Vec::new(),
            last_seq: inner.last_seq,
            boot_id: self.boot_id.clone(),
            resync: false,
        };

        if boot_id.is_some_and(|b| b != self.boot_id) {
            page.resync = true;
            return page;
        }
        // Anything between `after` and the oldest buffered event is gone
        if let Some(oldest) = inner.events.front() {
            if oldest.seq > after.saturating_add(1) {
                page.resync = true;
                return page;
            }
        } else if after < inner.last_seq {
            page.resync = true;
            return page;
        }

        page.events = inner
            .events
            .iter()
            .filter(|e| e.seq > after)
            .cloned()
            .collect();
        page
    }

    /// Wait up to `timeout` for events newer than `after`
    pub async fn wait_events(&self, after: u64, boot_id: Option<&str>, timeout: Duration) -> EventPage {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let page = self.events_after(after, boot_id);
            if page.resync || !page.events.is_empty() {
                return page;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return page;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seq: u64) -> Event {
        Event {
            seq,
            timestamp: Utc::now(),
            kind: EventKind::StatusChanged {
                status: SessionStatus::Running,
            },
        }
    }

    #[test]
    fn test_events_after() {
        let shared = SharedState::new("boot", 10);
        for seq in 1..=3 {
            shared.push_event(event(seq));
        }
        let page = shared.events_after(1, None);
        assert!(!page.resync);
        assert_eq!(page.events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(page.last_seq, 3);
        assert!(shared.events_after(3, Some("boot")).events.is_empty());
    }

    #[test]
    fn test_eviction_forces_resync() {
        let shared = SharedState::new("boot", 2);
        for seq in 1..=5 {
            shared.push_event(event(seq));
        }
        assert!(shared.events_after(1, None).resync);
        let page = shared.events_after(3, None);
        assert!(!page.resync);
        assert_eq!(page.events.len(), 2);
    }

    #[test]
    fn test_new_boot_forces_resync() {
        let shared = SharedState::new("second", 10);
        shared.push_event(event(1));
        assert!(shared.events_after(0, Some("first")).resync);
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(event(7)).unwrap();
        assert_eq!(json["seq"], 7);
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["status"], "running");
    }

    #[tokio::test]
    async fn test_wait_wakes_on_push() {
        let shared = std::sync::Arc::new(SharedState::new("boot", 10));
        let pusher = shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            pusher.push_event(event(1));
        });
        let page = shared.wait_events(0, None, Duration::from_secs(5)).await;
        assert_eq!(page.events.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_times_out_empty() {
        let shared = SharedState::new("boot", 10);
        let page = shared.wait_events(0, None, Duration::from_millis(20)).await;
        assert!(page.events.is_empty());
        assert!(!page.resync);
    }
}
