//! Typed agent events.
//!
//! Handlers run sequentially on the emitting task and must not block; a
//! handler that needs to do real work should forward the event into a
//! channel drained elsewhere.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::errors::Error;

/// One immutable event.  Per connection, `ConnectionOpened` strictly
/// precedes every `HttpRequestComplete` and all precede exactly one
/// `ConnectionClosed`.
#[derive(Debug, Clone)]
pub enum Event {
    AgentConnectSucceeded {
        at: DateTime<Utc>,
    },
    AgentDisconnected {
        at: DateTime<Utc>,
        error: Option<Arc<Error>>,
    },
    AgentHeartbeatReceived {
        at: DateTime<Utc>,
        /// Measured round-trip; `Duration::ZERO` marks a timed-out beat.
        latency: Duration,
    },
    ConnectionOpened {
        at: DateTime<Utc>,
        endpoint_id: String,
        url: String,
        remote_addr: String,
        proto: String,
    },
    ConnectionClosed {
        at: DateTime<Utc>,
        endpoint_id: String,
        remote_addr: String,
        duration: Duration,
        bytes_in: u64,
        bytes_out: u64,
        error: Option<String>,
    },
    HttpRequestComplete {
        at: DateTime<Utc>,
        endpoint_id: String,
        method: String,
        uri: String,
        status: u16,
        elapsed: Duration,
    },
}

impl Event {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::AgentConnectSucceeded { at }
            | Event::AgentDisconnected { at, .. }
            | Event::AgentHeartbeatReceived { at, .. }
            | Event::ConnectionOpened { at, .. }
            | Event::ConnectionClosed { at, .. }
            | Event::HttpRequestComplete { at, .. } => *at,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Fan-out point for events.  Emit copies the handler slice under the
/// read lock, then calls handlers outside of it.
#[derive(Default)]
pub(crate) struct EventSink {
    handlers: RwLock<Vec<EventHandler>>,
}

impl EventSink {
    pub(crate) fn add(&self, handler: EventHandler) {
        self.handlers
            .write()
            .expect("handler lock poisoned")
            .push(handler);
    }

    pub(crate) fn emit(&self, event: Event) {
        let handlers = self
            .handlers
            .read()
            .expect("handler lock poisoned")
            .clone();
        for handler in &handlers {
            handler(&event);
        }
    }
}
