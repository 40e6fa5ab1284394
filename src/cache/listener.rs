//! Line event listeners.
//!
//! Events are collected while a line is locked and fired once the engine has released every
//! lock, so a listener may freely call back into the store. A failing listener never
//! affects the protocol; its error goes to the configured [`ErrorSink`].

use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::cluster::types::NodeId;

/// Callbacks for one line (set with LSTN) or for every line (registered globally).
#[allow(unused_variables)]
pub trait CacheListener: Send + Sync {
    /// A fresh copy of the line arrived from its owner.
    fn received(&self, line: i64, version: u64, data: Option<&Bytes>) -> anyhow::Result<()> {
        Ok(())
    }

    /// The local copy was invalidated or ownership moved away.
    fn invalidated(&self, line: i64) -> anyhow::Result<()> {
        Ok(())
    }

    fn evicted(&self, line: i64) -> anyhow::Result<()> {
        Ok(())
    }

    /// The line was deleted.
    fn killed(&self, line: i64) -> anyhow::Result<()> {
        Ok(())
    }

    /// A MSG addressed to the line arrived at this owner.
    fn message_received(&self, line: i64, from: NodeId, data: Option<&Bytes>) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    Received {
        line: i64,
        version: u64,
        data: Option<Bytes>,
    },
    Invalidated {
        line: i64,
    },
    Evicted {
        line: i64,
    },
    Killed {
        line: i64,
    },
    MessageReceived {
        line: i64,
        from: NodeId,
        data: Option<Bytes>,
    },
}

impl LineEvent {
    pub fn line(&self) -> i64 {
        match self {
            LineEvent::Received { line, .. }
            | LineEvent::Invalidated { line }
            | LineEvent::Evicted { line }
            | LineEvent::Killed { line }
            | LineEvent::MessageReceived { line, .. } => *line,
        }
    }

    fn deliver(&self, listener: &dyn CacheListener) -> anyhow::Result<()> {
        match self {
            LineEvent::Received {
                line,
                version,
                data,
            } => listener.received(*line, *version, data.as_ref()),
            LineEvent::Invalidated { line } => listener.invalidated(*line),
            LineEvent::Evicted { line } => listener.evicted(*line),
            LineEvent::Killed { line } => listener.killed(*line),
            LineEvent::MessageReceived { line, from, data } => {
                listener.message_received(*line, *from, data.as_ref())
            }
        }
    }
}

/// Receives listener failures.
pub trait ErrorSink: Send + Sync {
    fn listener_failed(&self, event: &LineEvent, error: &anyhow::Error);
}

/// Logs listener failures at WARN.
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn listener_failed(&self, event: &LineEvent, error: &anyhow::Error) {
        tracing::warn!(
            "Listener failed on line {:#x} ({:?}): {:#}",
            event.line(),
            event,
            error
        );
    }
}

/// Fans events out to the line's own listener and every global listener.
pub struct EventDispatcher {
    global: RwLock<Vec<Arc<dyn CacheListener>>>,
    sink: Arc<dyn ErrorSink>,
}

impl EventDispatcher {
    pub fn new(sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            global: RwLock::new(Vec::new()),
            sink,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn CacheListener>) {
        self.global.write().push(listener);
    }

    /// Delivers `event` to every interested listener and returns how many failed.
    pub fn dispatch(&self, line_listener: Option<&Arc<dyn CacheListener>>, event: &LineEvent) -> usize {
        let mut failures = 0;
        let global = self.global.read().clone();
        for listener in line_listener.into_iter().chain(global.iter()) {
            if let Err(e) = event.deliver(listener.as_ref()) {
                self.sink.listener_failed(event, &e);
                failures += 1;
            }
        }
        failures
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(Arc::new(TracingErrorSink))
    }
}
