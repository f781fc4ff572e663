//! In-memory per-session event distribution.
//!
//! Each active session gets a broadcast channel plus a bounded replay
//! buffer so dashboard subscribers arriving mid-session catch up on recent
//! lines before receiving live ones. Publishing never blocks on a slow
//! subscriber: the broadcast channel is bounded and laggards drop lines.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

/// Broadcast capacity per session. Subscribers further behind than this
/// observe a `Lagged` gap instead of slowing the publisher.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Line(String),
    /// End-of-stream marker, sent exactly once when the session closes.
    Eof,
}

struct SessionChannel {
    tx: broadcast::Sender<StreamItem>,
    // Locked across broadcast sends so replay + live never duplicate or
    // drop a line for a concurrently arriving subscriber.
    history: Mutex<VecDeque<String>>,
    closed: AtomicBool,
}

/// What a new subscriber starts with: buffered catch-up lines, then a live
/// receiver. `live` is `None` when the session already closed — the replay
/// is everything there is.
pub struct Subscription {
    pub replay: Vec<String>,
    pub live: Option<broadcast::Receiver<StreamItem>>,
}

pub struct SessionHub {
    channels: DashMap<i64, Arc<SessionChannel>>,
    history_limit: usize,
}

impl SessionHub {
    pub fn new(history_limit: usize) -> Self {
        Self {
            channels: DashMap::new(),
            history_limit,
        }
    }

    fn channel(&self, session_id: i64) -> Arc<SessionChannel> {
        self.channels
            .entry(session_id)
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
                Arc::new(SessionChannel {
                    tx,
                    history: Mutex::new(VecDeque::new()),
                    closed: AtomicBool::new(false),
                })
            })
            .clone()
    }

    /// Register a session's channel so subscribers arriving before the
    /// first output line still get a live receiver.
    pub fn open(&self, session_id: i64) {
        self.channel(session_id);
    }

    /// Publish one formatted line to a session's subscribers.
    pub fn publish(&self, session_id: i64, line: &str) {
        let ch = self.channel(session_id);
        let mut history = ch.history.lock().expect("hub history lock poisoned");
        // Checked under the lock: close holds it too, so no line can be
        // appended or broadcast after Eof.
        if ch.closed.load(Ordering::Acquire) {
            debug!(session_id, "publish after close ignored");
            return;
        }
        if history.len() == self.history_limit {
            history.pop_front();
        }
        history.push_back(line.to_string());
        // Err means no live subscribers, which is fine.
        let _ = ch.tx.send(StreamItem::Line(line.to_string()));
    }

    /// Subscribe to a session's stream, replaying buffered history first.
    /// Unknown session ids get an empty subscription, not a fresh entry.
    pub fn subscribe(&self, session_id: i64) -> Subscription {
        let Some(ch) = self.channels.get(&session_id).map(|e| Arc::clone(e.value())) else {
            return Subscription {
                replay: Vec::new(),
                live: None,
            };
        };
        let history = ch.history.lock().expect("hub history lock poisoned");
        let replay: Vec<String> = history.iter().cloned().collect();
        let live = if ch.closed.load(Ordering::Acquire) {
            None
        } else {
            Some(ch.tx.subscribe())
        };
        drop(history);
        Subscription { replay, live }
    }

    /// Signal end-of-stream to all subscribers. The replay buffer stays
    /// available for late subscribers until [`SessionHub::remove`].
    pub fn close(&self, session_id: i64) {
        if let Some(ch) = self.channels.get(&session_id) {
            let _history = ch.history.lock().expect("hub history lock poisoned");
            ch.closed.store(true, Ordering::Release);
            let _ = ch.tx.send(StreamItem::Eof);
            debug!(session_id, "session stream closed");
        }
    }

    /// Release a session's buffers entirely (shutdown cleanup).
    pub fn remove(&self, session_id: i64) {
        self.channels.remove(&session_id);
    }

    /// Close and release every session stream (owner shutdown, step after
    /// drain). The process is exiting, so replay retention does not apply.
    pub fn close_all(&self) {
        let ids: Vec<i64> = self.channels.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.close(id);
            self.remove(id);
        }
    }

    /// Number of session entries currently held.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
