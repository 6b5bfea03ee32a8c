//! Per-request progress trace.
//!
//! A [`ThoughtQueue`] lives for exactly one request. Producers hold a cheap
//! [`ThoughtSink`] handle and push without blocking; the multiplexer drains
//! the queue between result polls. The queue is bounded and drops its oldest
//! entry when full, counting what it dropped.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use crate::events::ThoughtEvent;

pub const DEFAULT_THOUGHT_CAPACITY: usize = 1024;

struct QueueState {
    events: VecDeque<ThoughtEvent>,
    next_seq: u64,
    dropped: u64,
}

pub struct ThoughtQueue {
    state: Mutex<QueueState>,
    capacity: usize,
}

impl ThoughtQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                next_seq: 0,
                dropped: 0,
            }),
            capacity: capacity.max(1),
        })
    }

    pub fn push(&self, text: String) -> u64 {
        let mut state = self.state.lock();
        if state.events.len() >= self.capacity {
            state.events.pop_front();
            state.dropped += 1;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.events.push_back(ThoughtEvent {
            seq,
            at: Utc::now(),
            text,
        });
        seq
    }

    /// Take everything queued so far, in push order.
    pub fn drain(&self) -> Vec<ThoughtEvent> {
        self.state.lock().events.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Fire-and-forget handle onto a request's thought queue. A disconnected
/// sink only logs.
#[derive(Clone, Default)]
pub struct ThoughtSink {
    queue: Option<Arc<ThoughtQueue>>,
}

impl ThoughtSink {
    pub fn new(queue: Arc<ThoughtQueue>) -> Self {
        Self { queue: Some(queue) }
    }

    pub fn disconnected() -> Self {
        Self { queue: None }
    }

    pub fn emit(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::debug!(thought = %text, "thought");
        if let Some(queue) = &self.queue {
            queue.push(text);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.queue.is_some()
    }
}

impl std::fmt::Debug for ThoughtSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThoughtSink")
            .field("connected", &self.is_connected())
            .finish()
    }
}
