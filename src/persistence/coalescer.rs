//! Write coalescing for streamed message fragments.
//!
//! Agents stream `message` and `thinking` output token by token. Persisting
//! and fanning out every fragment would multiply disk writes and subscriber
//! traffic by one or two orders of magnitude, so consecutive mergeable
//! fragments are folded into one buffered event per session and flushed on
//! a short timer, ahead of any non-mergeable event, or on demand.
//!
//! The coalescer itself holds no timers; [`super::store::EventStore`] arms
//! a flush task per buffered generation and uses [`Coalescer::take_if_current`]
//! so a timer whose buffer has since been merged into or flushed does
//! nothing. An event that enters the coalescer is merged forward or
//! flushed exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use crate::models::event::{AgentEvent, EventPayload};

/// Delay between the last merged fragment and the timer flush.
pub const FLUSH_DELAY_MS: u64 = 500;

/// Whether two events may be folded into one.
///
/// Mergeable iff both are `message` or both are `thinking`, they belong to
/// the same session, and their `isUser` flags agree (an absent flag counts
/// as not-user).
#[must_use]
pub fn can_merge(a: &AgentEvent, b: &AgentEvent) -> bool {
    if a.session_id != b.session_id {
        return false;
    }
    match (&a.payload, &b.payload) {
        (EventPayload::Message(x), EventPayload::Message(y))
        | (EventPayload::Thinking(x), EventPayload::Thinking(y)) => {
            x.is_user.unwrap_or(false) == y.is_user.unwrap_or(false)
        }
        _ => false,
    }
}

/// Whether an event is of a type the coalescer buffers at all.
fn is_streamable(event: &AgentEvent) -> bool {
    matches!(
        event.payload,
        EventPayload::Message(_) | EventPayload::Thinking(_)
    )
}

struct Buffered {
    event: AgentEvent,
    generation: u64,
}

/// What the caller must do after handing an event to [`Coalescer::push`].
#[derive(Debug, Default)]
pub struct PushOutcome {
    /// A previously buffered event that must be written before anything
    /// else from this push.
    pub flush_first: Option<AgentEvent>,
    /// The pushed event, when it bypassed the buffer and must be written
    /// directly.
    pub write_now: Option<AgentEvent>,
    /// Set when the pushed event is now buffered: the generation to arm a
    /// [`FLUSH_DELAY_MS`] timer for.
    pub buffered_generation: Option<u64>,
}

/// Per-session in-memory buffers of the newest mergeable run.
#[derive(Default)]
pub struct Coalescer {
    buffers: Mutex<HashMap<String, Buffered>>,
    generation: AtomicU64,
}

impl Coalescer {
    /// Create an empty coalescer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event through the coalescer.
    ///
    /// Mergeable events join or replace the session's buffer; anything else
    /// forces the buffer out first and passes through untouched.
    pub async fn push(&self, event: AgentEvent) -> PushOutcome {
        let mut buffers = self.buffers.lock().await;
        let mut outcome = PushOutcome::default();

        if !is_streamable(&event) {
            if let Some(buffered) = buffers.remove(&event.session_id) {
                outcome.flush_first = Some(buffered.event);
            }
            outcome.write_now = Some(event);
            return outcome;
        }

        match buffers.get_mut(&event.session_id) {
            Some(buffered) if can_merge(&buffered.event, &event) => {
                merge_into(&mut buffered.event, &event);
                buffered.generation = self.generation.fetch_add(1, Ordering::Relaxed);
                outcome.buffered_generation = Some(buffered.generation);
            }
            Some(_) => {
                // Same session, different stream: the buffered run ended.
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let session_id = event.session_id.clone();
                let old = buffers.insert(session_id, Buffered { event, generation });
                outcome.flush_first = old.map(|b| b.event);
                outcome.buffered_generation = Some(generation);
            }
            None => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                buffers.insert(
                    event.session_id.clone(),
                    Buffered { event, generation },
                );
                outcome.buffered_generation = Some(generation);
            }
        }

        outcome
    }

    /// Take the session's buffer if its generation still matches.
    ///
    /// Timer flushes use this so that a buffer extended (or already
    /// flushed) since the timer was armed stays put for the newer timer.
    pub async fn take_if_current(&self, session_id: &str, generation: u64) -> Option<AgentEvent> {
        let mut buffers = self.buffers.lock().await;
        match buffers.get(session_id) {
            Some(buffered) if buffered.generation == generation => {
                buffers.remove(session_id).map(|b| b.event)
            }
            _ => None,
        }
    }

    /// Take the session's buffer unconditionally (explicit flush).
    pub async fn take(&self, session_id: &str) -> Option<AgentEvent> {
        self.buffers
            .lock()
            .await
            .remove(session_id)
            .map(|b| b.event)
    }

    /// Take every buffer (graceful shutdown).
    pub async fn take_all(&self) -> Vec<AgentEvent> {
        self.buffers
            .lock()
            .await
            .drain()
            .map(|(_, b)| b.event)
            .collect()
    }

    /// Drop the session's buffer without writing it (session deletion).
    pub async fn discard(&self, session_id: &str) {
        self.buffers.lock().await.remove(session_id);
    }
}

/// Fold `incoming` into `buffered`: concatenate content and advance the
/// timestamp to the newer event's.
fn merge_into(buffered: &mut AgentEvent, incoming: &AgentEvent) {
    buffered.timestamp = incoming.timestamp;
    match (&mut buffered.payload, &incoming.payload) {
        (EventPayload::Message(dst), EventPayload::Message(src))
        | (EventPayload::Thinking(dst), EventPayload::Thinking(src)) => {
            dst.content.push_str(&src.content);
        }
        _ => unreachable!("merge_into called on events can_merge rejected"),
    }
}
