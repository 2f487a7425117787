//! The uniform agent-session contract.
//!
//! A session is polymorphic over `{send, interrupt, status, close}`. `send`
//! returns a lazy, single-consumer, finite stream of [`AgentEvent`]s; at
//! most one `TurnComplete` is emitted per call and it marks the logical end
//! of the turn.
//!
//! Lifecycle bookkeeping lives in [`StatusCell`]: a turn begins with
//! [`StatusCell::begin_turn`], and the returned [`TurnGuard`] restores
//! `Idle` and bumps `turn_count` when dropped — whether the stream was
//! exhausted, failed, or abandoned by the caller mid-way.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use sb_domain::event::{AgentEvent, SessionState, SessionStatus, TokenUsage};
use sb_domain::{BoxStream, Error, Result};

/// The event sequence produced by one `send` call.
pub type EventStream = BoxStream<'static, Result<AgentEvent>>;

#[async_trait]
pub trait AgentSession: Send + Sync {
    /// Run one turn. The returned stream is lazy and single-consumer;
    /// dropping it cancels the turn (cascading to subprocess termination
    /// where one exists).
    async fn send(&self, message: &str) -> Result<EventStream>;

    /// Best-effort interrupt of an in-flight turn. Noop where the backend
    /// has no interrupt primitive.
    async fn interrupt(&self) {}

    /// Structurally independent snapshot of the session counters.
    fn status(&self) -> SessionStatus;

    /// Idempotent. A closed session rejects further `send` calls.
    async fn close(&self);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// StatusCell
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared session counters with the turn-teardown discipline.
#[derive(Clone, Default)]
pub struct StatusCell {
    inner: Arc<Mutex<SessionStatus>>,
}

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition `Idle → Processing` and hand back the scoped guard.
    /// Fails on a closed session.
    pub fn begin_turn(&self) -> Result<TurnGuard> {
        let mut status = self.inner.lock();
        if status.state == SessionState::Closed {
            return Err(Error::SessionClosed);
        }
        status.state = SessionState::Processing;
        status.last_activity = Some(Utc::now());
        let index = status.turn_count;
        Ok(TurnGuard {
            inner: self.inner.clone(),
            index,
        })
    }

    pub fn add_usage(&self, usage: &TokenUsage) {
        let mut status = self.inner.lock();
        status.total_tokens.add(usage);
        status.last_activity = Some(Utc::now());
    }

    pub fn set_closed(&self) {
        self.inner.lock().state = SessionState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().state == SessionState::Closed
    }

    /// Deep copy — callers may mutate the result freely.
    pub fn snapshot(&self) -> SessionStatus {
        self.inner.lock().clone()
    }
}

/// Scoped turn marker. Dropping it performs the unconditional teardown:
/// `turn_count += 1` and `Processing → Idle` (a `Closed` state set by
/// `close()` during the turn is preserved).
pub struct TurnGuard {
    inner: Arc<Mutex<SessionStatus>>,
    index: u64,
}

impl TurnGuard {
    /// Zero-based index of this turn, fixed at `begin_turn`.
    pub fn index(&self) -> u64 {
        self.index
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        let mut status = self.inner.lock();
        status.turn_count += 1;
        if status.state == SessionState::Processing {
            status.state = SessionState::Idle;
        }
        status.last_activity = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_drop_restores_idle_and_counts() {
        let cell = StatusCell::new();
        {
            let guard = cell.begin_turn().unwrap();
            assert_eq!(guard.index(), 0);
            assert_eq!(cell.snapshot().state, SessionState::Processing);
        }
        let status = cell.snapshot();
        assert_eq!(status.state, SessionState::Idle);
        assert_eq!(status.turn_count, 1);
    }

    #[test]
    fn guard_counts_even_when_turn_abandoned_early() {
        let cell = StatusCell::new();
        let guard = cell.begin_turn().unwrap();
        drop(guard); // simulate caller abandoning the stream
        let guard = cell.begin_turn().unwrap();
        assert_eq!(guard.index(), 1);
        drop(guard);
        assert_eq!(cell.snapshot().turn_count, 2);
    }

    #[test]
    fn close_during_turn_is_preserved() {
        let cell = StatusCell::new();
        let guard = cell.begin_turn().unwrap();
        cell.set_closed();
        drop(guard);
        let status = cell.snapshot();
        assert_eq!(status.state, SessionState::Closed);
        assert_eq!(status.turn_count, 1);
    }

    #[test]
    fn begin_turn_rejects_closed_session() {
        let cell = StatusCell::new();
        cell.set_closed();
        assert!(matches!(cell.begin_turn(), Err(Error::SessionClosed)));
    }

    #[test]
    fn snapshot_is_structurally_independent() {
        let cell = StatusCell::new();
        cell.add_usage(&TokenUsage {
            input: 10,
            output: 5,
            cached: 2,
        });
        let mut copy = cell.snapshot();
        copy.total_tokens.input = 999;
        assert_eq!(cell.snapshot().total_tokens.input, 10);
    }
}
