//! Slot bookkeeping: timers, connection attachment, lifetime deadlines.
//!
//! The state machine in [`crate::state`] decides what a slot does next;
//! this module holds the mutable shell around it — the armed timer's
//! generation, the attached connection adapter and the recycling deadline —
//! and the event envelope everything external is marshalled in with.

use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::connection::{ConnEvent, ConnectionAdapter};
use crate::error::PoolError;
use crate::state::SlotState;

/// Dense slot index, `0 .. max_connections`.
pub(crate) type SlotId = usize;

/// Everything that reaches the pool loop from outside: connection
/// lifecycles and timer firings. Requests and body signals arrive on their
/// own channels.
#[derive(Debug)]
pub(crate) enum PoolEvent {
    Conn {
        slot: SlotId,
        conn: u64,
        event: ConnEvent,
    },
    Timeout {
        slot: SlotId,
        generation: u64,
    },
}

/// One pool slot: at most one connection, at most one request in flight.
pub(crate) struct Slot<T> {
    pub id: SlotId,
    pub state: SlotState<T>,
    /// Timer identity. Bumped on every transition so firings armed for an
    /// older state are recognized and dropped.
    pub generation: u64,
    pub enqueued_for_dispatch: bool,
    /// When the current connection should be recycled, if a maximum
    /// lifetime is configured.
    disconnect_deadline: Option<Instant>,
    /// Embargo level at which the current connection attempt began.
    pub attempt_level: Duration,
    pub conn: Option<ConnectionAdapter>,
    /// The connection signalled a clean EOF but the slot still has entity
    /// traffic to account for.
    pub conn_eof: bool,
    changed_at: Instant,
}

impl<T> Slot<T> {
    pub(crate) fn new(id: SlotId) -> Self {
        Self {
            id,
            state: SlotState::Unconnected,
            generation: 0,
            enqueued_for_dispatch: false,
            disconnect_deadline: None,
            attempt_level: Duration::ZERO,
            conn: None,
            conn_eof: false,
            changed_at: Instant::now(),
        }
    }

    /// Move the state out for a transition, leaving a placeholder.
    pub(crate) fn take_state(&mut self) -> SlotState<T> {
        std::mem::replace(&mut self.state, SlotState::Unconnected)
    }

    /// Install the post-transition state and bump the timer generation,
    /// which cancels whatever timer was armed for the previous state.
    pub(crate) fn enter(&mut self, state: SlotState<T>) {
        self.state = state;
        self.generation = self.generation.wrapping_add(1);
        self.changed_at = Instant::now();
    }

    /// How long the slot has been in its current state.
    pub(crate) fn in_state_for(&self) -> Duration {
        self.changed_at.elapsed()
    }

    /// Arm the current state's timeout under the current generation.
    pub(crate) fn arm_timeout(&self, after: Duration, events: &mpsc::UnboundedSender<PoolEvent>) {
        let slot = self.id;
        let generation = self.generation;
        let events = events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(PoolEvent::Timeout { slot, generation });
        });
    }

    /// Whether the connection is attached and has not signalled EOF.
    pub(crate) fn connection_alive(&self) -> bool {
        self.conn.is_some() && !self.conn_eof
    }

    /// Whether the recycling deadline for the current connection passed.
    pub(crate) fn lifetime_expired(&self) -> bool {
        self.disconnect_deadline
            .is_some_and(|deadline| Instant::now() > deadline)
    }

    /// Record an established connection and its recycling deadline.
    ///
    /// The deadline gets up to 10% jitter (at least 2ms worth) so a fleet
    /// of connections opened together does not recycle in lockstep.
    pub(crate) fn record_established(&mut self, max_lifetime: Option<Duration>) {
        self.conn_eof = false;
        self.disconnect_deadline = max_lifetime.map(|lifetime| {
            let spread = (lifetime / 10).max(Duration::from_millis(2));
            let jitter_ns = rand::thread_rng().gen_range(0..spread.as_nanos().max(1)) as u64;
            Instant::now() + lifetime + Duration::from_nanos(jitter_ns)
        });
    }

    /// Close and detach the connection, if one is attached. Closing twice
    /// is a no-op; the adapter is gone after the first call.
    pub(crate) fn close_connection(&mut self, failure: Option<PoolError>) {
        if let Some(mut conn) = self.conn.take() {
            conn.close(failure);
        }
        self.conn_eof = false;
        self.disconnect_deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_carries_generation() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut slot: Slot<()> = Slot::new(3);

        slot.arm_timeout(Duration::from_secs(1), &events_tx);
        let stale_generation = slot.generation;

        // A transition bumps the generation before the timer fires.
        slot.enter(SlotState::Idle);
        slot.arm_timeout(Duration::from_secs(2), &events_tx);

        tokio::time::advance(Duration::from_secs(3)).await;

        let first = events_rx.recv().await.unwrap();
        let PoolEvent::Timeout { generation, .. } = first else {
            panic!("expected timeout event");
        };
        assert_eq!(generation, stale_generation);
        assert_ne!(generation, slot.generation);

        let second = events_rx.recv().await.unwrap();
        let PoolEvent::Timeout { generation, .. } = second else {
            panic!("expected timeout event");
        };
        assert_eq!(generation, slot.generation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifetime_deadline_with_jitter() {
        let mut slot: Slot<()> = Slot::new(0);
        let lifetime = Duration::from_secs(10);
        slot.record_established(Some(lifetime));

        assert!(!slot.lifetime_expired());

        // Past the lifetime plus the full jitter spread.
        tokio::time::advance(lifetime + lifetime / 10 + Duration::from_millis(1)).await;
        assert!(slot.lifetime_expired());
    }

    #[tokio::test]
    async fn test_no_lifetime_never_expires() {
        let mut slot: Slot<()> = Slot::new(0);
        slot.record_established(None);
        assert!(!slot.lifetime_expired());
    }
}
