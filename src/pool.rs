//! The pool stage: ports, slot vector, retry buffer, dispatch queue.
//!
//! One pool instance serves one host. The pool runs as a single task that
//! owns every slot; connection tasks, timers and entity instrumentation
//! reach it exclusively through channels, so no state is ever touched from
//! two places at once.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use http::Request;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::config::PoolConfig;
use crate::connection::{ConnEvent, ConnectionAdapter, ConnectionFactory};
use crate::context::{RequestContext, ResponseContext};
use crate::embargo::Embargo;
use crate::entity::{BodyEvent, BodyKind, BodySignal, Entity, EntityWatch};
use crate::error::{PoolError, Result};
use crate::slot::{PoolEvent, Slot, SlotId};
use crate::state::{Action, SlotEvent, SlotState, TransitionEnv};

/// Follow-up transitions allowed per external event before the pool
/// declares the slot logic buggy and stops.
const MAX_TRANSITIONS: usize = 10;

/// A bounded host connection pool.
///
/// Spawn one per host; requests go in through the [`PoolHandle`], each
/// paired response comes out of the returned receiver carrying the
/// caller's correlation tag.
pub struct HostPool;

impl HostPool {
    /// Start a pool over `factory` and return its two ports.
    pub fn spawn<T, F>(
        config: PoolConfig,
        factory: F,
    ) -> Result<(PoolHandle<T>, mpsc::Receiver<ResponseContext<T>>)>
    where
        T: Send + 'static,
        F: ConnectionFactory,
    {
        let config = config.validate()?;

        let (request_tx, request_rx) = mpsc::channel(config.max_open_requests);
        let (response_tx, response_rx) = mpsc::channel(1);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();

        let core = PoolCore {
            slots: (0..config.max_connections).map(Slot::new).collect(),
            idle: (0..config.max_connections).collect(),
            retry_buffer: VecDeque::new(),
            dispatch_queue: VecDeque::new(),
            emit_buffer: VecDeque::new(),
            embargo: Embargo::new(
                config.base_connection_backoff,
                config.max_connection_backoff,
            ),
            factory: Arc::new(factory),
            events_tx,
            signals_tx,
            out_tx: response_tx,
            reserved: None,
            pending: VecDeque::new(),
            draining: false,
            next_conn_id: 1,
            input_done: false,
            control_closed: false,
            stopping: false,
            fatal: false,
            config,
        };

        tokio::spawn(core.run(request_rx, events_rx, signals_rx, control_rx));

        let handle = PoolHandle {
            requests: request_tx,
            control: control_tx,
        };
        Ok((handle, response_rx))
    }
}

/// Input port of a running pool.
pub struct PoolHandle<T> {
    requests: mpsc::Sender<(Request<Entity>, T)>,
    control: mpsc::UnboundedSender<Control>,
}

impl<T> Clone for PoolHandle<T> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
            control: self.control.clone(),
        }
    }
}

impl<T> PoolHandle<T> {
    /// Submit a request together with its correlation tag.
    ///
    /// Applies backpressure once `max_open_requests` submissions are
    /// buffered ahead of the pool.
    pub async fn send(&self, request: Request<Entity>, tag: T) -> Result<()> {
        self.requests
            .send((request, tag))
            .await
            .map_err(|_| PoolError::PoolClosed)
    }

    /// Shut the pool down. In-flight requests fail with a shutdown error;
    /// idle connections close cleanly.
    pub fn shutdown(&self) {
        let _ = self.control.send(Control::Shutdown);
    }

    /// Observe the pool's current occupancy.
    pub async fn snapshot(&self) -> Result<PoolSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.control
            .send(Control::Snapshot(reply_tx))
            .map_err(|_| PoolError::PoolClosed)?;
        reply_rx.await.map_err(|_| PoolError::PoolClosed)
    }
}

/// Point-in-time pool occupancy, for diagnostics.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    /// Slots holding an established connection.
    pub connected: usize,
    /// Slots with a connection attempt in flight.
    pub connecting: usize,
    /// Slots able to accept a request right now.
    pub idle: usize,
    /// Slots with a request or response exchange in progress.
    pub in_flight: usize,
    /// Requests waiting for a slot.
    pub retry_depth: usize,
    /// Current connect-failure backoff level.
    pub embargo: Duration,
}

enum Control {
    Shutdown,
    Snapshot(oneshot::Sender<PoolSnapshot>),
}

struct PoolCore<T> {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    slots: Vec<Slot<T>>,
    /// Slots able to accept a request, lowest id first so high ids get the
    /// chance to idle out.
    idle: BTreeSet<SlotId>,
    /// Requests waiting for a slot. Fresh arrivals go to the front,
    /// retries to the tail.
    retry_buffer: VecDeque<RequestContext<T>>,
    /// Slots holding a response, in emission order.
    dispatch_queue: VecDeque<SlotId>,
    /// Results that bypassed slot dispatch (failures, shutdown) and wait
    /// for output capacity.
    emit_buffer: VecDeque<ResponseContext<T>>,
    embargo: Embargo,
    events_tx: mpsc::UnboundedSender<PoolEvent>,
    signals_tx: mpsc::UnboundedSender<BodySignal>,
    out_tx: mpsc::Sender<ResponseContext<T>>,
    /// Output permit held while a dispatchable slot is being driven.
    reserved: Option<mpsc::OwnedPermit<ResponseContext<T>>>,
    /// Slot events waiting to be applied; drained to empty after every
    /// external stimulus.
    pending: VecDeque<(SlotId, SlotEvent<T>)>,
    draining: bool,
    next_conn_id: u64,
    input_done: bool,
    control_closed: bool,
    stopping: bool,
    /// A slot transition loop failed to settle; the pool must stop.
    fatal: bool,
}

impl<T: Send + 'static> PoolCore<T> {
    async fn run(
        mut self,
        mut request_rx: mpsc::Receiver<(Request<Entity>, T)>,
        mut events_rx: mpsc::UnboundedReceiver<PoolEvent>,
        mut signals_rx: mpsc::UnboundedReceiver<BodySignal>,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
    ) {
        self.warm_up();

        loop {
            if self.fatal || self.stopping {
                break;
            }
            if self.out_tx.is_closed() {
                debug!("response side dropped, stopping pool");
                break;
            }
            if self.input_done && self.quiesced() {
                debug!("input finished and all slots drained, stopping pool");
                break;
            }

            let can_pull =
                !self.input_done && !self.idle.is_empty() && self.retry_buffer.is_empty();
            let want_demand = !self.emit_buffer.is_empty() || !self.dispatch_queue.is_empty();

            tokio::select! {
                biased;

                control = control_rx.recv(), if !self.control_closed => match control {
                    Some(Control::Shutdown) => {
                        self.stopping = true;
                    }
                    Some(Control::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    None => self.control_closed = true,
                },

                signal = signals_rx.recv() => {
                    if let Some(signal) = signal {
                        self.on_body_signal(signal);
                    }
                },

                event = events_rx.recv() => {
                    if let Some(event) = event {
                        self.on_pool_event(event);
                    }
                },

                permit = self.out_tx.clone().reserve_owned(), if want_demand => match permit {
                    Ok(permit) => self.on_demand(permit),
                    Err(_) => break,
                },

                request = request_rx.recv(), if can_pull => match request {
                    Some((request, tag)) => self.on_request(request, tag),
                    None => self.input_done = true,
                },
            }
        }

        self.shut_down_slots();
    }

    /// Open warm connections up to the minimum before serving traffic.
    fn warm_up(&mut self) {
        for id in 0..self.slots.len() {
            if !self.below_min_connections() {
                break;
            }
            self.handle(id, SlotEvent::PreConnect);
        }
    }

    // ------------------------------------------------------------------
    // Port handlers
    // ------------------------------------------------------------------

    fn on_request(&mut self, request: Request<Entity>, tag: T) {
        let ctx = RequestContext::new(request, tag, self.config.max_retries);
        match self.idle.first().copied() {
            Some(slot_id) => {
                self.idle.remove(&slot_id);
                self.handle(slot_id, SlotEvent::NewRequest(ctx));
            }
            None => {
                // The pull already consumed input capacity, so the request
                // goes to the front, ahead of queued retries.
                self.retry_buffer.push_front(ctx);
            }
        }
    }

    fn on_demand(&mut self, permit: mpsc::OwnedPermit<ResponseContext<T>>) {
        if let Some(response) = self.emit_buffer.pop_front() {
            permit.send(response);
            return;
        }
        if let Some(slot_id) = self.dispatch_queue.pop_front() {
            self.slots[slot_id].enqueued_for_dispatch = false;
            self.reserved = Some(permit);
            self.handle(slot_id, SlotEvent::ResponseDispatchable);
        }
        // Release the permit if the dispatch did not use it.
        self.reserved = None;
    }

    fn on_pool_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Timeout { slot, generation } => {
                if self.slots[slot].generation == generation {
                    self.handle(slot, SlotEvent::Timeout);
                } else {
                    trace!(slot, generation, "dropping stale timer");
                }
            }
            PoolEvent::Conn { slot, conn, event } => {
                let current = self.slots[slot].conn.as_ref().map(ConnectionAdapter::id);
                if current != Some(conn) {
                    trace!(slot, conn, "dropping event from abandoned connection");
                    return;
                }
                self.on_conn_event(slot, conn, event);
            }
        }
    }

    fn on_conn_event(&mut self, slot_id: SlotId, conn: u64, event: ConnEvent) {
        match event {
            ConnEvent::Established => {
                self.slots[slot_id].record_established(self.config.max_connection_lifetime);
                if self.embargo.on_attempt_succeeded() {
                    self.broadcast_embargo();
                }
                self.handle(slot_id, SlotEvent::ConnectionAttemptSucceeded);
            }
            ConnEvent::AttemptFailed(err) => {
                let attempt_level = self.slots[slot_id].attempt_level;
                if self.embargo.on_attempt_failed(attempt_level) {
                    debug!(
                        slot = slot_id,
                        embargo = ?self.embargo.level(),
                        "connect failure escalated the embargo"
                    );
                    self.broadcast_embargo();
                }
                self.handle(slot_id, SlotEvent::ConnectionAttemptFailed(err));
            }
            ConnEvent::Response(response) => {
                let response = self.instrument_response(slot_id, conn, response);
                self.handle(slot_id, SlotEvent::ResponseReceived(response));
            }
            ConnEvent::Completed => {
                self.slots[slot_id].conn_eof = true;
                self.handle(slot_id, SlotEvent::ConnectionCompleted);
            }
            ConnEvent::Failed(err) => {
                self.handle(slot_id, SlotEvent::ConnectionFailed(err));
            }
        }
    }

    fn on_body_signal(&mut self, signal: BodySignal) {
        let BodySignal {
            slot: slot_id,
            conn,
            kind,
            event,
        } = signal;
        let current = self.slots[slot_id].conn.as_ref().map(ConnectionAdapter::id);
        if current != Some(conn) {
            trace!(slot = slot_id, conn, "dropping body signal from abandoned connection");
            return;
        }
        let event = match (kind, event) {
            // First poll of a request body carries no pool-visible meaning.
            (BodyKind::Request, BodyEvent::Subscribed) => return,
            (BodyKind::Request, BodyEvent::Completed) => SlotEvent::RequestEntityCompleted,
            (BodyKind::Request, BodyEvent::Failed(err)) => {
                let err = match err {
                    err @ PoolError::RequestEntityStream(_) => err,
                    other => PoolError::request_entity(other.to_string()),
                };
                SlotEvent::RequestEntityFailed(err)
            }
            (BodyKind::Response, BodyEvent::Subscribed) => SlotEvent::ResponseEntitySubscribed,
            (BodyKind::Response, BodyEvent::Completed) => SlotEvent::ResponseEntityCompleted,
            (BodyKind::Response, BodyEvent::Failed(err)) => {
                let err = match err {
                    err @ PoolError::ResponseEntityStream(_) => err,
                    other => PoolError::response_entity(other.to_string()),
                };
                SlotEvent::ResponseEntityFailed(err)
            }
        };
        self.handle(slot_id, event);
    }

    // ------------------------------------------------------------------
    // Slot event driver
    // ------------------------------------------------------------------

    /// Apply an event to a slot and drain every event it cascades into.
    fn handle(&mut self, slot_id: SlotId, event: SlotEvent<T>) {
        self.pending.push_back((slot_id, event));
        self.drain_pending();
    }

    fn drain_pending(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        while let Some((slot_id, event)) = self.pending.pop_front() {
            self.apply(slot_id, event);
            if self.fatal {
                self.pending.clear();
                break;
            }
        }
        self.draining = false;
    }

    /// Drive one external event through the slot's transition fixpoint.
    fn apply(&mut self, slot_id: SlotId, event: SlotEvent<T>) {
        let mut event = Some(event);
        let mut steps = 0;
        while let Some(current) = event.take() {
            steps += 1;
            if steps > MAX_TRANSITIONS {
                warn!(
                    slot = slot_id,
                    "transition loop exceeded {MAX_TRANSITIONS} steps, stopping pool"
                );
                self.fatal = true;
                return;
            }
            event = self.step(slot_id, current);
        }
    }

    /// One transition plus the driver duties around it. Returns the
    /// follow-up event to apply, if the new state implies one.
    fn step(&mut self, slot_id: SlotId, event: SlotEvent<T>) -> Option<SlotEvent<T>> {
        let holds_min =
            self.connected_count() <= self.config.effective_min_connections();
        let env = TransitionEnv {
            config: &self.config,
            holds_min_connection: holds_min,
            lifetime_expired: self.slots[slot_id].lifetime_expired(),
            connection_alive: self.slots[slot_id].connection_alive(),
        };

        let event_name = event.name();
        let prev = self.slots[slot_id].state.name();
        let held_for = self.slots[slot_id].in_state_for();

        let state = self.slots[slot_id].take_state();
        let step = state.on_event(event, &env);
        self.slots[slot_id].enter(step.next);

        trace!(
            slot = slot_id,
            event = event_name,
            from = prev,
            to = self.slots[slot_id].state.name(),
            held_for = ?held_for,
            "slot transition"
        );

        // Close-and-reset states: shut the connection (reporting the
        // declared failure) and re-enter service — straight into the
        // embargo wait if a connect backoff is in force.
        if self.slots[slot_id].state.should_close_connection() {
            let failure = self.slots[slot_id].state.close_failure();
            if let SlotState::Failed(err) = &self.slots[slot_id].state {
                warn!(slot = slot_id, error = %err, "isolating failed slot");
            }
            self.slots[slot_id].close_connection(failure);
            let embargo = self.embargo.level();
            let next = if embargo.is_zero() || self.stopping {
                SlotState::Unconnected
            } else {
                SlotState::OutOfEmbargo {
                    wait: Embargo::jittered_wait(embargo),
                }
            };
            self.slots[slot_id].enter(next);
        }

        // Dispatch-queue membership follows the state exactly.
        if self.slots[slot_id].enqueued_for_dispatch
            && !matches!(
                self.slots[slot_id].state,
                SlotState::WaitingForResponseDispatch(..)
            )
        {
            self.dispatch_queue.retain(|&id| id != slot_id);
            self.slots[slot_id].enqueued_for_dispatch = false;
        }

        self.update_idle_index(slot_id);

        if let Some(action) = step.action {
            match action {
                Action::OpenConnection => self.open_connection(slot_id),
                Action::Deliver(ctx, err) => self.deliver_failure(ctx, err),
                Action::Emit(ctx, response) => self.emit_response(ctx, response),
            }
        }

        if let Some(timeout) = self.slots[slot_id].state.state_timeout(&self.config) {
            self.slots[slot_id].arm_timeout(timeout, &self.events_tx);
        }

        self.follow_up(slot_id)
    }

    /// The follow-up event a freshly entered state implies, if any.
    fn follow_up(&mut self, slot_id: SlotId) -> Option<SlotEvent<T>> {
        // The push case first; building the wire request needs mutable
        // access to the context inside the state.
        if let SlotState::PushingRequest(ctx) = &mut self.slots[slot_id].state {
            let wire = ctx.wire_request();
            return Some(self.push_to_connection(slot_id, wire));
        }

        enum Follow {
            Dispatch,
            StrictSubscribe,
            StrictComplete,
            Unconnected,
            ReadyForRequest,
            None,
        }

        let follow = match &self.slots[slot_id].state {
            SlotState::WaitingForResponseDispatch(..) => Follow::Dispatch,
            // Strict and empty entities have no stream to drive the
            // lifecycle; the driver walks it for them.
            SlotState::WaitingForEntitySubscription {
                strict_entity: true, ..
            } => Follow::StrictSubscribe,
            SlotState::WaitingForEndOfEntity {
                strict_entity: true, ..
            } => Follow::StrictComplete,
            SlotState::Unconnected => Follow::Unconnected,
            SlotState::Idle | SlotState::PreConnecting => Follow::ReadyForRequest,
            _ => Follow::None,
        };

        match follow {
            Follow::Dispatch => {
                if self.slots[slot_id].enqueued_for_dispatch {
                    return None;
                }
                // Dispatch right away if the output side has demand and no
                // other dispatch holds it; queue up otherwise.
                if self.reserved.is_none()
                    && let Ok(permit) = self.out_tx.clone().try_reserve_owned()
                {
                    self.reserved = Some(permit);
                    return Some(SlotEvent::ResponseDispatchable);
                }
                self.slots[slot_id].enqueued_for_dispatch = true;
                self.dispatch_queue.push_back(slot_id);
                None
            }
            Follow::StrictSubscribe => Some(SlotEvent::ResponseEntitySubscribed),
            Follow::StrictComplete => Some(SlotEvent::ResponseEntityCompleted),
            Follow::Unconnected if !self.stopping => {
                if let Some(ctx) = self.take_queued_request(slot_id) {
                    return Some(SlotEvent::NewRequest(ctx));
                }
                if self.below_min_connections() {
                    return Some(SlotEvent::PreConnect);
                }
                None
            }
            Follow::ReadyForRequest if !self.stopping => self
                .take_queued_request(slot_id)
                .map(SlotEvent::NewRequest),
            _ => None,
        }
    }

    /// Pop the retry-buffer head for `slot_id`, maintaining the idle index.
    fn take_queued_request(&mut self, slot_id: SlotId) -> Option<RequestContext<T>> {
        let ctx = self.retry_buffer.pop_front()?;
        self.idle.remove(&slot_id);
        Some(ctx)
    }

    fn push_to_connection(
        &mut self,
        slot_id: SlotId,
        request: Request<Entity>,
    ) -> SlotEvent<T> {
        let Some(adapter) = self.slots[slot_id].conn.as_ref() else {
            return SlotEvent::ConnectionFailed(PoolError::connection(
                "connection vanished before the request was pushed",
            ));
        };
        let conn = adapter.id();
        let request = request.map(|entity| match entity {
            entity @ (Entity::Empty | Entity::Strict(_)) => entity,
            streamed => streamed.instrument(
                EntityWatch {
                    slot: slot_id,
                    conn,
                    kind: BodyKind::Request,
                    signals: self.signals_tx.clone(),
                },
                None,
            ),
        });
        match adapter.push_request(request) {
            Ok(()) => SlotEvent::RequestDispatched,
            Err(err) => SlotEvent::ConnectionFailed(err),
        }
    }

    fn instrument_response(
        &mut self,
        slot_id: SlotId,
        conn: u64,
        response: http::Response<Entity>,
    ) -> http::Response<Entity> {
        let signals = self.signals_tx.clone();
        let Some(adapter) = self.slots[slot_id].conn.as_mut() else {
            return response;
        };
        response.map(|entity| match entity {
            entity @ (Entity::Empty | Entity::Strict(_)) => entity,
            streamed => {
                let (kill_tx, kill_rx) = oneshot::channel();
                adapter.arm_entity_kill(kill_tx);
                streamed.instrument(
                    EntityWatch {
                        slot: slot_id,
                        conn,
                        kind: BodyKind::Response,
                        signals,
                    },
                    Some(kill_rx),
                )
            }
        })
    }

    // ------------------------------------------------------------------
    // Dispatch and delivery
    // ------------------------------------------------------------------

    /// Route a failed request: back into the retry buffer if it has budget
    /// left, downstream as a failure otherwise.
    fn deliver_failure(&mut self, ctx: RequestContext<T>, err: PoolError) {
        if self.stopping || !ctx.can_retry(&err) {
            debug!(error = %err, retries_left = ctx.retries_left(), "request failed terminally");
            self.push_result(ResponseContext::new(ctx, Err(err)));
            return;
        }

        let ctx = ctx.retried();
        debug!(
            error = %err,
            retries_left = ctx.retries_left(),
            "request failed, queuing retry"
        );
        match self.idle.first().copied() {
            Some(slot_id) => {
                self.idle.remove(&slot_id);
                self.pending.push_back((slot_id, SlotEvent::NewRequest(ctx)));
            }
            // Retries queue behind fresh arrivals.
            None => self.retry_buffer.push_back(ctx),
        }
    }

    /// Emit a successful response, preferring the permit reserved for this
    /// dispatch.
    fn emit_response(&mut self, ctx: RequestContext<T>, response: http::Response<Entity>) {
        let context = ResponseContext::new(ctx, Ok(response));
        if let Some(permit) = self.reserved.take() {
            permit.send(context);
        } else {
            self.push_result(context);
        }
    }

    fn push_result(&mut self, context: ResponseContext<T>) {
        match self.out_tx.clone().try_reserve_owned() {
            Ok(permit) => {
                permit.send(context);
            }
            Err(_) => self.emit_buffer.push_back(context),
        }
    }

    // ------------------------------------------------------------------
    // Connections and bookkeeping
    // ------------------------------------------------------------------

    fn open_connection(&mut self, slot_id: SlotId) {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;

        debug!(slot = slot_id, conn = conn_id, "opening connection");
        let adapter = ConnectionAdapter::open(
            slot_id,
            conn_id,
            Arc::clone(&self.factory),
            self.config.pipelining_limit,
            self.events_tx.clone(),
        );
        let slot = &mut self.slots[slot_id];
        slot.attempt_level = self.embargo.level();
        slot.conn = Some(adapter);
        slot.conn_eof = false;
    }

    fn update_idle_index(&mut self, slot_id: SlotId) {
        if self.slots[slot_id].state.is_idle() {
            self.idle.insert(slot_id);
        } else {
            self.idle.remove(&slot_id);
        }
    }

    fn broadcast_embargo(&mut self) {
        let level = self.embargo.level();
        for id in 0..self.slots.len() {
            self.pending
                .push_back((id, SlotEvent::NewConnectionEmbargo(level)));
        }
        self.drain_pending();
    }

    fn connected_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state.is_connected())
            .count()
    }

    fn below_min_connections(&self) -> bool {
        let min = self.config.effective_min_connections();
        if min == 0 {
            return false;
        }
        let warm = self
            .slots
            .iter()
            .filter(|slot| slot.state.is_connected() || slot.state.is_connecting())
            .count();
        warm < min
    }

    fn quiesced(&self) -> bool {
        self.retry_buffer.is_empty()
            && self.dispatch_queue.is_empty()
            && self.emit_buffer.is_empty()
            && self
                .slots
                .iter()
                .all(|slot| !slot.state.has_ongoing_exchange())
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            connected: self.connected_count(),
            connecting: self
                .slots
                .iter()
                .filter(|slot| slot.state.is_connecting())
                .count(),
            idle: self.idle.len(),
            in_flight: self
                .slots
                .iter()
                .filter(|slot| slot.state.has_ongoing_exchange())
                .count(),
            retry_depth: self.retry_buffer.len(),
            embargo: self.embargo.level(),
        }
    }

    /// Stop every slot: pending requests fail with a shutdown error, idle
    /// connections close cleanly, entity streams in flight are aborted.
    fn shut_down_slots(&mut self) {
        self.stopping = true;

        // Requests that never reached a slot fail too.
        while let Some(ctx) = self.retry_buffer.pop_front() {
            let context = ResponseContext::new(ctx, Err(PoolError::PoolShutdown));
            self.emit_buffer.push_back(context);
        }

        for id in 0..self.slots.len() {
            self.handle(id, SlotEvent::Shutdown);
        }

        // Hand buffered results to a drain task so a still-attached
        // receiver sees every outcome; if it hung up they drop with it.
        if !self.emit_buffer.is_empty() {
            let out = self.out_tx.clone();
            let remaining: Vec<_> = self.emit_buffer.drain(..).collect();
            tokio::spawn(async move {
                for context in remaining {
                    if out.send(context).await.is_err() {
                        break;
                    }
                }
            });
        }
    }
}
