//! Connection factory seam and the per-slot connection adapter.
//!
//! The pool never touches the wire. A caller-supplied [`ConnectionFactory`]
//! receives a request stream and an event sender and drives one connection
//! for as long as both live; the adapter owns the pool side of those
//! channels and forwards everything onto the pool's single event loop.

use std::sync::Arc;

use async_trait::async_trait;
use http::Request;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::entity::Entity;
use crate::error::{PoolError, Result};
use crate::slot::{PoolEvent, SlotId};

/// The pool's side of one connection, handed to the factory.
///
/// The factory consumes requests from `requests` and reports everything
/// that happens on the connection through `events`. A dropped `requests`
/// stream means the pool closed the connection; the factory should then
/// wind it down.
pub struct ConnectionIo {
    /// Requests to put on the wire, in order.
    pub requests: mpsc::Receiver<Request<Entity>>,
    /// Responses and connection-level outcomes, in order.
    pub events: mpsc::Sender<ConnectionEvent>,
}

/// What a live connection reports back to the pool.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A response head (and entity) arrived.
    Response(http::Response<Entity>),
    /// The connection ended cleanly (server closed, keep-alive expired).
    Completed,
    /// The connection failed after it was established.
    Failed(PoolError),
}

/// Opens connections to the pool's host.
///
/// `connect` resolves once the connection is established: an `Err` counts
/// as a connect-time failure and feeds the pool's backoff; anything the
/// connection does afterwards travels through [`ConnectionIo::events`].
/// Implementations usually spawn their own task to serve the connection
/// and return as soon as the transport is up.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    async fn connect(&self, io: ConnectionIo) -> Result<()>;
}

#[async_trait]
impl<F> ConnectionFactory for Arc<F>
where
    F: ConnectionFactory + ?Sized,
{
    async fn connect(&self, io: ConnectionIo) -> Result<()> {
        (**self).connect(io).await
    }
}

/// Pool-side handle for one connection attempt and, once established, the
/// live connection. Owned by a slot; a slot that abandons its adapter never
/// hears from it again because every forwarded event carries the adapter's
/// identity and stale identities are dropped at the pool loop.
pub(crate) struct ConnectionAdapter {
    id: u64,
    slot: SlotId,
    requests: mpsc::Sender<Request<Entity>>,
    /// Kill-switch for the response entity currently streaming, if any.
    entity_kill: Option<oneshot::Sender<PoolError>>,
    pump: JoinHandle<()>,
    closed: bool,
}

impl ConnectionAdapter {
    /// Start a connection attempt through `factory` and forward its
    /// lifecycle onto the pool's event channel.
    pub(crate) fn open(
        slot: SlotId,
        id: u64,
        factory: Arc<dyn ConnectionFactory>,
        pipelining_limit: usize,
        events: mpsc::UnboundedSender<PoolEvent>,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::channel(pipelining_limit.max(1));
        let (event_tx, event_rx) = mpsc::channel(pipelining_limit.max(1));
        let io = ConnectionIo {
            requests: request_rx,
            events: event_tx,
        };

        let pump = tokio::spawn(pump(slot, id, factory, io, event_rx, events));

        Self {
            id,
            slot,
            requests: request_tx,
            entity_kill: None,
            pump,
            closed: false,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Hand one request to the factory.
    pub(crate) fn push_request(&self, request: Request<Entity>) -> Result<()> {
        self.requests
            .try_send(request)
            .map_err(|_| PoolError::connection("connection closed while sending the request"))
    }

    /// Arm the kill-switch for the response entity now streaming.
    pub(crate) fn arm_entity_kill(&mut self, kill: oneshot::Sender<PoolError>) {
        self.entity_kill = Some(kill);
    }

    /// Tear the connection down, aborting any in-flight response entity
    /// with `failure` (or a generic close cause).
    pub(crate) fn close(&mut self, failure: Option<PoolError>) {
        if self.closed {
            return;
        }
        self.closed = true;
        trace!(slot = self.slot, conn = self.id, "closing connection");

        if let Some(kill) = self.entity_kill.take() {
            let cause = failure
                .unwrap_or_else(|| PoolError::connection("connection was closed by the pool"));
            let _ = kill.send(cause);
        }
        self.pump.abort();
        // The request sender drops with the adapter, ending the factory's
        // request stream.
    }
}

impl Drop for ConnectionAdapter {
    fn drop(&mut self) {
        self.close(None);
    }
}

/// What the adapter forwards onto the pool loop.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    Established,
    AttemptFailed(PoolError),
    Response(http::Response<Entity>),
    Completed,
    Failed(PoolError),
}

/// Drive one connection: await establishment, then forward connection
/// events until a terminal one (or until the factory hangs up).
async fn pump(
    slot: SlotId,
    conn: u64,
    factory: Arc<dyn ConnectionFactory>,
    io: ConnectionIo,
    mut event_rx: mpsc::Receiver<ConnectionEvent>,
    events: mpsc::UnboundedSender<PoolEvent>,
) {
    let forward = |event: ConnEvent| events.send(PoolEvent::Conn { slot, conn, event }).is_ok();

    match factory.connect(io).await {
        Ok(()) => {
            if !forward(ConnEvent::Established) {
                return;
            }
        }
        Err(err) => {
            // Establishment failures all count as connect-time failures,
            // whatever the factory wrapped them in.
            let err = match err {
                err @ PoolError::ConnectAttemptFailed(_) => err,
                other => PoolError::connect_attempt(other.to_string()),
            };
            forward(ConnEvent::AttemptFailed(err));
            return;
        }
    }

    while let Some(event) = event_rx.recv().await {
        match event {
            ConnectionEvent::Response(response) => {
                if !forward(ConnEvent::Response(response)) {
                    return;
                }
            }
            ConnectionEvent::Completed => {
                forward(ConnEvent::Completed);
                return;
            }
            ConnectionEvent::Failed(err) => {
                let err = match err {
                    err @ PoolError::ConnectionFailed(_) => err,
                    other => PoolError::connection(other.to_string()),
                };
                forward(ConnEvent::Failed(err));
                return;
            }
        }
    }

    // The factory dropped its event sender without a terminal event; treat
    // it as a clean close.
    forward(ConnEvent::Completed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Response;

    struct EchoFactory;

    #[async_trait]
    impl ConnectionFactory for EchoFactory {
        async fn connect(&self, mut io: ConnectionIo) -> Result<()> {
            tokio::spawn(async move {
                while let Some(_request) = io.requests.recv().await {
                    let sent = io
                        .events
                        .send(ConnectionEvent::Response(Response::new(Entity::empty())))
                        .await;
                    if sent.is_err() {
                        return;
                    }
                }
                let _ = io.events.send(ConnectionEvent::Completed).await;
            });
            Ok(())
        }
    }

    struct RefusingFactory;

    #[async_trait]
    impl ConnectionFactory for RefusingFactory {
        async fn connect(&self, _io: ConnectionIo) -> Result<()> {
            Err(PoolError::slot("simulated refusal"))
        }
    }

    fn conn_event(event: PoolEvent) -> ConnEvent {
        match event {
            PoolEvent::Conn { event, .. } => event,
            other => panic!("unexpected pool event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_adapter_round_trip() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let adapter = ConnectionAdapter::open(0, 1, Arc::new(EchoFactory), 1, events_tx);

        let established = conn_event(events_rx.recv().await.unwrap());
        assert!(matches!(established, ConnEvent::Established));

        adapter
            .push_request(Request::new(Entity::empty()))
            .unwrap();
        let response = conn_event(events_rx.recv().await.unwrap());
        assert!(matches!(response, ConnEvent::Response(_)));

        drop(adapter);
        assert!(events_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_establishment_failure_is_connect_time() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let _adapter = ConnectionAdapter::open(0, 1, Arc::new(RefusingFactory), 1, events_tx);

        let event = conn_event(events_rx.recv().await.unwrap());
        let ConnEvent::AttemptFailed(err) = event else {
            panic!("expected attempt failure, got {event:?}");
        };
        assert!(matches!(err, PoolError::ConnectAttemptFailed(_)));
    }

    #[tokio::test]
    async fn test_factory_hangup_counts_as_clean_close() {
        struct Hangup;

        #[async_trait]
        impl ConnectionFactory for Hangup {
            async fn connect(&self, io: ConnectionIo) -> Result<()> {
                drop(io);
                Ok(())
            }
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let _adapter = ConnectionAdapter::open(0, 7, Arc::new(Hangup), 1, events_tx);

        assert!(matches!(
            conn_event(events_rx.recv().await.unwrap()),
            ConnEvent::Established
        ));
        assert!(matches!(
            conn_event(events_rx.recv().await.unwrap()),
            ConnEvent::Completed
        ));
    }
}
