//! Request and response entity model.
//!
//! Entities come in three shapes: empty, strict (a single `Bytes` chunk
//! already in memory) and streamed. Strict and empty entities can be cloned
//! for retries and complete the moment they are handed over; streamed
//! entities are single-use frame streams whose lifecycle (first poll,
//! completion, failure) the pool observes through instrumentation installed
//! on the connection boundary.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};

use crate::error::{PoolError, Result};

/// An HTTP message body as the pool sees it.
#[derive(Debug, Default)]
pub enum Entity {
    /// No body.
    #[default]
    Empty,
    /// A body fully available in memory.
    Strict(Bytes),
    /// A body delivered as a stream of frames.
    Streamed(EntityStream),
}

impl Entity {
    /// Create an empty entity.
    pub fn empty() -> Self {
        Self::Empty
    }

    /// Create a strict entity from in-memory bytes.
    pub fn strict(bytes: impl Into<Bytes>) -> Self {
        Self::Strict(bytes.into())
    }

    /// Create a streamed entity from a frame channel.
    ///
    /// The sending side delivers data frames and at most one terminal
    /// error; dropping the sender ends the stream.
    pub fn streamed(frames: mpsc::Receiver<Result<Bytes>>) -> Self {
        Self::Streamed(EntityStream {
            frames,
            watch: None,
            kill: None,
            finished: false,
            polled: false,
        })
    }

    /// Whether this entity is statically known to carry no data.
    pub fn is_known_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Strict(bytes) => bytes.is_empty(),
            Self::Streamed(_) => false,
        }
    }

    /// Whether the full body is already in memory.
    pub fn is_strict(&self) -> bool {
        matches!(self, Self::Empty | Self::Strict(_))
    }

    /// The strict payload, if there is one.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Strict(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Clone the entity if it is replayable. Streamed entities are
    /// single-use and return `None`.
    pub fn try_clone(&self) -> Option<Self> {
        match self {
            Self::Empty => Some(Self::Empty),
            Self::Strict(bytes) => Some(Self::Strict(bytes.clone())),
            Self::Streamed(_) => None,
        }
    }

    /// Collect the whole entity into memory.
    pub async fn collect(self) -> Result<Bytes> {
        match self {
            Self::Empty => Ok(Bytes::new()),
            Self::Strict(bytes) => Ok(bytes),
            Self::Streamed(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(frame) = stream.frame().await {
                    buf.extend_from_slice(&frame?);
                }
                Ok(buf.freeze())
            }
        }
    }

    /// Drain the entity without keeping its data.
    ///
    /// Draining to the end counts as orderly consumption; the slot that
    /// produced a streamed entity becomes reusable once the drain finishes.
    pub async fn discard(self) {
        if let Self::Streamed(mut stream) = self {
            while let Some(frame) = stream.frame().await {
                if frame.is_err() {
                    break;
                }
            }
        }
    }

    /// Install lifecycle instrumentation on a streamed entity.
    ///
    /// Strict and empty entities pass through untouched; their lifecycle is
    /// short-circuited by the slot instead.
    pub(crate) fn instrument(
        self,
        watch: EntityWatch,
        kill: Option<oneshot::Receiver<PoolError>>,
    ) -> Self {
        match self {
            Self::Streamed(mut stream) => {
                stream.watch = Some(watch);
                stream.kill = kill;
                Self::Streamed(stream)
            }
            other => other,
        }
    }
}

impl From<Bytes> for Entity {
    fn from(bytes: Bytes) -> Self {
        Self::Strict(bytes)
    }
}

impl From<&'static str> for Entity {
    fn from(s: &'static str) -> Self {
        Self::Strict(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for Entity {
    fn from(s: String) -> Self {
        Self::Strict(Bytes::from(s))
    }
}

impl From<Vec<u8>> for Entity {
    fn from(v: Vec<u8>) -> Self {
        Self::Strict(Bytes::from(v))
    }
}

/// Which side of the exchange a body belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyKind {
    Request,
    Response,
}

/// A lifecycle signal from an instrumented entity back to the pool.
#[derive(Debug)]
pub(crate) struct BodySignal {
    pub slot: usize,
    pub conn: u64,
    pub kind: BodyKind,
    pub event: BodyEvent,
}

#[derive(Debug)]
pub(crate) enum BodyEvent {
    /// The consumer polled the stream for the first time.
    Subscribed,
    /// The stream ended cleanly.
    Completed,
    /// The stream failed or was abandoned by its consumer.
    Failed(PoolError),
}

/// Instrumentation handle carried inside a streamed entity.
pub(crate) struct EntityWatch {
    pub slot: usize,
    pub conn: u64,
    pub kind: BodyKind,
    pub signals: mpsc::UnboundedSender<BodySignal>,
}

impl EntityWatch {
    fn send(&self, event: BodyEvent) {
        let _ = self.signals.send(BodySignal {
            slot: self.slot,
            conn: self.conn,
            kind: self.kind,
            event,
        });
    }
}

impl std::fmt::Debug for EntityWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityWatch")
            .field("slot", &self.slot)
            .field("conn", &self.conn)
            .field("kind", &self.kind)
            .finish()
    }
}

/// A streamed entity body.
///
/// Yields `Bytes` frames until the producer finishes or fails. When the
/// pool produced this stream, dropping it before the end counts as
/// cancellation and costs the underlying connection.
#[derive(Debug)]
pub struct EntityStream {
    frames: mpsc::Receiver<Result<Bytes>>,
    watch: Option<EntityWatch>,
    kill: Option<oneshot::Receiver<PoolError>>,
    finished: bool,
    polled: bool,
}

impl EntityStream {
    /// Receive the next frame.
    pub async fn frame(&mut self) -> Option<Result<Bytes>> {
        self.next().await
    }

    fn note_first_poll(&mut self) {
        if !self.polled {
            self.polled = true;
            if let Some(watch) = &self.watch {
                watch.send(BodyEvent::Subscribed);
            }
        }
    }

    fn finish(&mut self, failure: Option<PoolError>) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(watch) = &self.watch {
            match failure {
                None => watch.send(BodyEvent::Completed),
                Some(err) => watch.send(BodyEvent::Failed(err)),
            }
        }
    }
}

impl Stream for EntityStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }
        this.note_first_poll();

        // An armed kill-switch takes precedence over buffered frames.
        if let Some(kill) = this.kill.as_mut() {
            match Pin::new(kill).poll(cx) {
                Poll::Ready(Ok(cause)) => {
                    this.kill = None;
                    // The pool fired the switch; it does not need a signal back.
                    this.finished = true;
                    return Poll::Ready(Some(Err(cause)));
                }
                Poll::Ready(Err(_)) => {
                    this.kill = None;
                }
                Poll::Pending => {}
            }
        }

        match this.frames.poll_recv(cx) {
            Poll::Ready(Some(Ok(bytes))) => Poll::Ready(Some(Ok(bytes))),
            Poll::Ready(Some(Err(err))) => {
                this.finish(Some(err.clone()));
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.finish(None);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for EntityStream {
    fn drop(&mut self) {
        if !self.finished
            && let Some(watch) = self.watch.take()
        {
            let err = match watch.kind {
                BodyKind::Request => {
                    PoolError::request_entity("request entity was dropped before completion")
                }
                BodyKind::Response => {
                    PoolError::response_entity("response entity was dropped before completion")
                }
            };
            watch.send(BodyEvent::Failed(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watched_stream(
        frames: mpsc::Receiver<Result<Bytes>>,
    ) -> (Entity, mpsc::UnboundedReceiver<BodySignal>, oneshot::Sender<PoolError>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let entity = Entity::streamed(frames).instrument(
            EntityWatch {
                slot: 0,
                conn: 1,
                kind: BodyKind::Response,
                signals: signal_tx,
            },
            Some(kill_rx),
        );
        (entity, signal_rx, kill_tx)
    }

    #[test]
    fn test_known_empty() {
        assert!(Entity::empty().is_known_empty());
        assert!(Entity::strict(Bytes::new()).is_known_empty());
        assert!(!Entity::strict("payload").is_known_empty());
    }

    #[test]
    fn test_try_clone_is_strict_only() {
        assert!(Entity::strict("x").try_clone().is_some());
        let (_tx, rx) = mpsc::channel(1);
        assert!(Entity::streamed(rx).try_clone().is_none());
    }

    #[tokio::test]
    async fn test_collect_strict_and_streamed() {
        assert_eq!(
            Entity::strict("hello").collect().await.unwrap(),
            Bytes::from("hello")
        );

        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(Bytes::from("he"))).await.unwrap();
        tx.send(Ok(Bytes::from("llo"))).await.unwrap();
        drop(tx);
        assert_eq!(
            Entity::streamed(rx).collect().await.unwrap(),
            Bytes::from("hello")
        );
    }

    #[tokio::test]
    async fn test_signals_subscription_and_completion() {
        let (tx, rx) = mpsc::channel(4);
        let (entity, mut signals, _kill) = watched_stream(rx);

        tx.send(Ok(Bytes::from("data"))).await.unwrap();
        drop(tx);
        entity.collect().await.unwrap();

        let first = signals.recv().await.unwrap();
        assert!(matches!(first.event, BodyEvent::Subscribed));
        let second = signals.recv().await.unwrap();
        assert!(matches!(second.event, BodyEvent::Completed));
    }

    #[tokio::test]
    async fn test_drop_before_completion_signals_failure() {
        let (_tx, rx) = mpsc::channel::<Result<Bytes>>(1);
        let (entity, mut signals, _kill) = watched_stream(rx);

        drop(entity);

        let signal = signals.recv().await.unwrap();
        assert!(matches!(signal.event, BodyEvent::Failed(_)));
    }

    #[tokio::test]
    async fn test_kill_switch_aborts_stream() {
        let (_tx, rx) = mpsc::channel::<Result<Bytes>>(1);
        let (entity, mut signals, kill) = watched_stream(rx);

        kill.send(PoolError::PoolShutdown).unwrap();

        let Entity::Streamed(mut stream) = entity else {
            unreachable!()
        };
        let frame = stream.frame().await.unwrap();
        assert!(matches!(frame, Err(PoolError::PoolShutdown)));
        assert!(stream.frame().await.is_none());

        // Killed streams do not echo a failure back at the pool.
        let first = signals.recv().await.unwrap();
        assert!(matches!(first.event, BodyEvent::Subscribed));
        assert!(signals.try_recv().is_err());
    }
}
