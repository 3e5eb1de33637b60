//! Slot state machine.
//!
//! Each slot is a finite-state machine over one logical connection and at
//! most one request. Transitions are pure: they take the current state, an
//! event and a read-only environment snapshot, and produce the next state
//! plus at most one action for the driver to carry out. Everything with a
//! side effect (opening and closing connections, timers, dispatch) lives in
//! the driver, not here.

use std::time::Duration;

use http::Response;

use crate::config::PoolConfig;
use crate::context::{RequestContext, connection_close};
use crate::embargo::Embargo;
use crate::entity::Entity;
use crate::error::PoolError;

/// Events delivered to a slot.
#[derive(Debug)]
pub(crate) enum SlotEvent<T> {
    PreConnect,
    ConnectionAttemptSucceeded,
    ConnectionAttemptFailed(PoolError),
    NewConnectionEmbargo(Duration),
    NewRequest(RequestContext<T>),
    RequestDispatched,
    RequestEntityCompleted,
    RequestEntityFailed(PoolError),
    ResponseReceived(Response<Entity>),
    ResponseDispatchable,
    ResponseEntitySubscribed,
    ResponseEntityCompleted,
    ResponseEntityFailed(PoolError),
    ConnectionCompleted,
    ConnectionFailed(PoolError),
    Timeout,
    Shutdown,
}

impl<T> SlotEvent<T> {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::PreConnect => "pre-connect",
            Self::ConnectionAttemptSucceeded => "connection-attempt-succeeded",
            Self::ConnectionAttemptFailed(_) => "connection-attempt-failed",
            Self::NewConnectionEmbargo(_) => "new-connection-embargo",
            Self::NewRequest(_) => "new-request",
            Self::RequestDispatched => "request-dispatched",
            Self::RequestEntityCompleted => "request-entity-completed",
            Self::RequestEntityFailed(_) => "request-entity-failed",
            Self::ResponseReceived(_) => "response-received",
            Self::ResponseDispatchable => "response-dispatchable",
            Self::ResponseEntitySubscribed => "response-entity-subscribed",
            Self::ResponseEntityCompleted => "response-entity-completed",
            Self::ResponseEntityFailed(_) => "response-entity-failed",
            Self::ConnectionCompleted => "connection-completed",
            Self::ConnectionFailed(_) => "connection-failed",
            Self::Timeout => "timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Read-only facts the driver supplies for a single transition.
#[derive(Debug)]
pub(crate) struct TransitionEnv<'a> {
    pub config: &'a PoolConfig,
    /// Closing this slot's connection would drop the pool below its
    /// minimum-connection target.
    pub holds_min_connection: bool,
    /// The connection's recycling deadline has passed.
    pub lifetime_expired: bool,
    /// The connection is still attached and has not signalled EOF.
    pub connection_alive: bool,
}

/// Per-slot state. Grouped into idle/init, request phase, response phase
/// and terminal/transient states.
#[derive(Debug)]
pub(crate) enum SlotState<T> {
    /// No connection, available for work.
    Unconnected,
    /// A warm-up connection attempt is in flight; can still pick up a
    /// request while waiting.
    PreConnecting,
    /// A request-driven connection attempt is in flight.
    Connecting(RequestContext<T>),
    /// Connected and ready for a request.
    Idle,
    /// Waiting out the connect backoff before becoming available again.
    OutOfEmbargo { wait: Duration },
    /// Request is being pushed onto the connection.
    PushingRequest(RequestContext<T>),
    /// Request sent; waiting for the response head.
    WaitingForResponse(RequestContext<T>),
    /// Response received; waiting for downstream demand.
    WaitingForResponseDispatch(RequestContext<T>, Response<Entity>),
    /// Response handed downstream; waiting for the caller to start
    /// consuming the entity.
    WaitingForEntitySubscription { strict_entity: bool, close_after: bool },
    /// Entity being consumed; waiting for it to finish.
    WaitingForEndOfEntity { strict_entity: bool, close_after: bool },
    /// Driver must close the connection (reporting the failure, if any)
    /// and reset to `Unconnected`.
    ToBeClosed(Option<PoolError>),
    /// The slot hit an unexpected event; driver isolates and recycles it.
    Failed(PoolError),
}

/// One transition step: the next state and at most one driver action.
pub(crate) struct Step<T> {
    pub next: SlotState<T>,
    pub action: Option<Action<T>>,
}

impl<T> Step<T> {
    fn to(next: SlotState<T>) -> Self {
        Self { next, action: None }
    }

    fn with(next: SlotState<T>, action: Action<T>) -> Self {
        Self {
            next,
            action: Some(action),
        }
    }
}

/// Side effects requested by a transition.
pub(crate) enum Action<T> {
    /// Open a connection for this slot.
    OpenConnection,
    /// Route a failed request through the dispatcher (retry or emit).
    Deliver(RequestContext<T>, PoolError),
    /// Emit a successful response downstream. Only produced while the
    /// driver holds output demand.
    Emit(RequestContext<T>, Response<Entity>),
}

impl<T> SlotState<T> {
    /// Whether the slot can accept a new request.
    pub(crate) fn is_idle(&self) -> bool {
        matches!(self, Self::Unconnected | Self::PreConnecting | Self::Idle)
    }

    /// Whether the slot holds an established connection.
    pub(crate) fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::Idle
                | Self::PushingRequest(_)
                | Self::WaitingForResponse(_)
                | Self::WaitingForResponseDispatch(..)
                | Self::WaitingForEntitySubscription { .. }
                | Self::WaitingForEndOfEntity { .. }
        )
    }

    /// Whether a connection attempt is in flight.
    pub(crate) fn is_connecting(&self) -> bool {
        matches!(self, Self::PreConnecting | Self::Connecting(_))
    }

    /// Whether a request or response exchange is still in progress.
    pub(crate) fn has_ongoing_exchange(&self) -> bool {
        matches!(
            self,
            Self::Connecting(_)
                | Self::PushingRequest(_)
                | Self::WaitingForResponse(_)
                | Self::WaitingForResponseDispatch(..)
                | Self::WaitingForEntitySubscription { .. }
                | Self::WaitingForEndOfEntity { .. }
        )
    }

    /// The timeout to arm for this state, if any.
    pub(crate) fn state_timeout(&self, config: &PoolConfig) -> Option<Duration> {
        match self {
            Self::Idle => Some(config.idle_timeout),
            Self::OutOfEmbargo { wait } => Some(*wait),
            Self::WaitingForResponse(_) => config.response_timeout,
            Self::WaitingForEntitySubscription { .. } => {
                Some(config.response_entity_subscription_timeout)
            }
            _ => None,
        }
    }

    /// Whether the driver must close the connection on entering this state.
    pub(crate) fn should_close_connection(&self) -> bool {
        matches!(self, Self::ToBeClosed(_) | Self::Failed(_))
    }

    /// The failure to close the connection with, if any.
    pub(crate) fn close_failure(&self) -> Option<PoolError> {
        match self {
            Self::ToBeClosed(failure) => failure.clone(),
            Self::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Unconnected => "unconnected",
            Self::PreConnecting => "pre-connecting",
            Self::Connecting(_) => "connecting",
            Self::Idle => "idle",
            Self::OutOfEmbargo { .. } => "out-of-embargo",
            Self::PushingRequest(_) => "pushing-request",
            Self::WaitingForResponse(_) => "waiting-for-response",
            Self::WaitingForResponseDispatch(..) => "waiting-for-response-dispatch",
            Self::WaitingForEntitySubscription { .. } => "waiting-for-entity-subscription",
            Self::WaitingForEndOfEntity { .. } => "waiting-for-end-of-entity",
            Self::ToBeClosed(_) => "to-be-closed",
            Self::Failed(_) => "failed",
        }
    }

    /// Apply one event.
    pub(crate) fn on_event(self, event: SlotEvent<T>, env: &TransitionEnv<'_>) -> Step<T> {
        use SlotEvent as Ev;
        use SlotState as St;

        match (self, event) {
            // ----- Unconnected ---------------------------------------------
            (St::Unconnected, Ev::PreConnect) => {
                Step::with(St::PreConnecting, Action::OpenConnection)
            }
            (St::Unconnected, Ev::NewRequest(ctx)) => {
                Step::with(St::Connecting(ctx), Action::OpenConnection)
            }
            (St::Unconnected, Ev::NewConnectionEmbargo(level)) => {
                if level.is_zero() {
                    Step::to(St::Unconnected)
                } else {
                    Step::to(St::OutOfEmbargo {
                        wait: Embargo::jittered_wait(level),
                    })
                }
            }
            (St::Unconnected, Ev::Shutdown | Ev::Timeout) => Step::to(St::Unconnected),

            // ----- PreConnecting -------------------------------------------
            (St::PreConnecting, Ev::ConnectionAttemptSucceeded) => Step::to(St::Idle),
            (St::PreConnecting, Ev::ConnectionAttemptFailed(_)) => {
                Step::to(St::ToBeClosed(None))
            }
            // A request may arrive while the warm-up attempt is still in
            // flight; the pending connection serves it.
            (St::PreConnecting, Ev::NewRequest(ctx)) => Step::to(St::Connecting(ctx)),
            (St::PreConnecting, Ev::NewConnectionEmbargo(_)) => Step::to(St::PreConnecting),
            (St::PreConnecting, Ev::Shutdown) => Step::to(St::ToBeClosed(None)),

            // ----- Connecting ----------------------------------------------
            (St::Connecting(ctx), Ev::ConnectionAttemptSucceeded) => {
                Step::to(St::PushingRequest(ctx))
            }
            (St::Connecting(ctx), Ev::ConnectionAttemptFailed(err)) => {
                Step::with(St::ToBeClosed(None), Action::Deliver(ctx, err))
            }
            (St::Connecting(ctx), Ev::NewConnectionEmbargo(_)) => Step::to(St::Connecting(ctx)),
            (St::Connecting(ctx), Ev::Shutdown) => {
                Step::with(St::ToBeClosed(None), Action::Deliver(ctx, PoolError::PoolShutdown))
            }

            // ----- Idle ----------------------------------------------------
            (St::Idle, Ev::NewRequest(ctx)) => Step::to(St::PushingRequest(ctx)),
            (St::Idle, Ev::Timeout) => {
                // Warm connections below the minimum ride out the idle
                // timeout; the driver re-arms it.
                if env.holds_min_connection {
                    Step::to(St::Idle)
                } else {
                    Step::to(St::ToBeClosed(None))
                }
            }
            (St::Idle, Ev::ConnectionCompleted | Ev::ConnectionFailed(_)) => {
                Step::to(St::ToBeClosed(None))
            }
            // A lazily drained request body may finish after its response
            // already completed.
            (St::Idle, Ev::RequestEntityCompleted) => Step::to(St::Idle),
            (St::Idle, Ev::RequestEntityFailed(_)) => Step::to(St::ToBeClosed(None)),
            (St::Idle, Ev::NewConnectionEmbargo(_) | Ev::PreConnect) => Step::to(St::Idle),
            (St::Idle, Ev::Shutdown) => Step::to(St::ToBeClosed(None)),

            // ----- OutOfEmbargo --------------------------------------------
            (St::OutOfEmbargo { .. }, Ev::Timeout) => Step::to(St::Unconnected),
            (St::OutOfEmbargo { .. }, Ev::NewConnectionEmbargo(level)) => {
                if level.is_zero() {
                    Step::to(St::Unconnected)
                } else {
                    // The level changed; restart the cooldown at the new
                    // level.
                    Step::to(St::OutOfEmbargo {
                        wait: Embargo::jittered_wait(level),
                    })
                }
            }
            (St::OutOfEmbargo { .. }, Ev::Shutdown) => Step::to(St::Unconnected),

            // ----- PushingRequest ------------------------------------------
            (St::PushingRequest(ctx), Ev::RequestDispatched) => {
                Step::to(St::WaitingForResponse(ctx))
            }
            (St::PushingRequest(ctx), Ev::ConnectionFailed(err)) => {
                Step::with(St::ToBeClosed(None), Action::Deliver(ctx, err))
            }
            (St::PushingRequest(ctx), Ev::ConnectionCompleted) => {
                let err = PoolError::connection("connection closed before request was sent");
                Step::with(St::ToBeClosed(None), Action::Deliver(ctx, err))
            }
            (St::PushingRequest(ctx), Ev::NewConnectionEmbargo(_)) => {
                Step::to(St::PushingRequest(ctx))
            }
            (St::PushingRequest(ctx), Ev::Shutdown) => {
                Step::with(St::ToBeClosed(None), Action::Deliver(ctx, PoolError::PoolShutdown))
            }

            // ----- WaitingForResponse --------------------------------------
            (St::WaitingForResponse(ctx), Ev::ResponseReceived(response)) => {
                Step::to(St::WaitingForResponseDispatch(ctx, response))
            }
            (St::WaitingForResponse(ctx), Ev::RequestEntityCompleted) => {
                Step::to(St::WaitingForResponse(ctx))
            }
            (St::WaitingForResponse(ctx), Ev::RequestEntityFailed(err)) => {
                Step::with(St::ToBeClosed(Some(err.clone())), Action::Deliver(ctx, err))
            }
            (St::WaitingForResponse(ctx), Ev::Timeout) => {
                let timeout = env.config.response_timeout.unwrap_or_default();
                Step::with(
                    St::ToBeClosed(None),
                    Action::Deliver(ctx, PoolError::ResponseTimeout(timeout)),
                )
            }
            (St::WaitingForResponse(ctx), Ev::ConnectionFailed(err)) => {
                Step::with(St::ToBeClosed(None), Action::Deliver(ctx, err))
            }
            (St::WaitingForResponse(ctx), Ev::ConnectionCompleted) => {
                let err = PoolError::connection("connection closed before the response arrived");
                Step::with(St::ToBeClosed(None), Action::Deliver(ctx, err))
            }
            (St::WaitingForResponse(ctx), Ev::NewConnectionEmbargo(_)) => {
                Step::to(St::WaitingForResponse(ctx))
            }
            (St::WaitingForResponse(ctx), Ev::Shutdown) => {
                Step::with(St::ToBeClosed(None), Action::Deliver(ctx, PoolError::PoolShutdown))
            }

            // ----- WaitingForResponseDispatch ------------------------------
            (St::WaitingForResponseDispatch(ctx, response), Ev::ResponseDispatchable) => {
                let close_after = connection_close(response.headers())
                    || ctx.wants_close()
                    || env.lifetime_expired;
                let strict_entity = response.body().is_strict();
                Step::with(
                    St::WaitingForEntitySubscription {
                        strict_entity,
                        close_after,
                    },
                    Action::Emit(ctx, response),
                )
            }
            (St::WaitingForResponseDispatch(ctx, response), Ev::RequestEntityCompleted) => {
                Step::to(St::WaitingForResponseDispatch(ctx, response))
            }
            (St::WaitingForResponseDispatch(ctx, _), Ev::RequestEntityFailed(err)) => {
                Step::with(St::ToBeClosed(Some(err.clone())), Action::Deliver(ctx, err))
            }
            (St::WaitingForResponseDispatch(ctx, _), Ev::ConnectionFailed(err)) => {
                Step::with(St::ToBeClosed(None), Action::Deliver(ctx, err))
            }
            // The response head is already in; buffered entity frames can
            // still be delivered after a clean server close.
            (St::WaitingForResponseDispatch(ctx, response), Ev::ConnectionCompleted) => {
                Step::to(St::WaitingForResponseDispatch(ctx, response))
            }
            (St::WaitingForResponseDispatch(ctx, response), Ev::NewConnectionEmbargo(_)) => {
                Step::to(St::WaitingForResponseDispatch(ctx, response))
            }
            (St::WaitingForResponseDispatch(ctx, _), Ev::Shutdown) => {
                Step::with(St::ToBeClosed(None), Action::Deliver(ctx, PoolError::PoolShutdown))
            }

            // ----- WaitingForEntitySubscription ----------------------------
            (
                St::WaitingForEntitySubscription {
                    strict_entity,
                    close_after,
                },
                Ev::ResponseEntitySubscribed,
            ) => Step::to(St::WaitingForEndOfEntity {
                strict_entity,
                close_after,
            }),
            // A caller may drain the whole stream before the subscription
            // signal is processed; fold both steps into one.
            (
                St::WaitingForEntitySubscription { close_after, .. },
                Ev::ResponseEntityCompleted,
            ) => end_of_entity(close_after, env),
            (St::WaitingForEntitySubscription { .. }, Ev::ResponseEntityFailed(err)) => {
                Step::to(St::ToBeClosed(Some(err)))
            }
            (St::WaitingForEntitySubscription { .. }, Ev::Timeout) => {
                Step::to(St::ToBeClosed(Some(PoolError::SubscriptionTimeout(
                    env.config.response_entity_subscription_timeout,
                ))))
            }
            (St::WaitingForEntitySubscription { .. }, Ev::ConnectionFailed(err)) => {
                Step::to(St::ToBeClosed(Some(err)))
            }
            (state @ St::WaitingForEntitySubscription { .. }, Ev::ConnectionCompleted) => {
                Step::to(state)
            }
            (
                state @ St::WaitingForEntitySubscription { .. },
                Ev::RequestEntityCompleted | Ev::NewConnectionEmbargo(_),
            ) => Step::to(state),
            (St::WaitingForEntitySubscription { .. }, Ev::RequestEntityFailed(err)) => {
                Step::to(St::ToBeClosed(Some(err)))
            }
            (St::WaitingForEntitySubscription { .. }, Ev::Shutdown) => {
                Step::to(St::ToBeClosed(Some(PoolError::PoolShutdown)))
            }

            // ----- WaitingForEndOfEntity -----------------------------------
            (St::WaitingForEndOfEntity { close_after, .. }, Ev::ResponseEntityCompleted) => {
                end_of_entity(close_after, env)
            }
            (St::WaitingForEndOfEntity { .. }, Ev::ResponseEntityFailed(err)) => {
                Step::to(St::ToBeClosed(Some(err)))
            }
            (St::WaitingForEndOfEntity { .. }, Ev::ConnectionFailed(err)) => {
                Step::to(St::ToBeClosed(Some(err)))
            }
            (state @ St::WaitingForEndOfEntity { .. }, Ev::ConnectionCompleted) => Step::to(state),
            (
                state @ St::WaitingForEndOfEntity { .. },
                Ev::RequestEntityCompleted | Ev::NewConnectionEmbargo(_),
            ) => Step::to(state),
            (St::WaitingForEndOfEntity { .. }, Ev::RequestEntityFailed(err)) => {
                Step::to(St::ToBeClosed(Some(err)))
            }
            (St::WaitingForEndOfEntity { .. }, Ev::Shutdown) => {
                Step::to(St::ToBeClosed(Some(PoolError::PoolShutdown)))
            }

            // ----- anything else is a slot bug -----------------------------
            (state, event) => {
                let err = PoolError::slot(format!(
                    "unexpected event {} in state {}",
                    event.name(),
                    state.name()
                ));
                Step::to(St::Failed(err))
            }
        }
    }
}

/// Shared tail for response-entity completion: recycle or keep the
/// connection depending on close hints, lifetime and liveness.
fn end_of_entity<T>(close_after: bool, env: &TransitionEnv<'_>) -> Step<T> {
    if close_after || env.lifetime_expired || !env.connection_alive {
        Step::to(SlotState::ToBeClosed(None))
    } else {
        Step::to(SlotState::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Request, Uri};

    fn config() -> PoolConfig {
        PoolConfig::default()
    }

    fn env(config: &PoolConfig) -> TransitionEnv<'_> {
        TransitionEnv {
            config,
            holds_min_connection: false,
            lifetime_expired: false,
            connection_alive: true,
        }
    }

    fn ctx() -> RequestContext<u64> {
        let mut request = Request::new(Entity::empty());
        *request.uri_mut() = Uri::from_static("http://example.com/");
        RequestContext::new(request, 1, 3)
    }

    fn response() -> Response<Entity> {
        Response::new(Entity::empty())
    }

    #[test]
    fn test_request_drives_connect() {
        let config = config();
        let step = SlotState::Unconnected.on_event(SlotEvent::NewRequest(ctx()), &env(&config));
        assert!(matches!(step.next, SlotState::Connecting(_)));
        assert!(matches!(step.action, Some(Action::OpenConnection)));
    }

    #[test]
    fn test_happy_path_through_response() {
        let config = config();
        let env = env(&config);

        let step = SlotState::Connecting(ctx())
            .on_event(SlotEvent::ConnectionAttemptSucceeded, &env);
        assert!(matches!(step.next, SlotState::PushingRequest(_)));

        let step = step.next.on_event(SlotEvent::RequestDispatched, &env);
        assert!(matches!(step.next, SlotState::WaitingForResponse(_)));

        let step = step
            .next
            .on_event(SlotEvent::ResponseReceived(response()), &env);
        assert!(matches!(step.next, SlotState::WaitingForResponseDispatch(..)));

        let step = step.next.on_event(SlotEvent::ResponseDispatchable, &env);
        assert!(matches!(
            step.next,
            SlotState::WaitingForEntitySubscription {
                strict_entity: true,
                close_after: false,
            }
        ));
        assert!(matches!(step.action, Some(Action::Emit(..))));

        let step = step.next.on_event(SlotEvent::ResponseEntitySubscribed, &env);
        assert!(matches!(step.next, SlotState::WaitingForEndOfEntity { .. }));

        let step = step.next.on_event(SlotEvent::ResponseEntityCompleted, &env);
        assert!(matches!(step.next, SlotState::Idle));
    }

    #[test]
    fn test_connect_failure_delivers_request() {
        let config = config();
        let step = SlotState::Connecting(ctx()).on_event(
            SlotEvent::ConnectionAttemptFailed(PoolError::connect_attempt("refused")),
            &env(&config),
        );
        assert!(matches!(step.next, SlotState::ToBeClosed(None)));
        assert!(matches!(step.action, Some(Action::Deliver(..))));
    }

    #[test]
    fn test_embargo_entry_and_exit() {
        let config = config();
        let env = env(&config);
        let level = Duration::from_millis(100);

        let step =
            SlotState::<u64>::Unconnected.on_event(SlotEvent::NewConnectionEmbargo(level), &env);
        let SlotState::OutOfEmbargo { wait } = step.next else {
            panic!("expected out-of-embargo");
        };
        assert!(wait >= level && wait < level * 2);

        let step = SlotState::<u64>::OutOfEmbargo { wait }.on_event(SlotEvent::Timeout, &env);
        assert!(matches!(step.next, SlotState::Unconnected));
    }

    #[test]
    fn test_idle_timeout_respects_min_connections() {
        let config = config();
        let mut env = env(&config);

        env.holds_min_connection = true;
        let step = SlotState::<u64>::Idle.on_event(SlotEvent::Timeout, &env);
        assert!(matches!(step.next, SlotState::Idle));

        env.holds_min_connection = false;
        let step = SlotState::<u64>::Idle.on_event(SlotEvent::Timeout, &env);
        assert!(matches!(step.next, SlotState::ToBeClosed(None)));
    }

    #[test]
    fn test_response_timeout_fails_request() {
        let config = PoolConfig::builder()
            .response_timeout(Duration::from_secs(5))
            .build();
        let step = SlotState::WaitingForResponse(ctx()).on_event(SlotEvent::Timeout, &env(&config));
        assert!(matches!(step.next, SlotState::ToBeClosed(None)));
        let Some(Action::Deliver(_, err)) = step.action else {
            panic!("expected deliver action");
        };
        assert!(matches!(err, PoolError::ResponseTimeout(_)));
    }

    #[test]
    fn test_lifetime_expiry_closes_after_response() {
        let config = config();
        let mut env = env(&config);
        env.lifetime_expired = true;

        let step = SlotState::<u64>::WaitingForEndOfEntity {
            strict_entity: false,
            close_after: false,
        }
        .on_event(SlotEvent::ResponseEntityCompleted, &env);
        assert!(matches!(step.next, SlotState::ToBeClosed(None)));
    }

    #[test]
    fn test_close_hint_closes_after_response() {
        let config = config();
        let step = SlotState::<u64>::WaitingForEndOfEntity {
            strict_entity: false,
            close_after: true,
        }
        .on_event(SlotEvent::ResponseEntityCompleted, &env(&config));
        assert!(matches!(step.next, SlotState::ToBeClosed(None)));
    }

    #[test]
    fn test_subscription_timeout_kills_entity() {
        let config = config();
        let step = SlotState::<u64>::WaitingForEntitySubscription {
            strict_entity: false,
            close_after: false,
        }
        .on_event(SlotEvent::Timeout, &env(&config));
        assert!(matches!(
            step.next,
            SlotState::ToBeClosed(Some(PoolError::SubscriptionTimeout(_)))
        ));
    }

    #[test]
    fn test_unexpected_event_isolates_slot() {
        let config = config();
        let step = SlotState::<u64>::Idle.on_event(SlotEvent::ResponseDispatchable, &env(&config));
        assert!(matches!(step.next, SlotState::Failed(_)));
    }

    #[test]
    fn test_dispatch_honors_connection_close_header() {
        let config = config();
        let mut response = response();
        response
            .headers_mut()
            .insert(http::header::CONNECTION, "close".parse().unwrap());

        let step = SlotState::WaitingForResponseDispatch(ctx(), response)
            .on_event(SlotEvent::ResponseDispatchable, &env(&config));
        assert!(matches!(
            step.next,
            SlotState::WaitingForEntitySubscription {
                close_after: true,
                ..
            }
        ));
    }
}
