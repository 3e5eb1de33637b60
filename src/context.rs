//! Request and response contexts.
//!
//! A request entering the pool is decomposed into a rebuildable head plus
//! its entity, because `http::Request` cannot be cloned and a retry has to
//! put an equivalent request back on the wire. The context travels with the
//! request through slots and retries and comes back attached to the
//! response.

use http::header::CONNECTION;
use http::{HeaderMap, Method, Request, Response, Uri, Version};

use crate::entity::Entity;
use crate::error::{PoolError, Result};

/// A request plus the pool-side bookkeeping it carries: retry budget and
/// the caller's opaque correlation tag.
#[derive(Debug)]
pub struct RequestContext<T> {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    entity: Entity,
    entity_spent: bool,
    retries_left: u32,
    tag: T,
}

impl<T> RequestContext<T> {
    pub(crate) fn new(request: Request<Entity>, tag: T, retries: u32) -> Self {
        let (parts, entity) = request.into_parts();
        Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            entity,
            entity_spent: false,
            retries_left: retries,
            tag,
        }
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request URI.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The caller's correlation tag.
    pub fn tag(&self) -> &T {
        &self.tag
    }

    /// How many re-dispatches this request has left.
    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }

    /// Consume the context, returning the tag.
    pub fn into_tag(self) -> T {
        self.tag
    }

    /// Whether the request asked for the connection to be closed after the
    /// exchange.
    pub(crate) fn wants_close(&self) -> bool {
        connection_close(&self.headers)
    }

    /// Build the wire request for one dispatch attempt.
    ///
    /// Strict and empty entities are cloned so the context stays
    /// replayable; a streamed entity is moved out and the context is marked
    /// spent.
    pub(crate) fn wire_request(&mut self) -> Request<Entity> {
        let entity = match self.entity.try_clone() {
            Some(clone) => clone,
            None => {
                self.entity_spent = true;
                std::mem::take(&mut self.entity)
            }
        };
        let mut request = Request::new(entity);
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();
        *request.version_mut() = self.version;
        *request.headers_mut() = self.headers.clone();
        request
    }

    /// Whether this context may be dispatched again after failing with
    /// `error`.
    pub(crate) fn can_retry(&self, error: &PoolError) -> bool {
        self.retries_left > 0 && error.is_retryable() && !self.entity_spent
    }

    /// The context for the next attempt, with one retry spent.
    pub(crate) fn retried(mut self) -> Self {
        self.retries_left = self.retries_left.saturating_sub(1);
        self
    }
}

/// The outcome of one pooled request, paired with its originating context.
#[derive(Debug)]
pub struct ResponseContext<T> {
    request: RequestContext<T>,
    result: Result<Response<Entity>>,
}

impl<T> ResponseContext<T> {
    pub(crate) fn new(request: RequestContext<T>, result: Result<Response<Entity>>) -> Self {
        Self { request, result }
    }

    /// The caller's correlation tag.
    pub fn tag(&self) -> &T {
        self.request.tag()
    }

    /// The originating request context.
    pub fn request(&self) -> &RequestContext<T> {
        &self.request
    }

    /// The response or failure.
    pub fn result(&self) -> &Result<Response<Entity>> {
        &self.result
    }

    /// Whether the exchange produced a response.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Split into tag and outcome.
    pub fn into_parts(self) -> (T, Result<Response<Entity>>) {
        (self.request.tag, self.result)
    }
}

/// Check whether a header block asks for `Connection: close`.
pub(crate) fn connection_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn request(entity: Entity) -> Request<Entity> {
        let mut request = Request::new(entity);
        *request.uri_mut() = Uri::from_static("http://example.com/things");
        request
    }

    #[test]
    fn test_strict_request_survives_dispatch() {
        let mut ctx = RequestContext::new(request(Entity::strict("body")), 7u32, 2);

        let wire = ctx.wire_request();
        assert_eq!(wire.body().as_bytes(), Some(&Bytes::from("body")));

        // Still replayable after a dispatch.
        assert!(ctx.can_retry(&PoolError::connection("reset")));
        let ctx = ctx.retried();
        assert_eq!(ctx.retries_left(), 1);
    }

    #[test]
    fn test_streamed_request_is_spent_after_dispatch() {
        let (_tx, rx) = mpsc::channel(1);
        let mut ctx = RequestContext::new(request(Entity::streamed(rx)), (), 3);

        let _wire = ctx.wire_request();
        assert!(!ctx.can_retry(&PoolError::connection("reset")));
    }

    #[test]
    fn test_no_retries_left() {
        let ctx = RequestContext::new(request(Entity::empty()), (), 0);
        assert!(!ctx.can_retry(&PoolError::connection("reset")));
    }

    #[test]
    fn test_connection_close_detection() {
        let mut headers = HeaderMap::new();
        assert!(!connection_close(&headers));

        headers.insert(CONNECTION, "keep-alive".parse().unwrap());
        assert!(!connection_close(&headers));

        headers.insert(CONNECTION, "Keep-Alive, Close".parse().unwrap());
        assert!(connection_close(&headers));
    }
}
