//! Middleware sending matched requests to the functions runtime

use crate::error::ProxyError;
use crate::host::{Flow, Middleware};
use crate::pool::{ProxyAgent, ProxyBody};
use crate::routes::RouteMatcher;
use futures::future::BoxFuture;
use futures::FutureExt;
use hyper::body::{Body, Incoming};
use hyper::{Request, Response, Uri};
use std::sync::Arc;
use tracing::{debug, error};

/// Sends a request upstream and yields the upstream response
pub trait Forward<B>: Send + Sync {
    fn forward(&self, req: Request<B>) -> BoxFuture<'_, Result<Response<ProxyBody>, ProxyError>>;
}

impl<B> Forward<B> for ProxyAgent<B>
where
    B: Body + Send + Unpin + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn forward(&self, req: Request<B>) -> BoxFuture<'_, Result<Response<ProxyBody>, ProxyError>> {
        self.send_request(req).boxed()
    }
}

/// Route dispatcher.
///
/// A request whose path and query match any configured pattern is forwarded to the
/// runtime; everything else passes through untouched. Nothing is mutated per request,
/// so one dispatcher serves any number of concurrent requests.
pub struct Dispatcher<F> {
    matcher: RouteMatcher,
    base_url: Arc<str>,
    forwarder: F,
}

impl<F> Dispatcher<F> {
    pub fn new(matcher: RouteMatcher, base_url: &str, forwarder: F) -> Self {
        Self {
            matcher,
            base_url: Arc::from(base_url.trim_end_matches('/')),
            forwarder,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Whether a request with this URI would be sent to the runtime
    pub fn should_forward(&self, uri: &Uri) -> bool {
        uri.path_and_query()
            .is_some_and(|pq| self.matcher.matches(pq.as_str()))
    }

    fn rewrite(&self, uri: &Uri) -> Result<Uri, ProxyError> {
        let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let target = format!("{}{}", self.base_url, path);
        target
            .parse()
            .map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", target, e)))
    }
}

impl<F> Dispatcher<F> {
    /// Decide what to do with one request
    pub async fn dispatch<B>(&self, mut req: Request<B>) -> Flow<B>
    where
        F: Forward<B>,
    {
        if !self.should_forward(req.uri()) {
            return Flow::Next(req);
        }

        let original = req.uri().clone();
        match self.rewrite(&original) {
            Ok(uri) => *req.uri_mut() = uri,
            Err(e) => {
                error!(uri = %original, error = %e, "Failed to build functions runtime URL");
                return Flow::Error(e);
            }
        }

        debug!(method = %req.method(), uri = %original, target = %req.uri(), "Forwarding to functions runtime");

        match self.forwarder.forward(req).await {
            Ok(response) => Flow::Respond(response),
            Err(e) => {
                error!(uri = %original, error = %e, "Functions runtime request failed");
                Flow::Error(e)
            }
        }
    }
}

impl<F> Middleware<Incoming> for Dispatcher<F>
where
    F: Forward<Incoming>,
{
    fn handle(&self, req: Request<Incoming>) -> BoxFuture<'_, Flow<Incoming>> {
        self.dispatch(req).boxed()
    }
}
