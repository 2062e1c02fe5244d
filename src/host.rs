//! Contract between the plugin and the dev server hosting it
//!
//! The host owns the HTTP listener and the middleware pipeline; this module only
//! describes the pieces the plugin needs from it: a way to register middleware and
//! a channel for telling connected clients to reload.

use crate::error::ProxyError;
use crate::pool::ProxyBody;
use futures::future::BoxFuture;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::sync::Arc;
use tokio::sync::broadcast;

/// What a middleware decided to do with a request
pub enum Flow<B = Incoming> {
    /// Not handled here: continue with the next handler, request untouched
    Next(Request<B>),
    /// Handled: send this response to the client
    Respond(Response<ProxyBody>),
    /// Handling failed: continue with the host's error handling
    Error(ProxyError),
}

impl<B> Flow<B> {
    pub fn is_next(&self) -> bool {
        matches!(self, Flow::Next(_))
    }
}

/// A step in the host's request pipeline
pub trait Middleware<B = Incoming>: Send + Sync {
    fn handle(&self, req: Request<B>) -> BoxFuture<'_, Flow<B>>;
}

/// Events pushed to clients connected to the dev server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotEvent {
    /// Reload the whole page
    FullReload,
}

/// Broadcast channel from the dev server to its connected clients
#[derive(Debug, Clone)]
pub struct HotChannel {
    tx: broadcast::Sender<HotEvent>,
}

impl HotChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Send an event to every connected client, returning how many received it
    pub fn send(&self, event: HotEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HotEvent> {
        self.tx.subscribe()
    }

    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for HotChannel {
    fn default() -> Self {
        Self::new(16)
    }
}

/// The dev server, as seen by the plugin's setup hook
pub trait DevServerHost: Send + Sync {
    /// Append a middleware to the request pipeline
    fn use_middleware(&self, middleware: Arc<dyn Middleware<Incoming>>);

    /// Channel to the clients connected to the dev server
    fn hot(&self) -> HotChannel;
}
