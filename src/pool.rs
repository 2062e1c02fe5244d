//! Pooled HTTP forwarding to the functions runtime
//!
//! One [`ProxyAgent`] is created per session once the runtime reported its address,
//! and every matched request goes through it. Connections to the runtime are kept
//! alive and reused between requests.

use crate::error::ProxyError;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Body, Bytes, Incoming};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Body type of responses streamed back from the runtime
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Forwarding agent bound to the runtime's base URL
pub struct ProxyAgent<B = Incoming> {
    client: Client<HttpConnector, B>,
    target: Uri,
    /// `scheme://authority` of the target, without a trailing slash
    base_url: String,
    config: PoolConfig,
}

impl<B> ProxyAgent<B>
where
    B: Body + Send + Unpin + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    /// Create an agent for `target`, an absolute `http://host:port` base URL
    pub fn new(target: &str, config: PoolConfig) -> Result<Self, ProxyError> {
        let target: Uri = target
            .trim_end_matches('/')
            .parse()
            .map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", target, e)))?;
        if target.scheme_str() != Some("http") || target.authority().is_none() {
            return Err(ProxyError::InvalidTarget(format!(
                "{}: expected an http://host:port URL",
                target
            )));
        }

        let base_url = format!(
            "{}://{}",
            target.scheme_str().unwrap_or("http"),
            target.authority().map(|a| a.as_str()).unwrap_or_default()
        );

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            %target,
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Proxy agent initialized"
        );

        Ok(Self {
            client,
            target,
            base_url,
            config,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn target(&self) -> &Uri {
        &self.target
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Forward a request to the runtime.
    ///
    /// Only the path and query of the request URI are used; scheme and authority
    /// always come from the agent's target. Method, headers and body are passed
    /// through, and the response body is streamed back without buffering.
    pub async fn send_request(&self, req: Request<B>) -> Result<Response<ProxyBody>, ProxyError> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("{}{}", self.base_url, path);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let upstream_req = builder
            .body(body)
            .map_err(|e| ProxyError::RequestBuild(e.to_string()))?;

        let response = self.client.request(upstream_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}
