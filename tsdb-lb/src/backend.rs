//! Backend TSDB servers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::client::HttpConnector;
use hyper::{Body, Client, Request, Response, Uri};
use tokio::net::TcpStream;

use crate::serverpool::ServerPool;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One TSDB server of the pool.
///
/// Liveness and the connection count are single atomics mutated without
/// locks: the health probe writes liveness, request handling reads it and
/// counts in-flight forwards.
pub struct TsdbBackend {
    url: Uri,
    retention_period: Duration,
    alive: AtomicBool,
    active_connections: AtomicU64,
    client: Client<HttpConnector>,
}

impl TsdbBackend {
    /// Starts out alive; the first probe tick corrects that if needed.
    pub fn new(url: Uri, retention_period: Duration, client: Client<HttpConnector>) -> Self {
        Self {
            url,
            retention_period,
            alive: AtomicBool::new(true),
            active_connections: AtomicU64::new(0),
            client,
        }
    }

    pub fn url(&self) -> &Uri {
        &self.url
    }

    /// Oldest data this backend can answer a query for.
    pub fn retention_period(&self) -> Duration {
        self.retention_period
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Forwards `req` to this backend.
    ///
    /// The in-flight connection is counted on every exit path: the guard
    /// decrements on drop, whether the forward succeeds, fails, or the
    /// request future is cancelled.
    pub async fn forward(&self, req: Request<Body>) -> Result<Response<Body>, hyper::Error> {
        let _guard = self.begin_connection();
        self.client.request(req).await
    }

    pub(crate) fn begin_connection(&self) -> ConnectionGuard<'_> {
        ConnectionGuard::new(&self.active_connections)
    }
}

pub(crate) struct ConnectionGuard<'a> {
    counter: &'a AtomicU64,
}

impl<'a> ConnectionGuard<'a> {
    fn new(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Periodically checks every backend of the pool and updates its liveness.
pub async fn probe_loop(pool: Arc<ServerPool>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        for backend in pool.all_backends() {
            let alive = probe(backend.url()).await;
            if alive != backend.is_alive() {
                log::info!(
                    "backend {} is {}",
                    backend.url(),
                    if alive { "back up" } else { "down" }
                );
            }
            backend.set_alive(alive);
        }
    }
}

/// A TCP connect with a timeout. Keeps the balancer agnostic of the health
/// endpoint of the TSDB flavour behind it.
async fn probe(url: &Uri) -> bool {
    let Some(host) = url.host() else {
        return false;
    };
    let port = url
        .port_u16()
        .unwrap_or(if url.scheme_str() == Some("https") { 443 } else { 80 });
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(retention_secs: u64) -> TsdbBackend {
        TsdbBackend::new(
            Uri::from_static("http://127.0.0.1:9090"),
            Duration::from_secs(retention_secs),
            Client::new(),
        )
    }

    #[test]
    fn connection_guard_counts() {
        let b = backend(60);
        assert_eq!(b.active_connections(), 0);
        {
            let _one = b.begin_connection();
            let _two = b.begin_connection();
            assert_eq!(b.active_connections(), 2);
        }
        assert_eq!(b.active_connections(), 0);
    }

    #[tokio::test]
    async fn failed_forward_restores_the_connection_count() {
        // bind a port, then free it: connecting is refused
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let b = TsdbBackend::new(
            format!("http://{addr}").parse().unwrap(),
            Duration::from_secs(60),
            Client::new(),
        );
        let req = Request::builder()
            .uri(format!("http://{addr}/api/v1/query"))
            .body(Body::empty())
            .unwrap();
        assert!(b.forward(req).await.is_err());
        assert_eq!(b.active_connections(), 0);
    }

    #[tokio::test]
    async fn probe_detects_closed_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let url: Uri = format!("http://{addr}").parse().unwrap();
        assert!(probe(&url).await);
        drop(listener);
        assert!(!probe(&url).await);
    }
}
