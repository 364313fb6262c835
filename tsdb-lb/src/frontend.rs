//! The load balancer's HTTP frontend: a minimal reverse proxy.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::http::request::Parts;
use hyper::http::uri::InvalidUri;
use hyper::{
    header,
    http::StatusCode,
    service::{make_service_fn, service_fn},
    Body, HeaderMap, Request, Response, Server, Uri,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use url::form_urlencoded;

use crate::backend::TsdbBackend;
use crate::serverpool::RetentionRouter;

/// Per-request retry budget, attached to the request by the middleware step
/// before routing.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget(pub usize);

pub struct Frontend {
    router: RetentionRouter,
    retry_count: usize,
}

impl Frontend {
    pub fn new(router: RetentionRouter, retry_count: usize) -> Self {
        Self { router, retry_count }
    }

    /// Serves one request: parse the query window, pick a backend, stream
    /// through it.
    ///
    /// `503` is the only failure the balancer injects itself; a transport
    /// error with the retry budget exhausted propagates to the client as-is.
    pub async fn handle(&self, req: Request<Body>) -> Result<Response<Body>, hyper::Error> {
        let (mut parts, body) = req.into_parts();
        // Buffering makes the body inspectable and replayable on retry.
        // TSDB queries are small; responses stream through untouched.
        let body = hyper::body::to_bytes(body).await?;

        // middleware: the query window and the retry budget ride on the request
        let window = query_window(&parts, &body, OffsetDateTime::now_utc());
        parts.extensions.insert(RetryBudget(self.retry_count));

        let (cluster_id, upstream_pq) = split_cluster(&parts.uri);
        let mut budget = parts.extensions.get::<RetryBudget>().map_or(0, |b| b.0);
        let mut failed: Vec<Arc<TsdbBackend>> = Vec::new();
        loop {
            let Some(backend) = self.router.target_excluding(&cluster_id, window, &failed) else {
                return Ok(status_response(StatusCode::SERVICE_UNAVAILABLE, "Service not available"));
            };
            let upstream_req = match upstream_request(&parts, backend.url(), &upstream_pq, &body) {
                Ok(req) => req,
                Err(err) => {
                    log::error!("cannot build the upstream request for {}: {err}", backend.url());
                    return Ok(status_response(StatusCode::BAD_GATEWAY, "Bad gateway"));
                }
            };
            match backend.forward(upstream_req).await {
                Ok(response) => return Ok(strip_hop_headers(response)),
                Err(err) => {
                    log::error!("forwarding to backend {} failed: {err}", backend.url());
                    if budget == 0 {
                        return Err(err);
                    }
                    budget -= 1;
                    failed.push(backend);
                }
            }
        }
    }
}

/// Serves requests until the process is interrupted.
pub async fn run(addr: SocketAddr, frontend: Arc<Frontend>) -> anyhow::Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let frontend = Arc::clone(&frontend);
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req: Request<Body>| {
                let frontend = Arc::clone(&frontend);
                async move { frontend.handle(req).await }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    log::info!("load balancer listening on http://{addr}");
    server
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("shutting down");
        })
        .await?;
    Ok(())
}

/// How far into the past the query reaches: now minus its `start` parameter,
/// taken from the query string or, for form posts, the body. A missing or
/// unparseable start means a zero window.
fn query_window(parts: &Parts, body: &[u8], now: OffsetDateTime) -> Duration {
    let mut start = parts.uri.query().and_then(|query| find_start(query.as_bytes()));
    if start.is_none() && is_form(&parts.headers) {
        start = find_start(body);
    }
    let Some(start) = start else {
        return Duration::ZERO;
    };
    Duration::try_from(now - start).unwrap_or(Duration::ZERO)
}

fn find_start(encoded: &[u8]) -> Option<OffsetDateTime> {
    form_urlencoded::parse(encoded)
        .find(|(key, _)| key == "start")
        .and_then(|(_, value)| parse_timestamp(&value))
}

/// Prometheus-style timestamps: unix seconds, possibly fractional, or
/// RFC 3339.
fn parse_timestamp(value: &str) -> Option<OffsetDateTime> {
    if let Ok(seconds) = value.parse::<i64>() {
        return OffsetDateTime::from_unix_timestamp(seconds).ok();
    }
    if let Ok(seconds) = value.parse::<f64>() {
        return OffsetDateTime::from_unix_timestamp_nanos((seconds * 1e9) as i128).ok();
    }
    OffsetDateTime::parse(value, &Rfc3339).ok()
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"))
}

/// Splits `/hpc/api/v1/query?...` into the cluster id (`hpc`) and the
/// upstream path-and-query (`/api/v1/query?...`).
fn split_cluster(uri: &Uri) -> (String, String) {
    let path = uri.path();
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let (cluster, rest) = match trimmed.split_once('/') {
        Some((cluster, rest)) => (cluster, format!("/{rest}")),
        None => (trimmed, "/".to_string()),
    };
    let mut path_and_query = rest;
    if let Some(query) = uri.query() {
        path_and_query.push('?');
        path_and_query.push_str(query);
    }
    (cluster.to_string(), path_and_query)
}

const HOP_BY_HOP: [header::HeaderName; 3] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn upstream_request(
    parts: &Parts,
    backend_url: &Uri,
    path_and_query: &str,
    body: &hyper::body::Bytes,
) -> Result<Request<Body>, hyper::http::Error> {
    let target = target_uri(backend_url, path_and_query)?;
    let mut builder = Request::builder().method(parts.method.clone()).uri(target);
    for (name, value) in &parts.headers {
        // the host is the backend's now
        if HOP_BY_HOP.contains(name) || *name == header::HOST {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder.body(Body::from(body.clone()))
}

fn target_uri(backend_url: &Uri, path_and_query: &str) -> Result<Uri, InvalidUri> {
    let base = backend_url.to_string();
    format!("{}{path_and_query}", base.trim_end_matches('/')).parse()
}

fn strip_hop_headers(response: Response<Body>) -> Response<Body> {
    let (mut parts, body) = response.into_parts();
    for name in &HOP_BY_HOP {
        parts.headers.remove(name);
    }
    Response::from_parts(parts, body)
}

fn status_response(status: StatusCode, message: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serverpool::ServerPool;
    use hyper::Client;
    use pretty_assertions::assert_eq;

    const HOUR: Duration = Duration::from_secs(3600);
    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn parts_for(uri: &str) -> Parts {
        let (parts, _) = Request::builder().uri(uri).body(()).unwrap().into_parts();
        parts
    }

    #[test]
    fn window_from_unix_start() {
        let now = OffsetDateTime::from_unix_timestamp(1_720_000_000).unwrap();
        let start = 1_720_000_000 - 12 * 3600;
        let parts = parts_for(&format!("/hpc/api/v1/query_range?start={start}&end=1720000000&query=up"));
        assert_eq!(query_window(&parts, b"", now), 12 * HOUR);
    }

    #[test]
    fn window_from_rfc3339_start() {
        let now = OffsetDateTime::parse("2024-07-03T12:00:00Z", &Rfc3339).unwrap();
        let parts = parts_for("/hpc/api/v1/query_range?start=2024-07-03T00:00:00Z");
        assert_eq!(query_window(&parts, b"", now), 12 * HOUR);
    }

    #[test]
    fn window_from_form_body() {
        let now = OffsetDateTime::from_unix_timestamp(1_720_000_000).unwrap();
        let mut parts = parts_for("/hpc/api/v1/query_range");
        parts.headers.insert(
            header::CONTENT_TYPE,
            "application/x-www-form-urlencoded".parse().unwrap(),
        );
        let body = format!("query=up&start={}", 1_720_000_000 - 3600);
        assert_eq!(query_window(&parts, body.as_bytes(), now), HOUR);
    }

    #[test]
    fn missing_or_bad_start_means_zero_window() {
        let now = OffsetDateTime::from_unix_timestamp(1_720_000_000).unwrap();
        let parts = parts_for("/hpc/api/v1/query?query=up");
        assert_eq!(query_window(&parts, b"", now), Duration::ZERO);

        let parts = parts_for("/hpc/api/v1/query_range?start=tomorrow-ish");
        assert_eq!(query_window(&parts, b"", now), Duration::ZERO);

        // a start in the future clamps to zero
        let parts = parts_for("/hpc/api/v1/query_range?start=1720003600");
        assert_eq!(query_window(&parts, b"", now), Duration::ZERO);
    }

    #[test]
    fn cluster_id_is_the_first_path_segment() {
        let uri: Uri = "/hpc/api/v1/query?query=up".parse().unwrap();
        assert_eq!(
            split_cluster(&uri),
            ("hpc".to_string(), "/api/v1/query?query=up".to_string())
        );

        let uri: Uri = "/hpc".parse().unwrap();
        assert_eq!(split_cluster(&uri), ("hpc".to_string(), "/".to_string()));

        let uri: Uri = "/".parse().unwrap();
        assert_eq!(split_cluster(&uri), (String::new(), "/".to_string()));
    }

    async fn spawn_upstream(marker: &'static str) -> SocketAddr {
        let make_svc = make_service_fn(move |_conn| async move {
            Ok::<_, hyper::Error>(service_fn(move |_req: Request<Body>| async move {
                Ok::<_, hyper::Error>(Response::new(Body::from(marker)))
            }))
        });
        let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }

    fn backend_at(addr: SocketAddr, retention: Duration) -> Arc<TsdbBackend> {
        Arc::new(TsdbBackend::new(
            format!("http://{addr}").parse().unwrap(),
            retention,
            Client::new(),
        ))
    }

    fn closed_port() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    fn frontend(backends: Vec<Arc<TsdbBackend>>, retry_count: usize) -> Frontend {
        let mut pool = ServerPool::new();
        for backend in backends {
            pool.add("hpc", backend);
        }
        Frontend::new(RetentionRouter::new(Arc::new(pool)), retry_count)
    }

    #[tokio::test]
    async fn proxies_through_an_eligible_backend() {
        let upstream = spawn_upstream("upstream-ok").await;
        let frontend = frontend(vec![backend_at(upstream, 30 * DAY)], 1);

        let req = Request::builder()
            .uri("http://lb.example/hpc/api/v1/query?query=up")
            .body(Body::empty())
            .unwrap();
        let response = frontend.handle(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&body[..], b"upstream-ok");
    }

    #[tokio::test]
    async fn no_eligible_backend_is_a_503() {
        let upstream = spawn_upstream("unused").await;
        let hot = backend_at(upstream, 6 * HOUR);
        let frontend = frontend(vec![hot], 1);

        let start = 1_000_000; // far in the past: a huge window
        let req = Request::builder()
            .uri(format!("http://lb.example/hpc/api/v1/query_range?start={start}"))
            .body(Body::empty())
            .unwrap();
        let response = frontend.handle(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unknown_cluster_is_a_503() {
        let upstream = spawn_upstream("unused").await;
        let frontend = frontend(vec![backend_at(upstream, 30 * DAY)], 1);

        let req = Request::builder()
            .uri("http://lb.example/cloud/api/v1/query")
            .body(Body::empty())
            .unwrap();
        let response = frontend.handle(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn transport_failure_retries_on_the_next_backend() {
        let dead = backend_at(closed_port(), 30 * DAY);
        let live_addr = spawn_upstream("second-choice").await;
        let live = backend_at(live_addr, 30 * DAY);
        // the dead backend ranks first by registration order
        let frontend = frontend(vec![dead, live], 1);

        let req = Request::builder()
            .uri("http://lb.example/hpc/api/v1/query?query=up")
            .body(Body::empty())
            .unwrap();
        let response = frontend.handle(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&body[..], b"second-choice");
    }

    #[tokio::test]
    async fn exhausted_retries_propagate_the_transport_error() {
        let frontend = frontend(vec![backend_at(closed_port(), 30 * DAY)], 0);

        let req = Request::builder()
            .uri("http://lb.example/hpc/api/v1/query?query=up")
            .body(Body::empty())
            .unwrap();
        assert!(frontend.handle(req).await.is_err());
    }

    #[tokio::test]
    async fn post_body_is_replayed_on_retry() {
        let dead = backend_at(closed_port(), 30 * DAY);
        let live_addr = spawn_upstream("echo").await;
        let live = backend_at(live_addr, 30 * DAY);
        let frontend = frontend(vec![dead, live], 1);

        let req = Request::builder()
            .method("POST")
            .uri("http://lb.example/hpc/api/v1/query")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("query=up"))
            .unwrap();
        let response = frontend.handle(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
