//! HTTP exposition endpoint.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::http::StatusCode;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server,
};
use prometheus_client::encoding::text::encode;

use crate::collector::ComputeCollector;

/// Serves `GET /metrics` until the process is interrupted.
pub async fn run(addr: SocketAddr, collector: Arc<ComputeCollector>) -> anyhow::Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let collector = Arc::clone(&collector);
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let collector = Arc::clone(&collector);
                async move { Ok::<_, Infallible>(handle(req, &collector).await) }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    log::info!("compute unit metrics available on http://{addr}/metrics");
    server
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("shutting down");
        })
        .await?;
    Ok(())
}

async fn handle(req: Request<Body>, collector: &ComputeCollector) -> Response<Body> {
    if req.uri().path() != "/metrics" {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("Not Found"))
            .unwrap();
    }

    let registry = collector.collect().await;
    let mut buf = String::new();
    if let Err(err) = encode(&mut buf, &registry) {
        log::error!("failed to encode metrics: {err}");
        return Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from("Internal Server Error"))
            .unwrap();
    }

    Response::builder()
        .header(
            "Content-Type",
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )
        .body(Body::from(buf))
        .unwrap()
}
