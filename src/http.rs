//! Minimal `/metrics` + `/healthz` HTTP listener (§10.3).
//!
//! Mirrors the shape of the pageserver's embedded management HTTP
//! listener: a `hyper` server bound once at startup, independent of the
//! Postgres/Kinesis connections the pipeline itself manages.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{Encoder, TextEncoder};
use tracing::info;

use crate::supervisor::LeaderState;

async fn handle(req: Request<Body>, leader_state: Arc<LeaderState>) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let metric_families = prometheus::gather();
            let mut buffer = Vec::new();
            let encoder = TextEncoder::new();
            if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
                return Ok(Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::from(format!("failed to encode metrics: {err}")))
                    .expect("static response is well-formed"));
            }
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", encoder.format_type())
                .body(Body::from(buffer))
                .expect("static response is well-formed")
        }
        (&Method::GET, "/healthz") => {
            if leader_state.is_leading() {
                Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("leading"))
                    .expect("static response is well-formed")
            } else {
                Response::builder()
                    .status(StatusCode::SERVICE_UNAVAILABLE)
                    .body(Body::from("not leading"))
                    .expect("static response is well-formed")
            }
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .expect("static response is well-formed"),
    };
    Ok(response)
}

/// Bind and serve `/metrics` and `/healthz` until the process exits. Runs
/// as its own background task; failures here don't affect the pipeline.
pub async fn serve(addr: SocketAddr, leader_state: Arc<LeaderState>) -> anyhow::Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let leader_state = leader_state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(req, leader_state.clone()))) }
    });

    info!(%addr, "metrics HTTP listener starting");
    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}
