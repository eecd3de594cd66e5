//! Prometheus metrics for the nmq server.
//!
//! This module provides:
//! - Metrics registry with connection, frame and message counters
//! - HTTP server to expose metrics at `/metrics` endpoint

use crate::server::cancelled;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Prometheus metrics for the nmq server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently active connections.
    pub connections_active: Gauge,
    /// Frames received by opcode.
    pub frames_received_total: CounterVec,
    /// Complete messages delivered to the handler.
    pub messages_total: Counter,
    /// Raw bytes read from connections.
    pub bytes_received_total: Counter,
    /// Connections dropped for protocol violations.
    pub protocol_errors_total: Counter,
    /// Accept failures.
    pub accept_errors_total: Counter,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Connections
        let connections_total = Counter::with_opts(Opts::new(
            "nmq_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "nmq_connections_active",
            "Number of currently active connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        // Traffic
        let frames_received_total = CounterVec::new(
            Opts::new("nmq_frames_received_total", "Total frames received by opcode"),
            &["opcode"],
        )?;
        registry.register(Box::new(frames_received_total.clone()))?;

        let messages_total = Counter::with_opts(Opts::new(
            "nmq_messages_total",
            "Total complete messages delivered",
        ))?;
        registry.register(Box::new(messages_total.clone()))?;

        let bytes_received_total = Counter::with_opts(Opts::new(
            "nmq_bytes_received_total",
            "Total bytes read from connections",
        ))?;
        registry.register(Box::new(bytes_received_total.clone()))?;

        // Errors
        let protocol_errors_total = Counter::with_opts(Opts::new(
            "nmq_protocol_errors_total",
            "Connections closed because of protocol errors",
        ))?;
        registry.register(Box::new(protocol_errors_total.clone()))?;

        let accept_errors_total = Counter::with_opts(Opts::new(
            "nmq_accept_errors_total",
            "Total accept errors",
        ))?;
        registry.register(Box::new(accept_errors_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            frames_received_total,
            messages_total,
            bytes_received_total,
            protocol_errors_total,
            accept_errors_total,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server until `shutdown` turns true.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = cancelled(&mut shutdown) => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn response(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Handles an HTTP request to the metrics server.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route(req.uri().path(), &metrics))
}

fn route(path: &str, metrics: &Metrics) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => match metrics.encode() {
            Ok(body) => response(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                Bytes::from(body),
            ),
            Err(e) => {
                tracing::error!("Failed to encode metrics: {}", e);
                response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    Bytes::from(e.to_string()),
                )
            }
        },
        "/health" | "/healthz" => response(StatusCode::OK, "text/plain", Bytes::from("OK")),
        _ => response(StatusCode::NOT_FOUND, "text/plain", Bytes::from("Not Found")),
    }
}
