//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` is intended per process. A client holds a clone and
//! bumps counters from its media and control tasks.

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Configuration for the built-in Prometheus scrape endpoint.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9100`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        // ---
        Self { bind }
    }
}

/// Why a datagram was discarded on the receive path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    Decrypt,
    Codec,
    Unknown,
}

impl DropReason {
    // ---
    pub fn as_str(self) -> &'static str {
        // ---
        match self {
            DropReason::Malformed => "malformed",
            DropReason::Decrypt => "decrypt",
            DropReason::Codec => "codec",
            DropReason::Unknown => "unknown",
        }
    }
}

/// Prometheus registry plus the voice transport's metric handles.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // Media counters
    pub packets_sent_total: IntCounter,
    pub packets_received_total: IntCounter,
    pub packets_lost_total: IntCounter,
    pub packets_dropped_total: IntCounterVec,
    pub bytes_sent_total: IntCounter,
    pub bytes_received_total: IntCounter,
    pub rtcp_reports_total: IntCounter,
    pub keepalives_total: IntCounter,

    // Session counters
    pub reconnects_total: IntCounter,
    pub resumes_total: IntCounter,

    /// Labelled by `server`
    pub active_speakers: IntGaugeVec,

    // Latency histograms (seconds)
    pub encode_seconds: Histogram,
    pub decode_seconds: Histogram,
    pub heartbeat_rtt_seconds: Histogram,
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the standard metrics.
    ///
    /// `process_name` is applied as a constant label (`process=<name>`).
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("voicelink".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let histogram = |name: &str, help: &str| -> Result<Histogram> {
            let h = Histogram::with_opts(HistogramOpts::new(name, help))?;
            registry.register(Box::new(h.clone()))?;
            Ok(h)
        };

        let packets_sent_total = counter("rtp_packets_sent_total", "Total RTP packets sent")?;
        let packets_received_total =
            counter("rtp_packets_received_total", "Total RTP packets received")?;
        let packets_lost_total = counter(
            "rtp_packets_lost_total",
            "Sequence gaps detected across all speakers",
        )?;
        let bytes_sent_total = counter("rtp_bytes_sent_total", "Total UDP bytes sent")?;
        let bytes_received_total =
            counter("rtp_bytes_received_total", "Total UDP bytes received")?;
        let rtcp_reports_total =
            counter("rtcp_reports_total", "RTCP receiver reports decoded")?;
        let keepalives_total = counter("udp_keepalives_total", "UDP keepalive datagrams seen")?;
        let reconnects_total =
            counter("session_reconnects_total", "Full session reconnects started")?;
        let resumes_total = counter("session_resumes_total", "Session resume attempts")?;

        let packets_dropped_total = IntCounterVec::new(
            Opts::new(
                "udp_packets_dropped_total",
                "Datagrams discarded on the receive path",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(packets_dropped_total.clone()))?;

        let active_speakers = IntGaugeVec::new(
            Opts::new(
                "active_speakers",
                "Speakers currently tracked, per voice connection",
            ),
            &["server"],
        )?;
        registry.register(Box::new(active_speakers.clone()))?;

        let encode_seconds = histogram("opus_encode_seconds", "Opus encode duration in seconds")?;
        let decode_seconds = histogram("opus_decode_seconds", "Opus decode duration in seconds")?;
        let heartbeat_rtt_seconds = histogram(
            "heartbeat_rtt_seconds",
            "Gateway heartbeat round trip in seconds",
        )?;

        Ok(Self {
            registry,
            packets_sent_total,
            packets_received_total,
            packets_lost_total,
            packets_dropped_total,
            bytes_sent_total,
            bytes_received_total,
            rtcp_reports_total,
            keepalives_total,
            reconnects_total,
            resumes_total,
            active_speakers,
            encode_seconds,
            decode_seconds,
            heartbeat_rtt_seconds,
        })
    }

    /// Counts one discarded datagram.
    pub fn record_drop(&self, reason: DropReason) {
        // ---
        self.packets_dropped_total
            .with_label_values(&[reason.as_str()])
            .inc();
    }

    /// Records how many speakers the connection to `server_id` tracks.
    pub fn set_active_speakers(&self, server_id: u64, count: usize) {
        // ---
        self.active_speakers
            .with_label_values(&[&server_id.to_string()])
            .set(count as i64);
    }

    /// Drops the speaker series of a connection that is gone.
    pub fn clear_active_speakers(&self, server_id: u64) {
        // ---
        let _ = self
            .active_speakers
            .remove_label_values(&[&server_id.to_string()]);
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Spawns a minimal HTTP server that serves `GET /metrics`.
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> JoinHandle<Result<()>> {
        // ---
        let registry = Arc::new(self.registry.clone());
        tokio::spawn(async move {
            // ---
            let make_svc = make_service_fn(move |_conn| {
                let registry = Arc::clone(&registry);
                async move {
                    Ok::<_, hyper::Error>(service_fn(move |req| {
                        let registry = Arc::clone(&registry);
                        async move { handle_metrics_request(req, registry).await }
                    }))
                }
            });

            Server::bind(&cfg.bind)
                .serve(make_svc)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            Ok(())
        })
    }
}

async fn handle_metrics_request(
    req: Request<Body>,
    registry: Arc<Registry>,
) -> Result<Response<Body>, hyper::Error> {
    // ---
    if req.method() != Method::GET || req.uri().path() != "/metrics" {
        let mut resp = Response::new(Body::from("not found"));
        *resp.status_mut() = StatusCode::NOT_FOUND;
        return Ok(resp);
    }

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        let mut resp = Response::new(Body::from(format!("encode error: {e}")));
        *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        return Ok(resp);
    }

    let mut resp = Response::new(Body::from(buffer));
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    Ok(resp)
}
