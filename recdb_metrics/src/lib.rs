//! Prometheus metrics for the record server.
use anyhow::Result;
use hyper::{service::{make_service_fn, service_fn}, Body, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};
use std::net::SocketAddr;
use tracing::{info, warn};

pub static CONNECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!("recdb_connections_total", "Total client connections accepted")
        .expect("register recdb_connections_total")
});
pub static ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!("recdb_active_connections", "Client connections currently open")
        .expect("register recdb_active_connections")
});
pub static COMMANDS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    prometheus::register_int_counter_vec!(Opts::new("recdb_commands_total", "Commands executed"), &["op"])
        .expect("register recdb_commands_total")
});
pub static COMMAND_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    prometheus::register_int_counter_vec!(
        Opts::new("recdb_command_errors_total", "Commands answered with an error"),
        &["kind"]
    )
    .expect("register recdb_command_errors_total")
});
pub static COMMAND_LATENCY_SECS: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new("recdb_command_latency_seconds", "Command latency in seconds")
        .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]);
    prometheus::register_histogram!(opts).expect("register recdb_command_latency_seconds")
});

/// Render every registered metric in the Prometheus text format.
pub fn render() -> Result<Vec<u8>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(buffer)
}

/// Launch the Prometheus exporter on `addr`, serving `/metrics`.
/// Returns the bound address (useful when `addr` asks for port 0).
pub async fn serve(addr: &str) -> Result<SocketAddr> {
    let make_svc = make_service_fn(|_| async { Ok::<_, hyper::Error>(service_fn(metrics_handler)) });
    let server = Server::try_bind(&addr.parse()?)?.serve(make_svc);
    let bound = server.local_addr();
    info!(%bound, "metrics exporter listening");
    tokio::spawn(async move {
        if let Err(e) = server.await {
            warn!(error = %e, "metrics server error");
        }
    });
    Ok(bound)
}

async fn metrics_handler(req: Request<Body>) -> Result<Response<Body>, hyper::Error> {
    if req.uri().path() != "/metrics" {
        return Ok(status(StatusCode::NOT_FOUND));
    }
    match render() {
        Ok(buffer) => Ok(Response::new(Body::from(buffer))),
        Err(e) => {
            warn!(error = %e, "failed to encode metrics");
            Ok(status(StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}

fn status(code: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = code;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_render() {
        COMMANDS_TOTAL.with_label_values(&["READ"]).inc();
        CONNECTIONS_TOTAL.inc();
        let text = String::from_utf8(render().unwrap()).unwrap();
        assert!(text.contains("recdb_commands_total{op=\"READ\"}"));
        assert!(text.contains("recdb_connections_total"));
    }

    #[tokio::test]
    async fn exporter_serves_metrics_path() {
        CONNECTIONS_TOTAL.inc();
        let addr = serve("127.0.0.1:0").await.unwrap();
        let client = hyper::Client::new();
        let ok = client.get(format!("http://{addr}/metrics").parse().unwrap()).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let missing = client.get(format!("http://{addr}/other").parse().unwrap()).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
