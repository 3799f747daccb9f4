// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Classification --------
pub static PNL_REALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_realized", "realized P&L over the order history lookback").unwrap());

pub static WASH_SALE_SYMBOLS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("wash_sale_symbols", "symbols flagged in the last classification").unwrap());

pub static UNMATCHED_SELLS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("unmatched_sells_total", "filled sells with no open lot").unwrap());

// -------- Orders --------
pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_submitted_total", "orders accepted by the broker"),
        &["side", "type"],
    )
    .unwrap()
});

pub static ORDER_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("order_failures_total", "order submissions that failed after retries"),
        &["side"],
    )
    .unwrap()
});

pub static RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("broker_retries_total", "transient broker errors retried"), &["op"]).unwrap()
});

// -------- Rebalance --------
pub static BARRIER_POLLS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("barrier_polls_total", "sell barrier poll rounds").unwrap());

// value 1 on the current state label
pub static REBALANCE_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("rebalance_state", "orchestrator state (label: state)"), &["state"]).unwrap()
});

pub static TARGET_COUNT: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("target_list_len", "symbols on the current target list").unwrap());

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(PNL_REALIZED.clone())),
        REGISTRY.register(Box::new(WASH_SALE_SYMBOLS.clone())),
        REGISTRY.register(Box::new(UNMATCHED_SELLS.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(ORDER_FAILURES.clone())),
        REGISTRY.register(Box::new(RETRIES.clone())),
        REGISTRY.register(Box::new(BARRIER_POLLS.clone())),
        REGISTRY.register(Box::new(REBALANCE_STATE.clone())),
        REGISTRY.register(Box::new(TARGET_COUNT.clone())),
    ] {
        let _ = m;
    }
}

/// Zero out every state series, then raise `label`.
pub fn reset_state(gauge: &IntGaugeVec, label: &str) {
    gauge.reset();
    gauge.with_label_values(&[label]).set(1);
}

pub fn encode_metrics() -> Result<Vec<u8>, prometheus::Error> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buf)?;
    Ok(buf)
}

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Status line, content type and body for one request line such as `GET /metrics HTTP/1.1`.
fn route(request_line: &str) -> (&'static str, &'static str, Vec<u8>) {
    let mut parts = request_line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("GET"), Some("/metrics")) => match encode_metrics() {
            Ok(body) => ("200 OK", TEXT_FORMAT, body),
            Err(e) => ("500 Internal Server Error", "text/plain", e.to_string().into_bytes()),
        },
        (Some("GET"), Some(_)) => ("404 Not Found", "text/plain", b"try /metrics\n".to_vec()),
        _ => ("405 Method Not Allowed", "text/plain", Vec::new()),
    }
}

fn respond(stream: TcpStream) -> std::io::Result<()> {
    let mut line = String::new();
    BufReader::new(&stream).read_line(&mut line)?;
    let (status, content_type, body) = route(line.trim_end());
    let mut out = &stream;
    write!(
        out,
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )?;
    out.write_all(&body)?;
    out.flush()
}

// Dedicated OS thread, keeps the tokio runtime free for the rebalance
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(?e, %addr, "metrics bind failed");
                return;
            }
        };
        tracing::info!(%addr, "metrics listening");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => {
                    if let Err(e) = respond(stream) {
                        tracing::debug!(?e, "metrics client dropped");
                    }
                }
                Err(e) => tracing::warn!(?e, "metrics accept error"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_families() {
        init();
        ORDERS.with_label_values(&["buy", "limit"]).inc();
        let text = String::from_utf8(encode_metrics().unwrap()).unwrap();
        assert!(text.contains("orders_submitted_total"));
    }

    #[test]
    fn only_get_metrics_is_served() {
        init();
        BARRIER_POLLS.inc();
        let (status, content_type, body) = route("GET /metrics HTTP/1.1");
        assert_eq!(status, "200 OK");
        assert!(content_type.starts_with("text/plain; version=0.0.4"));
        assert!(String::from_utf8(body).unwrap().contains("barrier_polls_total"));

        assert_eq!(route("GET / HTTP/1.1").0, "404 Not Found");
        assert_eq!(route("GET /metrics/x HTTP/1.1").0, "404 Not Found");
        assert_eq!(route("POST /metrics HTTP/1.1").0, "405 Method Not Allowed");
        assert_eq!(route("").0, "405 Method Not Allowed");
    }

    #[test]
    fn reset_state_leaves_one_raised_label() {
        use prometheus::core::Collector;

        let g = IntGaugeVec::new(Opts::new("state_under_test", "x"), &["state"]).unwrap();
        g.with_label_values(&["DONE"]).set(1);
        g.with_label_values(&["BUYING"]).set(0);
        reset_state(&g, "SELECTING");

        let fam = g.collect();
        let series = fam[0].get_metric();
        assert_eq!(series.len(), 1);
        assert_eq!(g.with_label_values(&["SELECTING"]).get(), 1);
    }
}
