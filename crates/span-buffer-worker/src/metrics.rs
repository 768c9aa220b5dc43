use prometheus::Encoder;
use std::net::SocketAddr;
use tracing::{error, info};
use warp::Filter;

fn render() -> Result<String, anyhow::Error> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub async fn start_metrics_server(host: String, port: u16) -> Result<(), anyhow::Error> {
    let metrics_route = warp::path("metrics").map(|| match render() {
        Ok(body) => warp::reply::with_status(body, warp::http::StatusCode::OK),
        Err(e) => {
            error!("failed to encode metrics: {}", e);
            warp::reply::with_status(String::new(), warp::http::StatusCode::INTERNAL_SERVER_ERROR)
        }
    });

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Starting metrics server on http://{}/metrics", addr);
    warp::serve(metrics_route).run(addr).await;
    Ok(())
}
