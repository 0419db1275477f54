//! Local status HTTP server (spec.md §6, "Operational surface").
//!
//! Provides:
//! - `GET /`        — read-only HTML status page
//! - `GET /healthz` — always 200 OK (process is running)
//! - `GET /readyz`  — 200 when both sessions are connected, 503 otherwise
//! - `GET /stats`   — JSON snapshot of both directions' `Forwarder::stats()`
//!
//! # Security
//! No authentication. Every endpoint is read-only.

use crate::forwarder::Stats;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Configuration for the status HTTP server.
#[derive(Debug, Clone)]
pub struct StatusConfig {
    /// Bind address, e.g. `"0.0.0.0:8080"`.
    pub bind: String,
    pub connector_version: String,
}

/// Non-generic peephole onto a `Forwarder<P>`'s counters, so the status
/// server doesn't need to carry either direction's publisher type parameter.
pub trait StatsSource: Send + Sync {
    fn stats(&self) -> Stats;
    fn is_connected(&self) -> bool;
}

impl<P: bridge_protocol::capability::BusPublisher + 'static> StatsSource
    for crate::session::SessionManager<P>
{
    fn stats(&self) -> Stats {
        crate::session::SessionManager::stats(self)
    }
    fn is_connected(&self) -> bool {
        crate::session::SessionManager::is_connected(self)
    }
}

/// Handle to the running status HTTP server.
pub struct StatusServer {
    local_addr: SocketAddr,
}

impl StatusServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start the status HTTP server, polling `to_bus`/`from_bus` on each
    /// request rather than caching — counters are read-mostly and
    /// eventually-consistent by design (spec.md §5).
    pub async fn start(
        cfg: StatusConfig,
        to_bus: Arc<dyn StatsSource>,
        from_bus: Arc<dyn StatsSource>,
    ) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(&cfg.bind).await?;
        let local_addr = listener.local_addr()?;
        let version = Arc::new(cfg.connector_version);

        tokio::spawn(async move {
            run_server(listener, to_bus, from_bus, version).await;
        });

        Ok(StatusServer { local_addr })
    }
}

async fn run_server(
    listener: TcpListener,
    to_bus: Arc<dyn StatsSource>,
    from_bus: Arc<dyn StatsSource>,
    version: Arc<String>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let to_bus = to_bus.clone();
                let from_bus = from_bus.clone();
                let version = version.clone();
                tokio::spawn(async move {
                    handle_connection(stream, to_bus, from_bus, version).await;
                });
            }
            Err(_) => break,
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    to_bus: Arc<dyn StatsSource>,
    from_bus: Arc<dyn StatsSource>,
    version: Arc<String>,
) {
    let mut buf = vec![0u8; 4096];
    let n = match stream.read(&mut buf).await {
        Ok(n) if n > 0 => n,
        _ => return,
    };

    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => {
            send_response(&mut stream, 400, "text/plain", "Bad Request").await;
            return;
        }
    };

    let first_line = match request.lines().next() {
        Some(l) => l,
        None => {
            send_response(&mut stream, 400, "text/plain", "Bad Request").await;
            return;
        }
    };

    let mut parts = first_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("/");

    match (method, path) {
        ("GET", "/healthz") => {
            send_response(&mut stream, 200, "text/plain", "ok").await;
        }
        ("GET", "/readyz") => {
            if to_bus.is_connected() && from_bus.is_connected() {
                send_response(&mut stream, 200, "text/plain", "ready").await;
            } else {
                send_response(&mut stream, 503, "text/plain", "bus session not connected").await;
            }
        }
        ("GET", "/stats") => {
            let body = stats_json(&to_bus.stats(), &from_bus.stats());
            send_response(&mut stream, 200, "application/json", &body).await;
        }
        ("GET", "/") => {
            let html = status_page(&version, to_bus.is_connected(), from_bus.is_connected());
            send_response(&mut stream, 200, "text/html; charset=utf-8", &html).await;
        }
        _ => {
            send_response(&mut stream, 404, "text/plain", "Not Found").await;
        }
    }
}

fn stats_json(to_bus: &Stats, from_bus: &Stats) -> String {
    fn one(s: &Stats) -> String {
        format!(
            "{{\"forwarded\":{},\"sent\":{},\"queue_len\":{},\"retry_in_buf\":{},\"retry_out_buf\":{},\"retry_size\":{},\"fallback_len\":{}}}",
            s.forwarded, s.sent, s.queue_len, s.retry_in_buf, s.retry_out_buf, s.retry_size, s.fallback_len,
        )
    }
    format!("{{\"to_bus\":{},\"from_bus\":{}}}", one(to_bus), one(from_bus))
}

fn status_page(version: &str, to_bus_connected: bool, from_bus_connected: bool) -> String {
    let state = |c: bool| if c { "connected" } else { "disconnected" };
    format!(
        "<!DOCTYPE html><html><head><title>Connector Status</title></head>\
         <body>\
         <h1>Connector Status</h1>\
         <p>Version: {version}</p>\
         <p>Socket→Bus session: {to_bus}</p>\
         <p>Bus→Socket session: {from_bus}</p>\
         <p><a href=\"/stats\">stats (json)</a></p>\
         </body></html>",
        version = version,
        to_bus = state(to_bus_connected),
        from_bus = state(from_bus_connected),
    )
}

async fn send_response(stream: &mut TcpStream, status: u16, content_type: &str, body: &str) {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    };

    let response = format!(
        "HTTP/1.1 {status} {status_text}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {len}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        status = status,
        status_text = status_text,
        content_type = content_type,
        len = body.len(),
        body = body,
    );

    let _ = stream.write_all(response.as_bytes()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_json_includes_both_directions() {
        let a = Stats { forwarded: 1, sent: 2, queue_len: 3, retry_in_buf: 0, retry_out_buf: 0, retry_size: 0, fallback_len: 0 };
        let b = Stats::default();
        let json = stats_json(&a, &b);
        assert!(json.contains("\"to_bus\""));
        assert!(json.contains("\"from_bus\""));
        assert!(json.contains("\"sent\":2"));
    }
}
