//! Best-effort lookup of the network origin recorded with a consent.
//!
//! The address is audit metadata only. A lookup that fails or times out
//! yields `None`, and consent is recorded the same way either way.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::debug;

/// Upper bound on the response body of an IP echo service.
const MAX_BODY_BYTES: usize = 1024;

/// Optional collaborator that resolves the caller's public address.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IpLookup: Send + Sync {
    async fn lookup(&self) -> Option<IpAddr>;
}

/// Queries a plain-HTTP IP echo service (body is the bare address, or a JSON
/// object with an `ip` key).
#[derive(Debug, Clone)]
pub struct HttpIpLookup {
    host: String,
    port: u16,
    path: String,
    timeout: Duration,
}

impl HttpIpLookup {
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            path: path.into(),
            timeout,
        }
    }

    async fn fetch(&self) -> Result<IpAddr> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("failed to connect to {}:{}", self.host, self.port))?;

        let (mut sender, conn) = http1::handshake::<_, Body>(TokioIo::new(stream))
            .await
            .context("HTTP handshake with IP lookup service failed")?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "IP lookup connection closed with error");
            }
        });

        let req = Request::builder()
            .method(Method::GET)
            .uri(self.path.as_str())
            .header(header::HOST, self.host.as_str())
            .header(header::ACCEPT, "text/plain, application/json")
            .body(Body::empty())
            .context("failed to build IP lookup request")?;

        let resp = sender
            .send_request(req)
            .await
            .context("IP lookup request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("IP lookup service returned {}", resp.status());
        }

        let body = axum::body::to_bytes(Body::new(resp.into_body()), MAX_BODY_BYTES)
            .await
            .context("failed to read IP lookup response")?;
        parse_ip_body(&body)
    }
}

#[async_trait]
impl IpLookup for HttpIpLookup {
    async fn lookup(&self) -> Option<IpAddr> {
        match tokio::time::timeout(self.timeout, self.fetch()).await {
            Ok(Ok(ip)) => Some(ip),
            Ok(Err(e)) => {
                debug!(error = %e, "IP lookup failed");
                None
            }
            Err(_) => {
                debug!(timeout_ms = self.timeout.as_millis() as u64, "IP lookup timed out");
                None
            }
        }
    }
}

/// Parse an echo-service body: a bare address or `{"ip": "..."}`.
fn parse_ip_body(body: &[u8]) -> Result<IpAddr> {
    let text = std::str::from_utf8(body).context("IP lookup body is not UTF-8")?.trim();
    let raw = if text.starts_with('{') {
        let json: serde_json::Value =
            serde_json::from_str(text).context("IP lookup body is not valid JSON")?;
        json.get("ip")
            .and_then(|v| v.as_str())
            .context("IP lookup JSON has no \"ip\" string")?
            .to_owned()
    } else {
        text.to_owned()
    };
    raw.parse()
        .with_context(|| format!("IP lookup returned an invalid address: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    #[test]
    fn parses_plain_and_json_bodies() {
        assert_eq!(
            parse_ip_body(b"203.0.113.7\n").unwrap(),
            "203.0.113.7".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            parse_ip_body(br#"{"ip":"2001:db8::1"}"#).unwrap(),
            "2001:db8::1".parse::<IpAddr>().unwrap()
        );
        assert!(parse_ip_body(b"<html>").is_err());
        assert!(parse_ip_body(br#"{"addr":"1.2.3.4"}"#).is_err());
    }

    #[tokio::test]
    async fn resolves_from_echo_service() {
        let port = serve(Router::new().route("/", get(|| async { "198.51.100.23" }))).await;
        let lookup = HttpIpLookup::new("127.0.0.1", port, "/", Duration::from_secs(2));
        assert_eq!(lookup.lookup().await, Some("198.51.100.23".parse().unwrap()));
    }

    #[tokio::test]
    async fn error_status_yields_none() {
        let port = serve(Router::new()).await;
        let lookup = HttpIpLookup::new("127.0.0.1", port, "/", Duration::from_secs(2));
        assert_eq!(lookup.lookup().await, None);
    }

    #[tokio::test]
    async fn silent_service_times_out() {
        // Accepts connections but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        let lookup = HttpIpLookup::new("127.0.0.1", port, "/", Duration::from_millis(200));
        assert_eq!(lookup.lookup().await, None);
    }
}
