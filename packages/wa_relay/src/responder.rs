//! HTTP bridge to the external auto-reply backend.
//!
//! The backend takes a form post `{secret, fromNumber, text, jid}` and answers
//! with JSON `{text}`. A request that dies from a connection reset or abort is
//! retried exactly once with a cache-busting `_` query parameter.

use async_trait::async_trait;
use serde::Deserialize;
use std::error::Error as _;
use std::time::Duration;
use tracing::{debug, warn};

use wa_session::{ReplyRequest, Responder, ResponderError};

use crate::config::ResponderFileConfig;

const TRANSIENT_PATTERNS: &[&str] = &[
    "connection reset",
    "aborted",
    "broken pipe",
    "connection closed before message completed",
    "socket hang up",
];
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, Deserialize)]
struct ReplyBody {
    #[serde(default)]
    text: Option<String>,
}

pub struct HttpResponder {
    client: reqwest::Client,
    endpoint: String,
    secret: String,
}

impl HttpResponder {
    pub fn new(config: &ResponderFileConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            secret: config.secret.clone(),
        })
    }

    async fn attempt(
        &self,
        request: &ReplyRequest,
        cache_bust: Option<i64>,
    ) -> Result<String, ResponderError> {
        let mut builder = self.client.post(&self.endpoint).form(&[
            ("secret", self.secret.as_str()),
            ("fromNumber", request.from_number.as_str()),
            ("text", request.text.as_str()),
            ("jid", request.peer_id.as_str()),
        ]);
        if let Some(ts) = cache_bust {
            builder = builder.query(&[("_", ts)]);
        }

        let resp = builder.send().await.map_err(classify)?;
        let status = resp.status();
        let body = resp.text().await.map_err(classify)?;

        if !status.is_success() {
            return Err(ResponderError::Status {
                status: status.as_u16(),
                body: truncate(&body),
            });
        }

        let parsed: ReplyBody = serde_json::from_str(&body).map_err(|e| {
            ResponderError::Protocol(format!("invalid JSON ({}): {}", e, truncate(&body)))
        })?;
        parsed
            .text
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ResponderError::Protocol("reply has no 'text'".to_string()))
    }
}

#[async_trait]
impl Responder for HttpResponder {
    async fn get_reply(&self, request: &ReplyRequest) -> Result<String, ResponderError> {
        debug!("Asking responder for a reply to {}", request.from_number);
        match self.attempt(request, None).await {
            Err(e) if e.is_transient() => {
                warn!("Responder request failed ({}), retrying once", e);
                self.attempt(request, Some(chrono::Utc::now().timestamp_millis()))
                    .await
            }
            other => other,
        }
    }
}

fn classify(err: reqwest::Error) -> ResponderError {
    if is_transient(&err) {
        ResponderError::Transient(err.to_string())
    } else {
        ResponderError::Protocol(format!("request failed: {}", describe(&err)))
    }
}

/// Walks the error chain looking for a reset/abort signature.
fn is_transient(err: &reqwest::Error) -> bool {
    if err.is_timeout() {
        return false;
    }
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>()
            && matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            )
        {
            return true;
        }
        let text = e.to_string().to_lowercase();
        if TRANSIENT_PATTERNS.iter().any(|p| text.contains(p)) {
            return true;
        }
        source = e.source();
    }
    false
}

fn describe(err: &reqwest::Error) -> String {
    match err.source() {
        Some(source) => format!("{}: {}", err, source),
        None => err.to_string(),
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(MAX_ERROR_BODY).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Form, Json, Router, http::StatusCode, routing::post};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/whatsapp.php", addr)
    }

    fn responder(endpoint: String) -> HttpResponder {
        HttpResponder::new(&ResponderFileConfig {
            endpoint,
            secret: "s3cret".into(),
            timeout_secs: 5,
        })
        .unwrap()
    }

    fn request() -> ReplyRequest {
        ReplyRequest {
            from_number: "34600000000".into(),
            text: "hola".into(),
            peer_id: "34600000000@s.whatsapp.net".into(),
        }
    }

    #[tokio::test]
    async fn test_posts_form_and_reads_reply() {
        let router = Router::new().route(
            "/whatsapp.php",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                assert_eq!(form["secret"], "s3cret");
                assert_eq!(form["fromNumber"], "34600000000");
                assert_eq!(form["jid"], "34600000000@s.whatsapp.net");
                Json(serde_json::json!({ "text": format!("eco: {}", form["text"]) }))
            }),
        );
        let endpoint = serve(router).await;
        let reply = responder(endpoint).get_reply(&request()).await.unwrap();
        assert_eq!(reply, "eco: hola");
    }

    #[tokio::test]
    async fn test_http_error_is_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/whatsapp.php",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::INTERNAL_SERVER_ERROR, "boom")
                }
            }),
        );
        let endpoint = serve(router).await;
        let err = responder(endpoint).get_reply(&request()).await.unwrap_err();
        assert!(matches!(err, ResponderError::Status { status: 500, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_or_blank_text_is_protocol_error() {
        for body in [serde_json::json!({}), serde_json::json!({ "text": "  " })] {
            let router = Router::new().route(
                "/whatsapp.php",
                post(move || {
                    let body = body.clone();
                    async move { Json(body) }
                }),
            );
            let endpoint = serve(router).await;
            let err = responder(endpoint).get_reply(&request()).await.unwrap_err();
            assert!(matches!(err, ResponderError::Protocol(_)));
        }
    }

    #[tokio::test]
    async fn test_non_json_body_is_protocol_error() {
        let router = Router::new().route("/whatsapp.php", post(|| async { "<html>oops</html>" }));
        let endpoint = serve(router).await;
        let err = responder(endpoint).get_reply(&request()).await.unwrap_err();
        assert!(matches!(err, ResponderError::Protocol(_)));
    }

    async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    return text;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    #[tokio::test]
    async fn test_connection_reset_is_retried_once_with_cache_buster() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            // First connection: read the request, then hang up without answering.
            let (mut first, _) = listener.accept().await.unwrap();
            let head = read_request(&mut first).await;
            seen_tx.send(head.lines().next().unwrap_or("").to_string()).unwrap();
            drop(first);

            let (mut second, _) = listener.accept().await.unwrap();
            let head = read_request(&mut second).await;
            seen_tx.send(head.lines().next().unwrap_or("").to_string()).unwrap();
            let body = r#"{"text":"second time lucky"}"#;
            let resp = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            second.write_all(resp.as_bytes()).await.unwrap();
            second.shutdown().await.unwrap();
        });

        let reply = responder(format!("http://{}/whatsapp.php", addr))
            .get_reply(&request())
            .await
            .unwrap();
        assert_eq!(reply, "second time lucky");

        let first_line = seen_rx.recv().await.unwrap();
        let second_line = seen_rx.recv().await.unwrap();
        assert!(!first_line.contains("_="));
        assert!(second_line.contains("?_="));
    }
}
