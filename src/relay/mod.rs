//! Relay handler
//!
//! The hub keeps one persistent duplex channel to this workstation and
//! delivers inbound HTTP requests over it as `api_relay` frames. This module
//! validates each frame, routes it against the service-route table and the
//! path allow-list, forwards it to the local HTTP surface, and encodes the
//! reply frame. Transport is someone else's problem: the handler consumes
//! and produces JSON values.

use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Upstream (local HTTP) timeout.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(25);
/// Enclosing timeout; wins over the upstream timer so exactly one reply is
/// produced.
const OUTER_TIMEOUT: Duration = Duration::from_secs(30);
/// Serialized body ceiling, pre-JSON-encoded.
const MAX_BODY_BYTES: usize = 1_000_000;
const MAX_REQUEST_ID_LEN: usize = 100;

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// API prefixes always allowed through.
const API_PREFIXES: &[&str] = &[
    "/knowledge",
    "/context",
    "/sessions",
    "/health",
    "/projects",
    "/api/",
];

/// Static asset extensions served without an allow-list entry.
const STATIC_EXTENSIONS: &[&str] = &[
    "html", "htm", "css", "js", "mjs", "map", "woff", "woff2", "ttf", "otf", "eot", "png", "jpg",
    "jpeg", "gif", "svg", "ico", "webp", "avif", "mp4", "webm", "mp3", "wav", "pdf", "txt", "md",
];

/// One configured service route: requests under `prefix` forward to
/// `target` (a base URL), optionally with the prefix stripped.
#[derive(Debug, Clone)]
pub struct ServiceRoute {
    pub prefix: String,
    pub target: String,
    pub strip_prefix: bool,
}

pub struct RelayHandler {
    /// Default target: this process's own HTTP surface.
    local_base: String,
    routes: Vec<ServiceRoute>,
    client: reqwest::Client,
    /// requestId -> arrival time; doubles as the hasResponded latch.
    pending: Arc<DashMap<String, Instant>>,
}

impl RelayHandler {
    pub fn new(local_port: u16, mut routes: Vec<ServiceRoute>) -> Self {
        // Longest prefix wins, so sort once up front.
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self {
            local_base: format!("http://127.0.0.1:{}", local_port),
            routes,
            client: reqwest::Client::builder()
                .timeout(UPSTREAM_TIMEOUT)
                .build()
                .expect("relay HTTP client"),
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Clear pending request tracking (connection teardown).
    pub fn teardown(&self) {
        self.pending.clear();
    }

    /// Handle one inbound frame; returns the reply frame. Invalid frames get
    /// a 400 reply; only the first reply per requestId survives.
    pub async fn handle_frame(&self, frame: &Value) -> Option<Value> {
        let request_id = match validate_request_id(frame) {
            Ok(id) => id,
            Err(reason) => return Some(error_reply("", 400, &reason)),
        };

        // hasResponded latch: a requestId we have already seen is dropped.
        if self.pending.insert(request_id.clone(), Instant::now()).is_some() {
            debug!("Suppressing duplicate relay request {}", request_id);
            return None;
        }

        let reply = match tokio::time::timeout(OUTER_TIMEOUT, self.process(frame, &request_id))
            .await
        {
            Ok(reply) => reply,
            Err(_) => error_reply(&request_id, 504, "relay request timed out"),
        };

        self.pending.remove(&request_id);
        Some(reply)
    }

    async fn process(&self, frame: &Value, request_id: &str) -> Value {
        let method = match frame.get("method").and_then(Value::as_str) {
            Some(m) if ALLOWED_METHODS.contains(&m.to_uppercase().as_str()) => m.to_uppercase(),
            Some(m) => return error_reply(request_id, 400, &format!("method {} not allowed", m)),
            None => return error_reply(request_id, 400, "missing method"),
        };

        let path = match frame.get("path").and_then(Value::as_str) {
            Some(p) => p.to_string(),
            None => return error_reply(request_id, 400, "missing path"),
        };
        if let Err(reason) = validate_path(&path) {
            return error_reply(request_id, 400, &reason);
        }

        let body = frame.get("body").filter(|b| !b.is_null()).cloned();
        if let Some(body) = &body {
            let serialized = body.to_string();
            if serialized.len() > MAX_BODY_BYTES {
                return error_reply(request_id, 413, "body exceeds 1MB limit");
            }
        }

        let Some(target_url) = self.resolve_target(&path) else {
            return error_reply(request_id, 400, "path not allowed");
        };

        let mut url = target_url;
        if let Some(query) = frame.get("query").and_then(Value::as_str) {
            if !query.is_empty() {
                url.push('?');
                url.push_str(query.trim_start_matches('?'));
            }
        }

        self.forward(request_id, &method, &url, body, frame.get("headers"))
            .await
    }

    /// Match the path: service routes (longest prefix first), the API
    /// allow-list, static asset extensions, or exactly `/`.
    fn resolve_target(&self, path: &str) -> Option<String> {
        for route in &self.routes {
            if path.starts_with(&route.prefix) {
                let forwarded = if route.strip_prefix {
                    let rest = &path[route.prefix.len()..];
                    if rest.starts_with('/') || rest.is_empty() {
                        rest.to_string()
                    } else {
                        format!("/{}", rest)
                    }
                } else {
                    path.to_string()
                };
                return Some(format!("{}{}", route.target, forwarded));
            }
        }

        if path == "/"
            || API_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
            || has_static_extension(path)
        {
            return Some(format!("{}{}", self.local_base, path));
        }
        None
    }

    async fn forward(
        &self,
        request_id: &str,
        method: &str,
        url: &str,
        body: Option<Value>,
        headers: Option<&Value>,
    ) -> Value {
        let method = match reqwest::Method::from_bytes(method.as_bytes()) {
            Ok(m) => m,
            Err(_) => return error_reply(request_id, 400, "unparseable method"),
        };

        let mut request = self.client.request(method.clone(), url);

        // Rewrite headers: keep caller headers minus hop-by-hop fields, tag
        // the origin, and set content-type only for bodied writes.
        if let Some(Value::Object(map)) = headers {
            for (name, value) in map {
                let lowered = name.to_lowercase();
                if matches!(
                    lowered.as_str(),
                    "host" | "connection" | "content-length" | "content-type" | "transfer-encoding"
                ) {
                    continue;
                }
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }
        request = request.header("x-relay-source", "hub");

        if let Some(body) = body {
            if matches!(method.as_str(), "POST" | "PUT" | "PATCH") {
                request = request.header("content-type", "application/json");
            }
            request = request.body(body.to_string());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return error_reply(request_id, 504, "upstream timed out")
            }
            Err(e) => {
                warn!("Relay upstream error for {}: {}", url, e);
                return error_reply(request_id, 502, &format!("upstream error: {}", e));
            }
        };

        let status = response.status().as_u16();
        let mut reply_headers = serde_json::Map::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                reply_headers.insert(name.to_string(), Value::String(value.to_string()));
            }
        }
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return error_reply(request_id, 502, &format!("body read error: {}", e)),
        };

        let (data, encoding) = decode_body(&bytes, &content_type);
        json!({
            "type": "api_relay_response",
            "requestId": request_id,
            "status": status,
            "data": data,
            "headers": Value::Object(reply_headers),
            "encoding": encoding,
        })
    }
}

fn validate_request_id(frame: &Value) -> Result<String, String> {
    match frame.get("requestId") {
        None | Some(Value::Null) => Err("missing requestId".to_string()),
        Some(Value::String(id)) if id.is_empty() => Err("empty requestId".to_string()),
        Some(Value::String(id)) if id.len() > MAX_REQUEST_ID_LEN => {
            Err("requestId too long".to_string())
        }
        Some(Value::String(id)) => Ok(id.clone()),
        Some(_) => Err("requestId must be a string".to_string()),
    }
}

fn validate_path(path: &str) -> Result<(), String> {
    if !path.starts_with('/') {
        return Err("path must start with /".to_string());
    }
    if path.contains("..") {
        return Err("path traversal rejected".to_string());
    }
    if path.contains("//") {
        return Err("empty path segment rejected".to_string());
    }
    Ok(())
}

fn has_static_extension(path: &str) -> bool {
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.rsplit_once('.') {
        Some((_, ext)) => STATIC_EXTENSIONS.contains(&ext.to_lowercase().as_str()),
        None => false,
    }
}

/// Decode an upstream body per its content type and report which encoding
/// the reply uses.
fn decode_body(bytes: &[u8], content_type: &str) -> (Value, &'static str) {
    if is_binary_media(content_type) {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        return (Value::String(encoded), "base64");
    }
    if content_type.contains("application/json") {
        if let Ok(parsed) = serde_json::from_slice::<Value>(bytes) {
            return (parsed, "json");
        }
        // Malformed JSON degrades to text.
    }
    (
        Value::String(String::from_utf8_lossy(bytes).to_string()),
        "utf8",
    )
}

fn is_binary_media(content_type: &str) -> bool {
    content_type.starts_with("image/")
        || content_type.starts_with("audio/")
        || content_type.starts_with("video/")
        || content_type.starts_with("font/")
        || content_type.contains("application/octet-stream")
        || content_type.contains("application/pdf")
        || content_type.contains("application/zip")
        || content_type.contains("application/wasm")
}

fn error_reply(request_id: &str, status: u16, error: &str) -> Value {
    json!({
        "type": "api_relay_response",
        "requestId": request_id,
        "status": status,
        "error": error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> RelayHandler {
        RelayHandler::new(
            59999,
            vec![
                ServiceRoute {
                    prefix: "/term".to_string(),
                    target: "http://127.0.0.1:58888".to_string(),
                    strip_prefix: true,
                },
                ServiceRoute {
                    prefix: "/term/ws".to_string(),
                    target: "http://127.0.0.1:58889".to_string(),
                    strip_prefix: false,
                },
            ],
        )
    }

    #[tokio::test]
    async fn test_missing_request_id_rejected() {
        let reply = handler()
            .handle_frame(&json!({"method": "GET", "path": "/knowledge"}))
            .await
            .unwrap();
        assert_eq!(reply["status"], 400);
    }

    #[tokio::test]
    async fn test_non_string_request_id_rejected() {
        let reply = handler()
            .handle_frame(&json!({"requestId": 42, "method": "GET", "path": "/knowledge"}))
            .await
            .unwrap();
        assert_eq!(reply["status"], 400);
    }

    #[tokio::test]
    async fn test_overlong_request_id_rejected() {
        let reply = handler()
            .handle_frame(&json!({
                "requestId": "r".repeat(MAX_REQUEST_ID_LEN + 1),
                "method": "GET",
                "path": "/knowledge"
            }))
            .await
            .unwrap();
        assert_eq!(reply["status"], 400);
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let reply = handler()
            .handle_frame(&json!({
                "requestId": "r1",
                "method": "GET",
                "path": "/knowledge/../etc/passwd"
            }))
            .await
            .unwrap();
        assert_eq!(reply["status"], 400);
    }

    #[tokio::test]
    async fn test_disallowed_path_rejected() {
        let reply = handler()
            .handle_frame(&json!({
                "requestId": "r2",
                "method": "GET",
                "path": "/etc/passwd"
            }))
            .await
            .unwrap();
        assert_eq!(reply["status"], 400);
        assert!(reply["error"].as_str().unwrap().contains("not allowed"));
    }

    #[tokio::test]
    async fn test_bad_method_rejected() {
        let reply = handler()
            .handle_frame(&json!({
                "requestId": "r3",
                "method": "TRACE",
                "path": "/knowledge"
            }))
            .await
            .unwrap();
        assert_eq!(reply["status"], 400);
    }

    #[tokio::test]
    async fn test_body_over_cap_rejected() {
        let reply = handler()
            .handle_frame(&json!({
                "requestId": "r4",
                "method": "POST",
                "path": "/knowledge",
                "body": {"blob": "b".repeat(MAX_BODY_BYTES + 1)}
            }))
            .await
            .unwrap();
        assert_eq!(reply["status"], 413);
    }

    #[tokio::test]
    async fn test_duplicate_request_id_suppressed() {
        let handler = handler();
        // Pre-register the id as pending; the second arrival is dropped.
        handler.pending.insert("dup".to_string(), Instant::now());
        let reply = handler
            .handle_frame(&json!({
                "requestId": "dup",
                "method": "GET",
                "path": "/knowledge"
            }))
            .await;
        assert!(reply.is_none());
    }

    #[test]
    fn test_route_resolution() {
        let handler = handler();

        // Longest prefix wins; stripPrefix controls forwarding.
        assert_eq!(
            handler.resolve_target("/term/ws/session").unwrap(),
            "http://127.0.0.1:58889/term/ws/session"
        );
        assert_eq!(
            handler.resolve_target("/term/index").unwrap(),
            "http://127.0.0.1:58888/index"
        );

        // API prefix and root.
        assert_eq!(
            handler.resolve_target("/knowledge/K001").unwrap(),
            "http://127.0.0.1:59999/knowledge/K001"
        );
        assert!(handler.resolve_target("/").is_some());

        // Static asset by extension.
        assert_eq!(
            handler.resolve_target("/style.css").unwrap(),
            "http://127.0.0.1:59999/style.css"
        );

        // Everything else refused.
        assert!(handler.resolve_target("/etc/passwd").is_none());
    }

    #[test]
    fn test_static_extension_detection() {
        assert!(has_static_extension("/a/b/logo.png"));
        assert!(has_static_extension("/style.CSS"));
        assert!(!has_static_extension("/knowledge"));
        assert!(!has_static_extension("/bin/payload"));
    }

    #[test]
    fn test_decode_body_variants() {
        let (data, encoding) = decode_body(br#"{"x": 1}"#, "application/json");
        assert_eq!(encoding, "json");
        assert_eq!(data["x"], 1);

        let (data, encoding) = decode_body(b"not json {", "application/json");
        assert_eq!(encoding, "utf8");
        assert!(data.as_str().unwrap().contains("not json"));

        let (data, encoding) = decode_body(&[0xde, 0xad], "image/png");
        assert_eq!(encoding, "base64");
        assert_eq!(data.as_str().unwrap(), "3q0=");

        let (_, encoding) = decode_body(b"plain text", "text/plain");
        assert_eq!(encoding, "utf8");
    }

    #[test]
    fn test_validate_path_rules() {
        assert!(validate_path("/ok").is_ok());
        assert!(validate_path("relative").is_err());
        assert!(validate_path("/a/../b").is_err());
        assert!(validate_path("/a//b").is_err());
    }
}
