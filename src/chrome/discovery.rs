use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use serde::Deserialize;

use super::ChromeError;
use super::platform;

/// Browser version information returned by `/json/version`.
#[derive(Debug, Deserialize)]
pub struct BrowserVersion {
    /// Browser name and version (e.g. "Chrome/126.0.6478.55").
    #[serde(rename = "Browser")]
    pub browser: String,

    /// CDP protocol version (e.g. "1.3").
    #[serde(rename = "Protocol-Version", default)]
    pub protocol_version: String,

    /// Browser-wide WebSocket debugger URL.
    #[serde(rename = "webSocketDebuggerUrl")]
    pub ws_debugger_url: String,
}

/// One debuggable target from `/json/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetInfo {
    /// Target identifier.
    pub id: String,

    /// Target kind ("page", "service_worker", "background_page", …).
    #[serde(rename = "type")]
    pub kind: String,

    /// Page title.
    #[serde(default)]
    pub title: String,

    /// Current URL.
    #[serde(default)]
    pub url: String,

    /// Per-target WebSocket debugger URL.
    #[serde(rename = "webSocketDebuggerUrl")]
    pub ws_debugger_url: Option<String>,
}

/// Whether a target is safe to attach to.
///
/// Extension pages, service workers, and background pages are rejected:
/// against Chromium's UI-based remote debugging they stall the attach
/// handshake, so they are filtered out everywhere targets are listed or
/// adopted.
#[must_use]
pub fn is_attachable_target(kind: &str, url: &str) -> bool {
    if url.starts_with("chrome-extension://") {
        return false;
    }
    !matches!(kind, "service_worker" | "background_page")
}

/// Query `/json/version` on a debugger host.
///
/// # Errors
///
/// Returns `ChromeError::HttpError` on connection failure or
/// `ChromeError::ParseError` if the body cannot be deserialized.
pub async fn query_version(host: &str, port: u16) -> Result<BrowserVersion, ChromeError> {
    let body = http_get(host, port, "/json/version").await?;
    serde_json::from_str(&body).map_err(|e| ChromeError::ParseError(e.to_string()))
}

/// Query `/json/list` for debuggable targets. The attach filter is *not*
/// applied here; callers decide.
///
/// # Errors
///
/// Returns `ChromeError::HttpError` on connection failure or
/// `ChromeError::ParseError` if the body cannot be deserialized.
pub async fn query_targets(host: &str, port: u16) -> Result<Vec<TargetInfo>, ChromeError> {
    let body = http_get(host, port, "/json/list").await?;
    serde_json::from_str(&body).map_err(|e| ChromeError::ParseError(e.to_string()))
}

/// Read the `DevToolsActivePort` sentinel from the default user-data dir.
///
/// Returns `(port, ws_path)`.
///
/// # Errors
///
/// Returns `ChromeError::NoActivePort` if the file is missing or
/// `ChromeError::ParseError` if its contents are malformed.
pub fn read_devtools_active_port() -> Result<(u16, String), ChromeError> {
    let data_dir = platform::default_user_data_dir().ok_or(ChromeError::NoActivePort)?;
    read_devtools_active_port_from(&data_dir)
}

/// Read the `DevToolsActivePort` sentinel from a specific user-data dir.
///
/// The file has two lines: the debug port as decimal ASCII, then the
/// browser-wide WebSocket path (`/devtools/browser/…`).
///
/// # Errors
///
/// Returns `ChromeError::NoActivePort` if the file is missing or
/// `ChromeError::ParseError` if its contents are malformed.
pub fn read_devtools_active_port_from(
    data_dir: &std::path::Path,
) -> Result<(u16, String), ChromeError> {
    let path = data_dir.join("DevToolsActivePort");
    let contents = std::fs::read_to_string(&path).map_err(|_| ChromeError::NoActivePort)?;
    parse_devtools_active_port(&contents)
}

fn parse_devtools_active_port(contents: &str) -> Result<(u16, String), ChromeError> {
    let mut lines = contents.lines();
    let port_line = lines.next().ok_or(ChromeError::NoActivePort)?;
    let port: u16 = port_line.trim().parse().map_err(|_| {
        ChromeError::ParseError(format!("invalid port in DevToolsActivePort: {port_line}"))
    })?;
    let ws_path = lines
        .next()
        .ok_or(ChromeError::NoActivePort)?
        .trim()
        .to_string();
    Ok((port, ws_path))
}

/// Discover a running debugger: `DevToolsActivePort` sentinel first, then
/// the given host/port. Returns the browser WebSocket URL and port.
///
/// # Errors
///
/// Returns `ChromeError::NotRunning` if neither path yields a live endpoint.
pub async fn discover_debugger(host: &str, port: u16) -> Result<(String, u16), ChromeError> {
    if let Ok((file_port, ws_path)) = read_devtools_active_port() {
        if query_version("127.0.0.1", file_port).await.is_ok() {
            return Ok((format!("ws://127.0.0.1:{file_port}{ws_path}"), file_port));
        }
    }

    query_version(host, port)
        .await
        .map(|version| (version.ws_debugger_url, port))
        .map_err(|e| ChromeError::NotRunning(format!("discovery failed on {host}:{port}: {e}")))
}

// =============================================================================
// Minimal HTTP/1.1 GET
// =============================================================================

/// Check whether `buf` holds a complete HTTP response (headers plus the full
/// body per Content-Length).
fn is_http_response_complete(buf: &[u8]) -> bool {
    let Some(header_end) = find_header_end(buf) else {
        return false;
    };
    let body_start = header_end + 4;
    match parse_content_length(&buf[..header_end]) {
        Some(cl) => buf.len() >= body_start + cl,
        None => true,
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_content_length(headers: &[u8]) -> Option<usize> {
    let header_str = std::str::from_utf8(headers).ok()?;
    for line in header_str.lines() {
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse().ok();
            }
        }
    }
    None
}

fn parse_http_response(buf: &[u8]) -> Result<String, ChromeError> {
    let header_end = find_header_end(buf)
        .ok_or_else(|| ChromeError::HttpError("malformed HTTP response".into()))?;
    let body_start = header_end + 4;

    let headers = std::str::from_utf8(&buf[..header_end])
        .map_err(|e| ChromeError::HttpError(format!("invalid UTF-8 in headers: {e}")))?;

    let status_line = headers
        .lines()
        .next()
        .ok_or_else(|| ChromeError::HttpError("empty response".into()))?;
    if !status_line.contains(" 200 ") {
        return Err(ChromeError::HttpError(format!(
            "unexpected HTTP status: {status_line}"
        )));
    }

    let body_bytes = if let Some(cl) = parse_content_length(&buf[..header_end]) {
        let end = (body_start + cl).min(buf.len());
        &buf[body_start..end]
    } else {
        &buf[body_start..]
    };

    String::from_utf8(body_bytes.to_vec())
        .map_err(|e| ChromeError::HttpError(format!("invalid UTF-8 in body: {e}")))
}

/// Blocking HTTP GET run on the blocking pool. Chromium's debugger endpoint
/// keeps connections open without Content-Length in some builds, so the read
/// loop stops as soon as the response is complete rather than waiting for EOF.
async fn http_get(host: &str, port: u16, path: &str) -> Result<String, ChromeError> {
    let addr = format!("{host}:{port}");
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");

    tokio::task::spawn_blocking(move || {
        let mut stream = TcpStream::connect_timeout(
            &addr
                .parse()
                .map_err(|e| ChromeError::HttpError(format!("invalid address {addr}: {e}")))?,
            Duration::from_secs(2),
        )
        .map_err(|e| ChromeError::HttpError(format!("connection failed to {addr}: {e}")))?;

        stream.set_read_timeout(Some(Duration::from_secs(5))).ok();

        stream
            .write_all(request.as_bytes())
            .map_err(|e| ChromeError::HttpError(format!("write failed: {e}")))?;

        let mut buf = Vec::with_capacity(4096);
        let mut tmp = [0u8; 4096];
        loop {
            match stream.read(&mut tmp) {
                Ok(0) => break,
                Ok(n) => {
                    buf.extend_from_slice(&tmp[..n]);
                    if is_http_response_complete(&buf) {
                        break;
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if is_http_response_complete(&buf) {
                        break;
                    }
                    return Err(ChromeError::HttpError(format!("read timed out: {e}")));
                }
                Err(e) => return Err(ChromeError::HttpError(format!("read failed: {e}"))),
            }
        }

        parse_http_response(&buf)
    })
    .await
    .map_err(|e| ChromeError::HttpError(format!("task join failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_browser_version() {
        let json = r#"{
            "Browser": "Chrome/126.0.6478.55",
            "Protocol-Version": "1.3",
            "User-Agent": "Mozilla/5.0",
            "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/browser/abc-123"
        }"#;
        let v: BrowserVersion = serde_json::from_str(json).unwrap();
        assert_eq!(v.browser, "Chrome/126.0.6478.55");
        assert!(v.ws_debugger_url.starts_with("ws://"));
    }

    #[test]
    fn parse_targets() {
        let json = r#"[
            {"id": "T1", "type": "page", "title": "Tab", "url": "https://example.com",
             "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/page/T1"},
            {"id": "T2", "type": "service_worker", "title": "", "url": "https://example.com/sw.js"}
        ]"#;
        let targets: Vec<TargetInfo> = serde_json::from_str(json).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].kind, "page");
        assert!(targets[1].ws_debugger_url.is_none());
    }

    #[test]
    fn attach_filter_rejects_extension_pages() {
        assert!(!is_attachable_target(
            "page",
            "chrome-extension://abcdef/popup.html"
        ));
    }

    #[test]
    fn attach_filter_rejects_workers_and_background_pages() {
        assert!(!is_attachable_target("service_worker", "https://a.com/sw.js"));
        assert!(!is_attachable_target("background_page", "https://a.com"));
    }

    #[test]
    fn attach_filter_accepts_ordinary_pages() {
        assert!(is_attachable_target("page", "https://example.com"));
        assert!(is_attachable_target("iframe", "https://example.com/frame"));
    }

    #[test]
    fn sentinel_parse_valid() {
        let (port, path) = parse_devtools_active_port("9222\n/devtools/browser/abc-123\n").unwrap();
        assert_eq!(port, 9222);
        assert_eq!(path, "/devtools/browser/abc-123");
    }

    #[test]
    fn sentinel_parse_empty_fails() {
        assert!(parse_devtools_active_port("").is_err());
    }

    #[test]
    fn sentinel_parse_bad_port_fails() {
        assert!(parse_devtools_active_port("notaport\n/ws/path\n").is_err());
    }

    #[test]
    fn sentinel_parse_missing_path_fails() {
        assert!(parse_devtools_active_port("9222\n").is_err());
    }

    #[test]
    fn sentinel_read_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("DevToolsActivePort"),
            "9333\n/devtools/browser/xyz-789\n",
        )
        .unwrap();

        let (port, path) = read_devtools_active_port_from(dir.path()).unwrap();
        assert_eq!(port, 9333);
        assert_eq!(path, "/devtools/browser/xyz-789");
    }

    #[test]
    fn sentinel_read_missing_dir_fails() {
        let result = read_devtools_active_port_from(std::path::Path::new("/nonexistent/cb-test"));
        assert!(matches!(result, Err(ChromeError::NoActivePort)));
    }

    #[test]
    fn http_response_with_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 13\r\n\r\nHello, world!";
        assert_eq!(parse_http_response(raw).unwrap(), "Hello, world!");
    }

    #[test]
    fn http_response_without_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n{\"ok\":true}";
        assert_eq!(parse_http_response(raw).unwrap(), "{\"ok\":true}");
    }

    #[test]
    fn http_response_non_200_fails() {
        let raw = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        assert!(parse_http_response(raw).is_err());
    }

    #[test]
    fn http_completeness_tracks_content_length() {
        assert!(!is_http_response_complete(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nHe"
        ));
        assert!(is_http_response_complete(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nHello"
        ));
        assert!(!is_http_response_complete(b"HTTP/1.1 200 OK\r\n"));
    }
}
