//! HTTP server for the eventscope API
//! Minimal HTTP/1.1 handling on tokio; routing lives in `eventscope::api`.

use anyhow::{Context, Result};
use eventscope::api::{self, ApiRequest, ApiResponse, AppState};
use eventscope::config::Config;
use reqwest::Url;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const MAX_REQUEST_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("loading configuration")?;
    let state = Arc::new(AppState::from_config(&config)?);

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "Server listening");
    info!("  GET  /query?q=...          - Ask a question");
    info!("  GET  /events               - List catalogued events");
    info!("  POST /discover/all         - Discover events and properties");
    info!("  POST /llm/preview|confirm  - Two-phase descriptions");
    info!("  GET  /export?format=...    - Export the catalog");

    loop {
        let (stream, addr) = listener.accept().await?;
        debug!(%addr, "New connection");
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &state).await {
                warn!(%addr, error = %e, "Connection error");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, state: &AppState) -> Result<()> {
    let response = match read_request(&mut stream).await {
        Ok(Some(request)) => {
            info!(method = %request.method, path = %request.path, "Request");
            api::handle(state, &request).await
        }
        Ok(None) => return Ok(()),
        Err(e) => {
            error!(error = %e, "Malformed request");
            ApiResponse {
                status: 400,
                body: serde_json::json!({ "success": false, "error": e.to_string() }),
            }
        }
    };

    stream.write_all(&render_response(&response)).await?;
    Ok(())
}

/// Read one request: headers up to the blank line, then `Content-Length`
/// bytes of body.
async fn read_request(stream: &mut TcpStream) -> Result<Option<ApiRequest>> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            anyhow::bail!("connection closed mid-request");
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buffer) {
            break pos;
        }
        if buffer.len() > MAX_REQUEST_BYTES {
            anyhow::bail!("request headers too large");
        }
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().context("empty request")?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().context("missing method")?.to_string();
    let target = parts.next().context("missing request target")?.to_string();

    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_lowercase(), value.trim().to_string()))
        .collect();

    let content_length: usize = headers
        .get("content-length")
        .map(|v| v.parse::<usize>())
        .transpose()
        .context("invalid Content-Length")?
        .unwrap_or(0);
    if content_length > MAX_REQUEST_BYTES {
        anyhow::bail!("request body too large");
    }

    let body_start = header_end + 4;
    while buffer.len() < body_start + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("connection closed before body was complete");
        }
        buffer.extend_from_slice(&chunk[..n]);
    }

    let body = &buffer[body_start..body_start + content_length];
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        Some(serde_json::from_slice(body).context("request body is not valid JSON")?)
    };

    let url = Url::parse(&format!("http://localhost{}", target)).context("invalid request target")?;
    Ok(Some(ApiRequest {
        method,
        path: url.path().to_string(),
        query: url.query_pairs().into_owned().collect(),
        body,
    }))
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

fn render_response(response: &ApiResponse) -> Vec<u8> {
    let body = response.body.to_string();
    let status_text = match response.status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, PUT, DELETE, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        response.status,
        status_text,
        body.len(),
        body
    )
    .into_bytes()
}
