//! Local proxy: bridges relay-originated requests onto local destinations.
//!
//! Plain requests go through a pooled HTTP client with streaming bodies in
//! both directions. Upgrade requests speak HTTP/1.1 directly on a raw
//! socket, because after the `101` the connection stops being HTTP and both
//! sides just shovel bytes.

use crate::config::{SessionConfig, TunnelDescriptor};
use crate::registry::RequestFrame;
use crate::session::FrameSender;
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use futures_util::StreamExt;
use portgate_shared::descriptor::{HeaderMap, HeaderValues, HttpRequestHead, HttpResponseHead};
use portgate_shared::{Frame, FrameKind, RequestId};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::MaybeTlsStream;
use tracing::debug;
use url::Url;

/// Largest response head accepted from a local upgrade target.
const MAX_HEAD_LEN: usize = 64 * 1024;

/// How a request wants to be bridged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Http,
    Ws,
}

/// Everything a per-request task needs.
#[derive(Clone)]
pub struct ProxyContext {
    pub config: Arc<SessionConfig>,
    pub sender: FrameSender,
    pub client: reqwest::Client,
}

/// HTTP client for local targets. Redirects are forwarded, not followed.
pub fn local_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

/// Drive one request to completion.
///
/// All failures up to the point where the first frame goes out are answered
/// with a single `badgateway`; after that the request tears down silently so
/// the outbound sequence stays a clean prefix. Nothing here ever touches the
/// tunnel itself.
pub async fn handle(
    context: ProxyContext,
    kind: RequestKind,
    id: RequestId,
    payload: Bytes,
    rx: mpsc::Receiver<RequestFrame>,
) {
    let started = Instant::now();
    match run(&context, kind, id, payload, rx).await {
        Ok(()) => debug!("request {} finished in {:?}", id, started.elapsed()),
        Err(err) => {
            debug!("request {} failed locally: {err:#}", id);
            let _ = context.sender.send(Frame::bad_gateway(id)).await;
        }
    }
}

async fn run(
    context: &ProxyContext,
    kind: RequestKind,
    id: RequestId,
    payload: Bytes,
    rx: mpsc::Receiver<RequestFrame>,
) -> Result<()> {
    let head: HttpRequestHead =
        serde_json::from_slice(&payload).context("malformed request descriptor")?;
    let HttpRequestHead {
        url,
        subdomain,
        method,
        mut headers,
    } = head;

    let tunnel = context
        .config
        .find_tunnel(&subdomain)
        .ok_or_else(|| anyhow!("no tunnel registered for subdomain '{subdomain}'"))?;

    if tunnel.strip_host_header {
        strip_host(&mut headers);
    }

    match kind {
        RequestKind::Http => {
            let target = compose_target(&tunnel.local_target, &url);
            debug!("request {} {} {} -> {}", id, method, url, target);
            forward_http(context, id, &method, &target, headers, rx).await
        }
        RequestKind::Ws => {
            debug!("request {} upgrade {} -> {}", id, url, tunnel.local_target);
            forward_upgrade(context, id, tunnel, &method, &url, headers, rx).await
        }
    }
}

/// Remove any case variant of the `host` header.
fn strip_host(headers: &mut HeaderMap) {
    headers.retain(|name, _| !name.eq_ignore_ascii_case("host"));
}

/// Outbound URL: local origin, plus either the request path alone or the
/// target's base path concatenated with it.
fn compose_target(local_target: &Url, request_url: &str) -> String {
    let mut origin = format!(
        "{}://{}",
        local_target.scheme(),
        local_target.host_str().unwrap_or_default()
    );
    if let Some(port) = local_target.port() {
        origin.push_str(&format!(":{port}"));
    }

    let base = local_target.path();
    if base == "/" {
        format!("{origin}{request_url}")
    } else {
        format!("{origin}{base}{request_url}")
    }
}

// ---------------------------------------------------------------------------
// Plain request/response
// ---------------------------------------------------------------------------

async fn forward_http(
    context: &ProxyContext,
    id: RequestId,
    method: &str,
    target: &str,
    headers: HeaderMap,
    mut rx: mpsc::Receiver<RequestFrame>,
) -> Result<()> {
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .with_context(|| format!("invalid method '{method}'"))?;
    let header_map = to_client_headers(&headers)?;

    // Inbound data frames feed the outbound body; end closes it.
    let (body_tx, body_rx) = mpsc::channel::<std::io::Result<Bytes>>(64);
    let pump = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame.kind {
                FrameKind::Data => {
                    if body_tx.send(Ok(frame.payload)).await.is_err() {
                        break;
                    }
                }
                FrameKind::End => break,
                _ => {}
            }
        }
    });

    let response = context
        .client
        .request(method, target)
        .headers(header_map)
        .body(reqwest::Body::wrap_stream(ReceiverStream::new(body_rx)))
        .send()
        .await;
    let response = match response {
        Ok(response) => response,
        Err(err) => {
            pump.abort();
            return Err(err).context("local request failed");
        }
    };

    let head = HttpResponseHead {
        status_code: response.status().as_u16(),
        headers: from_client_headers(response.headers()),
    };
    debug!("request {} local answered {}", id, head.status_code);
    let payload = serde_json::to_vec(&head).context("encoding response head")?;
    context.sender.send(Frame::head(id, payload.into())).await?;

    // The head is on the wire; from here on a failure tears down silently.
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(chunk) if chunk.is_empty() => {}
            Ok(chunk) => {
                if context.sender.send(Frame::data(id, chunk)).await.is_err() {
                    pump.abort();
                    return Ok(());
                }
            }
            Err(err) => {
                debug!("request {} response body failed: {err}", id);
                pump.abort();
                return Ok(());
            }
        }
    }

    let _ = context.sender.send(Frame::end(id)).await;
    pump.abort();
    Ok(())
}

fn to_client_headers(headers: &HeaderMap) -> Result<reqwest::header::HeaderMap> {
    use reqwest::header::{HeaderName, HeaderValue};

    let mut map = reqwest::header::HeaderMap::new();
    for (name, values) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name '{name}'"))?;
        for value in values.iter() {
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header '{name}'"))?;
            map.append(name.clone(), value);
        }
    }
    Ok(map)
}

fn from_client_headers(headers: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut map = HeaderMap::new();
    for name in headers.keys() {
        let mut values: Vec<String> = headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok().map(str::to_string))
            .collect();
        let entry = match values.len() {
            0 => continue,
            1 => HeaderValues::One(values.remove(0)),
            _ => HeaderValues::Many(values),
        };
        map.insert(name.as_str().to_string(), entry);
    }
    map
}

// ---------------------------------------------------------------------------
// Upgraded stream
// ---------------------------------------------------------------------------

async fn forward_upgrade(
    context: &ProxyContext,
    id: RequestId,
    tunnel: &TunnelDescriptor,
    method: &str,
    request_url: &str,
    headers: HeaderMap,
    mut rx: mpsc::Receiver<RequestFrame>,
) -> Result<()> {
    let target = &tunnel.local_target;
    let host = target
        .host_str()
        .ok_or_else(|| anyhow!("local target has no host"))?;
    let port = target.port_or_known_default().unwrap_or(80);
    let path = if target.path() == "/" {
        request_url.to_string()
    } else {
        format!("{}{}", target.path(), request_url)
    };

    let mut stream = connect_local(target.scheme(), host, port).await?;

    // The local side sees an ordinary upgrade request.
    let mut request = format!("{method} {path} HTTP/1.1\r\n");
    if !headers.keys().any(|name| name.eq_ignore_ascii_case("host")) {
        let host_value = match target.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        request.push_str(&format!("host: {host_value}\r\n"));
    }
    for (name, values) in &headers {
        for value in values.iter() {
            request.push_str(&format!("{name}: {value}\r\n"));
        }
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let (head_block, leftover) = read_response_head(&mut stream).await?;
    let response = parse_response_head(&head_block)?;
    debug!(
        "request {} local answered {} {}",
        id, response.status, response.reason
    );

    context
        .sender
        .send(Frame::data(id, synthesize_head(&response).into()))
        .await?;
    if !leftover.is_empty() {
        context.sender.send(Frame::data(id, leftover)).await?;
    }

    // Raw byte pump. Either side's half-close ends the whole request: a
    // local EOF emits `end`, an inbound `end` shuts the local write side.
    let (mut local_read, mut local_write) = tokio::io::split(stream);
    let mut buf = vec![0u8; 8192];
    loop {
        tokio::select! {
            read = local_read.read(&mut buf) => match read {
                Ok(0) => {
                    let _ = context.sender.send(Frame::end(id)).await;
                    break;
                }
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    if context.sender.send(Frame::data(id, chunk)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!("request {} local read failed: {err}", id);
                    break;
                }
            },
            frame = rx.recv() => match frame {
                Some(frame) => match frame.kind {
                    FrameKind::Data => {
                        if local_write.write_all(&frame.payload).await.is_err() {
                            break;
                        }
                    }
                    FrameKind::End => {
                        let _ = local_write.shutdown().await;
                        break;
                    }
                    _ => {}
                },
                // Tunnel teardown.
                None => break,
            },
        }
    }
    Ok(())
}

async fn connect_local(
    scheme: &str,
    host: &str,
    port: u16,
) -> Result<MaybeTlsStream<TcpStream>> {
    let tcp = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("connecting to {host}:{port}"))?;
    if scheme == "https" {
        let connector = tokio_native_tls::TlsConnector::from(
            native_tls::TlsConnector::new().context("building TLS connector")?,
        );
        let tls = connector
            .connect(host, tcp)
            .await
            .with_context(|| format!("TLS handshake with {host}"))?;
        Ok(MaybeTlsStream::NativeTls(tls))
    } else {
        Ok(MaybeTlsStream::Plain(tcp))
    }
}

/// Read up to the end of the response head; whatever followed it in the same
/// read belongs to the upgraded stream and is returned separately.
async fn read_response_head<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(String, Bytes)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = find_header_end(&buf) {
            let head = String::from_utf8(buf[..end].to_vec()).context("non-UTF-8 response head")?;
            let leftover = Bytes::copy_from_slice(&buf[end + 4..]);
            return Ok((head, leftover));
        }
        if buf.len() > MAX_HEAD_LEN {
            bail!("local response head too large");
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            bail!("local socket closed before the response head");
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

struct ParsedHead {
    version: String,
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
}

fn parse_response_head(block: &str) -> Result<ParsedHead> {
    let mut lines = block.split("\r\n");
    let status_line = lines.next().unwrap_or_default();

    let mut parts = status_line.splitn(3, ' ');
    let version = parts
        .next()
        .and_then(|v| v.strip_prefix("HTTP/"))
        .ok_or_else(|| anyhow!("malformed status line '{status_line}'"))?
        .to_string();
    let status: u16 = parts
        .next()
        .unwrap_or_default()
        .parse()
        .with_context(|| format!("malformed status line '{status_line}'"))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(ParsedHead {
        version,
        status,
        reason,
        headers,
    })
}

/// Rebuild the head textually for the relay, header names lowercased.
fn synthesize_head(head: &ParsedHead) -> String {
    let mut text = format!("HTTP/{} {} {}\r\n", head.version, head.status, head.reason);
    for (name, value) in &head.headers {
        text.push_str(&format!("{}: {}\r\n", name.to_ascii_lowercase(), value));
    }
    text.push_str("\r\n");
    text
}
