//! Tunnel session: owns the duplex channel to the relay.
//!
//! One session equals one WebSocket connection. The read half decodes frames
//! and routes them through the registry; the write half is a single task fed
//! by an mpsc queue, so frames from concurrent requests may interleave at
//! frame boundaries but never inside a frame.

use crate::config::SessionConfig;
use crate::proxy;
use crate::registry::Registry;
use anyhow::{anyhow, bail, Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use portgate_shared::descriptor::IdleDescriptor;
use portgate_shared::{Error, Frame};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::{header, Request};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound frames queued ahead of the channel writer.
const OUTBOUND_QUEUE: usize = 256;

const MAX_REDIRECTS: usize = 5;

/// Cloneable handle for queueing one frame onto the channel.
///
/// The frame is assembled into a single transport message here, so the
/// writer task never splits it. Sending fails once the transport has.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Message>,
}

impl FrameSender {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, frame: Frame) -> portgate_shared::Result<()> {
        self.tx
            .send(Message::Binary(frame.encode()))
            .await
            .map_err(|_| Error::ChannelClosed)
    }
}

/// An established duplex channel, not yet driven.
pub struct Session {
    ws: WsStream,
    config: Arc<SessionConfig>,
    client: reqwest::Client,
}

impl Session {
    /// Open the duplex channel and register the route set.
    ///
    /// Returning `Ok` is the channel-ready signal; the caller decides when
    /// the connection counts as settled.
    pub async fn connect(config: Arc<SessionConfig>) -> Result<Session> {
        let client = proxy::local_client().context("building local HTTP client")?;
        let mut url = endpoint_url(&config)?;

        for _ in 0..=MAX_REDIRECTS {
            let request = client_request(&url, &config)?;
            match connect_async(request).await {
                Ok((ws, _response)) => {
                    debug!("channel open to {}", config.hostname);
                    return Ok(Session { ws, config, client });
                }
                Err(tungstenite::Error::Http(response)) if response.status().is_redirection() => {
                    let location = response
                        .headers()
                        .get(header::LOCATION)
                        .and_then(|value| value.to_str().ok())
                        .ok_or_else(|| anyhow!("redirect without a location header"))?;
                    url = url.join(location).context("invalid redirect location")?;
                    normalize_ws_scheme(&mut url);
                    debug!("following redirect to {url}");
                }
                Err(err) => return Err(err).context("opening relay channel"),
            }
        }
        bail!("too many redirects opening the relay channel")
    }

    /// Drive the channel until the relay fails, closes, or asks for idle.
    pub async fn run(self) -> portgate_shared::Result<IdleDescriptor> {
        let (sink, mut stream) = self.ws.split();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let writer = tokio::spawn(write_loop(sink, rx));
        let mut registry = Registry::new(
            self.config.clone(),
            FrameSender::new(tx.clone()),
            self.client.clone(),
        );

        let result = loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => match Frame::decode(&data) {
                    Some(frame) => {
                        trace!("frame in: {} {}", frame.kind, frame.request_id);
                        if let Some(descriptor) = registry.route(frame).await {
                            info!("relay requested idle mode");
                            break Ok(descriptor);
                        }
                    }
                    None => trace!("dropping malformed frame ({} bytes)", data.len()),
                },
                Some(Ok(Message::Ping(payload))) => {
                    if tx.send(Message::Pong(payload)).await.is_err() {
                        break Err(Error::ChannelClosed);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let detail = frame
                        .map(|f| format!("{} - {}", f.code, f.reason))
                        .unwrap_or_else(|| "closed without a close frame".to_string());
                    break Err(Error::Connection(detail));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => break Err(Error::Connection(err.to_string())),
                None => break Err(Error::Connection("channel ended unexpectedly".to_string())),
            }
        };

        // Dropping the registry aborts every in-flight request.
        drop(registry);
        writer.abort();
        result
    }
}

/// `{ws,wss}://<hostname>/api/tunnel?s=<name|label>&…&c=<client_id>`
fn endpoint_url(config: &SessionConfig) -> Result<Url> {
    let scheme = if config.secure { "wss" } else { "ws" };
    let mut url = Url::parse(&format!("{scheme}://{}/api/tunnel", config.hostname))
        .with_context(|| format!("invalid relay hostname '{}'", config.hostname))?;
    {
        let mut query = url.query_pairs_mut();
        for tunnel in &config.tunnels {
            query.append_pair("s", &format!("{}|{}", tunnel.remote_name, tunnel.label));
        }
        query.append_pair("c", &config.client_id);
    }
    Ok(url)
}

fn client_request(url: &Url, config: &SessionConfig) -> Result<Request<()>> {
    let host = url.host_str().context("relay URL has no host")?;
    let host_value = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let mut request = Request::builder()
        .uri(url.as_str())
        .header(header::HOST, host_value)
        .header(header::AUTHORIZATION, format!("Bearer {}", config.api_key))
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_VERSION, "13")
        .header(header::SEC_WEBSOCKET_KEY, generate_key());
    if !config.user_agent.is_empty() {
        request = request.header(header::USER_AGENT, config.user_agent.as_str());
    }
    request.body(()).context("building channel request")
}

/// Redirect targets may come back as `http(s)`; the channel stays WebSocket.
fn normalize_ws_scheme(url: &mut Url) {
    match url.scheme() {
        "http" => {
            let _ = url.set_scheme("ws");
        }
        "https" => {
            let _ = url.set_scheme("wss");
        }
        _ => {}
    }
}

/// Single owner of the sink; one queued message per frame.
async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        if let Err(err) = sink.send(message).await {
            debug!("channel write failed: {err}");
            break;
        }
    }
}
