//! Request registry: routes decoded frames to per-request handlers.

use crate::config::SessionConfig;
use crate::proxy::{self, RequestKind};
use crate::session::FrameSender;
use bytes::Bytes;
use portgate_shared::descriptor::IdleDescriptor;
use portgate_shared::{Frame, FrameKind, RequestId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

/// Buffered frames per in-flight request.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// A frame delivered on a per-request sub-stream, minus the request id.
#[derive(Debug)]
pub struct RequestFrame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

/// Owns the id -> sub-stream map and the per-request tasks.
///
/// The map is only ever touched from the session's read task. Dropping the
/// registry aborts every in-flight request, so nothing survives into the
/// next session.
pub struct Registry {
    config: Arc<SessionConfig>,
    sender: FrameSender,
    client: reqwest::Client,
    streams: HashMap<RequestId, mpsc::Sender<RequestFrame>>,
    tasks: JoinSet<()>,
}

impl Registry {
    pub fn new(config: Arc<SessionConfig>, sender: FrameSender, client: reqwest::Client) -> Self {
        Self {
            config,
            sender,
            client,
            streams: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Route one decoded frame.
    ///
    /// Returns the idle descriptor when the relay asks the agent to park;
    /// everything else is handled internally.
    pub async fn route(&mut self, frame: Frame) -> Option<IdleDescriptor> {
        if frame.kind == FrameKind::GoIdle {
            match serde_json::from_slice(&frame.payload) {
                Ok(descriptor) => return Some(descriptor),
                Err(err) => {
                    warn!("ignoring malformed go-idle frame: {err}");
                    return None;
                }
            }
        }

        if let Some(tx) = self.streams.get(&frame.request_id).cloned() {
            let sub = RequestFrame {
                kind: frame.kind,
                payload: frame.payload,
            };
            if tx.send(sub).await.is_err() {
                // Handler already finished; forget the id.
                self.streams.remove(&frame.request_id);
            }
            return None;
        }

        match frame.kind {
            FrameKind::Http => self.open(RequestKind::Http, frame),
            FrameKind::Ws => self.open(RequestKind::Ws, frame),
            other => {
                trace!(
                    "dropping {} frame for unknown request {}",
                    other,
                    frame.request_id
                );
            }
        }
        None
    }

    /// Create a PerRequest and hand it the rest of its frames.
    fn open(&mut self, kind: RequestKind, frame: Frame) {
        // Opportunistic cleanup of entries whose handler has finished.
        self.streams.retain(|_, tx| !tx.is_closed());

        debug!("request {} opened ({kind:?})", frame.request_id);
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        self.streams.insert(frame.request_id, tx);

        let context = proxy::ProxyContext {
            config: self.config.clone(),
            sender: self.sender.clone(),
            client: self.client.clone(),
        };
        self.tasks
            .spawn(proxy::handle(context, kind, frame.request_id, frame.payload, rx));
    }

    /// Number of requests currently in flight.
    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.streams.len()
    }
}
