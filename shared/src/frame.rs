//! Frame encoding/decoding for the tunnel protocol
//!
//! Frame format (one frame per transport message):
//! ```text
//! +---------+----------------------+----------+------------+---------+
//! | Version |   Request ID (16B)   | Type len | Type (var) | Payload |
//! +---------+----------------------+----------+------------+---------+
//! ```
//!
//! The type is a length-prefixed ASCII string. Frames shorter than the
//! fixed header or carrying an unknown version are dropped by the decoder.

use bytes::{BufMut, Bytes, BytesMut};

/// Only accepted protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Length of the opaque request identifier.
pub const REQUEST_ID_LEN: usize = 16;

/// Minimum length of a well-formed frame: version + request id + type length.
pub const MIN_FRAME_LEN: usize = 1 + REQUEST_ID_LEN + 1;

/// Opaque per-request identifier minted by the relay.
///
/// Compared by byte equality, never by reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId([u8; REQUEST_ID_LEN]);

impl RequestId {
    pub fn from_bytes(bytes: [u8; REQUEST_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Copy an id out of a wire buffer. Returns `None` on length mismatch.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; REQUEST_ID_LEN] = slice.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; REQUEST_ID_LEN] {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RequestId({})", self)
    }
}

/// Frame types exchanged over the duplex channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Relay -> agent: JSON request descriptor for a plain HTTP request.
    Http,
    /// Relay -> agent: JSON request descriptor asking for a protocol upgrade.
    Ws,
    /// Agent -> relay: JSON response head for an `http` request.
    Head,
    /// Either direction: raw body or upgraded-stream bytes.
    Data,
    /// Either direction: empty payload, orderly half-close.
    End,
    /// Agent -> relay: empty payload, the request could not be served locally.
    BadGateway,
    /// Relay -> agent: JSON idle descriptor, park the tunnel.
    GoIdle,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Http => "http",
            FrameKind::Ws => "ws",
            FrameKind::Head => "head",
            FrameKind::Data => "data",
            FrameKind::End => "end",
            FrameKind::BadGateway => "badgateway",
            FrameKind::GoIdle => "go-idle",
        }
    }

    /// Parse the wire type string. Unknown types are dropped by the decoder.
    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"http" => Some(FrameKind::Http),
            b"ws" => Some(FrameKind::Ws),
            b"head" => Some(FrameKind::Head),
            b"data" => Some(FrameKind::Data),
            b"end" => Some(FrameKind::End),
            b"badgateway" => Some(FrameKind::BadGateway),
            b"go-idle" => Some(FrameKind::GoIdle),
            _ => None,
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub request_id: RequestId,
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(request_id: RequestId, kind: FrameKind, payload: Bytes) -> Self {
        Self {
            request_id,
            kind,
            payload,
        }
    }

    /// Response head for an `http` request, JSON payload.
    pub fn head(request_id: RequestId, payload: Bytes) -> Self {
        Self::new(request_id, FrameKind::Head, payload)
    }

    /// Raw body or upgraded-stream bytes.
    pub fn data(request_id: RequestId, payload: Bytes) -> Self {
        Self::new(request_id, FrameKind::Data, payload)
    }

    /// Orderly half-close.
    pub fn end(request_id: RequestId) -> Self {
        Self::new(request_id, FrameKind::End, Bytes::new())
    }

    /// The request could not be fulfilled locally.
    pub fn bad_gateway(request_id: RequestId) -> Self {
        Self::new(request_id, FrameKind::BadGateway, Bytes::new())
    }

    /// Encode into a single transport message.
    pub fn encode(&self) -> Bytes {
        let kind = self.kind.as_str().as_bytes();
        let mut buf = BytesMut::with_capacity(MIN_FRAME_LEN + kind.len() + self.payload.len());

        buf.put_u8(PROTOCOL_VERSION);
        buf.put_slice(self.request_id.as_bytes());
        buf.put_u8(kind.len() as u8);
        buf.put_slice(kind);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode one transport message.
    ///
    /// Returns `None` for frames shorter than the fixed header, with an
    /// unknown version, with a truncated type string, or with a type string
    /// the protocol does not define. All fields are copied out; the result
    /// does not borrow from `buf`.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < MIN_FRAME_LEN || buf[0] != PROTOCOL_VERSION {
            return None;
        }

        let request_id = RequestId::from_slice(&buf[1..1 + REQUEST_ID_LEN])?;
        let type_len = buf[1 + REQUEST_ID_LEN] as usize;
        let rest = &buf[MIN_FRAME_LEN..];
        if rest.len() < type_len {
            return None;
        }

        let kind = FrameKind::from_wire(&rest[..type_len])?;
        let payload = Bytes::copy_from_slice(&rest[type_len..]);

        Some(Self {
            request_id,
            kind,
            payload,
        })
    }
}
