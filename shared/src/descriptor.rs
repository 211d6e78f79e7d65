//! JSON payload descriptors carried inside frames.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A header value: single string or list of strings.
///
/// The wire format distinguishes the two, and the distinction is preserved
/// end to end so multi-value headers survive the round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

impl HeaderValues {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        match self {
            HeaderValues::One(value) => std::slice::from_ref(value).iter().map(String::as_str),
            HeaderValues::Many(values) => values.as_slice().iter().map(String::as_str),
        }
    }
}

impl From<&str> for HeaderValues {
    fn from(value: &str) -> Self {
        HeaderValues::One(value.to_string())
    }
}

/// Header map as presented on the wire.
pub type HeaderMap = HashMap<String, HeaderValues>;

/// Request descriptor: payload of `http` and `ws` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequestHead {
    /// Path + query as presented to the relay.
    pub url: String,
    /// The `remote_name` of the tunnel chosen by the relay.
    pub subdomain: String,
    pub method: String,
    #[serde(default)]
    pub headers: HeaderMap,
}

/// Response head descriptor: payload of `head` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponseHead {
    pub status_code: u16,
    #[serde(default)]
    pub headers: HeaderMap,
}

/// Idle descriptor: payload of `go-idle` frames.
///
/// Four opaque strings consumed only by the idle notifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdleDescriptor {
    pub db: String,
    pub db_key: String,
    pub api_key: String,
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_head_parses() {
        let json = r#"{
            "url": "/ping?x=1",
            "subdomain": "app",
            "method": "GET",
            "headers": {"host": "app.example", "accept": ["text/html", "*/*"]}
        }"#;
        let head: HttpRequestHead = serde_json::from_str(json).unwrap();
        assert_eq!(head.url, "/ping?x=1");
        assert_eq!(head.subdomain, "app");
        assert_eq!(head.method, "GET");
        assert_eq!(head.headers["host"], HeaderValues::One("app.example".into()));
        assert_eq!(
            head.headers["accept"].iter().collect::<Vec<_>>(),
            vec!["text/html", "*/*"]
        );
    }

    #[test]
    fn test_request_head_headers_default_empty() {
        let head: HttpRequestHead =
            serde_json::from_str(r#"{"url": "/", "subdomain": "app", "method": "GET"}"#).unwrap();
        assert!(head.headers.is_empty());
    }

    #[test]
    fn test_response_head_wire_shape() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type".into(), "text/plain".into());
        let head = HttpResponseHead {
            status_code: 200,
            headers,
        };

        let json: serde_json::Value = serde_json::to_value(&head).unwrap();
        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["headers"]["content-type"], "text/plain");
    }

    #[test]
    fn test_multi_value_headers_roundtrip() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "set-cookie".into(),
            HeaderValues::Many(vec!["a=1".into(), "b=2".into()]),
        );
        headers.insert("server".into(), "mock".into());

        let json = serde_json::to_string(&HttpResponseHead {
            status_code: 204,
            headers: headers.clone(),
        })
        .unwrap();
        let back: HttpResponseHead = serde_json::from_str(&json).unwrap();
        assert_eq!(back.headers, headers);
    }

    #[test]
    fn test_idle_descriptor_wire_keys() {
        let json = r#"{"db": "acme.example.app", "dbKey": "wake/u1", "apiKey": "k", "token": "t"}"#;
        let idle: IdleDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(idle.db, "acme.example.app");
        assert_eq!(idle.db_key, "wake/u1");
        assert_eq!(idle.api_key, "k");
        assert_eq!(idle.token, "t");
    }
}
