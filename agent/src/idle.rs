//! Idle notifier: park on an external key-watch channel until wake-up.
//!
//! While idle the agent holds no tunnel at all. It signs in to the realtime
//! database named by the idle descriptor, watches a single key as an event
//! stream, and wakes the supervisor on the first observed change to the
//! per-route counters.

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use portgate_shared::descriptor::IdleDescriptor;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Hard cap on one idle period; after this the agent reconnects regardless.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

const TOKEN_ENDPOINT: &str =
    "https://identitytoolkit.googleapis.com/v1/accounts:signInWithCustomToken";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The watched key changed for one of our routes.
    Changed,
    /// Nothing happened for a full hour.
    Timeout,
    /// The watch failed; reconnecting is the safe reaction.
    Error,
}

/// Park until the watched key changes, the watch fails, or the hard timeout.
///
/// Every exit path drops the database session.
pub async fn watch(descriptor: &IdleDescriptor, remote_names: &[String]) -> WakeReason {
    match tokio::time::timeout(IDLE_TIMEOUT, watch_key(descriptor, remote_names)).await {
        Ok(Ok(())) => WakeReason::Changed,
        Ok(Err(err)) => {
            warn!("idle watch failed: {err:#}");
            WakeReason::Error
        }
        Err(_) => WakeReason::Timeout,
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    id_token: String,
}

/// One `put`/`patch` event on the watched key.
#[derive(Deserialize)]
struct KeyUpdate {
    path: String,
    data: Value,
}

async fn watch_key(descriptor: &IdleDescriptor, remote_names: &[String]) -> Result<()> {
    let client = reqwest::Client::new();

    let signin: SignInResponse = client
        .post(TOKEN_ENDPOINT)
        .query(&[("key", descriptor.api_key.as_str())])
        .json(&json!({ "token": descriptor.token, "returnSecureToken": true }))
        .send()
        .await
        .context("authenticating with the database service")?
        .error_for_status()
        .context("database authentication rejected")?
        .json()
        .await
        .context("malformed authentication response")?;

    let response = client
        .get(key_url(&descriptor.db, &descriptor.db_key))
        .query(&[("auth", signin.id_token.as_str())])
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
        .context("subscribing to the wake-up key")?
        .error_for_status()
        .context("wake-up subscription rejected")?;

    let mut events = EventParser::new();
    let mut value = Value::Null;
    let mut baseline: Option<Vec<Option<i64>>> = None;
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("wake-up stream failed")?;
        for event in events.push(&chunk) {
            match event.name.as_str() {
                "put" | "patch" => {
                    let update: KeyUpdate =
                        serde_json::from_str(&event.data).context("malformed wake-up event")?;
                    apply_update(&mut value, &update.path, update.data, event.name == "patch");

                    let projected = project(&value, remote_names);
                    match &baseline {
                        // The initial read only establishes the baseline.
                        None => {
                            debug!("idle baseline: {projected:?}");
                            baseline = Some(projected);
                        }
                        Some(previous) if *previous != projected => {
                            debug!("wake-up: {previous:?} -> {projected:?}");
                            return Ok(());
                        }
                        Some(_) => {}
                    }
                }
                "keep-alive" => {}
                "cancel" | "auth_revoked" => {
                    bail!("wake-up subscription revoked ({})", event.name)
                }
                other => debug!("ignoring idle event '{other}'"),
            }
        }
    }
    bail!("wake-up stream ended")
}

/// `https://<db>/<key>.json`; `db` may already be a full URL.
fn key_url(db: &str, key: &str) -> String {
    let base = if db.starts_with("http://") || db.starts_with("https://") {
        db.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", db.trim_end_matches('/'))
    };
    format!("{base}/{}.json", key.trim_matches('/'))
}

/// Apply a `put` (replace) or `patch` (shallow merge) at `path`.
fn apply_update(root: &mut Value, path: &str, data: Value, merge: bool) {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    apply_at(root, &segments, data, merge);
}

fn apply_at(slot: &mut Value, segments: &[&str], data: Value, merge: bool) {
    match segments.split_first() {
        None => match data {
            Value::Object(patch) if merge => {
                if let Value::Object(target) = slot {
                    for (key, value) in patch {
                        target.insert(key, value);
                    }
                } else {
                    *slot = Value::Object(patch);
                }
            }
            data => *slot = data,
        },
        Some((head, rest)) => {
            if !slot.is_object() {
                *slot = Value::Object(serde_json::Map::new());
            }
            if let Value::Object(map) = slot {
                let child = map.entry(head.to_string()).or_insert(Value::Null);
                apply_at(child, rest, data, merge);
            }
        }
    }
}

/// Project the key's value (a map `name -> integer`) onto our route names.
fn project(value: &Value, remote_names: &[String]) -> Vec<Option<i64>> {
    remote_names
        .iter()
        .map(|name| value.get(name).and_then(Value::as_i64))
        .collect()
}

/// One server-sent event.
#[derive(Debug, Default, PartialEq)]
struct SseEvent {
    name: String,
    data: String,
}

/// Minimal incremental server-sent-events parser.
#[derive(Default)]
struct EventParser {
    buf: String,
    name: String,
    data: String,
}

impl EventParser {
    fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns every event completed by this chunk.
    fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                if !self.name.is_empty() || !self.data.is_empty() {
                    events.push(SseEvent {
                        name: std::mem::take(&mut self.name),
                        data: std::mem::take(&mut self.data),
                    });
                }
            } else if let Some(rest) = line.strip_prefix("event:") {
                self.name = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("data:") {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(rest.trim_start());
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_project_missing_names_are_null() {
        let value = json!({ "app": 3, "api": 7, "other": 1 });
        assert_eq!(
            project(&value, &names(&["app", "api", "gone"])),
            vec![Some(3), Some(7), None]
        );
    }

    #[test]
    fn test_apply_put_at_root_replaces() {
        let mut value = json!({ "app": 1 });
        apply_update(&mut value, "/", json!({ "app": 2 }), false);
        assert_eq!(value, json!({ "app": 2 }));
    }

    #[test]
    fn test_apply_put_at_subpath() {
        let mut value = json!({ "app": 1 });
        apply_update(&mut value, "/api", json!(5), false);
        assert_eq!(value, json!({ "app": 1, "api": 5 }));
    }

    #[test]
    fn test_apply_patch_merges() {
        let mut value = json!({ "app": 1, "api": 2 });
        apply_update(&mut value, "/", json!({ "api": 9 }), true);
        assert_eq!(value, json!({ "app": 1, "api": 9 }));
    }

    #[test]
    fn test_key_url_forms() {
        assert_eq!(
            key_url("acme.example.app", "wake/u1"),
            "https://acme.example.app/wake/u1.json"
        );
        assert_eq!(
            key_url("https://acme.example.app/", "/wake/u1/"),
            "https://acme.example.app/wake/u1.json"
        );
    }

    #[test]
    fn test_event_parser_complete_event() {
        let mut parser = EventParser::new();
        let events = parser.push(b"event: put\ndata: {\"path\":\"/\",\"data\":null}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "put");
        assert_eq!(events[0].data, "{\"path\":\"/\",\"data\":null}");
    }

    #[test]
    fn test_event_parser_split_across_chunks() {
        let mut parser = EventParser::new();
        assert!(parser.push(b"event: pu").is_empty());
        assert!(parser.push(b"t\ndata: {}").is_empty());
        let events = parser.push(b"\n\nevent: keep-alive\ndata: null\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], SseEvent {
            name: "put".into(),
            data: "{}".into()
        });
        assert_eq!(events[1].name, "keep-alive");
    }

    #[test]
    fn test_event_parser_crlf_lines() {
        let mut parser = EventParser::new();
        let events = parser.push(b"event: put\r\ndata: {}\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "put");
    }
}
