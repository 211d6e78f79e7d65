//! Session configuration: forwarding routes and relay parameters.

use anyhow::{bail, Context, Result};
use base64::Engine;
use rand::RngCore;
use url::Url;

/// Public name of the hosted relay, used when `--host` is not given.
pub const DEFAULT_RELAY_HOST: &str = "portgate.dev";

/// One named forwarding route, immutable for the lifetime of a session.
#[derive(Debug, Clone)]
pub struct TunnelDescriptor {
    /// Short name registered with the relay; prefixed onto the relay's DNS.
    pub remote_name: String,
    /// Display string shown next to the name.
    pub label: String,
    /// Absolute origin + base path of the local destination.
    pub local_target: Url,
    /// Remove any incoming `host` header before forwarding.
    ///
    /// Not exposed on the command line; programmatic callers may clear it.
    pub strip_host_header: bool,
}

impl TunnelDescriptor {
    /// Parse a `--forward` spec: `<name>|<local>` or `<name>|<label>|<local>`.
    ///
    /// A missing label defaults to the name; a local target without an
    /// `http://` or `https://` prefix gets `http://` prepended.
    pub fn parse(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split('|').collect();
        let (name, label, target) = match parts.as_slice() {
            [name, target] => (*name, *name, *target),
            [name, label, target] => (*name, *label, *target),
            _ => bail!("expected <name>|<local-target> or <name>|<label>|<local-target>"),
        };

        if name.is_empty() {
            bail!("tunnel name cannot be empty");
        }
        if target.is_empty() {
            bail!("local target cannot be empty");
        }

        let target = if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else {
            format!("http://{target}")
        };
        let local_target = Url::parse(&target)
            .with_context(|| format!("invalid local target '{target}'"))?;
        if local_target.host_str().is_none() {
            bail!("local target '{target}' has no host");
        }

        Ok(Self {
            remote_name: name.to_string(),
            label: label.to_string(),
            local_target,
            strip_host_header: true,
        })
    }
}

/// Everything a tunnel session needs to establish itself.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Ordered route set; order is significant for registration and for the
    /// idle notifier's snapshot projection.
    pub tunnels: Vec<TunnelDescriptor>,
    pub api_key: String,
    pub hostname: String,
    /// `wss` when set, `ws` otherwise.
    pub secure: bool,
    pub user_agent: String,
    /// Stable per-process client identifier sent on registration.
    pub client_id: String,
}

impl SessionConfig {
    pub fn find_tunnel(&self, remote_name: &str) -> Option<&TunnelDescriptor> {
        self.tunnels.iter().find(|t| t.remote_name == remote_name)
    }

    pub fn remote_names(&self) -> Vec<String> {
        self.tunnels.iter().map(|t| t.remote_name.clone()).collect()
    }
}

/// 16 random bytes, base64url without padding. Generated once per process.
pub fn generate_client_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
