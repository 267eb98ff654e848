//! Per-request context shared by every pipeline stage.
//!
//! A `RequestContext` is built once by a transport adapter when a request
//! arrives and is read-only from then on.  It carries two deliberately
//! separate identities: the *client key* (where the request came from, used
//! by admission control) and the *subject* (who the caller claims to be, used
//! by authorization).

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Metadata key the RPC transport reads the caller identity from.
pub const RPC_IDENTITY_KEY: &str = "user-id";
/// Header the HTTP transport reads the caller identity from.
pub const HTTP_IDENTITY_HEADER: &str = "x-user-id";
/// Client key used when no address can be determined for the peer.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// The transport a request arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    Rpc,
    Http,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Rpc => "rpc",
            Transport::Http => "http",
        }
    }

    /// Resource name checked with the authorization oracle for this transport.
    pub fn resource(&self) -> &'static str {
        match self {
            Transport::Rpc => "grpc",
            Transport::Http => "api",
        }
    }

    /// Action name checked with the authorization oracle for this transport.
    pub fn action(&self) -> &'static str {
        match self {
            Transport::Rpc => "call",
            Transport::Http => "access",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An authenticated-by-assertion caller identity.  Never empty.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subject(String);

impl Subject {
    /// Returns `None` for empty or whitespace-only input.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Subject(trimmed.to_owned()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug)]
pub struct RequestContext {
    transport: Transport,
    method: String,
    subject: Option<Subject>,
    client_key: String,
    received_at: Instant,
    received_wall: DateTime<Utc>,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Start a context for a request that has just arrived.  The subject is
    /// unset until [`with_subject`](Self::with_subject) is called.
    pub fn new(transport: Transport, method: impl Into<String>, client_key: impl Into<String>) -> Self {
        Self {
            transport,
            method: method.into(),
            subject: None,
            client_key: client_key.into(),
            received_at: Instant::now(),
            received_wall: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_subject(mut self, subject: Option<Subject>) -> Self {
        self.subject = subject;
        self
    }

    /// Override the arrival instant.  Admission decisions are made against it.
    pub fn with_received_at(mut self, at: Instant) -> Self {
        self.received_at = at;
        self
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn subject(&self) -> Option<&Subject> {
        self.subject.as_ref()
    }

    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn received_wall(&self) -> DateTime<Utc> {
        self.received_wall
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Resolve the admission client key the way the HTTP framework's `ClientIP`
/// does: forwarded headers first (only when the deployment trusts them), then
/// the socket peer, then [`UNKNOWN_CLIENT`].
pub fn resolve_client_key(
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    peer: Option<SocketAddr>,
    trust_forwarded: bool,
) -> String {
    if trust_forwarded {
        let forwarded = forwarded_for
            .and_then(|raw| raw.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
        if let Some(ip) = real_ip.and_then(|raw| raw.trim().parse::<IpAddr>().ok()) {
            return ip.to_string();
        }
    }
    match peer {
        Some(addr) => addr.ip().to_string(),
        None => UNKNOWN_CLIENT.to_string(),
    }
}
