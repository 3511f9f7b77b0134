//! Automated conference participants
//!
//! A [`Session`] is one automated client (a browser driven over WebDriver or
//! a mobile app driven over Appium) that has joined the conference under
//! test. The trait is the whole capability set the rest of the harness
//! relies on: lifecycle control plus the handful of reads the verifier needs.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{HarnessError, Result};

pub mod mobile;
pub mod web;
pub mod webdriver;

pub use mobile::MobileSession;
pub use web::WebSession;

// ----------------------------------------------------------------------------
// Identity
// ----------------------------------------------------------------------------

/// Kind of automated client backing a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Browser driven through a W3C WebDriver endpoint
    Web,
    /// Native app driven through Appium
    Mobile,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Web => write!(f, "web"),
            SessionKind::Mobile => write!(f, "mobile"),
        }
    }
}

impl std::str::FromStr for SessionKind {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "web" => Ok(SessionKind::Web),
            "mobile" => Ok(SessionKind::Mobile),
            other => Err(HarnessError::config(format!("unknown session kind '{}'", other))),
        }
    }
}

/// What a pool is allowed to hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    Web,
    Mobile,
    /// Any mix of web and mobile sessions
    Hybrid,
}

impl PoolKind {
    pub fn admits(&self, kind: SessionKind) -> bool {
        matches!(
            (self, kind),
            (PoolKind::Hybrid, _)
                | (PoolKind::Web, SessionKind::Web)
                | (PoolKind::Mobile, SessionKind::Mobile)
        )
    }
}

/// 1-based, stable participant position within a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ordinal(u32);

impl Ordinal {
    pub const FIRST: Ordinal = Ordinal(1);
    pub const SECOND: Ordinal = Ordinal(2);
    pub const THIRD: Ordinal = Ordinal(3);

    pub fn new(position: u32) -> Result<Self> {
        if position == 0 {
            return Err(HarnessError::config("participant ordinals start at 1"));
        }
        Ok(Ordinal(position))
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    /// Ordinals `1..=count` in ascending order
    pub fn up_to(count: u32) -> impl Iterator<Item = Ordinal> {
        (1..=count).map(Ordinal)
    }
}

impl fmt::Display for Ordinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            1 => write!(f, "first"),
            2 => write!(f, "second"),
            3 => write!(f, "third"),
            n => write!(f, "#{}", n),
        }
    }
}

/// Unique handle identity; a restarted ordinal gets a new one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn generate() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Override making the client's ICE negotiation fail on join
pub const FAIL_ICE_OVERRIDE: &str = "config.failICE";

/// Per-session configuration handed to a factory
///
/// Overrides are opaque key/value pairs passed through to the client, e.g.
/// `config.failICE=true` to make connection establishment fail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub kind: Option<SessionKind>,
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kind(mut self, kind: SessionKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    /// Parse a `key=value` override as given on a command line
    pub fn with_override_str(self, pair: &str) -> Result<Self> {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| HarnessError::config(format!("override '{}' is not key=value", pair)))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(HarnessError::config(format!("override '{}' has an empty key", pair)));
        }
        Ok(self.with_override(key, value.trim()))
    }

    /// Layer `other` on top of this configuration
    pub fn merged_with(&self, other: &SessionConfig) -> SessionConfig {
        let mut merged = self.clone();
        if other.kind.is_some() {
            merged.kind = other.kind;
        }
        merged
            .overrides
            .extend(other.overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.overrides.get(key).map(String::as_str)
    }

    /// Overrides rendered as a URL fragment (`a=1&b=2`)
    pub fn fragment(&self) -> Option<String> {
        if self.overrides.is_empty() {
            return None;
        }
        Some(
            self.overrides
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("&"),
        )
    }
}

// ----------------------------------------------------------------------------
// Session Trait
// ----------------------------------------------------------------------------

/// One automated conference participant
///
/// Sessions handed out by a pool are only reachable through `&self`; the
/// lifecycle methods taking `&mut self` are reserved for the factory that
/// starts the session and the pool that stops it.
#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> SessionId;

    fn ordinal(&self) -> Ordinal;

    fn kind(&self) -> SessionKind;

    /// Configuration the session was started with
    fn config(&self) -> &SessionConfig;

    fn is_running(&self) -> bool;

    /// Launch the client and join the conference
    async fn start(&mut self) -> Result<()>;

    /// Tear the client down; safe to call on a stopped session
    async fn stop(&mut self) -> Result<()>;

    /// Leave the conference without stopping the driver
    async fn hang_up(&self) -> Result<()>;

    /// Whether the client reports being inside the conference room
    async fn is_joined(&self) -> Result<bool>;

    /// Identifier other participants use to address this one in their UI
    async fn endpoint_id(&self) -> Result<String>;

    /// Local transport port currently carrying this session's media
    async fn media_port(&self) -> Result<u16>;

    /// This session's rendered indicator for the peer with `peer_endpoint`
    async fn remote_indicator(&self, peer_endpoint: &str) -> Result<bool>;

    /// This session's rendered indicator for its own connection
    async fn local_indicator(&self) -> Result<bool>;

    /// Human readable label for logs
    fn label(&self) -> String {
        format!("{} {} participant", self.ordinal(), self.kind())
    }
}

#[async_trait]
impl Session for Box<dyn Session> {
    fn id(&self) -> SessionId {
        (**self).id()
    }

    fn ordinal(&self) -> Ordinal {
        (**self).ordinal()
    }

    fn kind(&self) -> SessionKind {
        (**self).kind()
    }

    fn config(&self) -> &SessionConfig {
        (**self).config()
    }

    fn is_running(&self) -> bool {
        (**self).is_running()
    }

    async fn start(&mut self) -> Result<()> {
        (**self).start().await
    }

    async fn stop(&mut self) -> Result<()> {
        (**self).stop().await
    }

    async fn hang_up(&self) -> Result<()> {
        (**self).hang_up().await
    }

    async fn is_joined(&self) -> Result<bool> {
        (**self).is_joined().await
    }

    async fn endpoint_id(&self) -> Result<String> {
        (**self).endpoint_id().await
    }

    async fn media_port(&self) -> Result<u16> {
        (**self).media_port().await
    }

    async fn remote_indicator(&self, peer_endpoint: &str) -> Result<bool> {
        (**self).remote_indicator(peer_endpoint).await
    }

    async fn local_indicator(&self) -> Result<bool> {
        (**self).local_indicator().await
    }

    fn label(&self) -> String {
        (**self).label()
    }
}

/// Parse a port number read back from a client
pub(crate) fn parse_port(raw: &str) -> Result<u16> {
    raw.trim()
        .parse::<u16>()
        .map_err(|_| HarnessError::Observation(format!("'{}' is not a port number", raw.trim())))
}

/// Poll `is_joined` until the session is in the room
///
/// Transient read failures count as "not yet". Missing the deadline is a
/// lifecycle error, since a participant that never joins cannot be used.
pub(crate) async fn wait_until_joined<S>(
    session: &S,
    clock: &dyn Clock,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()>
where
    S: Session + ?Sized,
{
    let started = clock.now();
    loop {
        match session.is_joined().await {
            Ok(true) => return Ok(()),
            Ok(false) => debug!("{} not joined yet", session.label()),
            Err(e) if e.is_transient() => debug!("{} not joined yet: {}", session.label(), e),
            Err(e) => return Err(e),
        }
        let elapsed = clock.now().saturating_sub(started);
        if elapsed >= timeout {
            return Err(HarnessError::lifecycle(
                session.ordinal(),
                format!("did not join within {:?}", timeout),
            ));
        }
        clock.sleep(poll_interval.min(timeout - elapsed)).await;
    }
}
