//! In-memory doubles for sessions and the firewall script
//!
//! [`MockConference`] is the shared view of the call: who is in the room,
//! which media ports are blocked and who was told to fail ICE. Sessions
//! created by [`MockSessionFactory`] derive their indicators from it, and
//! [`MockFirewall`] blocks ports in it instead of running a script, so
//! fault-injection scenarios run end to end without browsers or root.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{HarnessError, Result};
use crate::factory::{check_kind, SessionFactory};
use crate::fault::FaultInjector;
use crate::session::{
    Ordinal, PoolKind, Session, SessionConfig, SessionId, SessionKind, FAIL_ICE_OVERRIDE,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------------
// Conference
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct Participant {
    ordinal: Ordinal,
    media_port: u16,
    fail_ice: bool,
    in_room: bool,
}

#[derive(Debug)]
struct ConferenceState {
    port_base: u16,
    next_endpoint: u32,
    participants: BTreeMap<String, Participant>,
    blocked: BTreeSet<u16>,
    failing_stops: BTreeSet<Ordinal>,
    hung_up: Vec<Ordinal>,
}

impl Default for ConferenceState {
    fn default() -> Self {
        Self {
            port_base: 5000,
            next_endpoint: 0,
            participants: BTreeMap::new(),
            blocked: BTreeSet::new(),
            failing_stops: BTreeSet::new(),
            hung_up: Vec::new(),
        }
    }
}

impl ConferenceState {
    fn connected(&self, endpoint: &str) -> Result<bool> {
        let participant = self
            .participants
            .get(endpoint)
            .filter(|p| p.in_room)
            .ok_or_else(|| HarnessError::Observation(format!("participant {} is not rendered", endpoint)))?;
        Ok(!participant.fail_ice && !self.blocked.contains(&participant.media_port))
    }
}

/// Shared in-memory conference; clones observe the same call
#[derive(Debug, Clone, Default)]
pub struct MockConference {
    state: Arc<Mutex<ConferenceState>>,
}

impl MockConference {
    pub fn new() -> Self {
        Self::default()
    }

    /// Media ports are `base + ordinal - 1`; the default base is 5000
    pub fn with_port_base(self, base: u16) -> Self {
        lock(&self.state).port_base = base;
        self
    }

    /// Start a web participant directly, without a factory or pool
    pub async fn join(&self, ordinal: Ordinal) -> Result<MockSession> {
        let mut session = MockSession::new(self.clone(), ordinal, SessionKind::Web, SessionConfig::new());
        session.start().await?;
        Ok(session)
    }

    pub fn port_for(&self, ordinal: Ordinal) -> u16 {
        let offset = u16::try_from(ordinal.get() - 1).unwrap_or(u16::MAX);
        lock(&self.state).port_base.saturating_add(offset)
    }

    pub fn block(&self, port: u16) {
        lock(&self.state).blocked.insert(port);
    }

    pub fn clear(&self) {
        lock(&self.state).blocked.clear();
    }

    pub fn blocked_ports(&self) -> Vec<u16> {
        lock(&self.state).blocked.iter().copied().collect()
    }

    /// Make stopping the participant at `ordinal` fail
    pub fn fail_stop(&self, ordinal: Ordinal) {
        lock(&self.state).failing_stops.insert(ordinal);
    }

    /// Participants currently registered with the call
    pub fn present(&self) -> usize {
        lock(&self.state).participants.len()
    }

    /// Ordinals that hung up, in order
    pub fn hung_up(&self) -> Vec<Ordinal> {
        lock(&self.state).hung_up.clone()
    }

    fn register(&self, ordinal: Ordinal, fail_ice: bool) -> (String, u16) {
        let media_port = self.port_for(ordinal);
        let mut state = lock(&self.state);
        state.next_endpoint += 1;
        let endpoint = format!("{:08x}", state.next_endpoint);
        state.participants.insert(
            endpoint.clone(),
            Participant {
                ordinal,
                media_port,
                fail_ice,
                in_room: true,
            },
        );
        (endpoint, media_port)
    }

    fn unregister(&self, ordinal: Ordinal, endpoint: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if state.failing_stops.contains(&ordinal) {
            return Err(HarnessError::lifecycle(ordinal, "driver refused to quit"));
        }
        state.participants.remove(endpoint);
        Ok(())
    }

    fn leave(&self, endpoint: &str) {
        let mut state = lock(&self.state);
        let ordinal = match state.participants.get_mut(endpoint) {
            Some(participant) => {
                participant.in_room = false;
                participant.ordinal
            }
            None => return,
        };
        state.hung_up.push(ordinal);
    }

    fn in_room(&self, endpoint: &str) -> bool {
        lock(&self.state)
            .participants
            .get(endpoint)
            .map_or(false, |p| p.in_room)
    }

    fn connected(&self, endpoint: &str) -> Result<bool> {
        lock(&self.state).connected(endpoint)
    }
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

/// A scripted indicator sample, consumed before the conference model is consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedRead {
    Connected,
    Disconnected,
    /// Read fails with a transient observation error
    Transient(&'static str),
    /// Read fails with a non-transient error
    Fatal(&'static str),
}

pub struct MockSession {
    id: SessionId,
    ordinal: Ordinal,
    kind: SessionKind,
    config: SessionConfig,
    conference: MockConference,
    joined: Option<(String, u16)>,
    scripted: Mutex<VecDeque<ScriptedRead>>,
    endpoint_failures: Mutex<VecDeque<&'static str>>,
    reads: AtomicUsize,
}

impl MockSession {
    pub fn new(conference: MockConference, ordinal: Ordinal, kind: SessionKind, config: SessionConfig) -> Self {
        Self {
            id: SessionId::generate(),
            ordinal,
            kind,
            config,
            conference,
            joined: None,
            scripted: Mutex::new(VecDeque::new()),
            endpoint_failures: Mutex::new(VecDeque::new()),
            reads: AtomicUsize::new(0),
        }
    }

    /// Queue indicator samples returned ahead of the conference model
    pub fn script_reads(&self, reads: impl IntoIterator<Item = ScriptedRead>) {
        lock(&self.scripted).extend(reads);
    }

    /// Make the next endpoint id reads fail transiently, one per reason
    pub fn fail_endpoint_reads(&self, reasons: impl IntoIterator<Item = &'static str>) {
        lock(&self.endpoint_failures).extend(reasons);
    }

    /// Indicator reads performed so far
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn endpoint(&self) -> Result<&str> {
        self.joined
            .as_ref()
            .map(|(endpoint, _)| endpoint.as_str())
            .ok_or_else(|| HarnessError::lifecycle(self.ordinal, "mock session is not running"))
    }

    fn indicator(&self, endpoint: &str) -> Result<bool> {
        self.endpoint()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        let scripted = lock(&self.scripted).pop_front();
        match scripted {
            Some(ScriptedRead::Connected) => Ok(true),
            Some(ScriptedRead::Disconnected) => Ok(false),
            Some(ScriptedRead::Transient(reason)) => Err(HarnessError::Observation(reason.to_string())),
            Some(ScriptedRead::Fatal(reason)) => Err(HarnessError::lifecycle(self.ordinal, reason)),
            None => self.conference.connected(endpoint),
        }
    }
}

#[async_trait]
impl Session for MockSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn ordinal(&self) -> Ordinal {
        self.ordinal
    }

    fn kind(&self) -> SessionKind {
        self.kind
    }

    fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn is_running(&self) -> bool {
        self.joined.is_some()
    }

    async fn start(&mut self) -> Result<()> {
        if self.joined.is_none() {
            let fail_ice = self.config.get(FAIL_ICE_OVERRIDE) == Some("true");
            self.joined = Some(self.conference.register(self.ordinal, fail_ice));
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some((endpoint, _)) = &self.joined {
            self.conference.unregister(self.ordinal, endpoint)?;
            self.joined = None;
        }
        Ok(())
    }

    async fn hang_up(&self) -> Result<()> {
        self.conference.leave(self.endpoint()?);
        Ok(())
    }

    async fn is_joined(&self) -> Result<bool> {
        Ok(self.conference.in_room(self.endpoint()?))
    }

    async fn endpoint_id(&self) -> Result<String> {
        let endpoint = self.endpoint()?;
        let failure = lock(&self.endpoint_failures).pop_front();
        match failure {
            Some(reason) => Err(HarnessError::Observation(reason.to_string())),
            None => Ok(endpoint.to_string()),
        }
    }

    async fn media_port(&self) -> Result<u16> {
        self.joined
            .as_ref()
            .map(|(_, port)| *port)
            .ok_or_else(|| HarnessError::lifecycle(self.ordinal, "mock session is not running"))
    }

    async fn remote_indicator(&self, peer_endpoint: &str) -> Result<bool> {
        self.indicator(peer_endpoint)
    }

    async fn local_indicator(&self) -> Result<bool> {
        let endpoint = self.endpoint()?.to_string();
        self.indicator(&endpoint)
    }
}

// ----------------------------------------------------------------------------
// Factory
// ----------------------------------------------------------------------------

/// Factory producing [`MockSession`]s of one kind
#[derive(Debug, Clone)]
pub struct MockSessionFactory {
    conference: MockConference,
    kind: SessionKind,
    created: Arc<Mutex<Vec<(Ordinal, SessionConfig)>>>,
    failing: Arc<Mutex<BTreeSet<Ordinal>>>,
}

impl MockSessionFactory {
    pub fn new(conference: MockConference, kind: SessionKind) -> Self {
        Self {
            conference,
            kind,
            created: Arc::default(),
            failing: Arc::default(),
        }
    }

    /// Make every creation at `ordinal` fail to start
    pub fn fail_on(&self, ordinal: Ordinal) {
        lock(&self.failing).insert(ordinal);
    }

    /// Ordinals of successfully started sessions, in creation order
    pub fn created(&self) -> Vec<Ordinal> {
        lock(&self.created).iter().map(|(ordinal, _)| *ordinal).collect()
    }

    /// Configurations handed to successful creations, in creation order
    pub fn configs(&self) -> Vec<SessionConfig> {
        lock(&self.created).iter().map(|(_, config)| config.clone()).collect()
    }
}

#[async_trait]
impl SessionFactory for MockSessionFactory {
    type Session = MockSession;

    fn pool_kind(&self) -> PoolKind {
        match self.kind {
            SessionKind::Web => PoolKind::Web,
            SessionKind::Mobile => PoolKind::Mobile,
        }
    }

    async fn create(&self, ordinal: Ordinal, config: SessionConfig) -> Result<MockSession> {
        check_kind(self.pool_kind(), ordinal, &config)?;
        if lock(&self.failing).contains(&ordinal) {
            return Err(HarnessError::lifecycle(ordinal, "driver could not start a session"));
        }

        let mut session = MockSession::new(self.conference.clone(), ordinal, self.kind, config.clone());
        session.start().await?;
        lock(&self.created).push((ordinal, config));
        Ok(session)
    }
}

// ----------------------------------------------------------------------------
// Firewall
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallCall {
    Block(u16),
    Clear,
}

/// Fault injector that blocks ports in a [`MockConference`]
#[derive(Debug, Clone)]
pub struct MockFirewall {
    conference: MockConference,
    calls: Arc<Mutex<Vec<FirewallCall>>>,
    failing_blocks: Arc<Mutex<bool>>,
}

impl MockFirewall {
    pub fn new(conference: MockConference) -> Self {
        Self {
            conference,
            calls: Arc::default(),
            failing_blocks: Arc::default(),
        }
    }

    /// Make every later `block_port` fail like a script exiting non-zero
    pub fn fail_blocks(&self) {
        *lock(&self.failing_blocks) = true;
    }

    /// Every invocation so far, in order
    pub fn calls(&self) -> Vec<FirewallCall> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl FaultInjector for MockFirewall {
    async fn block_port(&self, port: u16) -> Result<()> {
        lock(&self.calls).push(FirewallCall::Block(port));
        if *lock(&self.failing_blocks) {
            return Err(HarnessError::ExternalProcess {
                command: format!("firewall --block-port {}", port),
                status: "exit status: 1".to_string(),
                stderr: "iptables: Permission denied".to_string(),
            });
        }
        self.conference.block(port);
        Ok(())
    }

    async fn clear_all_rules(&self) -> Result<()> {
        lock(&self.calls).push(FirewallCall::Clear);
        self.conference.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blocked_port_disconnects_only_its_owner() {
        let conference = MockConference::new();
        let first = conference.join(Ordinal::FIRST).await.unwrap();
        let second = conference.join(Ordinal::SECOND).await.unwrap();
        let second_endpoint = second.endpoint_id().await.unwrap();

        conference.block(second.media_port().await.unwrap());

        assert!(!first.remote_indicator(&second_endpoint).await.unwrap());
        assert!(!second.local_indicator().await.unwrap());
        assert!(first.local_indicator().await.unwrap());

        conference.clear();
        assert!(first.remote_indicator(&second_endpoint).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_a_transient_read_failure() {
        let conference = MockConference::new();
        let first = conference.join(Ordinal::FIRST).await.unwrap();

        let err = first.remote_indicator("deadbeef").await.unwrap_err();
        assert!(err.is_transient());
    }
}
