//! Ordinal-keyed participant pool
//!
//! Slots are sparse and never renumbered: closing the second participant
//! leaves the first and third where they are, and a later `ensure` or
//! `create` fills the gap again.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::error::{HarnessError, Result};
use crate::factory::SessionFactory;
use crate::session::{Ordinal, Session, SessionConfig};

pub struct SessionPool<F: SessionFactory> {
    factory: F,
    /// Configuration every participant starts from
    base_config: SessionConfig,
    sessions: BTreeMap<Ordinal, F::Session>,
}

impl<F: SessionFactory> SessionPool<F> {
    pub fn new(factory: F) -> Self {
        Self::with_base_config(factory, SessionConfig::new())
    }

    pub fn with_base_config(factory: F, base_config: SessionConfig) -> Self {
        Self {
            factory,
            base_config,
            sessions: BTreeMap::new(),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn base_config(&self) -> &SessionConfig {
        &self.base_config
    }

    /// Make sure participants `1..=count` exist, creating only the missing ones
    ///
    /// Returns the ordinals created by this call in ascending order. The first
    /// failure aborts; sessions created before it stay in the pool.
    pub async fn ensure(&mut self, count: u32) -> Result<Vec<Ordinal>> {
        let mut created = Vec::new();
        for ordinal in Ordinal::up_to(count) {
            if self.sessions.contains_key(&ordinal) {
                continue;
            }
            self.create(ordinal, SessionConfig::new()).await?;
            created.push(ordinal);
        }
        Ok(created)
    }

    /// Start a participant at `ordinal` with `config` layered over the base config
    pub async fn create(&mut self, ordinal: Ordinal, config: SessionConfig) -> Result<&F::Session> {
        if self.sessions.contains_key(&ordinal) {
            return Err(HarnessError::lifecycle(ordinal, "slot is already occupied"));
        }

        let config = self.base_config.merged_with(&config);
        if let Some(kind) = config.kind {
            if !self.factory.pool_kind().admits(kind) {
                return Err(HarnessError::config(format!(
                    "a {:?} pool cannot hold a {} participant",
                    self.factory.pool_kind(),
                    kind
                )));
            }
        }

        info!("Creating {} participant", ordinal);
        let session = self.factory.create(ordinal, config).await?;
        info!("{} is ready ({})", session.label(), session.id());
        Ok(&*self.sessions.entry(ordinal).or_insert(session))
    }

    pub fn get(&self, ordinal: Ordinal) -> Option<&F::Session> {
        self.sessions.get(&ordinal)
    }

    /// Like [`SessionPool::get`] but absence is an error
    pub fn require(&self, ordinal: Ordinal) -> Result<&F::Session> {
        self.get(ordinal)
            .ok_or_else(|| HarnessError::lifecycle(ordinal, "no live session in this slot"))
    }

    pub fn first(&self) -> Option<&F::Session> {
        self.get(Ordinal::FIRST)
    }

    pub fn second(&self) -> Option<&F::Session> {
        self.get(Ordinal::SECOND)
    }

    pub fn third(&self) -> Option<&F::Session> {
        self.get(Ordinal::THIRD)
    }

    /// Stop the participant and free its slot; empty slots are a no-op
    ///
    /// The slot is freed even when stopping fails.
    pub async fn close(&mut self, ordinal: Ordinal) -> Result<()> {
        let Some(mut session) = self.sessions.remove(&ordinal) else {
            return Ok(());
        };
        info!("Closing {}", session.label());
        session.stop().await
    }

    /// Close every live participant, returning the first failure
    pub async fn close_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for ordinal in self.ordinals() {
            if let Err(e) = self.close(ordinal).await {
                warn!("Failed to close {} participant: {}", ordinal, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Ask every live participant to leave the conference
    pub async fn hang_up_all(&self) -> Result<()> {
        let mut first_error = None;
        for session in self.sessions.values() {
            if let Err(e) = session.hang_up().await {
                warn!("{} failed to hang up: {}", session.label(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Live ordinals in ascending order
    pub fn ordinals(&self) -> Vec<Ordinal> {
        self.sessions.keys().copied().collect()
    }

    pub fn sessions(&self) -> impl Iterator<Item = (&Ordinal, &F::Session)> {
        self.sessions.iter()
    }
}
