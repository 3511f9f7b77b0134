//! Session factories
//!
//! A factory turns an ordinal plus a [`SessionConfig`] into a started,
//! joined session. Factories never retry; a session that fails to start is
//! reported as a lifecycle error and left for the caller to handle.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::clock::Clock;
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::session::mobile::MobileSessionSettings;
use crate::session::web::WebSessionSettings;
use crate::session::{
    MobileSession, Ordinal, PoolKind, Session, SessionConfig, SessionKind, WebSession,
};

/// Creates started sessions for a pool
#[async_trait]
pub trait SessionFactory: Send + Sync {
    type Session: Session;

    /// Which session kinds this factory can produce
    fn pool_kind(&self) -> PoolKind;

    /// Create and start the session for `ordinal`
    async fn create(&self, ordinal: Ordinal, config: SessionConfig) -> Result<Self::Session>;
}

pub(crate) fn check_kind(factory: PoolKind, ordinal: Ordinal, config: &SessionConfig) -> Result<()> {
    match config.kind {
        Some(kind) if !factory.admits(kind) => Err(HarnessError::config(format!(
            "{} participant asks for a {} session from a {:?} factory",
            ordinal, kind, factory
        ))),
        _ => Ok(()),
    }
}

// ----------------------------------------------------------------------------
// Web
// ----------------------------------------------------------------------------

pub struct WebSessionFactory {
    settings: WebSessionSettings,
}

impl WebSessionFactory {
    pub fn new(settings: WebSessionSettings) -> Self {
        Self { settings }
    }

    pub fn from_config(config: &HarnessConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self::new(WebSessionSettings {
            driver: config.webdriver.clone(),
            selectors: config.selectors.web.clone(),
            conference_url: config.conference.conference_url()?,
            join_timeout: config.timing.join_timeout(),
            poll_interval: config.timing.poll_interval(),
            command_timeout: config.timing.command_timeout(),
            clock,
        }))
    }
}

#[async_trait]
impl SessionFactory for WebSessionFactory {
    type Session = WebSession;

    fn pool_kind(&self) -> PoolKind {
        PoolKind::Web
    }

    async fn create(&self, ordinal: Ordinal, config: SessionConfig) -> Result<WebSession> {
        check_kind(self.pool_kind(), ordinal, &config)?;
        let mut session = WebSession::new(ordinal, config, self.settings.clone());
        session.start().await?;
        Ok(session)
    }
}

// ----------------------------------------------------------------------------
// Mobile
// ----------------------------------------------------------------------------

pub struct MobileSessionFactory {
    settings: MobileSessionSettings,
}

impl MobileSessionFactory {
    pub fn new(settings: MobileSessionSettings) -> Self {
        Self { settings }
    }

    pub fn from_config(config: &HarnessConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self::new(MobileSessionSettings {
            driver: config.appium.clone(),
            selectors: config.selectors.mobile.clone(),
            conference_url: config.conference.conference_url()?,
            deep_link_scheme: config.conference.deep_link_scheme.clone(),
            join_timeout: config.timing.join_timeout(),
            poll_interval: config.timing.poll_interval(),
            command_timeout: config.timing.command_timeout(),
            clock,
        }))
    }
}

#[async_trait]
impl SessionFactory for MobileSessionFactory {
    type Session = MobileSession;

    fn pool_kind(&self) -> PoolKind {
        PoolKind::Mobile
    }

    async fn create(&self, ordinal: Ordinal, config: SessionConfig) -> Result<MobileSession> {
        check_kind(self.pool_kind(), ordinal, &config)?;
        let mut session = MobileSession::new(ordinal, config, self.settings.clone());
        session.start().await?;
        Ok(session)
    }
}

// ----------------------------------------------------------------------------
// Hybrid
// ----------------------------------------------------------------------------

/// Mixes web and mobile participants in one pool
///
/// The kind comes from the session config, falling back to `default_kind`.
pub struct HybridSessionFactory<W = WebSessionFactory, M = MobileSessionFactory> {
    web: W,
    mobile: M,
    default_kind: SessionKind,
}

impl<W, M> HybridSessionFactory<W, M>
where
    W: SessionFactory,
    M: SessionFactory,
{
    pub fn new(web: W, mobile: M, default_kind: SessionKind) -> Self {
        Self {
            web,
            mobile,
            default_kind,
        }
    }

    pub fn default_kind(&self) -> SessionKind {
        self.default_kind
    }
}

impl HybridSessionFactory {
    pub fn from_config(config: &HarnessConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self::new(
            WebSessionFactory::from_config(config, clock.clone())?,
            MobileSessionFactory::from_config(config, clock)?,
            config.pool.default_kind,
        ))
    }
}

#[async_trait]
impl<W, M> SessionFactory for HybridSessionFactory<W, M>
where
    W: SessionFactory,
    M: SessionFactory,
    W::Session: 'static,
    M::Session: 'static,
{
    type Session = Box<dyn Session>;

    fn pool_kind(&self) -> PoolKind {
        PoolKind::Hybrid
    }

    async fn create(&self, ordinal: Ordinal, mut config: SessionConfig) -> Result<Box<dyn Session>> {
        let kind = *config.kind.get_or_insert(self.default_kind);
        debug!("Creating {} participant as {}", ordinal, kind);

        let session: Box<dyn Session> = match kind {
            SessionKind::Web => Box::new(self.web.create(ordinal, config).await?),
            SessionKind::Mobile => Box::new(self.mobile.create(ordinal, config).await?),
        };
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConference, MockSessionFactory};

    fn hybrid(conference: &MockConference) -> HybridSessionFactory<MockSessionFactory, MockSessionFactory> {
        HybridSessionFactory::new(
            MockSessionFactory::new(conference.clone(), SessionKind::Web),
            MockSessionFactory::new(conference.clone(), SessionKind::Mobile),
            SessionKind::Web,
        )
    }

    #[tokio::test]
    async fn test_hybrid_dispatches_on_requested_kind() {
        let conference = MockConference::new();
        let factory = hybrid(&conference);

        let web = factory.create(Ordinal::FIRST, SessionConfig::new()).await.unwrap();
        let mobile = factory
            .create(Ordinal::SECOND, SessionConfig::new().with_kind(SessionKind::Mobile))
            .await
            .unwrap();

        assert_eq!(web.kind(), SessionKind::Web);
        assert_eq!(web.config().kind, Some(SessionKind::Web));
        assert_eq!(mobile.kind(), SessionKind::Mobile);
        assert!(mobile.is_running());
        assert_eq!(factory.pool_kind(), PoolKind::Hybrid);
    }

    #[tokio::test]
    async fn test_single_kind_factory_rejects_other_kind() {
        let conference = MockConference::new();
        let factory = MockSessionFactory::new(conference, SessionKind::Web);

        let err = factory
            .create(Ordinal::FIRST, SessionConfig::new().with_kind(SessionKind::Mobile))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HarnessError::Configuration(_)));
        assert!(factory.created().is_empty());
    }
}
