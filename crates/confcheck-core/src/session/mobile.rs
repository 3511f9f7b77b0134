//! Mobile app participant driven through Appium
//!
//! The app joins by deep link and exposes its state through accessibility
//! labels, which is all the harness reads.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use super::webdriver::{as_observation, ElementLocator, WebDriverClient};
use super::{parse_port, wait_until_joined, Ordinal, Session, SessionConfig, SessionId, SessionKind};
use crate::clock::Clock;
use crate::config::{DriverConfig, MobileSelectors};
use crate::error::{HarnessError, Result};

#[derive(Clone)]
pub struct MobileSessionSettings {
    pub driver: DriverConfig,
    pub selectors: MobileSelectors,
    /// Conference page the deep link points at
    pub conference_url: Url,
    pub deep_link_scheme: String,
    pub join_timeout: Duration,
    pub poll_interval: Duration,
    pub command_timeout: Duration,
    /// Paces the join wait
    pub clock: Arc<dyn Clock>,
}

pub struct MobileSession {
    id: SessionId,
    ordinal: Ordinal,
    config: SessionConfig,
    settings: MobileSessionSettings,
    client: Option<WebDriverClient>,
}

impl MobileSession {
    pub fn new(ordinal: Ordinal, config: SessionConfig, settings: MobileSessionSettings) -> Self {
        Self {
            id: SessionId::generate(),
            ordinal,
            config,
            settings,
            client: None,
        }
    }

    /// Deep link opening the conference with this session's overrides
    pub fn deep_link(&self) -> String {
        let conference = &self.settings.conference_url;
        let mut link = format!(
            "{}://{}{}",
            self.settings.deep_link_scheme,
            conference.host_str().unwrap_or_default(),
            conference.path()
        );
        if let Some(fragment) = self.config.fragment() {
            link.push('#');
            link.push_str(&fragment);
        }
        link
    }

    fn client(&self) -> Result<&WebDriverClient> {
        self.client
            .as_ref()
            .ok_or_else(|| HarnessError::lifecycle(self.ordinal, "mobile session is not running"))
    }

    async fn label_text(&self, accessibility_id: &str) -> Result<String> {
        let client = self.client()?;
        let element = client
            .find_element(&ElementLocator::accessibility_id(accessibility_id))
            .await
            .map_err(as_observation)?;
        client
            .element_text(&element)
            .await
            .map(|text| text.trim().to_string())
            .map_err(as_observation)
    }

    async fn status(&self, accessibility_id: &str) -> Result<bool> {
        let text = self.label_text(accessibility_id).await?;
        Ok(text.eq_ignore_ascii_case(&self.settings.selectors.connected_text))
    }

    async fn open_conference(&self, client: &WebDriverClient) -> Result<()> {
        let link = self.deep_link();
        debug!("Opening deep link {}", link);
        let mut args = json!({ "url": link });
        if let Some(package) = self.settings.driver.capabilities["appium:appPackage"].as_str() {
            args["package"] = json!(package);
        }
        if let Some(bundle) = self.settings.driver.capabilities["appium:bundleId"].as_str() {
            args["bundleId"] = json!(bundle);
        }
        client.execute_script("mobile: deepLink", vec![args]).await.map(|_| ())
    }
}

#[async_trait]
impl Session for MobileSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn ordinal(&self) -> Ordinal {
        self.ordinal
    }

    fn kind(&self) -> SessionKind {
        SessionKind::Mobile
    }

    fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn is_running(&self) -> bool {
        self.client.is_some()
    }

    async fn start(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }
        info!("Starting {} via {}", self.label(), self.settings.driver.server_url);

        let ordinal = self.ordinal;
        let lifecycle = move |e: HarnessError| HarnessError::lifecycle(ordinal, e.to_string());
        let mut client = WebDriverClient::new(&self.settings.driver.server_url, self.settings.command_timeout)
            .map_err(lifecycle)?;
        client
            .start_session(&self.settings.driver.capabilities)
            .await
            .map_err(lifecycle)?;

        if let Err(e) = self.open_conference(&client).await {
            client.end_session().await.ok();
            return Err(lifecycle(e));
        }
        self.client = Some(client);

        let settings = &self.settings;
        let joined = wait_until_joined(
            &*self,
            settings.clock.as_ref(),
            settings.join_timeout,
            settings.poll_interval,
        )
        .await;
        if let Err(e) = joined {
            self.stop().await.ok();
            return Err(e);
        }
        info!("{} joined the conference", self.label());
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(mut client) = self.client.take() {
            info!("Stopping {}", self.label());
            client.end_session().await.map_err(|e| {
                HarnessError::lifecycle(self.ordinal, format!("driver session did not end: {}", e))
            })?;
        }
        Ok(())
    }

    async fn hang_up(&self) -> Result<()> {
        info!("{} hanging up", self.label());
        let client = self.client()?;
        let button = client
            .find_element(&ElementLocator::accessibility_id(&self.settings.selectors.hang_up_button))
            .await?;
        client.click(&button).await
    }

    async fn is_joined(&self) -> Result<bool> {
        let marker = ElementLocator::accessibility_id(&self.settings.selectors.joined_marker);
        let found = self
            .client()?
            .find_elements(&marker)
            .await
            .map_err(as_observation)?;
        Ok(!found.is_empty())
    }

    async fn endpoint_id(&self) -> Result<String> {
        let id = self.label_text(&self.settings.selectors.endpoint_id_label).await?;
        if id.is_empty() {
            return Err(HarnessError::Observation("endpoint id label is empty".to_string()));
        }
        Ok(id)
    }

    async fn media_port(&self) -> Result<u16> {
        let text = self.label_text(&self.settings.selectors.media_port_label).await?;
        parse_port(&text)
    }

    async fn remote_indicator(&self, peer_endpoint: &str) -> Result<bool> {
        let label = self
            .settings
            .selectors
            .remote_status_label
            .replace("{endpoint}", peer_endpoint);
        self.status(&label).await
    }

    async fn local_indicator(&self) -> Result<bool> {
        self.status(&self.settings.selectors.local_status_label).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;

    fn settings() -> MobileSessionSettings {
        MobileSessionSettings {
            driver: DriverConfig::appium_default(),
            selectors: MobileSelectors::default(),
            conference_url: Url::parse("https://meet.example.org/confcheck").unwrap(),
            deep_link_scheme: "org.jitsi.meet".to_string(),
            join_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            command_timeout: Duration::from_secs(5),
            clock: Arc::new(VirtualClock::new()),
        }
    }

    #[test]
    fn test_deep_link_includes_room_and_overrides() {
        let config = SessionConfig::new()
            .with_kind(SessionKind::Mobile)
            .with_override("config.failICE", "true");
        let session = MobileSession::new(Ordinal::SECOND, config, settings());

        assert_eq!(
            session.deep_link(),
            "org.jitsi.meet://meet.example.org/confcheck#config.failICE=true"
        );
        assert_eq!(session.kind(), SessionKind::Mobile);
        assert_eq!(session.label(), "second mobile participant");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_before_start() {
        let mut session = MobileSession::new(Ordinal::FIRST, SessionConfig::new(), settings());
        session.stop().await.unwrap();
        session.stop().await.unwrap();
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_failed_teardown_is_a_lifecycle_error() {
        let mut session = MobileSession::new(Ordinal::SECOND, SessionConfig::new(), settings());
        session.client = Some(WebDriverClient::attached("http://127.0.0.1:1", "deadbeef").unwrap());

        let err = session.stop().await.unwrap_err();
        assert!(matches!(err, HarnessError::SessionLifecycle { ordinal, .. } if ordinal == Ordinal::SECOND));
        assert!(!session.is_running());

        session.stop().await.unwrap();
    }
}
