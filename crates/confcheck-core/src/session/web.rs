//! Browser participant driven over W3C WebDriver

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;
use url::Url;

use super::webdriver::{as_observation, ElementLocator, WebDriverClient};
use super::{parse_port, wait_until_joined, Ordinal, Session, SessionConfig, SessionId, SessionKind};
use crate::clock::Clock;
use crate::config::{DriverConfig, WebSelectors};
use crate::error::{HarnessError, Result};

/// Everything a web session needs besides its own configuration
#[derive(Clone)]
pub struct WebSessionSettings {
    pub driver: DriverConfig,
    pub selectors: WebSelectors,
    /// Conference page, without the override fragment
    pub conference_url: Url,
    pub join_timeout: Duration,
    pub poll_interval: Duration,
    pub command_timeout: Duration,
    /// Paces the join wait
    pub clock: Arc<dyn Clock>,
}

pub struct WebSession {
    id: SessionId,
    ordinal: Ordinal,
    config: SessionConfig,
    settings: WebSessionSettings,
    client: Option<WebDriverClient>,
}

impl WebSession {
    pub fn new(ordinal: Ordinal, config: SessionConfig, settings: WebSessionSettings) -> Self {
        Self {
            id: SessionId::generate(),
            ordinal,
            config,
            settings,
            client: None,
        }
    }

    /// Conference URL with this session's overrides in the fragment
    pub fn join_url(&self) -> Url {
        let mut url = self.settings.conference_url.clone();
        url.set_fragment(self.config.fragment().as_deref());
        url
    }

    fn client(&self) -> Result<&WebDriverClient> {
        self.client
            .as_ref()
            .ok_or_else(|| HarnessError::lifecycle(self.ordinal, "web session is not running"))
    }

    async fn script(&self, script: &str) -> Result<Value> {
        self.client()?
            .execute_script(script, Vec::new())
            .await
            .map_err(as_observation)
    }

    /// `true` when the container is rendered and carries no disconnected marker
    async fn indicator(&self, container: &str, disconnected: &str) -> Result<bool> {
        let client = self.client()?;
        let rendered = client
            .find_elements(&ElementLocator::css(container))
            .await
            .map_err(as_observation)?;
        if rendered.is_empty() {
            return Err(HarnessError::Observation(format!("{} is not rendered", container)));
        }

        let markers = client
            .find_elements(&ElementLocator::css(disconnected))
            .await
            .map_err(as_observation)?;
        Ok(markers.is_empty())
    }
}

fn fill_endpoint(template: &str, endpoint: &str) -> String {
    template.replace("{endpoint}", endpoint)
}

#[async_trait]
impl Session for WebSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn ordinal(&self) -> Ordinal {
        self.ordinal
    }

    fn kind(&self) -> SessionKind {
        SessionKind::Web
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
        info!("Starting {} at {}", self.label(), self.join_url());

        let ordinal = self.ordinal;
        let lifecycle = move |e: HarnessError| HarnessError::lifecycle(ordinal, e.to_string());
        let mut client = WebDriverClient::new(&self.settings.driver.server_url, self.settings.command_timeout)
            .map_err(lifecycle)?;
        client
            .start_session(&self.settings.driver.capabilities)
            .await
            .map_err(lifecycle)?;

        let url = self.join_url();
        if let Err(e) = client.navigate(url.as_str()).await {
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
        self.client()?
            .execute_script(&self.settings.selectors.hang_up_script, Vec::new())
            .await
            .map(|_| ())
    }

    async fn is_joined(&self) -> Result<bool> {
        Ok(self.script(&self.settings.selectors.joined_script).await?.as_bool().unwrap_or(false))
    }

    async fn endpoint_id(&self) -> Result<String> {
        match self.script(&self.settings.selectors.endpoint_id_script).await? {
            Value::String(id) if !id.is_empty() => Ok(id),
            other => Err(HarnessError::Observation(format!("no endpoint id yet (got {})", other))),
        }
    }

    async fn media_port(&self) -> Result<u16> {
        match self.script(&self.settings.selectors.media_port_script).await? {
            Value::String(port) => parse_port(&port),
            Value::Number(port) => parse_port(&port.to_string()),
            other => Err(HarnessError::Observation(format!("no media port yet (got {})", other))),
        }
    }

    async fn remote_indicator(&self, peer_endpoint: &str) -> Result<bool> {
        let selectors = &self.settings.selectors;
        self.indicator(
            &fill_endpoint(&selectors.remote_thumbnail, peer_endpoint),
            &fill_endpoint(&selectors.remote_disconnected, peer_endpoint),
        )
        .await
    }

    async fn local_indicator(&self) -> Result<bool> {
        let selectors = &self.settings.selectors;
        self.indicator(&selectors.local_thumbnail, &selectors.local_disconnected)
            .await
    }
}
