use std::time::Duration;

use reqwest::{Client, Method};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{HarnessError, Result};

/// W3C element reference key
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Minimal W3C WebDriver client shared by browser and Appium sessions
pub struct WebDriverClient {
    client: Client,
    server_url: String,
    session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ElementLocator {
    pub strategy: LocatorStrategy,
    pub value: String,
}

#[derive(Debug, Clone, Copy)]
pub enum LocatorStrategy {
    Css,
    AccessibilityId,
}

impl LocatorStrategy {
    fn as_str(&self) -> &'static str {
        match self {
            LocatorStrategy::Css => "css selector",
            LocatorStrategy::AccessibilityId => "accessibility id",
        }
    }
}

impl ElementLocator {
    pub fn css(value: impl Into<String>) -> Self {
        Self {
            strategy: LocatorStrategy::Css,
            value: value.into(),
        }
    }

    pub fn accessibility_id(value: impl Into<String>) -> Self {
        Self {
            strategy: LocatorStrategy::AccessibilityId,
            value: value.into(),
        }
    }
}

impl WebDriverClient {
    pub fn new(server_url: impl Into<String>, command_timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(command_timeout).build()?;
        Ok(Self {
            client,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            session_id: None,
        })
    }

    /// Open a new driver session with the given capabilities
    pub async fn start_session(&mut self, capabilities: &Value) -> Result<String> {
        let payload = json!({
            "capabilities": {
                "alwaysMatch": capabilities,
                "firstMatch": [{}]
            }
        });

        let response = self.send(Method::POST, "/session".to_string(), Some(payload)).await?;
        let session_id = response["sessionId"]
            .as_str()
            .ok_or_else(|| HarnessError::Driver("no session ID in response".to_string()))?
            .to_string();

        info!("Started WebDriver session {} on {}", session_id, self.server_url);
        self.session_id = Some(session_id.clone());
        Ok(session_id)
    }

    /// End the current session
    ///
    /// The session is forgotten even when the delete fails, so a second call
    /// is a no-op.
    pub async fn end_session(&mut self) -> Result<()> {
        let Some(session_id) = self.session_id.take() else {
            return Ok(());
        };
        info!("Ending WebDriver session {}", session_id);
        self.send(Method::DELETE, format!("/session/{}", session_id), None)
            .await
            .map(|_| ())
            .map_err(|e| {
                warn!("Failed to end WebDriver session {}: {}", session_id, e);
                e
            })
    }

    /// Client bound to an existing driver session, for exercising teardown
    #[cfg(test)]
    pub(crate) fn attached(server_url: &str, session_id: &str) -> Result<Self> {
        let mut client = Self::new(server_url, Duration::from_secs(2))?;
        client.session_id = Some(session_id.to_string());
        Ok(client)
    }

    pub async fn navigate(&self, url: &str) -> Result<()> {
        debug!("Navigating to {}", url);
        self.session_command(Method::POST, "url", Some(json!({ "url": url })))
            .await
            .map(|_| ())
    }

    /// Run a synchronous script and return its result
    pub async fn execute_script(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        self.session_command(
            Method::POST,
            "execute/sync",
            Some(json!({ "script": script, "args": args })),
        )
        .await
    }

    /// All elements matching the locator; empty when nothing is rendered
    pub async fn find_elements(&self, locator: &ElementLocator) -> Result<Vec<String>> {
        let payload = json!({
            "using": locator.strategy.as_str(),
            "value": locator.value,
        });
        let value = self.session_command(Method::POST, "elements", Some(payload)).await?;

        let elements = value
            .as_array()
            .map(|items| items.iter().filter_map(element_id).collect())
            .unwrap_or_default();
        Ok(elements)
    }

    pub async fn find_element(&self, locator: &ElementLocator) -> Result<String> {
        self.find_elements(locator)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| HarnessError::Observation(format!("no element matches {:?}", locator)))
    }

    pub async fn element_text(&self, element_id: &str) -> Result<String> {
        let value = self
            .session_command(Method::GET, &format!("element/{}/text", element_id), None)
            .await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| HarnessError::Driver("no text in response".to_string()))
    }

    pub async fn click(&self, element_id: &str) -> Result<()> {
        debug!("Clicking element {}", element_id);
        self.session_command(
            Method::POST,
            &format!("element/{}/click", element_id),
            Some(json!({})),
        )
        .await
        .map(|_| ())
    }

    async fn session_command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let session_id = self
            .session_id
            .as_ref()
            .ok_or_else(|| HarnessError::Driver("no active WebDriver session".to_string()))?;
        self.send(method, format!("/session/{}/{}", session_id, path), body)
            .await
    }

    /// Issue a command and unwrap the `value` member of the reply
    async fn send(&self, method: Method, path: String, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{}", self.server_url, path);
        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        let mut reply: Value = response.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            let message = reply["value"]["message"]
                .as_str()
                .or_else(|| reply["value"]["error"].as_str())
                .unwrap_or("no error message")
                .to_string();
            return Err(HarnessError::Driver(format!("{} {}: {}", status, url, message)));
        }

        Ok(reply.get_mut("value").map(Value::take).unwrap_or(Value::Null))
    }
}

fn element_id(value: &Value) -> Option<String> {
    value[ELEMENT_KEY]
        .as_str()
        .or_else(|| value["ELEMENT"].as_str())
        .map(str::to_string)
}

/// Reads from the automation layer are transient from the verifier's view
pub(crate) fn as_observation(err: HarnessError) -> HarnessError {
    match err {
        HarnessError::Driver(message) => HarnessError::Observation(message),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_id_accepts_both_reference_keys() {
        let w3c = json!({ ELEMENT_KEY: "abc" });
        let legacy = json!({ "ELEMENT": "def" });

        assert_eq!(element_id(&w3c).as_deref(), Some("abc"));
        assert_eq!(element_id(&legacy).as_deref(), Some("def"));
        assert_eq!(element_id(&json!({})), None);
    }

    #[test]
    fn test_driver_errors_become_observations() {
        let err = as_observation(HarnessError::Driver("stale element".into()));
        assert!(err.is_transient());

        let err = as_observation(HarnessError::config("bad"));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_commands_require_a_session() {
        let client = WebDriverClient::new("http://127.0.0.1:4444/", Duration::from_secs(1)).unwrap();
        assert!(client.session_id.is_none());

        let err = client.navigate("https://meet.example.org/room").await.unwrap_err();
        assert!(matches!(err, HarnessError::Driver(_)));
    }

    #[tokio::test]
    async fn test_failed_delete_is_reported_and_forgotten() {
        // Nothing listens on port 1, so the delete cannot succeed
        let mut client = WebDriverClient::attached("http://127.0.0.1:1", "deadbeef").unwrap();

        let err = client.end_session().await.unwrap_err();
        assert!(matches!(err, HarnessError::Driver(_)));
        assert!(client.session_id.is_none());

        client.end_session().await.unwrap();
    }
}
