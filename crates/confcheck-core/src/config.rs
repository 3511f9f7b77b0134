//! Harness configuration
//!
//! Configuration is layered with figment, lowest priority first:
//! built-in defaults, `confcheck.toml` in the working directory, an explicit
//! file passed by the caller, then `CONFCHECK_`-prefixed environment
//! variables. Nested keys are separated by a double underscore, so
//! `CONFCHECK_FAULT_INJECTION__SCRIPT_PATH=/opt/fw.sh` sets
//! `fault_injection.script_path`.
//!
//! Leaving `fault_injection.script_path` unset disables every scenario that
//! needs to block ports; those scenarios are skipped rather than failed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use crate::error::{HarnessError, Result};
use crate::fault::ScriptFaultInjector;
use crate::session::{PoolKind, SessionConfig, SessionKind};

/// Complete configuration consumed by the harness
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub fault_injection: FaultInjectionConfig,
    pub conference: ConferenceConfig,
    /// Browser automation endpoint (chromedriver, geckodriver, Selenium grid)
    pub webdriver: DriverConfig,
    /// Mobile automation endpoint
    pub appium: DriverConfig,
    pub pool: PoolConfig,
    pub selectors: SelectorConfig,
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultInjectionConfig {
    /// Script accepting `--block-port <port>` and `--clear-rules`
    pub script_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConferenceConfig {
    /// Base URL of the conferencing web application
    pub base_url: String,
    /// Room every participant joins
    pub room: String,
    /// URL scheme the mobile app registers for deep links
    pub deep_link_scheme: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub server_url: String,
    /// W3C capabilities sent when opening a session
    pub capabilities: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Which session kinds the scenario pool may hold
    pub kind: PoolKind,
    /// Kind a hybrid pool creates when a session config names none
    pub default_kind: SessionKind,
    /// Overrides applied to every participant
    pub overrides: BTreeMap<String, String>,
}

/// How sessions read state back from the application under test
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub web: WebSelectors,
    pub mobile: MobileSelectors,
}

/// JavaScript snippets and CSS selectors used by web sessions
///
/// `{endpoint}` in a selector is replaced with the observed peer's endpoint id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSelectors {
    pub joined_script: String,
    pub endpoint_id_script: String,
    pub media_port_script: String,
    pub hang_up_script: String,
    pub remote_thumbnail: String,
    pub remote_disconnected: String,
    pub local_thumbnail: String,
    pub local_disconnected: String,
}

/// Accessibility ids used by mobile sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MobileSelectors {
    pub joined_marker: String,
    pub endpoint_id_label: String,
    pub media_port_label: String,
    pub hang_up_button: String,
    /// Label whose text is the rendered status of `{endpoint}`
    pub remote_status_label: String,
    pub local_status_label: String,
    /// Status text meaning "connected"; anything else counts as disconnected
    pub connected_text: String,
}

/// Waits and poll budgets
///
/// The expiry and grace durations mirror server-side thresholds of the
/// deployment under test and usually need tuning per environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval_ms: u64,
    /// Deadline for ordinary connectivity indications
    pub indication_timeout_ms: u64,
    /// Deadline for a freshly joined participant's first indication
    pub fresh_join_timeout_ms: u64,
    /// How long a participant may take to enter the room
    pub join_timeout_ms: u64,
    /// How long the server keeps channels of an unreachable peer
    pub channel_expiry_ms: u64,
    /// How long before a never-connected peer is reported disconnected
    pub failed_connection_grace_ms: u64,
    /// How long the performance scenario keeps everyone in the call
    pub performance_hold_ms: u64,
    /// Consecutive transient read failures tolerated per assertion
    pub max_transient_failures: u32,
    /// Per-request timeout for WebDriver/Appium calls
    pub command_timeout_ms: u64,
}

// ----------------------------------------------------------------------------
// Default Implementations
// ----------------------------------------------------------------------------

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            fault_injection: FaultInjectionConfig::default(),
            conference: ConferenceConfig::default(),
            webdriver: DriverConfig::webdriver_default(),
            appium: DriverConfig::appium_default(),
            pool: PoolConfig::default(),
            selectors: SelectorConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl Default for ConferenceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://meet.example.org".to_string(),
            room: "confcheck".to_string(),
            deep_link_scheme: "org.jitsi.meet".to_string(),
        }
    }
}

impl DriverConfig {
    pub fn webdriver_default() -> Self {
        Self {
            server_url: "http://127.0.0.1:4444".to_string(),
            capabilities: json!({
                "browserName": "chrome",
                "goog:chromeOptions": {
                    "args": [
                        "--use-fake-ui-for-media-stream",
                        "--use-fake-device-for-media-stream",
                        "--autoplay-policy=no-user-gesture-required"
                    ]
                }
            }),
        }
    }

    pub fn appium_default() -> Self {
        Self {
            server_url: "http://127.0.0.1:4723".to_string(),
            capabilities: json!({
                "platformName": "Android",
                "appium:automationName": "UiAutomator2",
                "appium:appPackage": "org.jitsi.meet",
                "appium:appActivity": ".MainActivity",
                "appium:noReset": true
            }),
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::webdriver_default()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            kind: PoolKind::Web,
            default_kind: SessionKind::Web,
            overrides: BTreeMap::new(),
        }
    }
}

impl Default for WebSelectors {
    fn default() -> Self {
        Self {
            joined_script: "return APP.conference.isJoined();".to_string(),
            endpoint_id_script: "return APP.conference.getMyUserId();".to_string(),
            media_port_script: concat!(
                "var pc = APP.conference._room.jvbJingleSession.peerconnection.peerconnection;",
                "var m = pc.localDescription.sdp.match(/a=candidate:\\S+ \\d+ udp \\d+ \\S+ (\\d+) typ host/);",
                "return m ? m[1] : null;"
            )
            .to_string(),
            hang_up_script: "APP.conference.hangup(); return true;".to_string(),
            remote_thumbnail: "#participant_{endpoint}".to_string(),
            remote_disconnected: "#participant_{endpoint} .connection-lost".to_string(),
            local_thumbnail: "#localVideoContainer".to_string(),
            local_disconnected: "#localVideoContainer .connection-lost".to_string(),
        }
    }
}

impl Default for MobileSelectors {
    fn default() -> Self {
        Self {
            joined_marker: "conference-joined".to_string(),
            endpoint_id_label: "local-endpoint-id".to_string(),
            media_port_label: "local-media-port".to_string(),
            hang_up_button: "hangup-button".to_string(),
            remote_status_label: "connection-status-{endpoint}".to_string(),
            local_status_label: "connection-status-local".to_string(),
            connected_text: "connected".to_string(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            indication_timeout_ms: 15_000,
            fresh_join_timeout_ms: 5_000,
            join_timeout_ms: 10_000,
            channel_expiry_ms: 65_000,
            failed_connection_grace_ms: 17_000,
            performance_hold_ms: 60_000,
            max_transient_failures: 10,
            command_timeout_ms: 30_000,
        }
    }
}

// ----------------------------------------------------------------------------
// Loading
// ----------------------------------------------------------------------------

impl HarnessConfig {
    /// Load defaults, `confcheck.toml`, then `CONFCHECK_*` variables
    pub fn load() -> Result<Self> {
        Self::load_layers(None)
    }

    /// Same as [`HarnessConfig::load`] with an explicit file layered above `confcheck.toml`
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(HarnessError::config(format!(
                "configuration file {} does not exist",
                path.display()
            )));
        }
        Self::load_layers(Some(path))
    }

    fn load_layers(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file("confcheck.toml"));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("CONFCHECK_").split("__"));

        let config: HarnessConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults (no file or env lookup)
    pub fn from_toml_str(document: &str) -> Result<Self> {
        let config: HarnessConfig = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::string(document))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let timing = &self.timing;
        if timing.poll_interval_ms == 0 {
            return Err(HarnessError::config("timing.poll_interval_ms must be positive"));
        }
        if timing.poll_interval_ms > timing.indication_timeout_ms {
            return Err(HarnessError::config(
                "timing.poll_interval_ms must not exceed timing.indication_timeout_ms",
            ));
        }
        if timing.max_transient_failures == 0 {
            return Err(HarnessError::config("timing.max_transient_failures must be positive"));
        }
        if !self.pool.kind.admits(self.pool.default_kind) {
            return Err(HarnessError::config(format!(
                "pool.default_kind {} is not allowed in a {:?} pool",
                self.pool.default_kind, self.pool.kind
            )));
        }
        Ok(())
    }

    /// Configuration every pool participant starts from
    pub fn base_session_config(&self) -> SessionConfig {
        SessionConfig {
            kind: None,
            overrides: self.pool.overrides.clone(),
        }
    }

    /// Effective configuration as TOML, in the same shape `confcheck.toml` takes
    pub fn to_toml_pretty(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| HarnessError::config(format!("failed to serialize configuration: {}", e)))
    }

    /// Effective configuration as JSON, for diagnostics
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| HarnessError::config(format!("failed to serialize configuration: {}", e)))
    }
}

impl ConferenceConfig {
    /// Page every participant opens: `base_url/room`
    pub fn conference_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            HarnessError::config(format!("invalid conference.base_url '{}': {}", self.base_url, e))
        })?;
        if self.room.trim().is_empty() {
            return Err(HarnessError::config("conference.room is empty"));
        }
        url.path_segments_mut()
            .map_err(|_| HarnessError::config(format!("{} cannot hold a room path", self.base_url)))?
            .pop_if_empty()
            .push(self.room.trim());
        Ok(url)
    }
}

impl FaultInjectionConfig {
    /// The configured injector, or `None` when fault injection is disabled
    pub fn injector(&self) -> Result<Option<ScriptFaultInjector>> {
        match &self.script_path {
            Some(path) => ScriptFaultInjector::new(path).map(Some),
            None => Ok(None),
        }
    }
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn indication_timeout(&self) -> Duration {
        Duration::from_millis(self.indication_timeout_ms)
    }

    pub fn fresh_join_timeout(&self) -> Duration {
        Duration::from_millis(self.fresh_join_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn channel_expiry(&self) -> Duration {
        Duration::from_millis(self.channel_expiry_ms)
    }

    pub fn failed_connection_grace(&self) -> Duration {
        Duration::from_millis(self.failed_connection_grace_ms)
    }

    pub fn performance_hold(&self) -> Duration {
        Duration::from_millis(self.performance_hold_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid_and_disable_fault_injection() {
        let config = HarnessConfig::default();
        config.validate().unwrap();

        assert!(config.fault_injection.script_path.is_none());
        assert!(config.fault_injection.injector().unwrap().is_none());
        assert_eq!(config.timing.channel_expiry(), Duration::from_secs(65));
        assert_eq!(config.timing.failed_connection_grace(), Duration::from_secs(17));
        assert_eq!(config.appium.server_url, "http://127.0.0.1:4723");
        assert_eq!(config.webdriver.capabilities["browserName"], "chrome");
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = HarnessConfig::from_toml_str(
            r#"
            [conference]
            room = "nightly"

            [pool]
            kind = "hybrid"
            default_kind = "mobile"
            overrides = { "config.p2p.enabled" = "false" }

            [timing]
            channel_expiry_ms = 70000
            "#,
        )
        .unwrap();

        assert_eq!(config.conference.room, "nightly");
        assert_eq!(config.conference.base_url, "https://meet.example.org");
        assert_eq!(config.pool.kind, PoolKind::Hybrid);
        assert_eq!(config.pool.default_kind, SessionKind::Mobile);
        assert_eq!(config.timing.channel_expiry_ms, 70_000);
        assert_eq!(config.timing.poll_interval_ms, 500);
        assert_eq!(
            config.base_session_config().get("config.p2p.enabled"),
            Some("false")
        );
    }

    #[test]
    fn test_validation_rejects_bad_timing() {
        let err = HarnessConfig::from_toml_str("[timing]\npoll_interval_ms = 0\n").unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));

        let err = HarnessConfig::from_toml_str(
            "[timing]\npoll_interval_ms = 20000\nindication_timeout_ms = 15000\n",
        )
        .unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));
    }

    #[test]
    fn test_validation_rejects_inadmissible_default_kind() {
        let err = HarnessConfig::from_toml_str("[pool]\nkind = \"web\"\ndefault_kind = \"mobile\"\n")
            .unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));
    }

    #[test]
    fn test_missing_script_is_a_configuration_error() {
        let config = FaultInjectionConfig {
            script_path: Some(PathBuf::from("/nonexistent/confcheck-firewall.sh")),
        };
        assert!(matches!(
            config.injector(),
            Err(HarnessError::Configuration(_))
        ));
    }

    #[test]
    fn test_conference_url_appends_room() {
        let mut conference = ConferenceConfig::default();
        assert_eq!(
            conference.conference_url().unwrap().as_str(),
            "https://meet.example.org/confcheck"
        );

        conference.base_url = "https://example.org/meet/".to_string();
        conference.room = "nightly".to_string();
        assert_eq!(
            conference.conference_url().unwrap().as_str(),
            "https://example.org/meet/nightly"
        );

        conference.base_url = "not a url".to_string();
        assert!(matches!(
            conference.conference_url(),
            Err(HarnessError::Configuration(_))
        ));
    }

    #[test]
    fn test_printed_toml_loads_back() {
        let mut config = HarnessConfig::default();
        config.conference.room = "nightly".to_string();
        config.timing.channel_expiry_ms = 70_000;

        let printed = config.to_toml_pretty().unwrap();
        let reloaded = HarnessConfig::from_toml_str(&printed).unwrap();

        assert_eq!(reloaded.conference.room, "nightly");
        assert_eq!(reloaded.timing.channel_expiry(), Duration::from_secs(70));
        assert_eq!(reloaded.appium.capabilities, config.appium.capabilities);
    }

    #[test]
    fn test_missing_explicit_file_is_rejected() {
        let err = HarnessConfig::load_from_file("/nonexistent/confcheck.toml").unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));
    }
}
