//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Default port of the remote game server.
pub const DEFAULT_PORT: u16 = 25565;

/// Protocol number spoken by default (1.18.x).
pub const DEFAULT_PROTOCOL_VERSION: i32 = 757;

/// Default path of the operator control socket.
pub const DEFAULT_CONTROL_SOCKET: &str = "/tmp/hidden-player.sock";

/// Account provider for credentialed logins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountProvider {
    Mojang,
    Microsoft,
}

/// How the presence client identifies itself to the remote server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Authentication {
    /// Account login with email and password.
    Credentialed {
        provider: AccountProvider,
        email: String,
        password: String,
    },
    /// Anonymous login with a bare username.
    Offline { username: String },
}

impl Authentication {
    /// Name sent in the login handshake.
    #[must_use]
    pub fn login_name(&self) -> &str {
        match self {
            Self::Credentialed { email, .. } => email,
            Self::Offline { username } => username,
        }
    }
}

impl Default for Authentication {
    fn default() -> Self {
        Self::Offline {
            username: "HiddenPlayer".to_string(),
        }
    }
}

/// Messages sent once the client becomes active.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirstMessages {
    /// Messages, sent in order.
    pub messages: Vec<String>,
    /// Delay after each message, in milliseconds.
    pub delay_ms: u64,
}

impl FirstMessages {
    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Automatic reconnect after an unplanned disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Wait before reconnecting, in milliseconds.
    pub delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: 5000,
        }
    }
}

/// Leave the server while other participants are present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OccupancyPolicy {
    pub enabled: bool,
    /// Interval between occupancy probes, in milliseconds.
    pub poll_interval_ms: u64,
    /// Upper bound for a single probe, in milliseconds.
    pub probe_timeout_ms: u64,
}

impl OccupancyPolicy {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for OccupancyPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 5000,
            probe_timeout_ms: 5000,
        }
    }
}

/// Play-state packet ids; these move between protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayPackets {
    pub keep_alive_clientbound: i32,
    pub keep_alive_serverbound: i32,
    pub chat_clientbound: i32,
    pub chat_serverbound: i32,
    pub disconnect_clientbound: i32,
}

impl Default for PlayPackets {
    fn default() -> Self {
        Self {
            keep_alive_clientbound: 0x21,
            keep_alive_serverbound: 0x0F,
            chat_clientbound: 0x0F,
            chat_serverbound: 0x03,
            disconnect_clientbound: 0x1A,
        }
    }
}

/// Immutable options of a presence client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceClientOptions {
    pub host: String,
    pub port: u16,
    pub protocol_version: i32,
    pub authentication: Authentication,
    pub first_messages: Option<FirstMessages>,
    pub reconnect: Option<ReconnectPolicy>,
    pub occupancy: Option<OccupancyPolicy>,
    pub packets: PlayPackets,
}

impl Default for PresenceClientOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            authentication: Authentication::default(),
            first_messages: None,
            reconnect: None,
            occupancy: None,
            packets: PlayPackets::default(),
        }
    }
}

impl PresenceClientOptions {
    /// Options for `host:port` with every optional policy disabled.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// `host:port` string for logging and socket addresses.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reconnect delay if automatic reconnect is enabled.
    #[must_use]
    pub fn reconnect_delay(&self) -> Option<Duration> {
        self.reconnect
            .as_ref()
            .filter(|r| r.enabled)
            .map(|r| Duration::from_millis(r.delay_ms))
    }

    /// Delay used by an explicit reconnect request.
    #[must_use]
    pub fn reconnect_request_delay(&self) -> Duration {
        self.reconnect
            .as_ref()
            .map_or(Duration::ZERO, |r| Duration::from_millis(r.delay_ms))
    }

    /// Occupancy policy if enabled.
    #[must_use]
    pub fn occupancy_policy(&self) -> Option<&OccupancyPolicy> {
        self.occupancy.as_ref().filter(|o| o.enabled)
    }

    /// First messages to send, empty if none are configured.
    #[must_use]
    pub fn first_message_script(&self) -> (&[String], Duration) {
        self.first_messages
            .as_ref()
            .map_or((&[][..], Duration::ZERO), |f| (&f.messages[..], f.delay()))
    }

    /// Check the options before a connection is attempted.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first malformed field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must not be 0".to_string()));
        }
        match &self.authentication {
            Authentication::Offline { username } if username.trim().is_empty() => {
                return Err(ConfigError::Invalid(
                    "offline username must not be empty".to_string(),
                ));
            }
            Authentication::Credentialed { email, .. } if email.trim().is_empty() => {
                return Err(ConfigError::Invalid(
                    "account email must not be empty".to_string(),
                ));
            }
            _ => {}
        }
        if let Some(occupancy) = self.occupancy_policy() {
            if occupancy.poll_interval_ms == 0 {
                return Err(ConfigError::Invalid(
                    "occupancy poll interval must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Configuration for the process supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Child binary; defaults to the running executable.
    pub program: Option<PathBuf>,
    /// Child arguments.
    pub args: Vec<String>,
    /// Grace period before a forced kill, in milliseconds.
    pub terminate_timeout_ms: u64,
    /// Wait before retrying a failed respawn, in milliseconds.
    pub respawn_delay_ms: u64,
    /// Number of output lines retained for diagnostics.
    pub log_capacity: usize,
}

impl SupervisorConfig {
    #[must_use]
    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }

    #[must_use]
    pub fn respawn_delay(&self) -> Duration {
        Duration::from_millis(self.respawn_delay_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: vec!["presence".to_string()],
            terminate_timeout_ms: 5000,
            respawn_delay_ms: 1000,
            log_capacity: 20,
        }
    }
}

/// Configuration for the liveness watchdog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    /// Endpoint whose round trip is sampled.
    pub target: String,
    /// Tick interval, in milliseconds.
    pub interval_ms: u64,
    /// Consecutive identical samples that trigger termination.
    pub threshold: u32,
    /// Upper bound for one sample, in milliseconds.
    pub sample_timeout_ms: u64,
}

impl WatchdogConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target: "gateway.discord.gg:443".to_string(),
            interval_ms: 10_000,
            threshold: 8,
            sample_timeout_ms: 5000,
        }
    }
}

/// Configuration for the operator control socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub socket_path: PathBuf,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_CONTROL_SOCKET),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub presence: PresenceClientOptions,
    pub supervisor: SupervisorConfig,
    pub watchdog: WatchdogConfig,
    pub control: ControlConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_defaults() {
        let options = PresenceClientOptions::default();
        assert_eq!(options.port, DEFAULT_PORT);
        assert_eq!(options.protocol_version, DEFAULT_PROTOCOL_VERSION);
        assert_eq!(options.authentication.login_name(), "HiddenPlayer");
        assert!(options.reconnect_delay().is_none());
        assert!(options.occupancy_policy().is_none());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_disabled_policies_are_hidden() {
        let mut options = PresenceClientOptions::new("h", 1);
        options.reconnect = Some(ReconnectPolicy {
            enabled: false,
            delay_ms: 100,
        });
        options.occupancy = Some(OccupancyPolicy {
            enabled: false,
            ..Default::default()
        });
        assert!(options.reconnect_delay().is_none());
        assert_eq!(options.reconnect_request_delay(), Duration::from_millis(100));
        assert!(options.occupancy_policy().is_none());
    }

    #[test]
    fn test_validate_rejects_malformed_options() {
        let mut options = PresenceClientOptions::new("", 25565);
        assert!(matches!(options.validate(), Err(ConfigError::Invalid(_))));

        options.host = "example.org".to_string();
        options.port = 0;
        assert!(options.validate().is_err());

        options.port = 25565;
        options.authentication = Authentication::Offline {
            username: "  ".to_string(),
        };
        assert!(options.validate().is_err());

        options.authentication = Authentication::default();
        options.occupancy = Some(OccupancyPolicy {
            enabled: true,
            poll_interval_ms: 0,
            probe_timeout_ms: 100,
        });
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_deserialize_presence_section() {
        let toml = r#"
            host = "ourworld.example"
            port = 40655

            [authentication]
            type = "offline"
            username = "Lurker"

            [first_messages]
            messages = ["/register a a", "/login a"]
            delay_ms = 5000

            [reconnect]
            enabled = true
            delay_ms = 250

            [occupancy]
            poll_interval_ms = 1000
        "#;
        let options: PresenceClientOptions = toml::from_str(toml).unwrap();
        assert_eq!(options.address(), "ourworld.example:40655");
        assert_eq!(options.authentication.login_name(), "Lurker");
        assert_eq!(options.first_message_script().0.len(), 2);
        assert_eq!(options.reconnect_delay(), Some(Duration::from_millis(250)));
        let occupancy = options.occupancy_policy().unwrap();
        assert_eq!(occupancy.poll_interval(), Duration::from_secs(1));
        assert_eq!(occupancy.probe_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_deserialize_credentialed_auth() {
        let toml = r#"
            type = "credentialed"
            provider = "microsoft"
            email = "someone@example.org"
            password = "hunter2"
        "#;
        let auth: Authentication = toml::from_str(toml).unwrap();
        assert_eq!(auth.login_name(), "someone@example.org");
        assert!(matches!(
            auth,
            Authentication::Credentialed {
                provider: AccountProvider::Microsoft,
                ..
            }
        ));
    }

    #[test]
    fn test_watchdog_defaults() {
        let config = WatchdogConfig::default();
        assert_eq!(config.interval(), Duration::from_secs(10));
        assert_eq!(config.threshold, 8);
    }
}
