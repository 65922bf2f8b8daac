//! Configuration management for CamLink
//!
//! Provides configuration loading, saving, and management for session retry
//! behavior, control-channel reconnection, and ICE server resolution.

use crate::errors::CamLinkError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CamLinkConfig {
    pub session: SessionConfig,
    pub control: ControlConfig,
    pub ice: IceConfig,
}

/// Peer-session lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Connection attempts per connect cycle before a session fails
    pub max_connect_attempts: u32,
    /// Backoff delay for the first retry, in milliseconds
    pub base_backoff_ms: u64,
    /// Upper bound on any backoff delay, in milliseconds
    pub cap_backoff_ms: u64,
    /// Candidate-gathering wait on desktop clients, in milliseconds
    pub gathering_timeout_desktop_ms: u64,
    /// Candidate-gathering wait on mobile clients, in milliseconds
    pub gathering_timeout_mobile_ms: u64,
    /// Offer/answer exchange bound, in milliseconds
    pub exchange_timeout_ms: u64,
    /// Inter-start delay when loading several streams on desktop
    pub stagger_delay_desktop_ms: u64,
    /// Inter-start delay when loading several streams on mobile
    pub stagger_delay_mobile_ms: u64,
}

/// Control-channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// WebSocket endpoint of the mount controller
    pub endpoint: String,
    /// Automatic reconnect attempts before waiting for a manual retry
    pub max_reconnect_attempts: u32,
    /// Backoff delay for the first reconnect, in milliseconds
    pub base_backoff_ms: u64,
    /// Upper bound on any reconnect delay, in milliseconds
    pub cap_backoff_ms: u64,
    /// Outbound queue bound while disconnected (oldest frames drop first)
    pub max_queue_depth: usize,
}

/// ICE server resolution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// Endpoint serving operator TURN configuration (`{ "iceServers": [...] }`);
    /// unset skips the fetch and uses the fallback list alone
    pub config_url: Option<String>,
    /// Static reflexive-only fallback servers
    pub fallback_stun: Vec<String>,
}

impl Default for CamLinkConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            control: ControlConfig::default(),
            ice: IceConfig::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_connect_attempts: 3,
            base_backoff_ms: 1_000,
            cap_backoff_ms: 10_000,
            gathering_timeout_desktop_ms: 5_000,
            gathering_timeout_mobile_ms: 10_000,
            exchange_timeout_ms: 15_000,
            stagger_delay_desktop_ms: 500,
            stagger_delay_mobile_ms: 2_000,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:8765".to_string(),
            max_reconnect_attempts: 5,
            base_backoff_ms: 1_000,
            cap_backoff_ms: 10_000,
            max_queue_depth: 64,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            config_url: None,
            fallback_stun: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
        }
    }
}

impl IceConfig {
    /// The fallback list as server descriptors.
    pub fn fallback_servers(&self) -> Vec<crate::ice::IceServer> {
        self.fallback_stun
            .iter()
            .map(|url| crate::ice::IceServer::stun(url.as_str()))
            .collect()
    }
}

impl CamLinkConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, CamLinkError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).map_err(|e| {
            CamLinkError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        let config: CamLinkConfig = toml::from_str(&contents).map_err(|e| {
            CamLinkError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), CamLinkError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                CamLinkError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml_string = toml::to_string_pretty(self).map_err(|e| {
            CamLinkError::ConfigError(format!("Failed to serialize config: {}", e))
        })?;

        fs::write(path, toml_string).map_err(|e| {
            CamLinkError::ConfigError(format!("Failed to write config file: {}", e))
        })?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("camlink.toml")
    }

    /// Load from default location or create with defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.session.max_connect_attempts == 0 || self.session.max_connect_attempts > 10 {
            return Err("Session connect attempts must be between 1 and 10".to_string());
        }
        if self.session.base_backoff_ms == 0 {
            return Err("Session base backoff must be nonzero".to_string());
        }
        if self.session.cap_backoff_ms < self.session.base_backoff_ms {
            return Err("Session backoff cap must be at least the base".to_string());
        }
        if self.session.gathering_timeout_desktop_ms == 0
            || self.session.gathering_timeout_mobile_ms == 0
        {
            return Err("Gathering timeouts must be nonzero".to_string());
        }
        if self.session.exchange_timeout_ms == 0 {
            return Err("Exchange timeout must be nonzero".to_string());
        }

        if self.control.endpoint.is_empty() {
            return Err("Control endpoint must not be empty".to_string());
        }
        if self.control.max_reconnect_attempts == 0 || self.control.max_reconnect_attempts > 20 {
            return Err("Control reconnect attempts must be between 1 and 20".to_string());
        }
        if self.control.base_backoff_ms == 0 {
            return Err("Control base backoff must be nonzero".to_string());
        }
        if self.control.cap_backoff_ms < self.control.base_backoff_ms {
            return Err("Control backoff cap must be at least the base".to_string());
        }
        if self.control.max_queue_depth == 0 {
            return Err("Control queue depth must be nonzero".to_string());
        }

        if self.ice.fallback_stun.is_empty() {
            return Err("ICE fallback list must not be empty".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CamLinkConfig::default();
        assert_eq!(config.session.max_connect_attempts, 3);
        assert_eq!(config.session.base_backoff_ms, 1_000);
        assert_eq!(config.control.max_reconnect_attempts, 5);
        assert_eq!(config.ice.fallback_stun.len(), 3);
    }

    #[test]
    fn test_config_validation() {
        let config = CamLinkConfig::default();
        assert!(config.validate().is_ok());

        let mut bad_attempts = config.clone();
        bad_attempts.session.max_connect_attempts = 0;
        assert!(bad_attempts.validate().is_err());

        let mut bad_cap = CamLinkConfig::default();
        bad_cap.control.cap_backoff_ms = 10;
        assert!(bad_cap.validate().is_err());

        let mut bad_endpoint = CamLinkConfig::default();
        bad_endpoint.control.endpoint = String::new();
        assert!(bad_endpoint.validate().is_err());
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = std::env::temp_dir();
        let config_path = temp_dir.join("test_camlink.toml");

        let _ = fs::remove_file(&config_path);

        let config = CamLinkConfig::default();
        assert!(config.save_to_file(&config_path).is_ok());

        let loaded = CamLinkConfig::load_from_file(&config_path).unwrap();
        assert_eq!(
            loaded.session.max_connect_attempts,
            config.session.max_connect_attempts
        );
        assert_eq!(loaded.control.endpoint, config.control.endpoint);

        let _ = fs::remove_file(&config_path);
    }

    #[test]
    fn test_config_toml_format() {
        let config = CamLinkConfig::default();
        let toml_string = toml::to_string_pretty(&config).unwrap();

        assert!(toml_string.contains("[session]"));
        assert!(toml_string.contains("[control]"));
        assert!(toml_string.contains("[ice]"));
        assert!(toml_string.contains("max_connect_attempts"));
        assert!(toml_string.contains("max_queue_depth"));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = CamLinkConfig::load_from_file("nonexistent_camlink.toml");
        assert!(result.is_ok()); // Should return default
        assert_eq!(result.unwrap().session.max_connect_attempts, 3);
    }
}
