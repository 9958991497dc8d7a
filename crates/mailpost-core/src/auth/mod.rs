//! Sender authentication
//!
//! DKIM and SPF checks are delegated to an external validator. Whether the
//! validator's runtime is present is decided once at startup and captured in
//! [`AuthSettings`], which the pipeline consults for every message.

mod script;

pub use script::{locate_program, ScriptValidator};

use async_trait::async_trait;
use mailpost_common::config::AuthConfig;
use mailpost_common::Result;
use std::net::IpAddr;

/// External DKIM/SPF validator
#[async_trait]
pub trait AuthValidator: Send + Sync {
    /// Verify the DKIM signature of a raw message
    async fn validate_dkim(&self, raw: &[u8]) -> Result<bool>;

    /// Check that `remote_ip` may send for `envelope_from`
    async fn validate_spf(
        &self,
        remote_ip: IpAddr,
        envelope_from: &str,
        remote_host: &str,
    ) -> Result<bool>;
}

/// Process-wide validator availability, fixed at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthSettings {
    /// The validator runtime was found at startup
    pub runtime_available: bool,
    pub dkim_enabled: bool,
    pub spf_enabled: bool,
}

impl AuthSettings {
    /// Probe the configured runtime and combine it with the disable switches
    pub fn detect(config: &AuthConfig) -> Self {
        let runtime_available = locate_program(&config.runtime).is_some();
        Self::from_config(config, runtime_available)
    }

    pub fn from_config(config: &AuthConfig, runtime_available: bool) -> Self {
        Self {
            runtime_available,
            dkim_enabled: !config.disable_dkim,
            spf_enabled: !config.disable_spf,
        }
    }

    /// Settings under which every check short-circuits to `failed`
    pub fn unavailable() -> Self {
        Self {
            runtime_available: false,
            dkim_enabled: true,
            spf_enabled: true,
        }
    }

    /// Whether the DKIM validator should be invoked
    pub fn dkim_active(&self) -> bool {
        self.runtime_available && self.dkim_enabled
    }

    /// Whether the SPF validator should be invoked
    pub fn spf_active(&self) -> bool {
        self.runtime_available && self.spf_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config() {
        let mut config = AuthConfig::default();
        config.disable_spf = true;

        let settings = AuthSettings::from_config(&config, true);
        assert!(settings.dkim_active());
        assert!(!settings.spf_active());

        let settings = AuthSettings::from_config(&config, false);
        assert!(!settings.dkim_active());
        assert!(!settings.spf_active());
    }

    #[test]
    fn test_detect_missing_runtime() {
        let config = AuthConfig {
            runtime: "mailpost-no-such-runtime-4b1d".to_string(),
            ..AuthConfig::default()
        };
        let settings = AuthSettings::detect(&config);
        assert!(!settings.runtime_available);
        assert_eq!(settings, AuthSettings::unavailable());
    }
}
