//! Configuration for mailpost

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// SMTP listener configuration
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Staging directory configuration
    #[serde(default)]
    pub staging: StagingConfig,

    /// Webhook delivery configuration
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// DKIM/SPF validator configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// SMTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Hostname for SMTP banner
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Bind host
    #[serde(default = "default_smtp_host")]
    pub host: String,

    /// SMTP port
    #[serde(default = "default_smtp_port")]
    pub port: u16,

    /// Maximum message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Idle timeout between client lines in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Resolve the remote host name from the peer address
    #[serde(default = "default_true")]
    pub reverse_dns: bool,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            host: default_smtp_host(),
            port: default_smtp_port(),
            max_message_size: default_max_message_size(),
            max_connections: default_max_connections(),
            connection_timeout_secs: default_connection_timeout(),
            reverse_dns: true,
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_smtp_host() -> String {
    "0.0.0.0".to_string()
}

fn default_smtp_port() -> u16 {
    2500
}

fn default_max_message_size() -> usize {
    25 * 1024 * 1024 // 25 MB
}

fn default_max_connections() -> usize {
    100
}

fn default_connection_timeout() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

/// Staging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Directory holding in-flight messages, created if absent
    #[serde(default = "default_tmp")]
    pub tmp: PathBuf,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self { tmp: default_tmp() }
    }
}

fn default_tmp() -> PathBuf {
    PathBuf::from(".tmp")
}

/// Webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Destination URL
    #[serde(default = "default_webhook_url")]
    pub url: String,

    /// Post envelopes to the webhook. When disabled they are only logged.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Name of the form field carrying the serialized envelope
    #[serde(default = "default_form_field")]
    pub form_field: String,

    /// Request timeout in seconds
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: default_webhook_url(),
            enabled: true,
            form_field: default_form_field(),
            timeout_secs: default_webhook_timeout(),
        }
    }
}

fn default_webhook_url() -> String {
    "http://localhost:3000/webhook".to_string()
}

fn default_form_field() -> String {
    "mailpost".to_string()
}

fn default_webhook_timeout() -> u64 {
    30
}

/// Authentication validator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Skip DKIM validation; every message is marked as failing
    #[serde(default)]
    pub disable_dkim: bool,

    /// Skip SPF validation; every message is marked as failing
    #[serde(default)]
    pub disable_spf: bool,

    /// Validator runtime program, looked up on PATH at startup
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// Arguments for the DKIM check; the raw message is written to stdin
    #[serde(default = "default_dkim_args")]
    pub dkim_args: Vec<String>,

    /// Arguments for the SPF check; ip, envelope-from and host are appended
    #[serde(default = "default_spf_args")]
    pub spf_args: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            disable_dkim: false,
            disable_spf: false,
            runtime: default_runtime(),
            dkim_args: default_dkim_args(),
            spf_args: default_spf_args(),
        }
    }
}

fn default_runtime() -> String {
    "python3".to_string()
}

fn default_dkim_args() -> Vec<String> {
    vec!["validators/dkim_verify.py".to_string()]
}

fn default_spf_args() -> Vec<String> {
    vec!["validators/spf_validate.py".to_string()]
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from the default locations, falling back to
    /// built-in defaults when no file exists
    pub fn load() -> crate::Result<Self> {
        let paths = [
            PathBuf::from("./mailpost.toml"),
            PathBuf::from("/etc/mailpost/mailpost.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Ok(Self::default())
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> crate::Result<()> {
        let url = reqwest::Url::parse(&self.webhook.url)
            .map_err(|e| crate::Error::Config(format!("Invalid webhook URL: {}", e)))?;

        match url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(crate::Error::Config(format!(
                    "Webhook URL scheme '{}' is not allowed. Only http and https are permitted.",
                    scheme
                )));
            }
        }

        if self.webhook.form_field.is_empty() {
            return Err(crate::Error::Config(
                "webhook.form_field must not be empty".to_string(),
            ));
        }

        if self.auth.runtime.trim().is_empty() {
            return Err(crate::Error::Config(
                "auth.runtime must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.smtp.port, 2500);
        assert_eq!(config.staging.tmp, PathBuf::from(".tmp"));
        assert_eq!(config.webhook.url, "http://localhost:3000/webhook");
        assert!(config.webhook.enabled);
        assert!(!config.auth.disable_dkim);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[smtp]
hostname = "mx.example.com"
port = 25

[staging]
tmp = "/var/spool/mailpost"

[webhook]
url = "https://hooks.example.com/inbound"
form_field = "message"

[auth]
disable_spf = true
runtime = "/usr/bin/python3"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.smtp.hostname, "mx.example.com");
        assert_eq!(config.smtp.port, 25);
        assert_eq!(config.smtp.max_connections, 100);
        assert_eq!(config.staging.tmp, PathBuf::from("/var/spool/mailpost"));
        assert_eq!(config.webhook.form_field, "message");
        assert!(config.auth.disable_spf);
        assert!(!config.auth.disable_dkim);
        assert_eq!(config.auth.dkim_args, default_dkim_args());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mailpost.toml");
        std::fs::write(&path, "[smtp]\nport = 2525\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.smtp.port, 2525);

        std::fs::write(&path, "[smtp\nport = ").unwrap();
        assert!(matches!(
            Config::from_file(&path),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_webhook() {
        let mut config = Config::default();
        config.webhook.url = "ftp://example.com/drop".to_string();
        assert!(config.validate().is_err());

        config.webhook.url = "not a url".to_string();
        assert!(config.validate().is_err());

        config.webhook.url = "https://example.com/hook".to_string();
        config.webhook.form_field = String::new();
        assert!(config.validate().is_err());
    }
}
