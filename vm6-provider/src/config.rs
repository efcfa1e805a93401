//! Provider settings, read from flags or `PM_*` environment variables.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use thiserror::Error;

use crate::logging::LogSettings;
use crate::remote::Credentials;
use crate::throttle::DEFAULT_MAX_PARALLEL;

const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("api url {0:?} must start with http:// or https://")]
    InvalidUrl(String),

    #[error("password and API token are mutually exclusive")]
    ConflictingCredentials,

    #[error("either a password or an API token is required")]
    MissingCredentials,

    #[error("password authentication requires an email")]
    MissingEmail,

    #[error("{field} must be at least 1")]
    NotPositive { field: &'static str },

    #[error("invalid log level entry {entry:?}, expected target=level (trace, debug, info, warn, error or off)")]
    InvalidLogLevel { entry: String },
}

#[derive(Debug, Clone, Parser)]
#[command(name = "vm6-provider", version, about)]
pub struct ProviderConfig {
    /// VMmanager API endpoint, e.g. https://vm.example.com/
    #[arg(long, env = "PM_API_URL")]
    pub api_url: String,

    /// Login email for password authentication
    #[arg(long, env = "PM_EMAIL")]
    pub email: Option<String>,

    /// Login password
    #[arg(long, env = "PM_PASS", hide_env_values = true)]
    pub password: Option<String>,

    /// API token, used instead of email and password
    #[arg(long, env = "PM_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    /// Maximum number of operations in flight
    #[arg(long, env = "PM_PARALLEL", default_value_t = DEFAULT_MAX_PARALLEL)]
    pub parallel: usize,

    /// Skip TLS certificate verification
    #[arg(long, env = "PM_TLS_INSECURE", default_value_t = true, action = ArgAction::Set)]
    pub tls_insecure: bool,

    /// Per-call timeout in seconds
    #[arg(long, env = "PM_TIMEOUT", default_value_t = 300)]
    pub timeout: u64,

    /// Read unknown enumerated values from the API as their defaults instead
    /// of refusing to work. Use at your own risk.
    #[arg(long, env = "PM_DANGEROUSLY_IGNORE_UNKNOWN_ATTRIBUTES")]
    pub dangerously_ignore_unknown_attributes: bool,

    /// Verbose client request logging
    #[arg(long, env = "PM_DEBUG")]
    pub debug: bool,

    /// Write provider logs to the log file
    #[arg(long, env = "PM_LOG_ENABLE")]
    pub log_enable: bool,

    /// Log file path
    #[arg(long, env = "PM_LOG_FILE", default_value = "vm6-provider.log")]
    pub log_file: PathBuf,

    /// Per-target log levels as target=level; `_default` sets the global level
    #[arg(long = "log-level", env = "PM_LOG_LEVELS", value_delimiter = ',')]
    pub log_levels: Vec<String>,
}

/// Settings that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub api_url: String,
    pub credentials: Credentials,
    pub parallel: usize,
    pub tls_insecure: bool,
    pub call_timeout: Duration,
    pub ignore_unknown_attributes: bool,
    pub debug: bool,
    pub log: LogSettings,
}

impl ProviderConfig {
    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(ConfigError::InvalidUrl(self.api_url));
        }

        let email = self.email.filter(|s| !s.is_empty());
        let password = self.password.filter(|s| !s.is_empty());
        let token = self.api_token.filter(|s| !s.is_empty());
        let credentials = match (email, password, token) {
            (_, Some(_), Some(_)) => return Err(ConfigError::ConflictingCredentials),
            (Some(email), Some(password), None) => Credentials::Password { email, password },
            (None, Some(_), None) => return Err(ConfigError::MissingEmail),
            (_, None, Some(token)) => Credentials::Token(token),
            (_, None, None) => return Err(ConfigError::MissingCredentials),
        };

        if self.parallel == 0 {
            return Err(ConfigError::NotPositive { field: "parallel" });
        }
        if self.timeout == 0 {
            return Err(ConfigError::NotPositive { field: "timeout" });
        }

        let levels = parse_levels(&self.log_levels)?;

        Ok(ValidatedConfig {
            api_url: self.api_url,
            credentials,
            parallel: self.parallel,
            tls_insecure: self.tls_insecure,
            call_timeout: Duration::from_secs(self.timeout),
            ignore_unknown_attributes: self.dangerously_ignore_unknown_attributes,
            debug: self.debug,
            log: LogSettings {
                enabled: self.log_enable,
                file: self.log_file,
                levels,
            },
        })
    }
}

fn parse_levels(entries: &[String]) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut levels = BTreeMap::new();
    for entry in entries.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
        let invalid = || ConfigError::InvalidLogLevel {
            entry: entry.to_string(),
        };
        let (target, level) = entry.split_once('=').ok_or_else(invalid)?;
        let level = level.to_ascii_lowercase();
        if target.is_empty() || !LEVELS.contains(&level.as_str()) {
            return Err(invalid());
        }
        levels.insert(target.to_string(), level);
    }
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ProviderConfig {
        let mut argv = vec!["vm6-provider"];
        argv.extend_from_slice(args);
        ProviderConfig::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["--api-url", "https://vm.example.com/", "--api-token", "t0k"])
            .validate()
            .unwrap();
        assert_eq!(config.parallel, 4);
        assert_eq!(config.call_timeout, Duration::from_secs(300));
        assert!(config.tls_insecure);
        assert!(!config.debug);
        assert!(!config.ignore_unknown_attributes);
        assert!(!config.log.enabled);
        assert_eq!(config.log.file, PathBuf::from("vm6-provider.log"));
        assert_eq!(config.credentials, Credentials::Token("t0k".into()));
    }

    #[test]
    fn test_ignore_unknown_attributes_flag() {
        let config = parse(&[
            "--api-url",
            "https://vm.example.com/",
            "--api-token",
            "t0k",
            "--dangerously-ignore-unknown-attributes",
        ])
        .validate()
        .unwrap();
        assert!(config.ignore_unknown_attributes);
    }

    #[test]
    fn test_password_and_token_are_exclusive() {
        let err = parse(&[
            "--api-url",
            "https://vm.example.com/",
            "--email",
            "admin@example.com",
            "--password",
            "pw",
            "--api-token",
            "t0k",
        ])
        .validate()
        .unwrap_err();
        assert_eq!(err, ConfigError::ConflictingCredentials);
    }

    #[test]
    fn test_credentials_required() {
        let err = parse(&["--api-url", "https://vm.example.com/"])
            .validate()
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingCredentials);

        let err = parse(&["--api-url", "https://vm.example.com/", "--password", "pw"])
            .validate()
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingEmail);
    }

    #[test]
    fn test_password_credentials() {
        let config = parse(&[
            "--api-url",
            "http://10.0.0.5/",
            "--email",
            "admin@example.com",
            "--password",
            "pw",
            "--tls-insecure",
            "false",
        ])
        .validate()
        .unwrap();
        assert!(!config.tls_insecure);
        assert_eq!(
            config.credentials,
            Credentials::Password {
                email: "admin@example.com".into(),
                password: "pw".into()
            }
        );
        assert!(!format!("{:?}", config.credentials).contains("pw\""));
    }

    #[test]
    fn test_rejects_bad_values() {
        let with_token = |args: &[&str]| {
            let mut args = args.to_vec();
            args.extend(["--api-token", "t0k"]);
            parse(&args).validate().unwrap_err()
        };

        assert!(matches!(
            with_token(&["--api-url", "vm.example.com"]),
            ConfigError::InvalidUrl(_)
        ));
        assert_eq!(
            with_token(&["--api-url", "https://a/", "--parallel", "0"]),
            ConfigError::NotPositive { field: "parallel" }
        );
        assert_eq!(
            with_token(&["--api-url", "https://a/", "--timeout", "0"]),
            ConfigError::NotPositive { field: "timeout" }
        );
    }

    #[test]
    fn test_log_levels() {
        let config = parse(&[
            "--api-url",
            "https://a/",
            "--api-token",
            "t0k",
            "--log-level",
            "_default=debug,vm6_provider::reconciler=TRACE",
            "--log-level",
            "vm6_provider::remote=warn",
        ])
        .validate()
        .unwrap();
        let levels: Vec<(&str, &str)> = config
            .log
            .levels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(
            levels,
            vec![
                ("_default", "debug"),
                ("vm6_provider::reconciler", "trace"),
                ("vm6_provider::remote", "warn"),
            ]
        );

        let err = parse(&["--api-url", "https://a/", "--api-token", "t", "--log-level", "noisy"])
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLogLevel { .. }));
    }
}
