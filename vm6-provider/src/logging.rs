//! Structured logging setup.
//!
//! Provider logs go to a file so they never mix with the orchestrator's
//! protocol stream. When logging is disabled everything is filtered out.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Key in the level map that sets the global level.
pub const DEFAULT_TARGET: &str = "_default";

const DEFAULT_LEVEL: &str = "info";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings {
    pub enabled: bool,
    pub file: PathBuf,
    /// target -> level; keys starting with `_` other than `_default` are ignored.
    pub levels: BTreeMap<String, String>,
}

/// Build the `EnvFilter` directive string for `settings`.
pub fn filter_directives(settings: &LogSettings) -> String {
    if !settings.enabled {
        return "off".to_string();
    }
    let global = settings
        .levels
        .get(DEFAULT_TARGET)
        .map(String::as_str)
        .unwrap_or(DEFAULT_LEVEL);

    let mut directives = vec![global.to_string()];
    directives.extend(
        settings
            .levels
            .iter()
            .filter(|(target, _)| !target.starts_with('_'))
            .map(|(target, level)| format!("{}={}", target, level)),
    );
    directives.join(",")
}

/// Install the global subscriber.
pub fn init(settings: &LogSettings) -> Result<()> {
    let filter = EnvFilter::try_new(filter_directives(settings)).context("invalid log filter")?;

    if !settings.enabled {
        tracing_subscriber::registry()
            .with(filter)
            .try_init()
            .context("failed to install log subscriber")?;
        return Ok(());
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&settings.file)
        .with_context(|| format!("failed to open log file {}", settings.file.display()))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .context("failed to install log subscriber")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(levels: &[(&str, &str)]) -> LogSettings {
        LogSettings {
            enabled: true,
            file: PathBuf::from("unused.log"),
            levels: levels
                .iter()
                .map(|(t, l)| (t.to_string(), l.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_disabled_is_off() {
        let mut s = settings(&[("_default", "trace")]);
        s.enabled = false;
        assert_eq!(filter_directives(&s), "off");
    }

    #[test]
    fn test_default_level_is_info() {
        assert_eq!(filter_directives(&settings(&[])), "info");
    }

    #[test]
    fn test_per_target_levels() {
        let s = settings(&[
            ("_default", "warn"),
            ("_capturelog", "true"),
            ("vm6_provider::remote", "debug"),
            ("vm6_provider::reconciler", "trace"),
        ]);
        assert_eq!(
            filter_directives(&s),
            "warn,vm6_provider::reconciler=trace,vm6_provider::remote=debug"
        );
        assert!(EnvFilter::try_new(filter_directives(&s)).is_ok());
    }
}
