use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_FILE: &str = "agent-stream.logs.jsonl";

/// Where and how run logs are written.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogConfig {
    pub enabled: bool,
    /// Level or filter directive; falls back to `RUST_LOG`, then `info`.
    pub level: Option<String>,
    /// JSONL output file. Logs go to stdout in compact form when unset.
    pub json_path: Option<PathBuf>,
}

impl LogConfig {
    /// Reads the configuration from the environment.
    ///
    /// - `ORCHESTRATOR_OBSERVABILITY_ENABLED` / `ORCHESTRATOR_OBSERVABILITY`: enable flag (default enabled).
    /// - `ORCHESTRATOR_LOG_LEVEL`: level/filter override.
    /// - `ORCHESTRATOR_JSON_LOG_PATH`: JSONL log file path.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = [
            "ORCHESTRATOR_OBSERVABILITY_ENABLED",
            "ORCHESTRATOR_OBSERVABILITY",
        ]
        .iter()
        .find_map(|key| lookup(key))
        .map(|value| parse_bool_env(&value).unwrap_or(true))
        .unwrap_or(true);
        Self {
            enabled,
            level: lookup("ORCHESTRATOR_LOG_LEVEL").filter(|level| !level.trim().is_empty()),
            json_path: lookup("ORCHESTRATOR_JSON_LOG_PATH")
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    fn env_filter(&self) -> EnvFilter {
        if let Some(level) = &self.level
            && let Ok(filter) = EnvFilter::try_new(level)
        {
            return filter;
        }
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn split_log_path(path: &Path) -> (&Path, &str) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE);
    (dir, file_name)
}

/// Initialize run logging once per process from the environment.
///
/// Safe to call repeatedly; later calls and an already-installed global
/// subscriber are ignored.
pub fn init_observability() {
    init_with(LogConfig::from_env());
}

/// Same as [`init_observability`] with an explicit configuration.
pub fn init_with(config: LogConfig) {
    INIT.get_or_init(|| {
        if !config.enabled {
            return;
        }

        let env_filter = config.env_filter();
        if let Some(path) = &config.json_path {
            let (dir, file_name) = split_log_path(path);
            let _ = std::fs::create_dir_all(dir);
            let writer = tracing_appender::rolling::never(dir, file_name);
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(false)
                .with_writer(writer);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(json_layer)
                .try_init();
        } else {
            let console_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stdout);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init();
        }
    });
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> LogConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LogConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_to_enabled_stdout() {
        let config = config(&[]);
        assert!(config.enabled);
        assert_eq!(config.level, None);
        assert_eq!(config.json_path, None);
    }

    #[test]
    fn reads_flags_level_and_path() {
        let config = config(&[
            ("ORCHESTRATOR_OBSERVABILITY", "off"),
            ("ORCHESTRATOR_LOG_LEVEL", "debug"),
            ("ORCHESTRATOR_JSON_LOG_PATH", "logs/run.jsonl"),
        ]);
        assert!(!config.enabled);
        assert_eq!(config.level.as_deref(), Some("debug"));
        assert_eq!(config.json_path, Some(PathBuf::from("logs/run.jsonl")));
    }

    #[test]
    fn unparseable_flag_keeps_logging_on() {
        assert!(config(&[("ORCHESTRATOR_OBSERVABILITY_ENABLED", "maybe")]).enabled);
        assert_eq!(parse_bool_env(" Disabled "), Some(false));
    }

    #[test]
    fn bare_file_name_logs_to_current_dir() {
        let path = PathBuf::from("run.jsonl");
        assert_eq!(split_log_path(&path), (Path::new("."), "run.jsonl"));
    }
}
