use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use script_exporter_core::dispatcher::DispatcherSettings;
use script_exporter_core::model::OutputFormat;

/// Invalid or inconsistent server settings.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a valid {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("TELEMETRY_PATH must start with '/' and must not end with '/', got '{0}'")]
    TelemetryPath(String),

    #[error("TELEMETRY_PATH must not contain '{{', '}}', '*' or a ':' segment, got '{0}'")]
    TelemetryPathSyntax(String),

    #[error("TELEMETRY_PATH '{0}' is already served by another endpoint")]
    TelemetryPathReserved(String),

    #[error("SCRIPT_WORKERS must be at least 1")]
    NoWorkers,

    #[error("SCRIPT_TIMEOUT_SECS must be greater than zero")]
    ZeroScriptTimeout,

    #[error("REQUEST_TIMEOUT_SECS ({request}) must be greater than SCRIPT_TIMEOUT_SECS ({script})")]
    RequestTimeoutTooShort { request: u64, script: u64 },
}

/// Routes mounted next to the metrics prefix.
const RESERVED_PATHS: &[&str] = &["/health"];

/// Server configuration loaded from environment variables.
///
/// Defaults match a stock exporter listening on port 9661.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `9661`).
    pub port: u16,
    /// Path under which metrics are served (default: `/metrics`).
    pub telemetry_path: String,
    /// Directory that script names are resolved against (default: cwd).
    pub script_path: PathBuf,
    /// Interpret script output as OpenTSDB lines (default: `false`).
    pub opentsdb: bool,
    /// Per-invocation script deadline in seconds (default: `60`).
    pub script_timeout_secs: u64,
    /// Concurrent runs allowed per script (default: `1`).
    pub script_workers: usize,
    /// Kill the script's whole process group on timeout (default: `false`).
    pub kill_process_group: bool,
    /// HTTP request timeout in seconds (default: `75`).
    pub request_timeout_secs: u64,
    /// Time allowed for in-flight scripts after shutdown (default: `10`).
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9661,
            telemetry_path: "/metrics".into(),
            script_path: PathBuf::new(),
            opentsdb: false,
            script_timeout_secs: 60,
            script_workers: 1,
            kill_process_group: false,
            request_timeout_secs: 75,
            shutdown_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default    |
    /// |-------------------------|------------|
    /// | `HOST`                  | `0.0.0.0`  |
    /// | `PORT`                  | `9661`     |
    /// | `TELEMETRY_PATH`        | `/metrics` |
    /// | `SCRIPT_PATH`           | (empty)    |
    /// | `OPENTSDB`              | `false`    |
    /// | `SCRIPT_TIMEOUT_SECS`   | `60`       |
    /// | `SCRIPT_WORKERS`        | `1`        |
    /// | `KILL_PROCESS_GROUP`    | `false`    |
    /// | `REQUEST_TIMEOUT_SECS`  | `75`       |
    /// | `SHUTDOWN_TIMEOUT_SECS` | `10`       |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build configuration from any variable source, then validate it.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "PORT", "port number", defaults.port)?,
            telemetry_path: lookup("TELEMETRY_PATH").unwrap_or(defaults.telemetry_path),
            script_path: lookup("SCRIPT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.script_path),
            opentsdb: parse_var(&lookup, "OPENTSDB", "boolean", defaults.opentsdb)?,
            script_timeout_secs: parse_var(
                &lookup,
                "SCRIPT_TIMEOUT_SECS",
                "number of seconds",
                defaults.script_timeout_secs,
            )?,
            script_workers: parse_var(
                &lookup,
                "SCRIPT_WORKERS",
                "worker count",
                defaults.script_workers,
            )?,
            kill_process_group: parse_var(
                &lookup,
                "KILL_PROCESS_GROUP",
                "boolean",
                defaults.kill_process_group,
            )?,
            request_timeout_secs: parse_var(
                &lookup,
                "REQUEST_TIMEOUT_SECS",
                "number of seconds",
                defaults.request_timeout_secs,
            )?,
            shutdown_timeout_secs: parse_var(
                &lookup,
                "SHUTDOWN_TIMEOUT_SECS",
                "number of seconds",
                defaults.shutdown_timeout_secs,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let path = &self.telemetry_path;
        if !path.starts_with('/') || path.ends_with('/') {
            return Err(ConfigError::TelemetryPath(path.clone()));
        }
        if path.contains(['{', '}', '*']) || path.split('/').any(|seg| seg.starts_with(':')) {
            return Err(ConfigError::TelemetryPathSyntax(path.clone()));
        }
        if RESERVED_PATHS.contains(&path.as_str()) {
            return Err(ConfigError::TelemetryPathReserved(path.clone()));
        }
        if self.script_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.script_timeout_secs == 0 {
            return Err(ConfigError::ZeroScriptTimeout);
        }
        if self.request_timeout_secs <= self.script_timeout_secs {
            return Err(ConfigError::RequestTimeoutTooShort {
                request: self.request_timeout_secs,
                script: self.script_timeout_secs,
            });
        }
        Ok(())
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs)
    }

    pub fn output_format(&self) -> OutputFormat {
        if self.opentsdb {
            OutputFormat::OpenTsdb
        } else {
            OutputFormat::Prometheus
        }
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            script_dir: self.script_path.clone(),
            max_per_script: self.script_workers,
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    expected: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid {
                var,
                expected,
                value,
            }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = load(&[]).expect("defaults are valid");
        assert_eq!(config.port, 9661);
        assert_eq!(config.telemetry_path, "/metrics");
        assert_eq!(config.script_workers, 1);
        assert_eq!(config.script_timeout(), Duration::from_secs(60));
        assert_eq!(config.output_format(), OutputFormat::Prometheus);
        assert!(!config.kill_process_group);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("PORT", "9100"),
            ("TELEMETRY_PATH", "/scrape"),
            ("SCRIPT_PATH", "/opt/scripts"),
            ("OPENTSDB", "true"),
            ("SCRIPT_WORKERS", "4"),
            ("SCRIPT_TIMEOUT_SECS", "5"),
            ("REQUEST_TIMEOUT_SECS", "10"),
        ])
        .expect("valid");
        assert_eq!(config.port, 9100);
        assert_eq!(config.output_format(), OutputFormat::OpenTsdb);
        let settings = config.dispatcher_settings();
        assert_eq!(settings.script_dir, PathBuf::from("/opt/scripts"));
        assert_eq!(settings.max_per_script, 4);
    }

    #[test]
    fn malformed_numbers_name_the_variable() {
        assert_matches!(
            load(&[("PORT", "http")]),
            Err(ConfigError::Invalid { var: "PORT", .. })
        );
        assert_matches!(
            load(&[("OPENTSDB", "yes please")]),
            Err(ConfigError::Invalid { var: "OPENTSDB", .. })
        );
    }

    #[test]
    fn telemetry_path_shape_is_checked() {
        for bad in ["metrics", "/metrics/", "/"] {
            assert_matches!(
                load(&[("TELEMETRY_PATH", bad)]),
                Err(ConfigError::TelemetryPath(_)),
                "{bad}"
            );
        }
    }

    #[test]
    fn telemetry_path_route_syntax_is_rejected() {
        for bad in ["/{script}", "/metrics/{*rest}", "/met}rics", "/metrics*", "/:id"] {
            assert_matches!(
                load(&[("TELEMETRY_PATH", bad)]),
                Err(ConfigError::TelemetryPathSyntax(_)),
                "{bad}"
            );
        }
    }

    #[test]
    fn telemetry_path_must_not_shadow_health() {
        assert_eq!(
            load(&[("TELEMETRY_PATH", "/health")]).unwrap_err(),
            ConfigError::TelemetryPathReserved("/health".to_string())
        );
        let config = load(&[("TELEMETRY_PATH", "/health/scripts")]).expect("nested is fine");
        assert_eq!(config.telemetry_path, "/health/scripts");
    }

    #[test]
    fn inconsistent_limits_are_rejected() {
        assert_eq!(load(&[("SCRIPT_WORKERS", "0")]).unwrap_err(), ConfigError::NoWorkers);
        assert_eq!(
            load(&[("SCRIPT_TIMEOUT_SECS", "0")]).unwrap_err(),
            ConfigError::ZeroScriptTimeout
        );
        assert_eq!(
            load(&[("SCRIPT_TIMEOUT_SECS", "90")]).unwrap_err(),
            ConfigError::RequestTimeoutTooShort {
                request: 75,
                script: 90
            }
        );
    }
}
