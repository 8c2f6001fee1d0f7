//! Layered Ralph configuration.
//!
//! Resolution order, highest priority first: CLI flags, `RALPH_*` environment
//! variables, `.tf/ralph/config.json`, built-in defaults. Each source is read
//! into a [`ConfigLayer`] whose fields are all optional; [`RalphConfig::merge`]
//! applies layers field by field over the defaults.

use crate::logger::LogLevel;
use crate::paths::{ProjectPaths, expand_home};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{LazyLock, Once};
use tracing::debug;

pub const DEFAULT_TICKET_QUERY: &str = "tk ready | head -1 | awk '{print $1}'";
pub const DEFAULT_COMPLETION_CHECK: &str = "tk ready | grep -q .";
pub const DEFAULT_SESSION_DIR: &str = "~/.pi/agent/sessions";

/// Matches a query that would invoke the ticketflow CLI itself.
static FRONT_DOOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[\s;&|()/])(?:tf|ticketflow)(?:$|[\s;&|()])").unwrap()
});

static LEGACY_SESSION_WARNING: Once = Once::new();

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where agent output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PiOutput {
    #[default]
    Inherit,
    File,
    Discard,
}

impl fmt::Display for PiOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inherit => write!(f, "inherit"),
            Self::File => write!(f, "file"),
            Self::Discard => write!(f, "discard"),
        }
    }
}

impl FromStr for PiOutput {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inherit" => Ok(Self::Inherit),
            "file" => Ok(Self::File),
            "discard" => Ok(Self::Discard),
            other => Err(ConfigError::Invalid(format!(
                "piOutput must be inherit, file or discard (got '{other}')"
            ))),
        }
    }
}

/// An explicitly configured session directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionDirSetting {
    /// `false`, `null` or `""`: sessions are off.
    Disabled,
    Path(String),
}

impl SessionDirSetting {
    fn from_json(value: &Value) -> Self {
        match value {
            Value::String(s) if !s.trim().is_empty() => Self::Path(s.clone()),
            Value::Bool(true) => Self::Path(DEFAULT_SESSION_DIR.to_string()),
            _ => Self::Disabled,
        }
    }

    fn from_env(value: &str) -> Self {
        let trimmed = value.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" | "false" | "0" | "no" | "off" | "null" | "none" => Self::Disabled,
            _ => Self::Path(trimmed.to_string()),
        }
    }
}

// A present key always yields Some, so `null` disables instead of meaning "unset".
fn deserialize_session_dir<'de, D>(deserializer: D) -> Result<Option<SessionDirSetting>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(Some(SessionDirSetting::from_json(&value)))
}

/// One configuration source. `None` means "not set here".
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigLayer {
    pub max_iterations: Option<u32>,
    pub ticket_query: Option<String>,
    pub completion_check: Option<String>,
    pub sleep_between_tickets: Option<u64>,
    pub sleep_between_retries: Option<u64>,
    pub workflow: Option<String>,
    pub workflow_flags: Option<String>,
    pub parallel_workers: Option<u32>,
    pub parallel_worktrees_dir: Option<String>,
    pub component_tag_prefix: Option<String>,
    pub parallel_allow_untagged: Option<bool>,
    pub parallel_keep_worktrees: Option<bool>,
    pub attempt_timeout_ms: Option<u64>,
    pub max_restarts: Option<u32>,
    pub log_level: Option<LogLevel>,
    pub capture_json: Option<bool>,
    #[serde(deserialize_with = "deserialize_session_dir")]
    pub session_dir: Option<SessionDirSetting>,
    pub force_legacy_sessions: Option<bool>,
    pub agent_command: Option<String>,
    pub knowledge_dir: Option<String>,
    pub logs_dir: Option<String>,
    pub promise_on_complete: Option<bool>,
    pub pi_output: Option<PiOutput>,
    pub pi_output_file: Option<String>,
}

impl ConfigLayer {
    /// Reads `.tf/ralph/config.json`. A missing file is an empty layer; a
    /// malformed one is an error naming the file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let layer = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(layer)
    }

    /// Reads `RALPH_*` overrides through `lookup`. Unparseable values are
    /// skipped and reported in `warnings`.
    pub fn from_env<F>(lookup: F, warnings: &mut Vec<String>) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut layer = Self::default();

        fn parsed<T: FromStr>(
            name: &str,
            raw: Option<String>,
            warnings: &mut Vec<String>,
        ) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse::<T>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warnings.push(format!("Ignoring invalid {name}={raw}"));
                    None
                }
            }
        }

        fn flag(name: &str, raw: Option<String>, warnings: &mut Vec<String>) -> Option<bool> {
            let raw = raw?;
            let value = parse_bool(&raw);
            if value.is_none() {
                warnings.push(format!("Ignoring invalid {name}={raw}"));
            }
            value
        }

        layer.log_level = parsed("RALPH_LOG_LEVEL", lookup("RALPH_LOG_LEVEL"), warnings);
        layer.attempt_timeout_ms = parsed(
            "RALPH_ATTEMPT_TIMEOUT_MS",
            lookup("RALPH_ATTEMPT_TIMEOUT_MS"),
            warnings,
        );
        layer.max_restarts = parsed("RALPH_MAX_RESTARTS", lookup("RALPH_MAX_RESTARTS"), warnings);
        layer.max_iterations = parsed(
            "RALPH_MAX_ITERATIONS",
            lookup("RALPH_MAX_ITERATIONS"),
            warnings,
        );
        layer.parallel_workers = parsed(
            "RALPH_PARALLEL_WORKERS",
            lookup("RALPH_PARALLEL_WORKERS"),
            warnings,
        );
        layer.pi_output = parsed("RALPH_PI_OUTPUT", lookup("RALPH_PI_OUTPUT"), warnings);
        layer.capture_json = flag("RALPH_CAPTURE_JSON", lookup("RALPH_CAPTURE_JSON"), warnings);
        layer.force_legacy_sessions = flag(
            "RALPH_FORCE_LEGACY_SESSIONS",
            lookup("RALPH_FORCE_LEGACY_SESSIONS"),
            warnings,
        );
        layer.session_dir = lookup("RALPH_SESSION_DIR").map(|v| SessionDirSetting::from_env(&v));
        layer
    }

    /// Reads overrides from the process environment.
    pub fn from_process_env(warnings: &mut Vec<String>) -> Self {
        Self::from_env(|name| std::env::var(name).ok(), warnings)
    }
}

/// Parses `1/0/true/false/yes/no/on/off`, case-insensitively.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Fully resolved Ralph configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RalphConfig {
    pub max_iterations: u32,
    pub ticket_query: String,
    pub completion_check: String,
    pub sleep_between_tickets_ms: u64,
    pub sleep_between_retries_ms: u64,
    pub workflow: String,
    pub workflow_flags: String,
    pub parallel_workers: u32,
    pub parallel_worktrees_dir: String,
    pub component_tag_prefix: String,
    pub parallel_allow_untagged: bool,
    pub parallel_keep_worktrees: bool,
    /// Per-attempt wall clock limit. 0 disables.
    pub attempt_timeout_ms: u64,
    pub max_restarts: u32,
    pub log_level: LogLevel,
    pub capture_json: bool,
    /// `None` means not explicitly configured.
    pub session_dir: Option<SessionDirSetting>,
    pub force_legacy_sessions: bool,
    pub agent_command: String,
    pub knowledge_dir: String,
    pub logs_dir: String,
    pub promise_on_complete: bool,
    pub pi_output: PiOutput,
    pub pi_output_file: Option<String>,
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            ticket_query: DEFAULT_TICKET_QUERY.to_string(),
            completion_check: DEFAULT_COMPLETION_CHECK.to_string(),
            sleep_between_tickets_ms: 5000,
            sleep_between_retries_ms: 10000,
            workflow: "/tf".to_string(),
            workflow_flags: "--auto".to_string(),
            parallel_workers: 1,
            parallel_worktrees_dir: ".tf/ralph/worktrees".to_string(),
            component_tag_prefix: "component:".to_string(),
            parallel_allow_untagged: false,
            parallel_keep_worktrees: false,
            attempt_timeout_ms: 0,
            max_restarts: 0,
            log_level: LogLevel::Info,
            capture_json: false,
            session_dir: None,
            force_legacy_sessions: false,
            agent_command: "pi".to_string(),
            knowledge_dir: ".tf/knowledge".to_string(),
            logs_dir: ".tf/ralph/logs".to_string(),
            promise_on_complete: true,
            pi_output: PiOutput::Inherit,
            pi_output_file: None,
        }
    }
}

/// Result of [`RalphConfig::load`]: the config plus any warnings that should
/// be logged once a logger at the final level exists.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: RalphConfig,
    pub warnings: Vec<String>,
}

/// Outcome of session directory resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDirResolution {
    /// Absolute directory, or `None` when sessions are disabled.
    pub path: Option<PathBuf>,
    /// Set when a legacy in-project directory was found but not used.
    pub legacy_warning: Option<String>,
}

impl RalphConfig {
    /// Applies one layer over `self`.
    pub fn merge(&mut self, layer: ConfigLayer) {
        macro_rules! take {
            ($($field:ident => $target:ident),* $(,)?) => {
                $(if let Some(v) = layer.$field { self.$target = v; })*
            };
        }
        take!(
            max_iterations => max_iterations,
            ticket_query => ticket_query,
            completion_check => completion_check,
            sleep_between_tickets => sleep_between_tickets_ms,
            sleep_between_retries => sleep_between_retries_ms,
            workflow => workflow,
            workflow_flags => workflow_flags,
            parallel_workers => parallel_workers,
            parallel_worktrees_dir => parallel_worktrees_dir,
            component_tag_prefix => component_tag_prefix,
            parallel_allow_untagged => parallel_allow_untagged,
            parallel_keep_worktrees => parallel_keep_worktrees,
            attempt_timeout_ms => attempt_timeout_ms,
            max_restarts => max_restarts,
            log_level => log_level,
            capture_json => capture_json,
            force_legacy_sessions => force_legacy_sessions,
            agent_command => agent_command,
            knowledge_dir => knowledge_dir,
            logs_dir => logs_dir,
            promise_on_complete => promise_on_complete,
            pi_output => pi_output,
        );
        if layer.session_dir.is_some() {
            self.session_dir = layer.session_dir;
        }
        if layer.pi_output_file.is_some() {
            self.pi_output_file = layer.pi_output_file;
        }
    }

    /// Merges defaults, file, environment and CLI layers in priority order,
    /// then sanitizes and validates the result.
    pub fn resolve(
        file: ConfigLayer,
        env: ConfigLayer,
        cli: ConfigLayer,
    ) -> Result<LoadedConfig, ConfigError> {
        let mut config = Self::default();
        config.merge(file);
        config.merge(env);
        config.merge(cli);

        let mut warnings = Vec::new();
        if let Some(w) = config.sanitize_ticket_query() {
            warnings.push(w);
        }
        config.validate()?;
        Ok(LoadedConfig { config, warnings })
    }

    /// Loads the config file under `paths`, the given environment lookup and
    /// the CLI layer.
    pub fn load<F>(
        paths: &ProjectPaths,
        env_lookup: F,
        cli: ConfigLayer,
    ) -> Result<LoadedConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = ConfigLayer::from_file(&paths.config_path())?;
        let mut env_warnings = Vec::new();
        let env = ConfigLayer::from_env(env_lookup, &mut env_warnings);
        let mut loaded = Self::resolve(file, env, cli)?;
        env_warnings.append(&mut loaded.warnings);
        loaded.warnings = env_warnings;
        Ok(loaded)
    }

    /// Replaces a ticket query that would recurse into the ticketflow CLI.
    /// Returns the warning to log when a replacement happened.
    pub fn sanitize_ticket_query(&mut self) -> Option<String> {
        if !FRONT_DOOR_RE.is_match(&self.ticket_query) {
            return None;
        }
        let rejected = std::mem::replace(&mut self.ticket_query, DEFAULT_TICKET_QUERY.to_string());
        Some(format!(
            "ticketQuery '{rejected}' invokes the ticketflow CLI; using default '{DEFAULT_TICKET_QUERY}'"
        ))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallel_workers == 0 {
            return Err(ConfigError::Invalid(
                "parallelWorkers must be at least 1".to_string(),
            ));
        }
        if self.workflow.trim().is_empty() {
            return Err(ConfigError::Invalid("workflow must not be empty".to_string()));
        }
        if self.agent_command.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "agentCommand must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves the planning session directory for a project.
    pub fn resolve_session_dir(&self, paths: &ProjectPaths) -> SessionDirResolution {
        let legacy = paths.legacy_sessions_dir();

        if self.force_legacy_sessions {
            return SessionDirResolution {
                path: Some(legacy),
                legacy_warning: None,
            };
        }

        match &self.session_dir {
            Some(SessionDirSetting::Disabled) => SessionDirResolution {
                path: None,
                legacy_warning: None,
            },
            Some(SessionDirSetting::Path(p)) => SessionDirResolution {
                path: Some(paths.resolve(expand_home(p))),
                legacy_warning: None,
            },
            None => {
                let path = paths.resolve(expand_home(DEFAULT_SESSION_DIR));
                let legacy_warning = legacy.is_dir().then(|| {
                    format!(
                        "Legacy session directory {} found; sessions now live in {}. Set sessionDir or RALPH_FORCE_LEGACY_SESSIONS=1 to keep using it",
                        legacy.display(),
                        path.display()
                    )
                });
                SessionDirResolution {
                    path: Some(path),
                    legacy_warning,
                }
            }
        }
    }
}

/// Runs `emit` the first time it is called in this process.
pub fn warn_legacy_sessions_once(emit: impl FnOnce()) {
    LEGACY_SESSION_WARNING.call_once(emit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::Logger;
    use crate::testing::CapturedOutput;
    use serde_json::json;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RalphConfig::default();
        assert_eq!(config.max_iterations, 50);
        assert_eq!(config.parallel_workers, 1);
        assert_eq!(config.workflow, "/tf");
        assert_eq!(config.attempt_timeout_ms, 0);
        assert!(config.promise_on_complete);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_layer_camel_case() {
        let layer: ConfigLayer = serde_json::from_str(
            r#"{"maxIterations": 3, "sleepBetweenTickets": 0, "parallelWorkers": 4,
                "componentTagPrefix": "area:", "logLevel": "debug", "piOutput": "file"}"#,
        )
        .unwrap();
        let mut config = RalphConfig::default();
        config.merge(layer);
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.sleep_between_tickets_ms, 0);
        assert_eq!(config.parallel_workers, 4);
        assert_eq!(config.component_tag_prefix, "area:");
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.pi_output, PiOutput::File);
        // Untouched fields keep defaults
        assert_eq!(config.sleep_between_retries_ms, 10000);
    }

    #[test]
    fn test_priority_cli_over_env_over_file() {
        let file: ConfigLayer =
            serde_json::from_str(r#"{"maxRestarts": 1, "attemptTimeoutMs": 100, "maxIterations": 7}"#)
                .unwrap();
        let mut warnings = Vec::new();
        let env_layer = ConfigLayer::from_env(
            env(&[("RALPH_MAX_RESTARTS", "2"), ("RALPH_ATTEMPT_TIMEOUT_MS", "200")]),
            &mut warnings,
        );
        let cli = ConfigLayer {
            max_restarts: Some(3),
            ..ConfigLayer::default()
        };

        let loaded = RalphConfig::resolve(file, env_layer, cli).unwrap();
        assert_eq!(loaded.config.max_restarts, 3);
        assert_eq!(loaded.config.attempt_timeout_ms, 200);
        assert_eq!(loaded.config.max_iterations, 7);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_env_bools_and_invalid_values() {
        let mut warnings = Vec::new();
        let layer = ConfigLayer::from_env(
            env(&[
                ("RALPH_CAPTURE_JSON", "yes"),
                ("RALPH_FORCE_LEGACY_SESSIONS", "maybe"),
                ("RALPH_LOG_LEVEL", "WARN"),
                ("RALPH_MAX_RESTARTS", "lots"),
            ]),
            &mut warnings,
        );
        assert_eq!(layer.capture_json, Some(true));
        assert_eq!(layer.force_legacy_sessions, None);
        assert_eq!(layer.log_level, Some(LogLevel::Warn));
        assert_eq!(layer.max_restarts, None);
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_session_dir_disable_forms() {
        for raw in [r#"{"sessionDir": false}"#, r#"{"sessionDir": null}"#, r#"{"sessionDir": ""}"#] {
            let layer: ConfigLayer = serde_json::from_str(raw).unwrap();
            assert_eq!(layer.session_dir, Some(SessionDirSetting::Disabled), "{raw}");
        }
        let absent: ConfigLayer = serde_json::from_str("{}").unwrap();
        assert_eq!(absent.session_dir, None);
    }

    #[test]
    fn test_front_door_query_replaced() {
        let mut config = RalphConfig {
            ticket_query: "tf ralph next | head -1".to_string(),
            ..RalphConfig::default()
        };
        let warning = config.sanitize_ticket_query();
        assert!(warning.is_some());
        assert_eq!(config.ticket_query, DEFAULT_TICKET_QUERY);

        for safe in ["tk ready | head -1", "grep tfx list.txt", "echo pt-tf"] {
            let mut config = RalphConfig {
                ticket_query: safe.to_string(),
                ..RalphConfig::default()
            };
            assert!(config.sanitize_ticket_query().is_none(), "{safe}");
        }

        let mut config = RalphConfig {
            ticket_query: "npx ticketflow ready".to_string(),
            ..RalphConfig::default()
        };
        assert!(config.sanitize_ticket_query().is_some());
    }

    #[test]
    fn test_validate_rejects_zero_workers_and_empty_workflow() {
        let config = RalphConfig {
            parallel_workers: 0,
            ..RalphConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = RalphConfig {
            workflow: "  ".to_string(),
            ..RalphConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_file_names_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = ConfigLayer::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("config.json"));
    }

    #[test]
    fn test_missing_file_is_empty_layer() {
        let temp = TempDir::new().unwrap();
        let layer = ConfigLayer::from_file(&temp.path().join("nope.json")).unwrap();
        assert!(layer.max_iterations.is_none());
    }

    #[test]
    fn test_session_dir_resolution() {
        let temp = TempDir::new().unwrap();
        let paths = ProjectPaths::new(temp.path());

        // Disabled
        let config = RalphConfig {
            session_dir: Some(SessionDirSetting::Disabled),
            ..RalphConfig::default()
        };
        assert_eq!(config.resolve_session_dir(&paths).path, None);

        // Relative path resolves under the project root
        let config = RalphConfig {
            session_dir: Some(SessionDirSetting::Path("state/sessions".to_string())),
            ..RalphConfig::default()
        };
        assert_eq!(
            config.resolve_session_dir(&paths).path,
            Some(temp.path().join("state/sessions"))
        );

        // Legacy dir present, nothing configured: warn but use new default
        std::fs::create_dir_all(paths.legacy_sessions_dir()).unwrap();
        let resolution = RalphConfig::default().resolve_session_dir(&paths);
        assert!(resolution.legacy_warning.is_some());
        assert_ne!(resolution.path, Some(paths.legacy_sessions_dir()));

        // Explicit config silences the warning
        let config = RalphConfig {
            session_dir: Some(SessionDirSetting::Path("/tmp/s".to_string())),
            ..RalphConfig::default()
        };
        assert!(config.resolve_session_dir(&paths).legacy_warning.is_none());

        // Forced legacy
        let config = RalphConfig {
            force_legacy_sessions: true,
            ..RalphConfig::default()
        };
        assert_eq!(
            config.resolve_session_dir(&paths).path,
            Some(paths.legacy_sessions_dir())
        );
    }

    // The only caller of the process-wide guard in this test binary.
    #[test]
    fn test_legacy_warning_fires_once() {
        let out = CapturedOutput::default();
        let logger = Logger::with_writer(LogLevel::Info, out.clone());
        for _ in 0..3 {
            warn_legacy_sessions_once(|| {
                logger.warn("Using legacy session dir", &[("event", json!("legacy_session_dir"))]);
            });
        }
        let text = out.contents();
        assert_eq!(text.matches("event=legacy_session_dir").count(), 1);
        assert_eq!(text.lines().count(), 1);
    }
}
