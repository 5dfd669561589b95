use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_TERMINATE_JOIN_TIMEOUT_MS: u64 = 2_000; // forced cleanup of one instance
pub const DEFAULT_TEARDOWN_JOIN_TIMEOUT_MS: u64 = 1_000; // per join attempt during teardown
pub const WORKER_BINARY_NAME: &str = "workcell-worker";

/// Top-level config (workcell.toml + WORKCELL_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkcellConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Knobs for the executor's event channel and process shutdown behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Address the loopback event channel binds to. The port is always
    /// ephemeral.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Bound on the join that follows a forced termination (`terminate_job`,
    /// spawn-failure cleanup).
    #[serde(default = "default_terminate_join_timeout_ms")]
    pub terminate_join_timeout_ms: u64,

    /// Bound on each join attempt while tearing down.
    #[serde(default = "default_teardown_join_timeout_ms")]
    pub teardown_join_timeout_ms: u64,

    /// When tearing down with `wait = true`, terminate whatever is still
    /// alive after this many join rounds. `None` waits for workers to finish
    /// on their own.
    #[serde(default)]
    pub teardown_force_after: Option<u32>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            terminate_join_timeout_ms: DEFAULT_TERMINATE_JOIN_TIMEOUT_MS,
            teardown_join_timeout_ms: DEFAULT_TEARDOWN_JOIN_TIMEOUT_MS,
            teardown_force_after: None,
        }
    }
}

impl ExecutorConfig {
    pub fn terminate_join_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_join_timeout_ms)
    }

    pub fn teardown_join_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_join_timeout_ms)
    }
}

/// How worker processes are launched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker executable. Falls back to `workcell-worker` next to the
    /// current executable.
    #[serde(default)]
    pub program: Option<PathBuf>,

    /// Extra arguments passed to every worker.
    #[serde(default)]
    pub args: Vec<String>,
}

impl WorkerConfig {
    /// Resolve the worker executable path.
    pub fn resolve_program(&self) -> PathBuf {
        if let Some(ref program) = self.program {
            return program.clone();
        }
        let name = format!("{WORKER_BINARY_NAME}{}", std::env::consts::EXE_SUFFIX);
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
            .unwrap_or_else(|| PathBuf::from(name))
    }
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_terminate_join_timeout_ms() -> u64 {
    DEFAULT_TERMINATE_JOIN_TIMEOUT_MS
}
fn default_teardown_join_timeout_ms() -> u64 {
    DEFAULT_TEARDOWN_JOIN_TIMEOUT_MS
}

impl WorkcellConfig {
    /// Load config from a TOML file with WORKCELL_* env var overrides.
    ///
    /// Nested keys are separated by a double underscore, e.g.
    /// `WORKCELL_EXECUTOR__TEARDOWN_FORCE_AFTER=3`. A missing file is not an
    /// error; every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        tracing::debug!(path = %path, "loading workcell config");

        let config: WorkcellConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("WORKCELL_").split("__"))
            .extract()
            .map_err(|e| crate::error::WorkcellError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.workcell/workcell.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = WorkcellConfig::load(path.to_str()).unwrap();

        assert_eq!(config.executor.bind, DEFAULT_BIND);
        assert_eq!(
            config.executor.terminate_join_timeout_ms,
            DEFAULT_TERMINATE_JOIN_TIMEOUT_MS
        );
        assert_eq!(config.executor.teardown_force_after, None);
        assert!(config.worker.program.is_none());
        assert!(config.worker.args.is_empty());
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[executor]
teardown_join_timeout_ms = 250
teardown_force_after = 4

[worker]
program = "/opt/workcell/bin/worker"
args = ["--quiet"]
"#
        )
        .unwrap();

        let config = WorkcellConfig::load(file.path().to_str()).unwrap();

        assert_eq!(config.executor.bind, DEFAULT_BIND);
        assert_eq!(config.executor.teardown_join_timeout(), Duration::from_millis(250));
        assert_eq!(config.executor.teardown_force_after, Some(4));
        assert_eq!(
            config.worker.resolve_program(),
            PathBuf::from("/opt/workcell/bin/worker")
        );
        assert_eq!(config.worker.args, vec!["--quiet".to_string()]);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[executor]\nteardown_join_timeout_ms = \"soon\"").unwrap();

        let err = WorkcellConfig::load(file.path().to_str()).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn default_worker_program_sits_next_to_current_exe() {
        let program = WorkerConfig::default().resolve_program();
        let file_name = program.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.starts_with(WORKER_BINARY_NAME));
    }
}
