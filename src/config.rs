use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable naming a config file when `--config` is absent.
pub const CONFIG_ENV: &str = "FUNC_SANDBOX_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Each invocation runs in a child process killed at the deadline
    #[default]
    ChildProcess,
    /// Each invocation runs on a dedicated isolate thread in this process
    InProcess,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    #[serde(default)]
    pub isolation: Isolation,
    /// Used when a request carries no `timeout`
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Binary started with `--isolate`. Defaults to the current executable.
    /// Supports ${ENV_VAR} substitution
    #[serde(default)]
    pub isolate_program: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_max_heap_mb")]
    pub max_heap_mb: usize,
    /// Guest diagnostics forwarded per invocation, counted as encoded lines
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_max_stderr_bytes")]
    pub max_stderr_bytes: usize,
}

fn default_timeout_secs() -> u64 {
    1800
}

fn default_max_heap_mb() -> usize {
    512
}

fn default_max_output_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_max_stderr_bytes() -> usize {
    256 * 1024
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            isolation: Isolation::default(),
            default_timeout_secs: default_timeout_secs(),
            isolate_program: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_heap_mb: default_max_heap_mb(),
            max_output_bytes: default_max_output_bytes(),
            max_stderr_bytes: default_max_stderr_bytes(),
        }
    }
}

impl LimitsConfig {
    pub fn max_heap_bytes(&self) -> usize {
        self.max_heap_mb.saturating_mul(1024 * 1024)
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${FUNC_SANDBOX_HOME}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    /// `--config` wins over `FUNC_SANDBOX_CONFIG`; with neither, defaults.
    pub fn discover(flag: Option<&str>) -> anyhow::Result<Self> {
        match flag.map(String::from).or_else(|| std::env::var(CONFIG_ENV).ok()) {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// The binary spawned for out-of-process isolates.
    pub fn isolate_program(&self) -> anyhow::Result<PathBuf> {
        match &self.sandbox.isolate_program {
            Some(path) => Ok(path.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    // ── load tests ──────────────────────────────────────

    #[test]
    fn test_empty_file_uses_defaults() {
        let file = write_config("");
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.sandbox.isolation, Isolation::ChildProcess);
        assert_eq!(config.sandbox.default_timeout_secs, 1800);
        assert_eq!(config.limits.max_heap_mb, 512);
        assert_eq!(config.limits.max_output_bytes, 16 * 1024 * 1024);
        assert_eq!(config.limits.max_stderr_bytes, 256 * 1024);
    }

    #[test]
    fn test_full_config() {
        let file = write_config(
            r#"
[sandbox]
isolation = "in_process"
default_timeout_secs = 30
isolate_program = "/opt/func-sandbox"

[limits]
max_heap_mb = 64
max_output_bytes = 1024
max_stderr_bytes = 512
"#,
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.sandbox.isolation, Isolation::InProcess);
        assert_eq!(config.sandbox.default_timeout_secs, 30);
        assert_eq!(
            config.isolate_program().unwrap(),
            PathBuf::from("/opt/func-sandbox")
        );
        assert_eq!(config.limits.max_heap_bytes(), 64 * 1024 * 1024);
        assert_eq!(config.limits.max_output_bytes, 1024);
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("FUNC_SANDBOX_TEST_PROGRAM_DIR", "/srv/bin");
        let file = write_config(
            "[sandbox]\nisolate_program = \"${FUNC_SANDBOX_TEST_PROGRAM_DIR}/func-sandbox\"\n",
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(
            config.sandbox.isolate_program,
            Some(PathBuf::from("/srv/bin/func-sandbox"))
        );
    }

    #[test]
    fn test_unknown_isolation_is_rejected() {
        let file = write_config("[sandbox]\nisolation = \"vm\"\n");
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::load("/nonexistent/func-sandbox.toml").is_err());
    }

    #[test]
    fn test_discover_prefers_flag() {
        let file = write_config("[sandbox]\ndefault_timeout_secs = 7\n");
        let path = file.path().to_string_lossy().to_string();
        let config = Config::discover(Some(&path)).unwrap();
        assert_eq!(config.sandbox.default_timeout_secs, 7);
    }

    #[test]
    fn test_default_isolate_program_is_current_exe() {
        let config = Config::default();
        assert_eq!(
            config.isolate_program().unwrap(),
            std::env::current_exe().unwrap()
        );
    }
}
