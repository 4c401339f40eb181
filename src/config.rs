use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SandboxConfig {
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Resource limits for one invocation. Every field has a default, so an
/// empty config file (or no file at all) yields a working sandbox.
#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Wall-clock budget per invocation, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Concurrent-timer cap per invocation.
    #[serde(default = "default_max_timers")]
    pub max_timers: usize,
    /// Log entry-count cap per invocation.
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
    /// Per-entry formatted-text cap, in characters.
    #[serde(default = "default_max_log_entry_chars")]
    pub max_log_entry_chars: usize,
    /// Cumulative character budget across all log entries.
    #[serde(default = "default_max_log_total_chars")]
    pub max_log_total_chars: usize,
    /// Serialized-result size cap, in characters.
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,
    /// Optional QuickJS heap limit, in bytes.
    #[serde(default)]
    pub memory_limit_bytes: Option<usize>,
    /// Optional QuickJS stack limit, in bytes.
    #[serde(default)]
    pub max_stack_bytes: Option<usize>,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_timers() -> usize {
    100
}

fn default_max_log_entries() -> usize {
    200
}

fn default_max_log_entry_chars() -> usize {
    2_000
}

fn default_max_log_total_chars() -> usize {
    20_000
}

fn default_max_result_chars() -> usize {
    50_000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_timers: default_max_timers(),
            max_log_entries: default_max_log_entries(),
            max_log_entry_chars: default_max_log_entry_chars(),
            max_log_total_chars: default_max_log_total_chars(),
            max_result_chars: default_max_result_chars(),
            memory_limit_bytes: None,
            max_stack_bytes: None,
        }
    }
}

impl SandboxConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${SANDBOX_TIMEOUT_MS}
        let expanded = shellexpand::env(&content)?;
        let config: SandboxConfig = toml::from_str(&expanded)?;
        Ok(config)
    }
}
