use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

/// Server configuration.
///
/// Loaded in layers: defaults, then an optional YAML file named by
/// `H1LOOP_CONFIG`, then environment overrides (`LISTEN`,
/// `H1LOOP_WORKERS`, `H1LOOP_IDLE_TIMEOUT_MS`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    /// Number of event-loop threads.
    pub worker_threads: usize,
    /// Idle window before the first request and between requests.
    pub idle_timeout_ms: u64,
    /// Period of each worker's timeout scan.
    pub tick_interval_ms: u64,
    /// Add `Server: h1loop` to responses that do not set one.
    pub server_header: bool,
    pub max_header_size: usize,
    pub read_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            idle_timeout_ms: 120_000,
            tick_interval_ms: 1_000,
            server_header: true,
            max_header_size: 64 * 1024,
            read_buffer_size: 4096,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var("H1LOOP_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };

        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Ok(addr) = std::env::var("LISTEN") {
            self.listen_addr = addr;
        }
        if let Ok(workers) = std::env::var("H1LOOP_WORKERS") {
            self.worker_threads = workers
                .parse()
                .with_context(|| format!("invalid H1LOOP_WORKERS: {workers}"))?;
        }
        if let Ok(ms) = std::env::var("H1LOOP_IDLE_TIMEOUT_MS") {
            self.idle_timeout_ms = ms
                .parse()
                .with_context(|| format!("invalid H1LOOP_IDLE_TIMEOUT_MS: {ms}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_threads == 0 {
            bail!("worker_threads must be at least 1");
        }
        if self.idle_timeout_ms == 0 {
            bail!("idle_timeout_ms must be non-zero");
        }
        if self.tick_interval_ms == 0 {
            bail!("tick_interval_ms must be non-zero");
        }
        if self.max_header_size < 1024 {
            bail!("max_header_size must be at least 1024 bytes");
        }
        if self.read_buffer_size < 512 {
            bail!("read_buffer_size must be at least 512 bytes");
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_fields_override_defaults() {
        let cfg = Config::from_yaml("worker_threads: 3\nidle_timeout_ms: 500\nserver_header: false\n").unwrap();

        assert_eq!(cfg.worker_threads, 3);
        assert_eq!(cfg.idle_timeout(), Duration::from_millis(500));
        assert!(!cfg.server_header);
        assert_eq!(cfg.listen_addr, "127.0.0.1:8080");
        assert_eq!(cfg.tick_interval(), Duration::from_secs(1));
    }

    #[test]
    fn validation_rejects_zero_durations() {
        let cfg = Config {
            tick_interval_ms: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            worker_threads: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn mistyped_field_is_an_error() {
        assert!(Config::from_yaml("worker_threads: lots").is_err());
    }
}
