use serde::Deserialize;
use span_buffer::BufferConfig;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // General
    pub general: GeneralConfig,

    // Buffer tuning
    #[serde(default)]
    pub buffer: BufferConfig,

    // Ingest and flush loop
    #[serde(default)]
    pub worker: WorkerConfig,

    // Metrics
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    /// Spans collected before a batch is written
    pub batch_size: usize,
    /// Cadence of the flush loop
    pub flush_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_ms: 1000,
        }
    }
}

impl WorkerConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.buffer.validate()?;
        if config.worker.batch_size == 0 {
            anyhow::bail!("worker.batch_size must be at least 1");
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("Failed to create temp file");
        file.write_all(contents.as_bytes()).expect("Failed to write config");
        file
    }

    #[test]
    fn test_load_full_config() {
        let file = write_config(
            r#"
            [general]
            log_level = "debug"

            [buffer]
            short_linger_secs = 5
            long_linger_secs = 30
            ttl_margin_secs = 60
            num_shards = 4
            max_flush_segments = 50

            [worker]
            batch_size = 10
            flush_interval_ms = 250

            [metrics]
            enabled = false
            host = "127.0.0.1"
            port = 9102
            "#,
        );

        let config = Config::load(file.path()).expect("config should load");
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.buffer.num_shards, 4);
        assert_eq!(config.buffer.segment_ttl(), Duration::from_secs(90));
        assert_eq!(config.worker.batch_size, 10);
        assert_eq!(config.worker.flush_interval(), Duration::from_millis(250));
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_buffer_and_worker_sections_are_optional() {
        let file = write_config(
            r#"
            [general]
            log_level = "info"

            [metrics]
            enabled = true
            host = "0.0.0.0"
            port = 9102
            "#,
        );

        let config = Config::load(file.path()).expect("config should load");
        assert_eq!(config.buffer, BufferConfig::default());
        assert_eq!(config.worker.batch_size, 100);
    }

    #[test]
    fn test_invalid_buffer_config_is_rejected() {
        let file = write_config(
            r#"
            [general]
            log_level = "info"

            [buffer]
            short_linger_secs = 60
            long_linger_secs = 10

            [metrics]
            enabled = false
            host = "127.0.0.1"
            port = 9102
            "#,
        );

        assert!(Config::load(file.path()).is_err());
    }
}
