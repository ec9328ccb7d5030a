//! Worker configuration
//!
//! Each connection setting resolves, first match wins:
//! 1. command-line flag
//! 2. environment variable (`EPOCH_NAMESPACE`, `EPOCH_TASK_QUEUE`, `EPOCH_ADDRESS`)
//! 3. the TOML file given with `--config`
//! 4. built-in default
//!
//! Flags and environment are merged by clap before they reach `resolve`.

use anyhow::Context;
use epoch_workflow::{RetryPolicy, WorkerOptions};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Contents of `worker.toml`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub(crate) struct WorkerConfig {
    pub(crate) namespace: Option<String>,
    pub(crate) task_queue: Option<String>,
    pub(crate) address: Option<String>,
    /// Protocol schema; the bundled canonical protocol when absent
    pub(crate) schema: Option<PathBuf>,
    pub(crate) retry: RetryConfig,
}

/// `[retry]` table; unset keys keep the policy default
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub(crate) struct RetryConfig {
    pub(crate) initial_interval_ms: Option<u64>,
    pub(crate) backoff_coefficient: Option<f64>,
    pub(crate) maximum_interval_ms: Option<u64>,
    pub(crate) maximum_attempts: Option<u32>,
    pub(crate) jitter: Option<f64>,
    pub(crate) start_to_close_ms: Option<u64>,
}

impl RetryConfig {
    pub(crate) fn policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::default();
        if let Some(ms) = self.initial_interval_ms {
            policy.initial_interval = Duration::from_millis(ms);
        }
        if let Some(coefficient) = self.backoff_coefficient {
            policy.backoff_coefficient = coefficient;
        }
        if let Some(ms) = self.maximum_interval_ms {
            policy.maximum_interval = Duration::from_millis(ms);
        }
        if let Some(attempts) = self.maximum_attempts {
            policy.maximum_attempts = attempts;
        }
        if let Some(jitter) = self.jitter {
            policy.jitter = jitter;
        }
        if let Some(ms) = self.start_to_close_ms {
            policy.start_to_close = Some(Duration::from_millis(ms));
        }
        policy
    }
}

impl WorkerConfig {
    pub(crate) fn load(path: &Path) -> anyhow::Result<Self> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&source).with_context(|| format!("invalid config {}", path.display()))
    }
}

/// Settings given on the command line or through the environment
#[derive(Debug, Clone, Default)]
pub(crate) struct Overrides {
    pub(crate) namespace: Option<String>,
    pub(crate) task_queue: Option<String>,
    pub(crate) address: Option<String>,
    pub(crate) schema: Option<PathBuf>,
}

/// Fully resolved worker settings
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Resolved {
    pub(crate) options: WorkerOptions,
    pub(crate) schema: Option<PathBuf>,
    pub(crate) retry: RetryPolicy,
}

pub(crate) fn resolve(overrides: Overrides, file: WorkerConfig) -> Resolved {
    let defaults = WorkerOptions::default();
    Resolved {
        options: WorkerOptions {
            namespace: overrides
                .namespace
                .or(file.namespace)
                .unwrap_or(defaults.namespace),
            task_queue: overrides
                .task_queue
                .or(file.task_queue)
                .unwrap_or(defaults.task_queue),
            address: overrides.address.or(file.address).unwrap_or(defaults.address),
        },
        schema: overrides.schema.or(file.schema),
        retry: file.retry.policy(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn defaults_apply_without_flags_or_file() {
        let resolved = resolve(Overrides::default(), WorkerConfig::default());
        assert_eq!(resolved.options, WorkerOptions::default());
        assert_eq!(resolved.schema, None);
        assert_eq!(resolved.retry, RetryPolicy::default());
    }

    #[test]
    fn flags_beat_the_file() {
        let file = WorkerConfig {
            namespace: Some("staging".into()),
            task_queue: Some("epochs-from-file".into()),
            ..WorkerConfig::default()
        };
        let overrides = Overrides {
            task_queue: Some("epochs-from-flag".into()),
            ..Overrides::default()
        };

        let resolved = resolve(overrides, file);
        assert_eq!(resolved.options.namespace, "staging");
        assert_eq!(resolved.options.task_queue, "epochs-from-flag");
        assert_eq!(resolved.options.address, "127.0.0.1:7233");
    }

    #[test]
    fn toml_file_with_retry_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
namespace = "prod"
address = "10.0.0.5:7233"
schema = "protocols/epoch.yaml"

[retry]
initial-interval-ms = 250
maximum-attempts = 10
start-to-close-ms = 5000
"#
        )
        .unwrap();

        let config = WorkerConfig::load(file.path()).unwrap();
        let resolved = resolve(Overrides::default(), config);

        assert_eq!(resolved.options.namespace, "prod");
        assert_eq!(resolved.options.task_queue, "epoch-protocol");
        assert_eq!(resolved.schema, Some(PathBuf::from("protocols/epoch.yaml")));
        assert_eq!(resolved.retry.initial_interval, Duration::from_millis(250));
        assert_eq!(resolved.retry.maximum_attempts, 10);
        assert_eq!(resolved.retry.start_to_close, Some(Duration::from_secs(5)));
        assert_eq!(resolved.retry.backoff_coefficient, 2.0);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "queue = \"typo\"").unwrap();
        assert!(WorkerConfig::load(file.path()).is_err());
    }
}
