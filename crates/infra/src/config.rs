//! Coordinator configuration.
//!
//! One explicit struct, built once at startup and handed to each stage when it
//! is constructed. Values come from `ANNOFLOW_*` environment variables
//! (`DATABASE_URL` / `REDIS_URL` for backends); anything unset keeps its
//! development default.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use annoflow_events::{MAX_RECEIVE_MESSAGES, MAX_RECEIVE_WAIT, ReceiveOptions};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Queue polling parameters shared by every stage worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    pub max_messages: usize,
    pub wait: Duration,
    pub visibility_timeout: Duration,
}

impl PollConfig {
    pub fn receive_options(&self) -> ReceiveOptions {
        ReceiveOptions::new(self.max_messages, self.wait)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_messages: MAX_RECEIVE_MESSAGES,
            wait: MAX_RECEIVE_WAIT,
            visibility_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub inputs_bucket: String,
    pub results_bucket: String,
    /// Results are written under `{results_prefix}/{user_id}/…`.
    pub results_prefix: String,
    pub vault: String,
    pub presigned_ttl: Duration,
    /// Root directory for the filesystem object store (one dir per bucket).
    pub root_dir: PathBuf,
    /// Cold-storage vaults and the archival execution journal, used when job
    /// records are durable.
    pub state_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            inputs_bucket: "annoflow-inputs".into(),
            results_bucket: "annoflow-results".into(),
            results_prefix: "results".into(),
            vault: "annoflow-vault".into(),
            presigned_ttl: Duration::from_secs(60),
            root_dir: PathBuf::from("data/objects"),
            state_dir: PathBuf::from("data/state"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatorConfig {
    /// Local working directory; inputs land here as `{job_id}~{file}`.
    pub jobs_dir: PathBuf,
    /// Tool command line; `{input}` is replaced with the local input path.
    pub command: Vec<String>,
    /// Result file is `{stem}{result_suffix}`, stem = input name minus extension.
    pub result_suffix: String,
    /// Log file is `{input_file_name}{log_suffix}`.
    pub log_suffix: String,
    pub sweep_interval: Duration,
}

impl Default for AnnotatorConfig {
    fn default() -> Self {
        Self {
            jobs_dir: PathBuf::from("data/jobs"),
            command: vec!["anntools".into(), "{input}".into()],
            result_suffix: ".annot.vcf".into(),
            log_suffix: ".count.log".into(),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveConfig {
    /// How long an archival execution waits before acting.
    pub grace_period: Duration,
    pub tick_interval: Duration,
    pub reconcile_interval: Duration,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(180),
            tick_interval: Duration::from_secs(1),
            reconcile_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyConfig {
    pub sender: String,
    /// Prefix of the job detail link; the job id is appended.
    pub job_link_base: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            sender: "annoflow@localhost".into(),
            job_link_base: "http://localhost:8080/jobs/".into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendConfig {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub bind: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub poll: PollConfig,
    pub storage: StorageConfig,
    pub annotator: AnnotatorConfig,
    pub archive: ArchiveConfig,
    pub notify: NotifyConfig,
    pub backends: BackendConfig,
    pub http: HttpConfig,
}

impl CoordinatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("ANNOFLOW_POLL_MAX_MESSAGES") {
            let n: usize = parse("ANNOFLOW_POLL_MAX_MESSAGES", &v)?;
            cfg.poll.max_messages = n.clamp(1, MAX_RECEIVE_MESSAGES);
        }
        if let Some(v) = get("ANNOFLOW_POLL_WAIT_SECS") {
            cfg.poll.wait = secs("ANNOFLOW_POLL_WAIT_SECS", &v)?.min(MAX_RECEIVE_WAIT);
        }
        if let Some(v) = get("ANNOFLOW_VISIBILITY_TIMEOUT_SECS") {
            cfg.poll.visibility_timeout = secs("ANNOFLOW_VISIBILITY_TIMEOUT_SECS", &v)?;
        }

        if let Some(v) = get("ANNOFLOW_INPUTS_BUCKET") {
            cfg.storage.inputs_bucket = v;
        }
        if let Some(v) = get("ANNOFLOW_RESULTS_BUCKET") {
            cfg.storage.results_bucket = v;
        }
        if let Some(v) = get("ANNOFLOW_RESULTS_PREFIX") {
            cfg.storage.results_prefix = v.trim_matches('/').to_string();
        }
        if let Some(v) = get("ANNOFLOW_VAULT") {
            cfg.storage.vault = v;
        }
        if let Some(v) = get("ANNOFLOW_PRESIGNED_TTL_SECS") {
            cfg.storage.presigned_ttl = secs("ANNOFLOW_PRESIGNED_TTL_SECS", &v)?;
        }
        if let Some(v) = get("ANNOFLOW_STORAGE_ROOT") {
            cfg.storage.root_dir = PathBuf::from(v);
        }
        if let Some(v) = get("ANNOFLOW_STATE_DIR") {
            cfg.storage.state_dir = PathBuf::from(v);
        }

        if let Some(v) = get("ANNOFLOW_JOBS_DIR") {
            cfg.annotator.jobs_dir = PathBuf::from(v);
        }
        if let Some(v) = get("ANNOFLOW_ANNOTATOR_CMD") {
            cfg.annotator.command = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = get("ANNOFLOW_SWEEP_INTERVAL_SECS") {
            cfg.annotator.sweep_interval = secs("ANNOFLOW_SWEEP_INTERVAL_SECS", &v)?;
        }

        if let Some(v) = get("ANNOFLOW_ARCHIVE_GRACE_SECS") {
            cfg.archive.grace_period = secs("ANNOFLOW_ARCHIVE_GRACE_SECS", &v)?;
        }
        if let Some(v) = get("ANNOFLOW_RECONCILE_INTERVAL_SECS") {
            cfg.archive.reconcile_interval = secs("ANNOFLOW_RECONCILE_INTERVAL_SECS", &v)?;
        }

        if let Some(v) = get("ANNOFLOW_MAIL_SENDER") {
            cfg.notify.sender = v;
        }
        if let Some(v) = get("ANNOFLOW_JOB_LINK_BASE") {
            cfg.notify.job_link_base = v;
        }

        cfg.backends.database_url = get("DATABASE_URL");
        cfg.backends.redis_url = get("REDIS_URL");

        if let Some(v) = get("ANNOFLOW_HTTP_ADDR") {
            cfg.http.bind = parse("ANNOFLOW_HTTP_ADDR", &v)?;
        }

        Ok(cfg)
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: core::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn secs(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(key, value).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<CoordinatorConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CoordinatorConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let cfg = from_pairs(&[]).unwrap();
        assert_eq!(cfg, CoordinatorConfig::default());
        assert_eq!(cfg.archive.grace_period, Duration::from_secs(180));
        assert!(cfg.backends.database_url.is_none());
    }

    #[test]
    fn poll_limits_are_clamped_to_contract() {
        let cfg = from_pairs(&[
            ("ANNOFLOW_POLL_MAX_MESSAGES", "50"),
            ("ANNOFLOW_POLL_WAIT_SECS", "60"),
        ])
        .unwrap();
        assert_eq!(cfg.poll.max_messages, 10);
        assert_eq!(cfg.poll.wait, Duration::from_secs(20));
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = from_pairs(&[
            ("ANNOFLOW_VAULT", "cold"),
            ("ANNOFLOW_RESULTS_PREFIX", "/out/"),
            ("ANNOFLOW_ANNOTATOR_CMD", "python run.py {input}"),
            ("DATABASE_URL", "postgres://localhost/annoflow"),
            ("ANNOFLOW_HTTP_ADDR", "127.0.0.1:9000"),
            ("ANNOFLOW_STATE_DIR", "/var/lib/annoflow"),
        ])
        .unwrap();
        assert_eq!(cfg.storage.state_dir, PathBuf::from("/var/lib/annoflow"));
        assert_eq!(cfg.storage.vault, "cold");
        assert_eq!(cfg.storage.results_prefix, "out");
        assert_eq!(cfg.annotator.command, ["python", "run.py", "{input}"]);
        assert_eq!(cfg.backends.database_url.as_deref(), Some("postgres://localhost/annoflow"));
        assert_eq!(cfg.http.bind.port(), 9000);
    }

    #[test]
    fn invalid_number_is_reported_with_key() {
        let err = from_pairs(&[("ANNOFLOW_ARCHIVE_GRACE_SECS", "soon")]).unwrap_err();
        let ConfigError::Invalid { key, .. } = err;
        assert_eq!(key, "ANNOFLOW_ARCHIVE_GRACE_SECS");
    }
}
