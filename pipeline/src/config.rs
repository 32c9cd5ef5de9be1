use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ductwork_core::{Error, Result, Severity};
use ductwork_kafka::KafkaConfig;
use ductwork_middleware::{BackoffConfig, SinkRetryConfig};
use ductwork_pubsub::PubSubConfig;

/// Which source provider feeds this pipeline, and that provider's options.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum InputConfig {
    Kafka(KafkaConfig),
    PubSub(PubSubConfig),
}

/// Which engine drives a Kafka (`Stream`-backed) input. Ignored for
/// Pub/Sub inputs, which are always driven by `JobPoolEngine` since
/// `MessagePool` has no per-stream ordering to preserve.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    /// `StreamEngine`: one message at a time, in order.
    Stream,
    /// `BatchStreamEngine`: accumulate up to `batch_size` (or
    /// `batch_timeout_ms`) before calling the handler once per batch.
    BatchStream,
    /// `RunOnceEngine`: drain one batch and exit; for cron-triggered jobs
    /// rather than long-running services.
    RunOnce,
}

impl Default for EngineMode {
    fn default() -> EngineMode {
        EngineMode::Stream
    }
}

/// Backoff shape, expressed in the serde-friendly millisecond form every
/// other duration in this struct uses; converted to
/// `ductwork_middleware::BackoffConfig` via [`BackoffSettings::to_backoff_config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackoffSettings {
    #[serde(default = "BackoffSettings::default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "BackoffSettings::default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "BackoffSettings::default_spread")]
    pub spread: f64,
    #[serde(default = "BackoffSettings::default_factor")]
    pub factor: f64,
    #[serde(default = "BackoffSettings::default_max_retries")]
    pub max_retries: i64,
}

impl BackoffSettings {
    fn default_initial_delay_ms() -> u64 {
        200
    }
    fn default_max_delay_ms() -> u64 {
        10_000
    }
    fn default_spread() -> f64 {
        0.2
    }
    fn default_factor() -> f64 {
        1.5
    }
    fn default_max_retries() -> i64 {
        -1
    }

    pub fn to_backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            spread: self.spread,
            factor: self.factor,
            max_retries: self.max_retries,
        }
    }
}

impl Default for BackoffSettings {
    fn default() -> BackoffSettings {
        BackoffSettings {
            initial_delay_ms: Self::default_initial_delay_ms(),
            max_delay_ms: Self::default_max_delay_ms(),
            spread: Self::default_spread(),
            factor: Self::default_factor(),
            max_retries: Self::default_max_retries(),
        }
    }
}

/// Dead-letter routing options.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DlqSettings {
    /// Topic failed messages are shelved to. `None` (or `noop: true`) means
    /// failed, non-fatal messages are logged and dropped instead.
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub noop: bool,
}

impl Default for DlqSettings {
    fn default() -> DlqSettings {
        DlqSettings {
            topic: None,
            noop: true,
        }
    }
}

/// Top-level pipeline configuration: everything needed to wire a source,
/// engine, retry/DLQ middleware and sink together.
///
/// Every duration is represented in milliseconds so the struct stays
/// directly `serde`-deserializable without a custom `Duration` visitor;
/// code that needs a `Duration` converts at the point of use.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_system_name")]
    pub system_name: String,

    pub input: InputConfig,

    #[serde(default)]
    pub engine_mode: EngineMode,

    #[serde(default = "Config::default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "Config::default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "Config::default_processing_timeout_ms")]
    pub processing_timeout_ms: u64,
    #[serde(default = "Config::default_n_workers")]
    pub n_workers: usize,

    #[serde(default)]
    pub backoff: BackoffSettings,
    #[serde(default)]
    pub dlq: DlqSettings,
    #[serde(default)]
    pub sink_retry: SinkRetrySettings,

    #[serde(default = "Config::default_stale_after_ms")]
    pub stale_after_ms: u64,
}

impl Config {
    fn default_system_name() -> String {
        "ductwork".to_string()
    }
    fn default_batch_size() -> usize {
        1
    }
    fn default_batch_timeout_ms() -> u64 {
        1_000
    }
    fn default_processing_timeout_ms() -> u64 {
        0
    }
    fn default_n_workers() -> usize {
        num_cpus::get()
    }
    fn default_stale_after_ms() -> u64 {
        60_000
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    /// `0` means no processing timeout is configured: the handler stack
    /// skips `TimeoutHandler` entirely rather than wrapping it with a
    /// zero-duration deadline.
    pub fn processing_timeout(&self) -> Option<Duration> {
        if self.processing_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.processing_timeout_ms))
        }
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    /// Loads this pipeline's configuration from a JSON file at `path`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let file = File::open(path).map_err(|e| Error::wrap("config.from_file", Severity::Fatal, e))?;
        Config::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Config> {
        serde_json::from_reader(reader).map_err(|e| Error::wrap("config.from_reader", Severity::Fatal, e))
    }

    /// Rejects configurations that would build a runtime that can never
    /// make progress: an empty system name (used as the metrics label for
    /// every wrapped handler) or, for a Kafka input, an empty broker or
    /// topic list.
    pub fn validate(&self) -> Result<()> {
        if self.system_name.trim().is_empty() {
            return Err(Error::msg(
                "config.validate",
                Severity::Fatal,
                "system_name must not be empty",
            ));
        }
        if let InputConfig::Kafka(kafka) = &self.input {
            if kafka.brokers.is_empty() {
                return Err(Error::msg(
                    "config.validate",
                    Severity::Fatal,
                    "kafka input requires at least one broker",
                ));
            }
            if kafka.topics.is_empty() {
                return Err(Error::msg(
                    "config.validate",
                    Severity::Fatal,
                    "kafka input requires at least one topic",
                ));
            }
        }
        Ok(())
    }
}

/// Backoff shape for the sink retrier, expressed the same millisecond way
/// as [`BackoffSettings`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SinkRetrySettings {
    #[serde(default = "SinkRetrySettings::default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "SinkRetrySettings::default_max_extra_jitter_ms")]
    pub max_extra_jitter_ms: u64,
    #[serde(default = "SinkRetrySettings::default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "SinkRetrySettings::default_max_attempts")]
    pub max_attempts: u32,
}

impl SinkRetrySettings {
    fn default_base_backoff_ms() -> u64 {
        2_000
    }
    fn default_max_extra_jitter_ms() -> u64 {
        250
    }
    fn default_multiplier() -> f64 {
        2.0
    }
    fn default_max_attempts() -> u32 {
        5
    }

    pub fn to_sink_retry_config(&self) -> SinkRetryConfig {
        SinkRetryConfig {
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_extra_jitter: Duration::from_millis(self.max_extra_jitter_ms),
            multiplier: self.multiplier,
            max_attempts: self.max_attempts,
        }
    }
}

impl Default for SinkRetrySettings {
    fn default() -> SinkRetrySettings {
        SinkRetrySettings {
            base_backoff_ms: Self::default_base_backoff_ms(),
            max_extra_jitter_ms: Self::default_max_extra_jitter_ms(),
            multiplier: Self::default_multiplier(),
            max_attempts: Self::default_max_attempts(),
        }
    }
}
