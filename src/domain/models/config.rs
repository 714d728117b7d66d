use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Process-level configuration for the controller binary
///
/// This is distinct from [`ControllerConfig`](super::ControllerConfig), which is
/// read from the cluster at runtime and may change while the process runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Namespace holding the controller's configuration resource
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Name of the configuration resource to watch
    #[serde(default = "default_config_map")]
    pub config_map: String,

    /// Number of concurrent workflow reconciliation workers
    #[serde(default = "default_workers")]
    pub workflow_workers: usize,

    /// Number of concurrent pod event workers
    #[serde(default = "default_workers")]
    pub pod_workers: usize,

    /// Capacity of the completed-pod labeling channel
    #[serde(default = "default_completed_pods_capacity")]
    pub completed_pods_capacity: usize,

    /// Full resync period of the workflow cache, in seconds
    #[serde(default = "default_workflow_resync_secs")]
    pub workflow_resync_secs: u64,

    /// Full resync period of the pod cache, in seconds
    #[serde(default = "default_pod_resync_secs")]
    pub pod_resync_secs: u64,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Overall token bucket shared by requeued keys
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Per-key requeue policy after a failed reconciliation pass
    #[serde(default)]
    pub requeue: RequeueConfig,
}

fn default_namespace() -> String {
    "kube-system".to_string()
}

fn default_config_map() -> String {
    "workflow-controller-configmap".to_string()
}

const fn default_workers() -> usize {
    8
}

const fn default_completed_pods_capacity() -> usize {
    512
}

const fn default_workflow_resync_secs() -> u64 {
    20 * 60
}

const fn default_pod_resync_secs() -> u64 {
    30 * 60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            config_map: default_config_map(),
            workflow_workers: default_workers(),
            pod_workers: default_workers(),
            completed_pods_capacity: default_completed_pods_capacity(),
            workflow_resync_secs: default_workflow_resync_secs(),
            pod_resync_secs: default_pod_resync_secs(),
            logging: LoggingConfig::default(),
            rate_limit: RateLimitConfig::default(),
            requeue: RequeueConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Rotation of log files: daily, hourly or never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RateLimitConfig {
    /// Requeues per second allowed across all keys
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,

    /// Burst size for token bucket
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

const fn default_requests_per_second() -> f64 {
    10.0
}

const fn default_burst_size() -> u32 {
    100
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst_size: default_burst_size(),
        }
    }
}

/// Requeue policy for keys whose reconciliation pass failed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RequeueConfig {
    /// Attempts before a key is dropped until its next event
    #[serde(default = "default_max_requeues")]
    pub max_requeues: u32,

    /// Initial per-key backoff delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum per-key backoff delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_max_requeues() -> u32 {
    5
}

const fn default_initial_backoff_ms() -> u64 {
    5
}

const fn default_max_backoff_ms() -> u64 {
    1_000_000
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            max_requeues: default_max_requeues(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}
