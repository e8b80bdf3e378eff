//! 运行时选项。
//!
//! 所有时长以毫秒保存，便于 TOML 书写；对外通过 `Duration` 访问器读取。
//!
//! ```toml
//! enable_config_polling = true
//! poll_interval_ms = 2500
//! network_resolution = "external"
//! ```

use std::time::Duration;

use couchbase_topology::NetworkResolution;
use serde::Deserialize;

use crate::error::ConfigError;

/// 配置传播的可调参数，缺省值与服务端 SDK 的常见默认保持一致。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOptions {
    /// 是否启动后台轮询。
    pub enable_config_polling: bool,
    pub poll_interval_ms: u64,
    /// 单次拉取集群映射的超时。
    pub fetch_timeout_ms: u64,
    /// 节点返回低于推送版本的映射后，再次拉取前的等待。
    pub push_retry_interval_ms: u64,
    /// 同一推送版本的最大重试次数；更高版本的推送重置计数，同一版本的重复推送沿用计数。
    pub push_max_retries: u32,
    pub stream_backoff_initial_ms: u64,
    pub stream_backoff_max_ms: u64,
    /// 流式配置单行的最大字节数，超出即断开该连接。
    pub stream_max_line_bytes: usize,
    /// 剪除节点时等待在途操作结束的上限。
    pub prune_drain_timeout_ms: u64,
    /// 选择 KV 端点时使用 TLS 端口。
    pub enable_tls: bool,
    pub network_resolution: NetworkResolution,
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            enable_config_polling: true,
            poll_interval_ms: 2_500,
            fetch_timeout_ms: 2_500,
            push_retry_interval_ms: 100,
            push_max_retries: 50,
            stream_backoff_initial_ms: 10,
            stream_backoff_max_ms: 10_000,
            stream_max_line_bytes: 16 * 1024 * 1024,
            prune_drain_timeout_ms: 5_000,
            enable_tls: false,
            network_resolution: NetworkResolution::Auto,
        }
    }
}

impl ConfigOptions {
    /// 从 TOML 文本加载，缺失的键取缺省值，未知键报错。
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn push_retry_interval(&self) -> Duration {
        Duration::from_millis(self.push_retry_interval_ms)
    }

    pub fn stream_backoff_initial(&self) -> Duration {
        Duration::from_millis(self.stream_backoff_initial_ms)
    }

    pub fn stream_backoff_max(&self) -> Duration {
        Duration::from_millis(self.stream_backoff_max_ms)
    }

    pub fn prune_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.prune_drain_timeout_ms)
    }
}
