//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 配置传播链路上的失败全部在后台任务内消化：记录日志后继续使用最后一次接纳的配置；
//! - 本枚举只在同步入口（发布、引导、加载选项）向调用方返回，后台路径把它写进日志字段。
//!
//! ## 分类（What）
//! - 过期配置（版本不更新）不是错误，而是 [`PublishOutcome::Stale`](crate::PublishOutcome::Stale)
//!   或静默丢弃；
//! - 派发通道发现顺序被破坏时只打 `error` 日志并丢弃，不构造错误值。

use std::time::Duration;

use couchbase_topology::TopologyError;
use thiserror::Error;

/// 配置传播子系统的错误域。
///
/// # 教案式说明
/// - **契约 (What)**：所有变体均为 `Send + Sync + 'static`，可跨任务传播；上下文以 `String`
///   保存，便于直接进入结构化日志；
/// - **重试语义 (How)**：[`ConfigError::is_transient`] 区分“下一次推送/轮询自然会重试”的瞬时失败与
///   需要调用方介入的失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 没有任何可用节点能返回集群映射（全部失效或缺少 KV 服务）。
    #[error("no viable node could serve the cluster map for bucket `{bucket}`")]
    BootstrapFailure { bucket: String },

    /// 配置文档无法解析或缺少必要字段，候选配置被丢弃。
    #[error("malformed cluster map for bucket `{bucket}`: {detail}")]
    MalformedConfig { bucket: String, detail: String },

    /// 从节点拉取配置时出现 I/O 或协议错误。
    #[error("fetching cluster map from `{endpoint}` failed: {detail}")]
    Fetch { endpoint: String, detail: String },

    /// 拉取超过了 `fetch_timeout`。
    #[error("fetching cluster map from `{endpoint}` timed out after {timeout:?}")]
    FetchTimeout { endpoint: String, timeout: Duration },

    /// 流式配置源发来的单行超过上限，连接被丢弃。
    #[error("config stream from `{endpoint}` sent a line longer than {limit} bytes")]
    StreamLineTooLong { endpoint: String, limit: usize },

    /// 操作因关闭而被取消。
    #[error("operation cancelled by shutdown")]
    Cancelled,

    /// 派发器已停止，不再接受发布或订阅。
    #[error("config handler has been stopped")]
    ContextStopped,

    /// 请求的 bucket 尚未注册。
    #[error("bucket `{bucket}` is not registered")]
    BucketMissing { bucket: String },

    /// 当前配置未声明所需能力，例如在 memcached bucket 上使用 collections。
    #[error("bucket `{bucket}` does not support `{capability}`")]
    Unsupported { bucket: String, capability: String },

    /// TOML 选项解析失败。
    #[error("invalid config options: {0}")]
    Options(#[from] toml::de::Error),

    /// 拓扑层错误。
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

impl ConfigError {
    /// 由拓扑错误构造带 bucket 上下文的 `MalformedConfig`。
    pub fn malformed(bucket: impl Into<String>, source: &TopologyError) -> Self {
        ConfigError::MalformedConfig {
            bucket: bucket.into(),
            detail: source.to_string(),
        }
    }

    /// 失败是否会在下一次推送或轮询时自然重试。
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConfigError::BootstrapFailure { .. }
                | ConfigError::Fetch { .. }
                | ConfigError::FetchTimeout { .. }
                | ConfigError::StreamLineTooLong { .. }
                | ConfigError::MalformedConfig { .. }
                | ConfigError::Topology(_)
        )
    }
}
