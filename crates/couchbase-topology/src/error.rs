//! 拓扑解析错误。
//!
//! 合并节点、比较版本均为尽力而为且不会失败；只有反序列化与基本字段校验会产生错误。

use thiserror::Error;

/// 配置文档无法被接纳为 [`BucketConfig`](crate::BucketConfig)。
#[derive(Debug, Error)]
pub enum TopologyError {
    /// JSON 结构或字段类型不符合服务端约定。
    #[error("malformed cluster map document: {source}")]
    Malformed {
        #[source]
        source: serde_json::Error,
    },

    /// 文档缺少 bucket 名称，无法路由到任何订阅者。
    #[error("cluster map document carries no bucket name")]
    MissingBucketName,
}

impl From<serde_json::Error> for TopologyError {
    fn from(source: serde_json::Error) -> Self {
        TopologyError::Malformed { source }
    }
}
