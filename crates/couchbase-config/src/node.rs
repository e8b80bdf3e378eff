//! 节点连接的协作者契约。
//!
//! # 教案式说明
//! - **边界 (What)**：真正的 KV/HTTP 传输不在本 crate 内；这里只声明配置传播需要的最小能力面：
//!   健康状态、KV 能力、拉取集群映射与关闭；
//! - **共享 (How)**：节点以 `Arc<dyn ClusterNode>` 在节点集合、租约与后台任务之间共享，
//!   因此所有方法只取 `&self`。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use couchbase_topology::{BucketConfig, ConfigVersion, HostEndpoint, NodeAdapter};
use tokio_util::sync::CancellationToken;

use crate::error::ConfigError;

/// 一条到集群节点的连接。
#[async_trait]
pub trait ClusterNode: Send + Sync + fmt::Debug {
    /// 节点集合中的键：主机名 + KV 端口。
    fn endpoint(&self) -> &HostEndpoint;

    /// 连接是否已失效。
    fn is_dead(&self) -> bool;

    /// 节点是否提供 KV 服务。
    fn has_kv(&self) -> bool;

    /// 当前已建立的 KV 端点；为空表示尚无可用通道。
    fn key_endpoints(&self) -> Vec<HostEndpoint> {
        vec![self.endpoint().clone()]
    }

    /// 向节点请求 `bucket` 的当前集群映射。
    ///
    /// - `since`：调用方已知的最新版本，节点可据此返回更紧凑的响应；
    /// - `cancel`：关闭时触发，实现应尽快返回 [`ConfigError::Cancelled`]。
    ///
    /// 返回的配置应已完成 [`BucketConfig::finish`]。
    async fn get_cluster_map(
        &self,
        bucket: &str,
        since: Option<ConfigVersion>,
        cancel: CancellationToken,
    ) -> Result<BucketConfig, ConfigError>;

    /// 关闭连接；被剪除的节点在在途操作结束后调用。
    async fn close(&self);
}

/// 节点连接工厂。
#[async_trait]
pub trait NodeFactory: Send + Sync {
    /// 建立到 `endpoint` 的连接。引导阶段尚无拓扑信息，`adapter` 为 `None`。
    async fn create_and_connect(
        &self,
        endpoint: HostEndpoint,
        adapter: Option<NodeAdapter>,
    ) -> Result<Arc<dyn ClusterNode>, ConfigError>;
}

/// 节点是否可用于拉取配置：存活、提供 KV 且至少有一个 KV 端点。
pub(crate) fn is_viable(node: &dyn ClusterNode) -> bool {
    !node.is_dead() && node.has_kv() && !node.key_endpoints().is_empty()
}
