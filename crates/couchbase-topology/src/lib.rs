#![doc = r#"
# couchbase-topology

## 定位（What）
- 描述 Couchbase 服务端下发的 bucket 拓扑快照：节点列表、扩展服务端口、vbucket 映射与能力集；
- 提供 `(epoch, revision)` 版本的全序比较，以及“是否为更新配置”“节点集合是否变化”
  “vbucket 映射是否变化”三类纯函数判定；
- 将 `nodes` 与 `nodesExt` 两个可能错位的数组按 `serverList` 顺序合并为 [`NodeAdapter`]。

## 契约（Contract）
- 本 crate 不含运行时与 I/O，所有类型均为同步、可 `Send + Sync` 共享的值；
- [`BucketConfig`] 在 [`BucketConfig::finish`] 之后视为不可变，下游以 `Arc<BucketConfig>`
  共享，被取代的快照直接丢弃而非原地修改；
- 服务端 JSON 的字段名与 vbucket 二维数组布局保持原样往返。

## 结构（How）
- [`version`]：`ConfigVersion` 与 `is_newer`；
- [`endpoint`]：主机名端口剥离与 `HostEndpoint`；
- [`node`] / [`vbucket`]：服务端 DTO；
- [`config`]：`BucketConfig` 快照与后处理；
- [`adapter`]：节点合并算法与 `NodeAdapter`；
- [`compare`]：变更判定函数。
"#]

pub mod adapter;
pub mod compare;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod node;
pub mod vbucket;
pub mod version;

pub use adapter::{NodeAdapter, ServicePorts};
pub use compare::{has_cluster_nodes_changed, has_config_changes, has_vbucket_map_changed};
pub use config::{BucketConfig, NetworkResolution};
pub use endpoint::HostEndpoint;
pub use error::TopologyError;
pub use node::{AlternateAddress, AlternateAddresses, Node, NodeExt, NodePorts, Services};
pub use vbucket::VBucketServerMap;
pub use version::{ConfigVersion, is_newer};

/// 服务端在单节点集群中使用的主机名占位符，需替换为引导时使用的主机。
pub const HOST_PLACEHOLDER: &str = "$HOST";
