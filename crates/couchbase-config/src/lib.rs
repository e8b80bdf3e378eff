#![doc = r#"
# couchbase-config

## 定位（What）
- 接收服务端推送的“配置已变更”通知、轮询或流式读取集群映射，判定新配置是否取代当前配置，
  并把被接纳的配置按序交付给 bucket 与节点连接管理；
- 只依赖 `couchbase-topology` 的值类型；传输层通过 [`ClusterNode`]、[`NodeFactory`]、
  [`ConfigStreamSource`] 三个 trait 注入。

## 数据流（How）
1. 节点连接观察到更新版本 → [`Bucket::process_config_push`]；
2. [`ConfigPushHandler`] 合并推送、挑选节点拉取映射，拉到更新版本则经
   [`ClusterContext::publish_config`] 交给 [`ConfigHandler`]；
3. [`ConfigHandler`] 在每个 bucket 的闸门内做最终版本比较，按序调用订阅者的
   [`ConfigUpdateSink::config_updated`]；
4. [`Bucket`] 原子替换当前配置；节点集合变化时由 [`ClusterContext::process_cluster_map`]
   建连并剪除消失的节点。

## 失败策略（Contract）
- 后台路径上的任何失败都只记录日志，应用继续使用最后一次接纳的配置；
- 同一 bucket 交付给订阅者的配置版本严格递增。
"#]

pub mod bucket;
pub mod collection;
pub mod context;
pub mod error;
pub mod handler;
pub mod node;
pub mod options;
pub mod push;
pub mod stream;

pub use bucket::{Bucket, ConfigUpdateSink};
pub use collection::{NodeCollection, NodeEntry, NodeLease};
pub use context::ClusterContext;
pub use error::ConfigError;
pub use handler::{ConfigHandler, ConfigPoller, PublishOutcome};
pub use node::{ClusterNode, NodeFactory};
pub use options::ConfigOptions;
pub use push::ConfigPushHandler;
pub use stream::{ConfigStreamListener, ConfigStreamSource, StreamBackoff};
