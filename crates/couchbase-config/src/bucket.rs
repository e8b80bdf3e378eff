//! # Bucket：配置订阅者与当前配置持有者
//!
//! ## 核心意图（Why）
//! - 请求路由持续读取“当前配置”；它以 `ArcSwapOption<BucketConfig>` 保存，写入为整份替换，
//!   读者拿到的永远是完整的旧快照或完整的新快照；
//! - 每个 bucket 拥有自己的 [`ConfigPushHandler`]，不同 bucket 的推送互不阻塞。
//!
//! ## 行为契约（What）
//! - `config_updated`：仅当 [`has_config_changes`] 判定为更新时应用；应用顺序为
//!   “替换快照 → 抬高推送处理器的已知版本 → 节点集合变化或仍有未建连节点时收敛节点 → 记录映射变化”；
//! - `wait_for_version`：等待当前配置达到某版本，供引导流程与测试同步使用。

use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use couchbase_topology::{
    BucketConfig, ConfigVersion, has_cluster_nodes_changed, has_config_changes,
    has_vbucket_map_changed,
};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::context::ClusterContext;
use crate::error::ConfigError;
use crate::push::ConfigPushHandler;

/// 已接纳配置的接收方。
#[async_trait]
pub trait ConfigUpdateSink: Send + Sync {
    /// 订阅的 bucket 名称。
    fn name(&self) -> &str;

    /// 派发器按版本递增顺序调用；实现不应长时间阻塞，耗时工作请另行派生任务。
    async fn config_updated(&self, config: Arc<BucketConfig>);
}

/// 已注册的 bucket。
pub struct Bucket {
    name: String,
    current: ArcSwapOption<BucketConfig>,
    applied: watch::Sender<ConfigVersion>,
    push: ConfigPushHandler,
    context: Weak<ClusterContext>,
}

impl Bucket {
    pub(crate) fn new(name: &str, push: ConfigPushHandler, context: Weak<ClusterContext>) -> Self {
        let (applied, _) = watch::channel(ConfigVersion::ZERO);
        Self {
            name: name.to_owned(),
            current: ArcSwapOption::empty(),
            applied,
            push,
            context,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 当前配置快照。
    pub fn current_config(&self) -> Option<Arc<BucketConfig>> {
        self.current.load_full()
    }

    /// 当前配置版本；尚无配置时为 `None`。
    pub fn current_version(&self) -> Option<ConfigVersion> {
        self.current.load().as_ref().map(|config| config.version())
    }

    pub fn push_handler(&self) -> &ConfigPushHandler {
        &self.push
    }

    /// 转交给推送处理器，见 [`ConfigPushHandler::process_config_push`]。
    pub fn process_config_push(&self, version: ConfigVersion) -> bool {
        self.push.process_config_push(version)
    }

    /// 要求当前配置声明某项能力。
    ///
    /// 能力缺失是预期内的分支（例如 memcached bucket 不支持 collections），以
    /// [`ConfigError::Unsupported`] 返回而非 panic；尚无配置时返回 `BucketMissing`。
    pub fn require_capability(&self, capability: &str) -> Result<(), ConfigError> {
        let Some(config) = self.current.load_full() else {
            return Err(ConfigError::BucketMissing {
                bucket: self.name.clone(),
            });
        };
        if config.has_capability(capability) {
            Ok(())
        } else {
            Err(ConfigError::Unsupported {
                bucket: self.name.clone(),
                capability: capability.to_owned(),
            })
        }
    }

    /// 等待当前配置版本达到 `version`，超时返回 `false`。
    pub async fn wait_for_version(&self, version: ConfigVersion, timeout: Duration) -> bool {
        let mut rx = self.applied.subscribe();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|applied| *applied >= version)).await;
        matches!(reached, Ok(Ok(_)))
    }

    pub(crate) fn shutdown(&self) {
        self.push.shutdown();
    }
}

#[async_trait]
impl ConfigUpdateSink for Bucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn config_updated(&self, config: Arc<BucketConfig>) {
        let current = self.current.load_full();
        if !has_config_changes(&config, current.as_deref(), &self.name) {
            debug!(
                bucket = %self.name,
                version = %config.version(),
                "ignoring config that does not supersede the current one"
            );
            return;
        }

        let nodes_changed = has_cluster_nodes_changed(&config, current.as_deref());
        let map_changed = has_vbucket_map_changed(&config, current.as_deref());
        let version = config.version();

        self.current.store(Some(Arc::clone(&config)));
        self.push.observe(version);

        if let Some(context) = self.context.upgrade() {
            let missing = context.unreconciled_endpoints(&self.name, &config);
            if nodes_changed || !missing.is_empty() {
                if !nodes_changed {
                    debug!(bucket = %self.name, ?missing, "retrying node connections");
                }
                context.process_cluster_map(&self.name, &config).await;
            }
        }
        if map_changed {
            info!(bucket = %self.name, %version, "vbucket map changed");
        }
        self.applied.send_replace(version);
        debug!(bucket = %self.name, %version, nodes_changed, "config applied");
    }
}
