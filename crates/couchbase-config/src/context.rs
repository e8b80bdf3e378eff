//! # ClusterContext：节点连接与 bucket 注册的所有者
//!
//! ## 核心意图（Why）
//! - 持有节点集合、已注册 bucket、派发器与节点工厂，是配置传播链路的汇合点；
//! - 消费已发布配置，收敛节点连接：新增节点建连，消失节点在在途操作结束后关闭。
//!
//! ## 所有权（How）
//! - 上下文以 `Arc::new_cyclic` 构造，派发器与各 bucket 只持有指回上下文的 `Weak`，
//!   整个对象图无强引用环；
//! - 节点收敛由一把异步互斥锁串行化，同一配置重复处理不会建出重复连接；
//! - 剪除分两步：锁内把条目移出集合（此后无法再签发租约），锁外等待租约清零后关闭。
//!
//! ## 契约（What）
//! - `process_cluster_map` / `prune_nodes` 永不失败，建连错误只记录日志；
//! - `publish_config` 按选项设置网络解析策略后交给派发器；
//! - `bootstrap_bucket` 依次尝试种子端点，全部失败或拿到的配置未能应用时返回
//!   [`ConfigError::BootstrapFailure`]；
//! - `unregister_bucket` 同时释放该 bucket 的派发通道，之后重新引导从空白状态开始。

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use couchbase_topology::{BucketConfig, ConfigVersion, HostEndpoint};
use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::join_all;
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bucket::{Bucket, ConfigUpdateSink};
use crate::collection::{NodeCollection, NodeEntry, NodeLease};
use crate::error::ConfigError;
use crate::handler::{ConfigHandler, ConfigPoller, PublishOutcome};
use crate::node::{ClusterNode, NodeFactory, is_viable};
use crate::options::ConfigOptions;
use crate::push::{ConfigPushHandler, PushTiming};

/// 集群上下文。
pub struct ClusterContext {
    options: ConfigOptions,
    nodes: NodeCollection,
    buckets: DashMap<String, Arc<Bucket>>,
    handler: ConfigHandler,
    factory: Arc<dyn NodeFactory>,
    reconcile: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    me: Weak<ClusterContext>,
}

impl ClusterContext {
    /// 构造上下文；必须在 Tokio 运行时内调用后续的注册与发布方法。
    pub fn new(options: ConfigOptions, factory: Arc<dyn NodeFactory>) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<ClusterContext>| {
            let cancel = CancellationToken::new();
            let poller: Weak<dyn ConfigPoller> = me.clone();
            let handler = ConfigHandler::new(poller, options.poll_interval(), cancel.child_token());
            Self {
                options,
                nodes: NodeCollection::new(),
                buckets: DashMap::new(),
                handler,
                factory,
                reconcile: tokio::sync::Mutex::new(()),
                cancel,
                me: me.clone(),
            }
        })
    }

    /// 启动派发器（按选项决定是否轮询）。
    pub fn start(&self) {
        self.handler.start(self.options.enable_config_polling);
    }

    pub fn options(&self) -> &ConfigOptions {
        &self.options
    }

    pub fn handler(&self) -> &ConfigHandler {
        &self.handler
    }

    pub fn nodes(&self) -> &NodeCollection {
        &self.nodes
    }

    /// 关闭时触发的根取消令牌。
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 注册 bucket 并订阅其配置；已注册时返回已有实例。
    pub fn register_bucket(&self, name: &str) -> Result<Arc<Bucket>, ConfigError> {
        if self.handler.is_stopped() {
            return Err(ConfigError::ContextStopped);
        }
        let bucket = match self.buckets.entry(name.to_owned()) {
            Entry::Occupied(occupied) => return Ok(Arc::clone(occupied.get())),
            Entry::Vacant(vacant) => {
                let push = ConfigPushHandler::spawn(
                    name,
                    self.me.clone(),
                    PushTiming {
                        fetch_timeout: self.options.fetch_timeout(),
                        retry_interval: self.options.push_retry_interval(),
                        max_retries: self.options.push_max_retries,
                    },
                    self.cancel.child_token(),
                );
                let bucket = Arc::new(Bucket::new(name, push, self.me.clone()));
                vacant.insert(Arc::clone(&bucket));
                bucket
            }
        };
        let sink: Arc<dyn ConfigUpdateSink> = bucket.clone();
        if let Err(err) = self.handler.subscribe(sink) {
            self.buckets.remove(name);
            bucket.shutdown();
            return Err(err);
        }
        info!(bucket = name, "bucket registered");
        Ok(bucket)
    }

    /// 注销 bucket：停止其推送处理器、取消订阅，并释放它独占的节点。
    pub async fn unregister_bucket(&self, name: &str) -> Option<Arc<Bucket>> {
        let (_, bucket) = self.buckets.remove(name)?;
        self.handler.unsubscribe(name);
        self.handler.retire(name);
        bucket.shutdown();
        let removed = {
            let _guard = self.reconcile.lock().await;
            self.release_nodes(name, |_| false)
        };
        self.close_drained(removed).await;
        info!(bucket = name, "bucket unregistered");
        Some(bucket)
    }

    pub fn bucket(&self, name: &str) -> Option<Arc<Bucket>> {
        self.buckets.get(name).map(|bucket| Arc::clone(bucket.value()))
    }

    /// 按选项设置网络解析策略后发布。
    pub fn publish_config(&self, config: BucketConfig) -> Result<PublishOutcome, ConfigError> {
        let config = config.with_network_resolution(self.options.network_resolution);
        self.handler.publish(Arc::new(config))
    }

    /// 依次尝试种子端点，拿到第一份集群映射后注册并发布。
    pub async fn bootstrap_bucket(
        &self,
        name: &str,
        seeds: &[HostEndpoint],
    ) -> Result<Arc<Bucket>, ConfigError> {
        for seed in seeds {
            let (node, created) = match self.nodes.get(seed) {
                Some(entry) => (Arc::clone(entry.node()), false),
                None => match self.factory.create_and_connect(seed.clone(), None).await {
                    Ok(node) => (node, true),
                    Err(err) => {
                        warn!(bucket = name, %seed, error = %err, "bootstrap connect failed");
                        continue;
                    }
                },
            };

            match self.fetch_from(node.as_ref(), name, None).await {
                Ok(config) => {
                    if created {
                        let entry = NodeEntry::new(Arc::clone(&node), None);
                        entry.add_owner(name);
                        let (kept, inserted) = self.nodes.insert_if_absent(seed.clone(), entry);
                        if !inserted {
                            kept.add_owner(name);
                            node.close().await;
                        }
                    } else if let Some(entry) = self.nodes.get(seed) {
                        entry.add_owner(name);
                    }
                    let version = config.version();
                    let bucket = self.register_bucket(name)?;
                    match self.publish_config(config)? {
                        PublishOutcome::Accepted => {}
                        PublishOutcome::Stale => {
                            debug!(bucket = name, %version, "bootstrap config already superseded")
                        }
                    }
                    if !bucket
                        .wait_for_version(version, self.options.fetch_timeout())
                        .await
                    {
                        warn!(bucket = name, %seed, %version, "bootstrap config was never applied");
                        return Err(ConfigError::BootstrapFailure {
                            bucket: name.to_owned(),
                        });
                    }
                    info!(bucket = name, %seed, %version, "bucket bootstrapped");
                    return Ok(bucket);
                }
                Err(ConfigError::Cancelled) => return Err(ConfigError::Cancelled),
                Err(err) => {
                    warn!(bucket = name, %seed, error = %err, "bootstrap fetch failed");
                    if created {
                        node.close().await;
                    }
                }
            }
        }
        Err(ConfigError::BootstrapFailure {
            bucket: name.to_owned(),
        })
    }

    /// 依据配置收敛 `bucket` 的节点连接，随后剪除消失的节点。
    pub async fn process_cluster_map(&self, bucket: &str, config: &BucketConfig) {
        let removed = {
            let _guard = self.reconcile.lock().await;
            for adapter in config.merged_nodes() {
                let Some(endpoint) = adapter.kv_endpoint(self.options.enable_tls) else {
                    continue;
                };
                if let Some(entry) = self.nodes.get(&endpoint) {
                    entry.add_owner(bucket);
                    entry.set_adapter(adapter);
                    continue;
                }
                match self
                    .factory
                    .create_and_connect(endpoint.clone(), Some(adapter.clone()))
                    .await
                {
                    Ok(node) => {
                        let entry = NodeEntry::new(node, Some(adapter));
                        entry.add_owner(bucket);
                        self.nodes.insert_if_absent(endpoint.clone(), entry);
                        info!(bucket, %endpoint, "node added");
                    }
                    Err(err) => warn!(bucket, %endpoint, error = %err, "node connect failed"),
                }
            }
            self.prune_locked(bucket, config)
        };
        self.close_drained(removed).await;
    }

    /// `config` 中 `bucket` 尚未持有连接的 KV 端点（从未建连或上次建连失败）。
    pub fn unreconciled_endpoints(&self, bucket: &str, config: &BucketConfig) -> Vec<HostEndpoint> {
        config
            .merged_nodes()
            .iter()
            .filter_map(|adapter| adapter.kv_endpoint(self.options.enable_tls))
            .filter(|endpoint| {
                self.nodes
                    .get(endpoint)
                    .is_none_or(|entry| !entry.is_owned_by(bucket))
            })
            .collect()
    }

    /// 剪除 `bucket` 拥有、但 `config` 中已不存在的节点。
    pub async fn prune_nodes(&self, bucket: &str, config: &BucketConfig) {
        let removed = {
            let _guard = self.reconcile.lock().await;
            self.prune_locked(bucket, config)
        };
        self.close_drained(removed).await;
    }

    /// 为端点签发租约，持有期间节点不会被关闭。
    pub fn lease(&self, endpoint: &HostEndpoint) -> Option<NodeLease> {
        self.nodes.lease(endpoint)
    }

    /// 随机选择一个被 `bucket` 拥有、存活且提供 KV 的节点。
    pub fn select_kv_node(&self, bucket: &str) -> Option<NodeLease> {
        let candidates: Vec<Arc<NodeEntry>> = self
            .nodes
            .owned_by(bucket)
            .into_iter()
            .filter(|entry| is_viable(entry.node().as_ref()))
            .collect();
        candidates
            .choose(&mut rand::thread_rng())
            .map(|entry| NodeLease::acquire(Arc::clone(entry)))
    }

    /// `bucket` 当前拥有的节点端点。
    pub fn nodes_for_bucket(&self, bucket: &str) -> Vec<HostEndpoint> {
        let mut endpoints: Vec<HostEndpoint> = self
            .nodes
            .owned_by(bucket)
            .iter()
            .map(|entry| entry.endpoint().clone())
            .collect();
        endpoints.sort();
        endpoints
    }

    /// 停止派发与全部后台任务，关闭所有节点。
    pub async fn shutdown(&self) {
        self.handler.stop();
        self.cancel.cancel();
        for bucket in self.buckets.iter() {
            bucket.value().shutdown();
        }
        self.buckets.clear();
        let drained = {
            let _guard = self.reconcile.lock().await;
            self.nodes.drain()
        };
        self.close_drained(drained).await;
        info!("cluster context shut down");
    }

    fn prune_locked(&self, bucket: &str, config: &BucketConfig) -> Vec<Arc<NodeEntry>> {
        let keep: HashSet<HostEndpoint> = config
            .merged_nodes()
            .iter()
            .filter_map(|adapter| adapter.kv_endpoint(self.options.enable_tls))
            .collect();
        self.release_nodes(bucket, |endpoint| keep.contains(endpoint))
    }

    /// 对 `bucket` 拥有且 `keep` 判定为否的节点解除所有权，移出已无拥有者的条目。
    fn release_nodes(
        &self,
        bucket: &str,
        keep: impl Fn(&HostEndpoint) -> bool,
    ) -> Vec<Arc<NodeEntry>> {
        let mut removed = Vec::new();
        for entry in self.nodes.owned_by(bucket) {
            let endpoint = entry.endpoint().clone();
            if keep(&endpoint) {
                continue;
            }
            if entry.remove_owner(bucket) {
                if let Some(entry) = self.nodes.remove_unowned(&endpoint) {
                    info!(bucket, %endpoint, "node pruned");
                    removed.push(entry);
                }
            } else {
                debug!(bucket, %endpoint, "node still owned by other buckets");
            }
        }
        removed
    }

    async fn close_drained(&self, entries: Vec<Arc<NodeEntry>>) {
        if entries.is_empty() {
            return;
        }
        let timeout = self.options.prune_drain_timeout();
        join_all(entries.into_iter().map(|entry| async move {
            if !entry.wait_idle(timeout).await {
                warn!(
                    endpoint = %entry.endpoint(),
                    in_flight = entry.in_flight(),
                    "closing node with operations still in flight"
                );
            }
            entry.node().close().await;
        }))
        .await;
    }

    async fn fetch_from(
        &self,
        node: &dyn ClusterNode,
        bucket: &str,
        since: Option<ConfigVersion>,
    ) -> Result<BucketConfig, ConfigError> {
        let timeout = self.options.fetch_timeout();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ConfigError::Cancelled),
            outcome = tokio::time::timeout(
                timeout,
                node.get_cluster_map(bucket, since, self.cancel.child_token()),
            ) => outcome.unwrap_or_else(|_| Err(ConfigError::FetchTimeout {
                endpoint: node.endpoint().to_string(),
                timeout,
            })),
        }
    }
}

#[async_trait]
impl ConfigPoller for ClusterContext {
    async fn poll_cluster_map(
        &self,
        bucket: &str,
        since: Option<ConfigVersion>,
        cancel: CancellationToken,
    ) -> Result<BucketConfig, ConfigError> {
        let lease = self
            .select_kv_node(bucket)
            .ok_or_else(|| ConfigError::BootstrapFailure {
                bucket: bucket.to_owned(),
            })?;
        let timeout = self.options.fetch_timeout();
        let config = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConfigError::Cancelled),
            outcome = tokio::time::timeout(
                timeout,
                lease.node().get_cluster_map(bucket, since, cancel.child_token()),
            ) => outcome.unwrap_or_else(|_| Err(ConfigError::FetchTimeout {
                endpoint: lease.endpoint().to_string(),
                timeout,
            })),
        }?;
        Ok(config.with_network_resolution(self.options.network_resolution))
    }
}

impl Drop for ClusterContext {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
