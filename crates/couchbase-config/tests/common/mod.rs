//! 集成测试共用的内存替身：模拟集群、节点、节点工厂与记录型订阅者。
//!
//! # 教案式说明
//! - **意图 (Why)**：传输层是外部协作者，测试只需要可控的“节点当前返回哪份映射”“节点是否存活”
//!   “是否已关闭”三个旋钮；
//! - **结构 (How)**：[`MockCluster`] 按 bucket 保存“服务端当前映射”，所有 [`MockNode`] 共享它；
//!   [`MockFactory`] 记录建连历史并可让指定主机建连失败。

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use couchbase_config::{
    ClusterContext, ClusterNode, ConfigError, ConfigOptions, ConfigUpdateSink, NodeFactory,
};
use couchbase_otel::InstallOptions;
use couchbase_topology::{
    BucketConfig, ConfigVersion, HostEndpoint, Node, NodeAdapter, NodeExt, Services,
    VBucketServerMap,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

pub const KV_PORT: u16 = 11210;

/// 以主机列表构造一份已完成后处理的配置。
pub fn cluster_config(bucket: &str, version: (u64, u64), hosts: &[&str]) -> BucketConfig {
    let mut config = BucketConfig::new(bucket, ConfigVersion::from(version));
    config.uuid = "5ac1f3c0d2".to_owned();
    config.node_locator = "vbucket".to_owned();
    config.bucket_capabilities = vec!["collections".to_owned(), "xattr".to_owned()];
    config.nodes = hosts
        .iter()
        .map(|host| Node::new(format!("{host}:8091"), KV_PORT))
        .collect();
    config.nodes_ext = hosts
        .iter()
        .map(|host| NodeExt::new(*host, Services::data(KV_PORT, 11207)))
        .collect();
    let servers = hosts.len().max(1) as i16;
    config.vbucket_server_map = Some(VBucketServerMap {
        hash_algorithm: "CRC".to_owned(),
        num_replicas: 0,
        server_list: hosts.iter().map(|host| format!("{host}:{KV_PORT}")).collect(),
        vbucket_map: (0..8).map(|vb| vec![vb % servers]).collect(),
        vbucket_map_forward: None,
    });
    config.finish(hosts.first().copied().unwrap_or("localhost"));
    config
}

/// 同一主机上以不同 KV 端口运行多个节点的配置（本地多实例）。
pub fn same_host_config(
    bucket: &str,
    version: (u64, u64),
    host: &str,
    kv_ports: &[u16],
) -> BucketConfig {
    let mut config = BucketConfig::new(bucket, ConfigVersion::from(version));
    config.node_locator = "vbucket".to_owned();
    config.nodes = kv_ports
        .iter()
        .enumerate()
        .map(|(idx, port)| Node::new(format!("{host}:{}", 9000 + idx), *port))
        .collect();
    config.nodes_ext = kv_ports
        .iter()
        .enumerate()
        .map(|(idx, port)| {
            let mut services = Services::data(*port, port + 1);
            services.mgmt = 9000 + idx as u16;
            NodeExt::new(host, services)
        })
        .collect();
    let servers = kv_ports.len().max(1) as i16;
    config.vbucket_server_map = Some(VBucketServerMap {
        hash_algorithm: "CRC".to_owned(),
        num_replicas: 0,
        server_list: kv_ports.iter().map(|port| format!("{host}:{port}")).collect(),
        vbucket_map: (0..8).map(|vb| vec![vb % servers]).collect(),
        vbucket_map_forward: None,
    });
    config.finish(host);
    config
}

pub fn endpoint(host: &str) -> HostEndpoint {
    HostEndpoint::new(host, KV_PORT)
}

/// 轮询与重试都调快的测试选项。
pub fn fast_options() -> ConfigOptions {
    ConfigOptions {
        enable_config_polling: false,
        poll_interval_ms: 20,
        fetch_timeout_ms: 500,
        push_retry_interval_ms: 10,
        push_max_retries: 500,
        stream_backoff_initial_ms: 5,
        stream_backoff_max_ms: 50,
        prune_drain_timeout_ms: 2_000,
        ..ConfigOptions::default()
    }
}

/// 模拟集群：每个 bucket 当前“服务端返回”的映射。
#[derive(Default)]
pub struct MockCluster {
    served: Mutex<HashMap<String, BucketConfig>>,
    fetch_delay: Mutex<Duration>,
    fetches: AtomicU64,
}

impl MockCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, config: BucketConfig) {
        self.served.lock().insert(config.name.clone(), config);
    }

    /// 让节点在请求 `bucket` 时返回 `config`，无论其名称为何。
    pub fn serve_as(&self, bucket: &str, config: BucketConfig) {
        self.served.lock().insert(bucket.to_owned(), config);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = delay;
    }

    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

pub struct MockNode {
    endpoint: HostEndpoint,
    cluster: Arc<MockCluster>,
    dead: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for MockNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockNode")
            .field("endpoint", &self.endpoint)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MockNode {
    pub fn set_dead(&self, dead: bool) {
        self.dead.store(dead, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterNode for MockNode {
    fn endpoint(&self) -> &HostEndpoint {
        &self.endpoint
    }

    fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst)
    }

    fn has_kv(&self) -> bool {
        true
    }

    async fn get_cluster_map(
        &self,
        bucket: &str,
        _since: Option<ConfigVersion>,
        cancel: CancellationToken,
    ) -> Result<BucketConfig, ConfigError> {
        let cluster = &self.cluster;
        cluster.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *cluster.fetch_delay.lock();
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ConfigError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        cluster
            .served
            .lock()
            .get(bucket)
            .cloned()
            .ok_or_else(|| ConfigError::Fetch {
                endpoint: self.endpoint.to_string(),
                detail: format!("bucket `{bucket}` not found"),
            })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// 记录建连历史的节点工厂。
pub struct MockFactory {
    cluster: Arc<MockCluster>,
    nodes: Mutex<Vec<Arc<MockNode>>>,
    unreachable: Mutex<HashSet<String>>,
}

impl MockFactory {
    pub fn new(cluster: Arc<MockCluster>) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            nodes: Mutex::new(Vec::new()),
            unreachable: Mutex::new(HashSet::new()),
        })
    }

    pub fn make_unreachable(&self, host: &str) {
        self.unreachable.lock().insert(host.to_owned());
    }

    pub fn make_reachable(&self, host: &str) {
        self.unreachable.lock().remove(host);
    }

    /// 历史上创建过的全部节点（含已关闭的）。
    pub fn created(&self) -> Vec<Arc<MockNode>> {
        self.nodes.lock().clone()
    }

    pub fn created_for(&self, host: &str) -> Vec<Arc<MockNode>> {
        self.created()
            .into_iter()
            .filter(|node| node.endpoint.host() == host)
            .collect()
    }
}

#[async_trait]
impl NodeFactory for MockFactory {
    async fn create_and_connect(
        &self,
        endpoint: HostEndpoint,
        _adapter: Option<NodeAdapter>,
    ) -> Result<Arc<dyn ClusterNode>, ConfigError> {
        if self.unreachable.lock().contains(endpoint.host()) {
            return Err(ConfigError::Fetch {
                endpoint: endpoint.to_string(),
                detail: "connection refused".to_owned(),
            });
        }
        let node = Arc::new(MockNode {
            endpoint,
            cluster: Arc::clone(&self.cluster),
            dead: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.nodes.lock().push(Arc::clone(&node));
        Ok(node)
    }
}

/// 记录收到的配置版本的订阅者。
pub struct RecordingSink {
    name: String,
    seen: Mutex<Vec<ConfigVersion>>,
    delay: Duration,
}

impl RecordingSink {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_delay(name, Duration::ZERO)
    }

    pub fn with_delay(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            seen: Mutex::new(Vec::new()),
            delay,
        })
    }

    pub fn seen(&self) -> Vec<ConfigVersion> {
        self.seen.lock().clone()
    }

    /// 等待收到 `version`，超时返回 `false`。
    pub async fn wait_for(&self, version: ConfigVersion, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.seen.lock().contains(&version) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.seen.lock().contains(&version)
    }
}

#[async_trait]
impl ConfigUpdateSink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn config_updated(&self, config: Arc<BucketConfig>) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.seen.lock().push(config.version());
    }
}

/// 启动一个模拟集群与上下文；首次调用时为本测试进程安装日志与追踪管线。
pub fn harness(options: ConfigOptions) -> (Arc<MockCluster>, Arc<MockFactory>, Arc<ClusterContext>) {
    if !couchbase_otel::is_installed() {
        let _ = couchbase_otel::install_with(InstallOptions {
            service_name: "couchbase-config-tests".to_owned(),
            default_filter: "warn".to_owned(),
        });
    }
    let cluster = MockCluster::new();
    let factory = MockFactory::new(Arc::clone(&cluster));
    let context = ClusterContext::new(options, Arc::clone(&factory) as Arc<dyn NodeFactory>);
    context.start();
    (cluster, factory, context)
}

/// 轮询等待条件成立。
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
