//! # NodeCollection：节点连接仓储
//!
//! ## 核心意图（Why）
//! - 以 KV 端点为键保存共享的节点连接，多个 bucket 可以同时“拥有”同一个节点；
//! - 为请求路径提供租约 [`NodeLease`]：持有租约期间节点即使被剪除也不会被关闭。
//!
//! ## 行为契约（What）
//! - `insert_if_absent`：并发插入同一端点时只保留第一个，返回最终驻留的条目；
//! - `remove_unowned`：仅当条目已无任何拥有者时才移除，判定与移除在同一分片锁内完成；
//! - 租约计数归零时唤醒 [`NodeEntry::wait_idle`] 的等待者。
//!
//! ## 风险提示（Trade-offs）
//! - `DashMap` guard 会阻塞同分片写入，所有方法都在返回前释放 guard，只交出 `Arc<NodeEntry>`。

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use couchbase_topology::{HostEndpoint, NodeAdapter};
use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::node::ClusterNode;

/// 节点集合中的单个条目。
pub struct NodeEntry {
    node: Arc<dyn ClusterNode>,
    owners: Mutex<BTreeSet<String>>,
    adapter: Mutex<Option<NodeAdapter>>,
    leases: AtomicUsize,
    idle: Notify,
}

impl NodeEntry {
    pub(crate) fn new(node: Arc<dyn ClusterNode>, adapter: Option<NodeAdapter>) -> Arc<Self> {
        Arc::new(Self {
            node,
            owners: Mutex::new(BTreeSet::new()),
            adapter: Mutex::new(adapter),
            leases: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    pub fn node(&self) -> &Arc<dyn ClusterNode> {
        &self.node
    }

    pub fn endpoint(&self) -> &HostEndpoint {
        self.node.endpoint()
    }

    /// 最近一次收敛写入的节点视图。
    pub fn adapter(&self) -> Option<NodeAdapter> {
        self.adapter.lock().clone()
    }

    pub(crate) fn set_adapter(&self, adapter: NodeAdapter) {
        *self.adapter.lock() = Some(adapter);
    }

    /// 当前拥有该节点的 bucket 名称。
    pub fn owners(&self) -> Vec<String> {
        self.owners.lock().iter().cloned().collect()
    }

    pub fn is_owned_by(&self, bucket: &str) -> bool {
        self.owners.lock().contains(bucket)
    }

    pub(crate) fn add_owner(&self, bucket: &str) -> bool {
        self.owners.lock().insert(bucket.to_owned())
    }

    /// 移除拥有者，返回移除后是否已无人拥有。
    pub(crate) fn remove_owner(&self, bucket: &str) -> bool {
        let mut owners = self.owners.lock();
        owners.remove(bucket);
        owners.is_empty()
    }

    fn is_unowned(&self) -> bool {
        self.owners.lock().is_empty()
    }

    /// 在途租约数量。
    pub fn in_flight(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }

    /// 等待在途租约全部释放，`timeout` 内完成返回 `true`。
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }

    fn release(&self) {
        if self.leases.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

impl fmt::Debug for NodeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeEntry")
            .field("endpoint", self.endpoint())
            .field("owners", &*self.owners.lock())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// 节点租约：存活期间阻止节点被关闭。
#[derive(Debug)]
pub struct NodeLease {
    entry: Arc<NodeEntry>,
}

impl NodeLease {
    pub(crate) fn acquire(entry: Arc<NodeEntry>) -> Self {
        entry.leases.fetch_add(1, Ordering::AcqRel);
        Self { entry }
    }

    pub fn node(&self) -> &Arc<dyn ClusterNode> {
        self.entry.node()
    }

    pub fn endpoint(&self) -> &HostEndpoint {
        self.entry.endpoint()
    }
}

impl Drop for NodeLease {
    fn drop(&mut self) {
        self.entry.release();
    }
}

/// 以 KV 端点为键的并发节点仓储。
#[derive(Debug, Default)]
pub struct NodeCollection {
    nodes: DashMap<HostEndpoint, Arc<NodeEntry>>,
}

impl NodeCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, endpoint: &HostEndpoint) -> Option<Arc<NodeEntry>> {
        self.nodes.get(endpoint).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, endpoint: &HostEndpoint) -> bool {
        self.nodes.contains_key(endpoint)
    }

    /// 插入新条目；端点已存在时保留旧条目并返回 `(旧条目, false)`。
    pub(crate) fn insert_if_absent(
        &self,
        endpoint: HostEndpoint,
        entry: Arc<NodeEntry>,
    ) -> (Arc<NodeEntry>, bool) {
        match self.nodes.entry(endpoint) {
            Entry::Occupied(occupied) => (Arc::clone(occupied.get()), false),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&entry));
                (entry, true)
            }
        }
    }

    /// 若条目已无拥有者则移除并返回。
    pub(crate) fn remove_unowned(&self, endpoint: &HostEndpoint) -> Option<Arc<NodeEntry>> {
        self.nodes
            .remove_if(endpoint, |_, entry| entry.is_unowned())
            .map(|(_, entry)| entry)
    }

    /// 为端点上的节点签发租约。
    pub fn lease(&self, endpoint: &HostEndpoint) -> Option<NodeLease> {
        self.get(endpoint).map(NodeLease::acquire)
    }

    /// 被 `bucket` 拥有的全部条目。
    pub fn owned_by(&self, bucket: &str) -> Vec<Arc<NodeEntry>> {
        self.nodes
            .iter()
            .filter(|entry| entry.value().is_owned_by(bucket))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// 全部端点，排序后返回。
    pub fn endpoints(&self) -> Vec<HostEndpoint> {
        let mut endpoints: Vec<HostEndpoint> =
            self.nodes.iter().map(|entry| entry.key().clone()).collect();
        endpoints.sort();
        endpoints
    }

    /// 清空集合并交出全部条目，关闭阶段使用。
    pub(crate) fn drain(&self) -> Vec<Arc<NodeEntry>> {
        let endpoints: Vec<HostEndpoint> =
            self.nodes.iter().map(|entry| entry.key().clone()).collect();
        endpoints
            .iter()
            .filter_map(|endpoint| self.nodes.remove(endpoint).map(|(_, entry)| entry))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
