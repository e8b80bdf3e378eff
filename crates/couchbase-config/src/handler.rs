//! # ConfigHandler：进程级配置派发器
//!
//! ## 核心意图（Why）
//! - 推送、轮询、流式监听与引导得到的配置全部经由 [`ConfigHandler::publish`] 这一个入口流向订阅者；
//! - 不同 bucket 的发布互不等待，同一 bucket 的发布严格串行，且永不回退。
//!
//! ## 结构（How）
//! - 每个 bucket 一条“通道”（lane）：
//!   - **闸门**：`parking_lot::Mutex` 保护“已接纳版本 + 发送端”。发布在闸门内完成最终的版本比较，
//!     并在持有闸门时把配置送入 FIFO，因此入队顺序即接纳顺序；
//!   - **订阅者表**：`ArcSwap<Vec<_>>` 整表替换，读路径零锁；
//!   - **通道工作者**：独立任务消费 FIFO，把积压合并为最新一条，再按“已应用版本”复核单调性后依次调用
//!     订阅者的 `config_updated`。订阅者回调在闸门之外执行，耗时回调只会拖慢本 bucket；
//! - 轮询循环（可选）每隔 `poll_interval` 向 [`ConfigPoller`] 请求各订阅 bucket 的映射并发布。
//!
//! ## 契约（What）
//! - `publish` 返回 [`PublishOutcome::Stale`] 表示配置不比已接纳版本新，已被丢弃；
//! - 晚到的订阅者先收到最近一份已接纳配置，再收到之后的更新；
//! - 通道在 [`ConfigHandler::retire`] 之前一直保留（含工作者与已接纳版本），`unsubscribe` 不释放它；
//! - `stop` 之后 `publish`/`subscribe` 返回 [`ConfigError::ContextStopped`]；
//! - 通道工作者若发现待应用配置不比已应用版本新，说明串行化不变量被破坏：记录 `error` 并丢弃，
//!   不会让进程崩溃。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use async_trait::async_trait;
use couchbase_topology::{BucketConfig, ConfigVersion};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::bucket::ConfigUpdateSink;
use crate::error::ConfigError;

/// 发布结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// 版本更新，已排入该 bucket 的派发队列。
    Accepted,
    /// 版本不比已接纳版本新，已丢弃。
    Stale,
}

/// 轮询数据源，由 [`ClusterContext`](crate::ClusterContext) 实现。
#[async_trait]
pub trait ConfigPoller: Send + Sync {
    /// 拉取 `bucket` 的当前集群映射。
    async fn poll_cluster_map(
        &self,
        bucket: &str,
        since: Option<ConfigVersion>,
        cancel: CancellationToken,
    ) -> Result<BucketConfig, ConfigError>;
}

/// 订阅者及其“已补发至”水位。
///
/// 订阅时该 bucket 已有接纳配置，则记录其版本并把它排进 FIFO 单独补发给这位订阅者；
/// FIFO 中不高于水位的积压配置会跳过它，保证每位订阅者看到的版本仍严格递增。
struct SinkSlot {
    sink: Arc<dyn ConfigUpdateSink>,
    replayed_through: Option<ConfigVersion>,
}

type SinkList = Vec<Arc<SinkSlot>>;

enum LaneEvent {
    Publish(Arc<BucketConfig>),
    Replay(Arc<SinkSlot>, Arc<BucketConfig>),
}

struct LaneGate {
    admitted: Option<ConfigVersion>,
    retired: bool,
    tx: mpsc::UnboundedSender<LaneEvent>,
}

struct Lane {
    gate: Mutex<LaneGate>,
    sinks: ArcSwap<SinkList>,
    latest: ArcSwapOption<BucketConfig>,
    cancel: CancellationToken,
}

struct HandlerInner {
    lanes: DashMap<String, Arc<Lane>>,
    poller: Weak<dyn ConfigPoller>,
    poll_interval: Duration,
    started: AtomicBool,
    stopped: AtomicBool,
    cancel: CancellationToken,
}

/// 配置派发器；克隆共享同一内部状态。
#[derive(Clone)]
pub struct ConfigHandler {
    inner: Arc<HandlerInner>,
}

impl ConfigHandler {
    /// 创建派发器。`poller` 以弱引用持有，避免与上下文形成环。
    pub fn new(
        poller: Weak<dyn ConfigPoller>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(HandlerInner {
                lanes: DashMap::new(),
                poller,
                poll_interval,
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                cancel,
            }),
        }
    }

    /// 启动后台轮询（`enable_polling` 为 `true` 时）。重复调用无效果。
    pub fn start(&self, enable_polling: bool) {
        if self.inner.started.swap(true, Ordering::AcqRel) || !enable_polling {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(inner.poll_loop().instrument(info_span!("config_poll")));
    }

    /// 停止派发：取消通道工作者与轮询，此后拒绝发布和订阅。
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// 发布一份配置。
    ///
    /// # 教案式说明
    /// - **前置条件**：必须在 Tokio 运行时内调用（首次发布会为该 bucket 启动通道工作者）；
    /// - **后置条件**：返回 `Accepted` 时配置已进入 FIFO，稍后按序交付；订阅者回调不在本调用内执行。
    pub fn publish(&self, config: Arc<BucketConfig>) -> Result<PublishOutcome, ConfigError> {
        self.inner.publish(config)
    }

    /// 订阅某 bucket 的配置；同一 bucket 可有多个订阅者。
    ///
    /// 该 bucket 已有接纳配置时，最近一份会经由通道补发给新订阅者，
    /// 之后的配置照常按序交付。
    pub fn subscribe(&self, sink: Arc<dyn ConfigUpdateSink>) -> Result<(), ConfigError> {
        loop {
            if self.is_stopped() {
                return Err(ConfigError::ContextStopped);
            }
            let lane = self.inner.lane(sink.name());
            let gate = lane.gate.lock();
            if gate.retired {
                continue;
            }
            let latest = lane.latest.load_full();
            let slot = Arc::new(SinkSlot {
                sink: Arc::clone(&sink),
                replayed_through: latest.as_ref().map(|config| config.version()),
            });
            lane.sinks.rcu(|sinks| {
                let mut next = SinkList::clone(sinks);
                next.push(Arc::clone(&slot));
                next
            });
            if let Some(latest) = latest {
                if gate.tx.send(LaneEvent::Replay(slot, latest)).is_err() {
                    return Err(ConfigError::ContextStopped);
                }
            }
            debug!(bucket = sink.name(), "config subscriber registered");
            return Ok(());
        }
    }

    /// 移除某 bucket 的全部订阅者，返回是否确有移除。
    ///
    /// 通道本身（及其已接纳版本）保留，之后重新订阅也不会接受回退的配置；
    /// 需要连同历史一起释放时再调用 [`ConfigHandler::retire`]。
    pub fn unsubscribe(&self, bucket: &str) -> bool {
        let Some(lane) = self.inner.lane_of(bucket) else {
            return false;
        };
        let _gate = lane.gate.lock();
        let previous = lane.sinks.swap(Arc::new(SinkList::new()));
        !previous.is_empty()
    }

    /// 释放没有订阅者的通道：停止其工作者并丢弃已接纳版本，返回是否确有释放。
    ///
    /// 仍有订阅者时不做任何事。释放后再发布同名 bucket 会从空白通道开始。
    pub fn retire(&self, bucket: &str) -> bool {
        let Some(lane) = self.inner.lane_of(bucket) else {
            return false;
        };
        let mut gate = lane.gate.lock();
        if gate.retired || !lane.sinks.load().is_empty() {
            return false;
        }
        gate.retired = true;
        self.inner
            .lanes
            .remove_if(bucket, |_, current| Arc::ptr_eq(current, &lane));
        lane.cancel.cancel();
        debug!(bucket, "config lane retired");
        true
    }

    /// 最近一次被接纳的配置。
    pub fn latest(&self, bucket: &str) -> Option<Arc<BucketConfig>> {
        self.inner
            .lane_of(bucket)
            .and_then(|lane| lane.latest.load_full())
    }

    /// 当前有订阅者的 bucket。
    pub fn subscribed_buckets(&self) -> Vec<String> {
        self.inner.subscribed_buckets()
    }
}

impl HandlerInner {
    fn lane_of(&self, bucket: &str) -> Option<Arc<Lane>> {
        self.lanes.get(bucket).map(|lane| Arc::clone(lane.value()))
    }

    fn lane(&self, bucket: &str) -> Arc<Lane> {
        if let Some(lane) = self.lane_of(bucket) {
            return lane;
        }
        let mut spawned = None;
        let lane = self
            .lanes
            .entry(bucket.to_owned())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let lane = Arc::new(Lane {
                    gate: Mutex::new(LaneGate {
                        admitted: None,
                        retired: false,
                        tx,
                    }),
                    sinks: ArcSwap::from_pointee(SinkList::new()),
                    latest: ArcSwapOption::empty(),
                    cancel: self.cancel.child_token(),
                });
                spawned = Some((Arc::clone(&lane), rx));
                lane
            })
            .value()
            .clone();
        if let Some((lane, rx)) = spawned {
            tokio::spawn(
                lane_worker(bucket.to_owned(), lane, rx)
                    .instrument(info_span!("config_lane", bucket = %bucket)),
            );
        }
        lane
    }

    fn publish(&self, config: Arc<BucketConfig>) -> Result<PublishOutcome, ConfigError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ConfigError::ContextStopped);
        }
        config
            .validate()
            .map_err(|err| ConfigError::malformed(config.name.clone(), &err))?;

        let version = config.version();
        loop {
            let lane = self.lane(&config.name);
            let mut gate = lane.gate.lock();
            if gate.retired {
                continue;
            }
            if let Some(admitted) = gate.admitted {
                if !version.is_newer_than(&admitted) {
                    debug!(bucket = %config.name, %version, %admitted, "dropping stale publish");
                    return Ok(PublishOutcome::Stale);
                }
            }
            if gate.tx.send(LaneEvent::Publish(Arc::clone(&config))).is_err() {
                return Err(ConfigError::ContextStopped);
            }
            gate.admitted = Some(version);
            lane.latest.store(Some(config));
            return Ok(PublishOutcome::Accepted);
        }
    }

    fn subscribed_buckets(&self) -> Vec<String> {
        let mut buckets: Vec<String> = self
            .lanes
            .iter()
            .filter(|lane| !lane.value().sinks.load().is_empty())
            .map(|lane| lane.key().clone())
            .collect();
        buckets.sort();
        buckets
    }

    async fn poll_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            let Some(poller) = self.poller.upgrade() else {
                break;
            };
            for bucket in self.subscribed_buckets() {
                let since = self
                    .lane_of(&bucket)
                    .and_then(|lane| lane.gate.lock().admitted);
                let polled = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return,
                    polled = poller.poll_cluster_map(&bucket, since, self.cancel.child_token()) => polled,
                };
                match polled {
                    Ok(config) => match self.publish(Arc::new(config)) {
                        Ok(PublishOutcome::Accepted) => info!(%bucket, "polled cluster map accepted"),
                        Ok(PublishOutcome::Stale) => {}
                        Err(ConfigError::ContextStopped) => return,
                        Err(err) => warn!(%bucket, error = %err, "polled cluster map rejected"),
                    },
                    Err(ConfigError::Cancelled) => return,
                    Err(err) => debug!(%bucket, error = %err, "cluster map poll failed"),
                }
            }
        }
    }
}

async fn lane_worker(bucket: String, lane: Arc<Lane>, mut rx: mpsc::UnboundedReceiver<LaneEvent>) {
    let mut applied: Option<ConfigVersion> = None;
    let mut backlog: Option<LaneEvent> = None;
    loop {
        let event = match backlog.take() {
            Some(event) => event,
            None => {
                let received = tokio::select! {
                    biased;
                    _ = lane.cancel.cancelled() => break,
                    received = rx.recv() => received,
                };
                let Some(event) = received else {
                    break;
                };
                event
            }
        };

        let mut config = match event {
            LaneEvent::Replay(slot, config) => {
                if lane.sinks.load().iter().any(|live| Arc::ptr_eq(live, &slot)) {
                    debug!(%bucket, version = %config.version(), "replaying latest config to new subscriber");
                    slot.sink.config_updated(config).await;
                }
                continue;
            }
            LaneEvent::Publish(config) => config,
        };
        while let Ok(next) = rx.try_recv() {
            match next {
                LaneEvent::Publish(newer) => config = newer,
                replay => {
                    backlog = Some(replay);
                    break;
                }
            }
        }

        let version = config.version();
        if let Some(applied) = applied {
            if !version.is_newer_than(&applied) {
                error!(%bucket, %version, %applied, "publish ordering violated; dropping config");
                continue;
            }
        }
        applied = Some(version);

        let sinks = lane.sinks.load_full();
        for slot in sinks.iter() {
            if slot
                .replayed_through
                .is_some_and(|through| !version.is_newer_than(&through))
            {
                continue;
            }
            slot.sink.config_updated(Arc::clone(&config)).await;
        }
    }
}
