//! # ConfigPushHandler：单 bucket 的配置推送状态机
//!
//! ## 核心意图（Why）
//! - 节点在 KV 响应中“顺带”告知存在更新的配置版本，但并不携带配置本身；处理器负责把这类
//!   建议性通知转换为一次拉取，并只在拉到的配置确实更新时发布；
//! - 推送是建议性的，重复、迟到、乱序都属常态，因此任何过期结果都静默丢弃。
//!
//! ## 状态（What）
//! - `last_known`：已发布或已观察到的最高版本，受 `parking_lot::Mutex` 保护，读者永远看不到撕裂的
//!   `(epoch, revision)`；
//! - `pending`：单槽合并队列，只保留最高的待处理版本。拉取进行中到达的推送抬高槽位，拉取结束后
//!   最多再触发一次拉取；
//! - `chase`：正在追赶的推送版本及其“拉到回退映射”的次数。同一版本的重复推送沿用计数，
//!   重试预算耗尽后每次重复推送至多再拉取一次；
//! - 后台工作者：一个任务串行消费槽位，天然保证同一 bucket 至多一个在途拉取。
//!
//! ## 状态转换（How）
//! 1. **Idle → Fetching**：`process_config_push(v)`，`v` 不比 `last_known` 新时直接忽略，不做任何 I/O；
//! 2. **Fetching**：挑选一个存活且提供 KV 的节点，在 `fetch_timeout` 内调用
//!    `get_cluster_map(Some(last_known), cancel)`；
//! 3. **Fetching → Idle**：比较*拉取到的*版本与 `last_known`。更新则经派发器发布并抬高 `last_known`，
//!    否则丢弃；若拉取版本仍低于推送版本（节点暂时返回回退的映射），在 `push_retry_interval` 后
//!    重新入槽，最多 `push_max_retries` 次；
//! 4. 节点不可用、I/O 错误、超时只记录日志，视为“本轮无更新”；
//! 5. 节点返回其它 bucket 的映射时丢弃，既不发布也不抬高 `last_known`。
//!
//! ## 取消（Cancellation）
//! - 工作者与在途拉取都监听 bucket 的 `CancellationToken`，关闭时立即返回 Idle 并退出。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use couchbase_topology::ConfigVersion;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, trace, warn};

use crate::context::ClusterContext;
use crate::error::ConfigError;
use crate::handler::PublishOutcome;

/// 一次拉取的结果，决定是否需要重新入槽。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FetchOutcome {
    /// 拉取版本不低于推送版本。
    Settled,
    /// 节点返回的版本低于推送版本。
    Regressed,
    /// 本轮失败（无可用节点、I/O、超时、映射属于其它 bucket）。
    Failed,
    /// 关闭或上下文已释放。
    Abandoned,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct PushTiming {
    pub(crate) fetch_timeout: Duration,
    pub(crate) retry_interval: Duration,
    pub(crate) max_retries: u32,
}

struct PushShared {
    bucket: String,
    last_known: Mutex<ConfigVersion>,
    pending: Mutex<Option<ConfigVersion>>,
    chase: Mutex<Option<(ConfigVersion, u32)>>,
    wake: Notify,
    fetches: AtomicU64,
    timing: PushTiming,
    context: Weak<ClusterContext>,
    cancel: CancellationToken,
}

/// 单 bucket 的推送处理器，由 [`Bucket`](crate::Bucket) 持有。
pub struct ConfigPushHandler {
    shared: Arc<PushShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ConfigPushHandler {
    /// 创建处理器并在当前 Tokio 运行时上启动工作者。
    pub(crate) fn spawn(
        bucket: &str,
        context: Weak<ClusterContext>,
        timing: PushTiming,
        cancel: CancellationToken,
    ) -> Self {
        let shared = Arc::new(PushShared {
            bucket: bucket.to_owned(),
            last_known: Mutex::new(ConfigVersion::ZERO),
            pending: Mutex::new(None),
            chase: Mutex::new(None),
            wake: Notify::new(),
            fetches: AtomicU64::new(0),
            timing,
            context,
            cancel,
        });
        let worker = tokio::spawn(
            Arc::clone(&shared)
                .run()
                .instrument(info_span!("config_push", bucket = %bucket)),
        );
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// 处理一次“配置至少已到版本 `version`”的通知。
    ///
    /// 返回 `true` 表示通知被接纳并已唤醒工作者；过期通知返回 `false` 且不产生任何 I/O。
    pub fn process_config_push(&self, version: ConfigVersion) -> bool {
        if self.shared.cancel.is_cancelled() {
            return false;
        }
        let last_known = self.last_known_version();
        if !version.is_newer_than(&last_known) {
            trace!(bucket = %self.shared.bucket, %version, %last_known, "ignoring stale config push");
            return false;
        }
        self.shared.enqueue(version);
        self.shared.wake.notify_one();
        true
    }

    /// 已知的最高版本，供诊断读取。
    pub fn last_known_version(&self) -> ConfigVersion {
        *self.shared.last_known.lock()
    }

    /// 通过其它途径（轮询、流、引导）得知的版本，只会抬高不会回退。
    pub fn observe(&self, version: ConfigVersion) {
        self.shared.raise(version);
    }

    /// 自创建以来发起的拉取次数。
    pub fn fetch_attempts(&self) -> u64 {
        self.shared.fetches.load(Ordering::Relaxed)
    }

    /// 是否有待处理的推送。
    pub fn has_pending(&self) -> bool {
        self.shared.pending.lock().is_some()
    }

    /// 取消工作者与在途拉取。
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

impl Drop for ConfigPushHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PushShared {
    fn raise(&self, version: ConfigVersion) {
        let mut last_known = self.last_known.lock();
        if version > *last_known {
            *last_known = version;
        }
    }

    fn take_pending(&self) -> Option<ConfigVersion> {
        self.pending.lock().take()
    }

    /// 入槽：槽位中已有不低于 `version` 的版本时保持不变。
    fn enqueue(&self, version: ConfigVersion) {
        let mut slot = self.pending.lock();
        match *slot {
            Some(existing) if existing >= version => {}
            _ => *slot = Some(version),
        }
    }

    /// 记录一次对 `version` 的回退拉取，返回累计次数；追赶目标变化时从零开始。
    fn record_regression(&self, version: ConfigVersion) -> u32 {
        let mut chase = self.chase.lock();
        let attempts = match *chase {
            Some((chasing, attempts)) if chasing == version => attempts.saturating_add(1),
            _ => 1,
        };
        *chase = Some((version, attempts));
        attempts
    }

    fn settle(&self) {
        *self.chase.lock() = None;
    }

    async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.wake.notified() => {}
            }
            while let Some(version) = self.take_pending() {
                let last_known = *self.last_known.lock();
                if !version.is_newer_than(&last_known) {
                    trace!(%version, %last_known, "pending push already satisfied");
                    continue;
                }
                match self.fetch_once(version).await {
                    FetchOutcome::Abandoned => return,
                    FetchOutcome::Regressed => {
                        let attempts = self.record_regression(version);
                        if attempts > self.timing.max_retries {
                            warn!(
                                %version,
                                attempts,
                                "node kept serving a regressed cluster map; giving up until the next push"
                            );
                            continue;
                        }
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => return,
                            _ = tokio::time::sleep(self.timing.retry_interval) => {}
                        }
                        self.enqueue(version);
                    }
                    FetchOutcome::Settled => self.settle(),
                    FetchOutcome::Failed => {}
                }
            }
        }
    }

    async fn fetch_once(&self, target: ConfigVersion) -> FetchOutcome {
        let Some(context) = self.context.upgrade() else {
            return FetchOutcome::Abandoned;
        };
        let Some(lease) = context.select_kv_node(&self.bucket) else {
            let err = ConfigError::BootstrapFailure {
                bucket: self.bucket.clone(),
            };
            warn!(error = %err, "config push could not be served");
            return FetchOutcome::Failed;
        };

        let since = *self.last_known.lock();
        let endpoint = lease.endpoint().clone();
        let timeout = self.timing.fetch_timeout;
        self.fetches.fetch_add(1, Ordering::Relaxed);

        let fetch = lease
            .node()
            .get_cluster_map(&self.bucket, Some(since), self.cancel.child_token());
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ConfigError::Cancelled),
            outcome = tokio::time::timeout(timeout, fetch) => match outcome {
                Ok(result) => result,
                Err(_) => Err(ConfigError::FetchTimeout { endpoint: endpoint.to_string(), timeout }),
            },
        };
        drop(lease);

        let config = match result {
            Ok(config) => config,
            Err(ConfigError::Cancelled) => return FetchOutcome::Abandoned,
            Err(err) => {
                warn!(%endpoint, error = %err, "fetching pushed cluster map failed");
                return FetchOutcome::Failed;
            }
        };
        if config.name != self.bucket {
            warn!(%endpoint, returned = %config.name, "node returned a cluster map for another bucket");
            return FetchOutcome::Failed;
        }

        let fetched = config.version();
        let last_known = *self.last_known.lock();
        if fetched.is_newer_than(&last_known) {
            match context.publish_config(config) {
                Ok(PublishOutcome::Accepted) => {
                    debug!(%fetched, %endpoint, "published pushed cluster map");
                    self.raise(fetched);
                }
                Ok(PublishOutcome::Stale) => {
                    debug!(%fetched, "dispatcher already holds a newer cluster map");
                    self.raise(fetched);
                }
                Err(ConfigError::ContextStopped) => return FetchOutcome::Abandoned,
                Err(err) => {
                    warn!(%fetched, error = %err, "publishing pushed cluster map failed");
                    return FetchOutcome::Failed;
                }
            }
        } else {
            debug!(%fetched, %last_known, %target, "discarding fetched cluster map that is not newer");
        }

        if fetched < target {
            FetchOutcome::Regressed
        } else {
            FetchOutcome::Settled
        }
    }
}
