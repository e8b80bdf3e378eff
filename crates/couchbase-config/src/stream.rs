//! HTTP 流式配置监听。
//!
//! 服务端在流式配置端点上持续写出以换行分隔的配置文档。监听器按随机顺序轮流连接各服务器，
//! 逐行解析并经派发器发布；所有服务器都失败后按指数退避（×10，封顶）休眠，任何一行成功即重置退避。
//! 单行超过 `stream_max_line_bytes` 时丢弃缓冲并断开该服务器，转向下一台。
//! HTTP 客户端本身是外部协作者，这里只依赖 [`ConfigStreamSource`]。

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use couchbase_topology::{BucketConfig, HostEndpoint};
use futures::StreamExt;
use futures::stream::BoxStream;
use rand::seq::SliceRandom;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::context::ClusterContext;
use crate::error::ConfigError;

/// 打开某服务器上某 bucket 的配置流，产出任意切分的文本片段。
#[async_trait]
pub trait ConfigStreamSource: Send + Sync {
    async fn open(
        &self,
        server: &HostEndpoint,
        bucket: &str,
    ) -> Result<BoxStream<'static, Result<String, ConfigError>>, ConfigError>;
}

/// 指数退避：每次失败乘以 10，封顶 `max`；成功后回到 `initial`。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl StreamBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// 返回本次应休眠的时长，并推进到下一档。
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(10).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// 单行超过上限。
#[derive(Debug, PartialEq, Eq)]
struct LineTooLong;

/// 把任意切分的文本片段重组为完整的行，单行不得超过 `limit` 字节。
#[derive(Debug)]
struct LineFramer {
    buffer: String,
    limit: usize,
}

impl LineFramer {
    fn new(limit: usize) -> Self {
        Self {
            buffer: String::new(),
            limit,
        }
    }

    fn push(&mut self, chunk: &str) -> Result<Vec<String>, LineTooLong> {
        self.buffer.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(idx) = self.buffer.find('\n') {
            if idx > self.limit {
                self.buffer.clear();
                return Err(LineTooLong);
            }
            let line: String = self.buffer.drain(..=idx).collect();
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_owned());
            }
        }
        if self.buffer.len() > self.limit {
            self.buffer.clear();
            return Err(LineTooLong);
        }
        Ok(lines)
    }
}

/// 单个 bucket 的流式配置监听器。
pub struct ConfigStreamListener {
    bucket: String,
    servers: Vec<HostEndpoint>,
    source: Arc<dyn ConfigStreamSource>,
    context: Weak<ClusterContext>,
    backoff: StreamBackoff,
    max_line_bytes: usize,
    cancel: CancellationToken,
}

impl ConfigStreamListener {
    /// 以上下文的选项与取消令牌构造监听器。
    pub fn new(
        bucket: &str,
        servers: Vec<HostEndpoint>,
        source: Arc<dyn ConfigStreamSource>,
        context: &Arc<ClusterContext>,
    ) -> Self {
        let options = context.options();
        Self {
            bucket: bucket.to_owned(),
            servers,
            source,
            context: Arc::downgrade(context),
            backoff: StreamBackoff::new(options.stream_backoff_initial(), options.stream_backoff_max()),
            max_line_bytes: options.stream_max_line_bytes,
            cancel: context.cancellation_token().child_token(),
        }
    }

    /// 停止监听用的令牌。
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 在当前运行时上启动监听循环。
    pub fn spawn(self) -> JoinHandle<()> {
        let span = info_span!("config_stream", bucket = %self.bucket);
        tokio::spawn(self.run().instrument(span))
    }

    /// 监听循环，直到取消或上下文被释放。
    pub async fn run(mut self) {
        while !self.cancel.is_cancelled() {
            let mut servers = self.servers.clone();
            servers.shuffle(&mut rand::thread_rng());
            for server in &servers {
                if !self.consume(server).await {
                    return;
                }
            }
            let delay = self.backoff.next_delay();
            debug!(?delay, "all config stream servers exhausted; backing off");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// 消费一台服务器的流直到结束；返回 `false` 表示应退出监听。
    async fn consume(&mut self, server: &HostEndpoint) -> bool {
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return false,
            opened = self.source.open(server, &self.bucket) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%server, error = %err, "opening config stream failed");
                return true;
            }
        };

        let mut framer = LineFramer::new(self.max_line_bytes);
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                chunk = stream.next() => chunk,
            };
            let chunk = match chunk {
                None => return true,
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => {
                    warn!(%server, error = %err, "config stream interrupted");
                    return true;
                }
            };
            let lines = match framer.push(&chunk) {
                Ok(lines) => lines,
                Err(LineTooLong) => {
                    let err = ConfigError::StreamLineTooLong {
                        endpoint: server.to_string(),
                        limit: self.max_line_bytes,
                    };
                    warn!(%server, error = %err, "dropping config stream");
                    return true;
                }
            };
            for line in lines {
                let Some(context) = self.context.upgrade() else {
                    return false;
                };
                let config = match BucketConfig::from_json_str(&line, server.host()) {
                    Ok(config) => config,
                    Err(err) => {
                        let err = ConfigError::malformed(self.bucket.clone(), &err);
                        warn!(%server, error = %err, "skipping malformed streamed config");
                        continue;
                    }
                };
                self.backoff.reset();
                match context.publish_config(config) {
                    Ok(outcome) => debug!(%server, ?outcome, "streamed config published"),
                    Err(ConfigError::ContextStopped) => return false,
                    Err(err) => warn!(%server, error = %err, "streamed config rejected"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_tenfold_and_caps() {
        let mut backoff = StreamBackoff::new(Duration::from_millis(10), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn framer_joins_split_chunks_and_skips_blank_lines() {
        let mut framer = LineFramer::new(1024);
        assert!(framer.push("{\"name\":").unwrap().is_empty());
        let lines = framer.push("\"default\"}\n\n\n\n{\"na").unwrap();
        assert_eq!(lines, vec!["{\"name\":\"default\"}".to_owned()]);
        let lines = framer.push("me\":\"b\"}\n").unwrap();
        assert_eq!(lines, vec!["{\"name\":\"b\"}".to_owned()]);
    }

    #[test]
    fn framer_rejects_unterminated_line_over_limit() {
        let mut framer = LineFramer::new(8);
        assert!(framer.push("12345").unwrap().is_empty());
        assert_eq!(framer.push("6789"), Err(LineTooLong));
        assert!(framer.buffer.is_empty());
        assert_eq!(framer.push("ok\n").unwrap(), vec!["ok".to_owned()]);
    }

    #[test]
    fn framer_rejects_terminated_line_over_limit() {
        let mut framer = LineFramer::new(4);
        assert_eq!(framer.push("abcdefgh\nok\n"), Err(LineTooLong));
        assert_eq!(framer.push("fine\n").unwrap(), vec!["fine".to_owned()]);
    }
}
