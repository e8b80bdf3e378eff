//! # couchbase-otel
//!
//! 为配置传播子系统提供“一次调用即生效”的日志与追踪安装入口。
//!
//! ## 教案式说明
//! - **意图（Why）**：`couchbase-config` 只依赖 `tracing` 门面打点，宿主进程需要在启动时装配
//!   具体的 Subscriber；本 crate 给出默认组合，免去每个应用重复拼装；
//! - **逻辑（How）**：`registry + EnvFilter + fmt + OpenTelemetry` 四层叠加，`EnvFilter` 读取
//!   `RUST_LOG`，缺省为 `info`；OpenTelemetry 层把后台任务的 span（推送处理、派发通道、轮询、流监听）
//!   导出为追踪数据；
//! - **契约（What）**：进程内只能成功安装一次，重复调用返回 [`Error::AlreadyInstalled`]；外部已设置
//!   全局 Subscriber 时返回 [`Error::SubscriberAlreadySet`]。

use std::borrow::Cow;
use std::sync::OnceLock;

use opentelemetry::{
    KeyValue, global,
    trace::TracerProvider as _,
};
use opentelemetry_sdk::{
    Resource,
    trace::{self, TracerProvider},
};
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// 安装状态的全局缓存，确保 `install` 仅执行一次。
static INSTALL_STATE: OnceLock<InstallState> = OnceLock::new();

/// 缺省的日志过滤级别。
pub const DEFAULT_FILTER: &str = "info";

/// 安装过程可能出现的错误。
#[derive(Debug)]
pub enum Error {
    /// `install` 被重复调用。
    AlreadyInstalled,
    /// 外部提前设置了全局 `tracing` Subscriber。
    SubscriberAlreadySet,
    /// 设置全局 Subscriber 失败的底层错误。
    SetGlobalSubscriber(tracing::dispatcher::SetGlobalDefaultError),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::AlreadyInstalled => f.write_str("couchbase-otel 已完成安装，禁止重复调用 install"),
            Error::SubscriberAlreadySet => {
                f.write_str("全局 tracing Subscriber 已存在，couchbase-otel 无法覆盖")
            }
            Error::SetGlobalSubscriber(err) => {
                write!(f, "设置 tracing 全局 Subscriber 失败: {err}")
            }
        }
    }
}

impl std::error::Error for Error {}

/// 安装参数。
#[derive(Clone, Debug)]
pub struct InstallOptions {
    /// 写入 `service.name` 资源属性。
    pub service_name: String,
    /// `RUST_LOG` 未设置时使用的过滤指令。
    pub default_filter: String,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            service_name: "couchbase-config".to_owned(),
            default_filter: DEFAULT_FILTER.to_owned(),
        }
    }
}

struct InstallState {
    // 持有 Provider 以维持导出管线的生命周期。
    #[allow(dead_code)]
    provider: TracerProvider,
}

/// 以缺省参数安装。
pub fn install() -> Result<(), Error> {
    install_with(InstallOptions::default())
}

/// 以指定参数安装全局 Subscriber 与 TracerProvider。
///
/// # 教案式说明
/// - **逻辑（How）**：
///   1. 检查重复安装与外部 Subscriber；
///   2. 构建 `TracerProvider` 并注册到 `opentelemetry::global`；
///   3. 组装 `fmt + EnvFilter + OpenTelemetry` Layer 并设置为全局 Subscriber；
///   4. 写入 `INSTALL_STATE`。
/// - **契约（What）**：成功后进程内所有 `tracing` 事件立即生效；失败不会留下半安装的全局状态，
///   唯一例外是第 2 步注册的全局 Provider。
pub fn install_with(options: InstallOptions) -> Result<(), Error> {
    if INSTALL_STATE.get().is_some() {
        return Err(Error::AlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(Error::SubscriberAlreadySet);
    }

    let state = install_impl(&options)?;
    INSTALL_STATE
        .set(state)
        .map_err(|_| Error::AlreadyInstalled)
}

/// 是否已经成功安装。
pub fn is_installed() -> bool {
    INSTALL_STATE.get().is_some()
}

/// 由服务名构造 OpenTelemetry `Resource`，并合并 SDK 缺省探测到的属性。
pub fn resource_for(service_name: &str) -> Resource {
    Resource::default().merge(&Resource::new([
        KeyValue::new("service.name", service_name.to_owned()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]))
}

fn install_impl(options: &InstallOptions) -> Result<InstallState, Error> {
    let provider = TracerProvider::builder()
        .with_config(
            trace::config()
                .with_sampler(trace::Sampler::AlwaysOn)
                .with_resource(resource_for(&options.service_name)),
        )
        .build();
    global::set_tracer_provider(provider.clone());

    let tracer = provider.versioned_tracer(
        "couchbase.config",
        Some(env!("CARGO_PKG_VERSION")),
        Some(Cow::Borrowed(env!("CARGO_PKG_NAME"))),
        None,
    );

    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter(&options.default_filter))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_opentelemetry::layer().with_tracer(tracer));
    tracing::subscriber::set_global_default(subscriber).map_err(Error::SetGlobalSubscriber)?;

    Ok(InstallState { provider })
}

fn build_env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}
