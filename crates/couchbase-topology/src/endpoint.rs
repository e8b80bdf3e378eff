//! 主机名与端口的规范化工具。

use core::fmt;

/// 剥离 `host:port` 中的端口部分，保留主机名。
///
/// # 契约 (What)
/// - `host`、`host:port` → `host`；
/// - `[v6]:port` → `[v6]`；
/// - 裸 IPv6（多个冒号且无方括号）原样返回；
/// - 返回值借用输入，不分配。
pub fn strip_port(raw: &str) -> &str {
    let colons = raw.matches(':').count();
    match colons {
        0 => raw,
        1 => raw.split(':').next().unwrap_or(raw),
        _ => match raw.rfind(':') {
            Some(idx) if raw.starts_with('[') && raw[..idx].ends_with(']') => &raw[..idx],
            _ => raw,
        },
    }
}

/// 从 `host:port` 中解析端口；无端口或无法解析时返回 `None`。
pub fn port_of(raw: &str) -> Option<u16> {
    let host = strip_port(raw);
    if host.len() == raw.len() {
        return None;
    }
    raw[host.len() + 1..].parse().ok()
}

/// 从 `http://host:port/path` 形式的 URL 中解析端口。
pub(crate) fn url_port(url: &str) -> Option<u16> {
    let authority = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = authority.split('/').next().unwrap_or(authority);
    port_of(authority)
}

/// 以“主机名 + 端口”标识的节点端点，用作节点集合的键。
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostEndpoint {
    host: String,
    port: u16,
}

impl HostEndpoint {
    /// 构造端点；`host` 中若带端口会被剥离。
    pub fn new(host: impl AsRef<str>, port: u16) -> Self {
        Self {
            host: strip_port(host.as_ref()).to_owned(),
            port,
        }
    }

    /// 解析 `host:port` 字符串。
    pub fn parse(raw: &str) -> Option<Self> {
        port_of(raw).map(|port| Self::new(strip_port(raw), port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for HostEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_port_handles_address_shapes() {
        assert_eq!(strip_port("10.0.0.1"), "10.0.0.1");
        assert_eq!(strip_port("10.0.0.1:8091"), "10.0.0.1");
        assert_eq!(strip_port("[::1]:11210"), "[::1]");
        assert_eq!(strip_port("fe80::1"), "fe80::1");
    }

    #[test]
    fn url_port_reads_authority() {
        assert_eq!(url_port("http://cb1.local:8092/default"), Some(8092));
        assert_eq!(url_port("http://cb1.local/default"), None);
    }

    #[test]
    fn endpoint_parse_round_trips_display() {
        let endpoint = HostEndpoint::parse("cb2.local:11210").expect("endpoint");
        assert_eq!(endpoint.host(), "cb2.local");
        assert_eq!(endpoint.port(), 11210);
        assert_eq!(endpoint.to_string(), "cb2.local:11210");
        assert!(HostEndpoint::parse("cb2.local").is_none());
    }
}
