//! `nodes` 与 `nodesExt` 的合并视图。
//!
//! # 教案式说明
//! - **问题 (What)**：两个数组描述同一组物理节点，但长度与顺序都可能错位：
//!   `nodesExt` 覆盖全部集群节点（含纯查询/搜索节点），`nodes` 只列出数据节点，
//!   重平衡期间还可能在 `nodesExt` 末尾残留已驱逐的数据节点；
//! - **算法 (How)**：`BucketConfig::finish` 已按 `serverList` 重排两个数组；这里先根据长度关系
//!   选出 [`MergeCase`]，再在下标切片上生成 `(Option<node_idx>, Option<ext_idx>)` 配对，
//!   最后统一构造 [`NodeAdapter`]。空值判断全部集中在配对阶段；
//! - **失败策略 (Contract)**：合并永不报错。主机名对不上的条目按位置兜底或作为纯扩展节点保留。

use crate::config::{BucketConfig, NetworkResolution};
use crate::endpoint::{HostEndpoint, port_of, strip_port, url_port};
use crate::node::{Node, NodeExt, Services};

/// 节点各服务端口，0 表示不提供该服务。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServicePorts {
    pub kv: u16,
    pub kv_tls: u16,
    pub views: u16,
    pub views_tls: u16,
    pub query: u16,
    pub query_tls: u16,
    pub search: u16,
    pub search_tls: u16,
    pub analytics: u16,
    pub analytics_tls: u16,
    pub mgmt: u16,
    pub mgmt_tls: u16,
}

impl From<&Services> for ServicePorts {
    fn from(services: &Services) -> Self {
        Self {
            kv: services.kv,
            kv_tls: services.kv_ssl,
            views: services.capi,
            views_tls: services.capi_ssl,
            query: services.n1ql,
            query_tls: services.n1ql_ssl,
            search: services.fts,
            search_tls: services.fts_ssl,
            analytics: services.cbas,
            analytics_tls: services.cbas_ssl,
            mgmt: services.mgmt,
            mgmt_tls: services.mgmt_ssl,
        }
    }
}

/// `Node` + `NodeExt` 的合并视图，派生数据，不单独持久化。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAdapter {
    hostname: String,
    couch_api_base: Option<String>,
    ports: ServicePorts,
    alternate_network: bool,
}

impl NodeAdapter {
    /// 由一对可能缺失的节点描述构造视图；两者至少存在其一。
    pub(crate) fn new(node: Option<&Node>, ext: Option<&NodeExt>, config: &BucketConfig) -> Self {
        let alternate_network = ext.is_some_and(|ext| uses_alternate_network(ext, config));
        let hostname = resolve_hostname(node, ext, alternate_network);
        let couch_api_base = node.and_then(|node| node.couch_api_base.clone());

        let ports = match ext {
            Some(ext) => {
                let services = match ext.alternate_addresses.as_ref() {
                    Some(alt) if alternate_network => alt
                        .external
                        .as_ref()
                        .and_then(|external| external.ports.as_ref())
                        .unwrap_or(&ext.services),
                    _ => &ext.services,
                };
                let mut ports = ServicePorts::from(services);
                if !alternate_network && node.is_none() {
                    // 缺少 `nodes` 条目的数据服务尚未就绪。
                    ports.kv = 0;
                    ports.kv_tls = 0;
                }
                ports
            }
            None => node.map_or_else(ServicePorts::default, |node| ServicePorts {
                kv: node.ports.direct,
                kv_tls: node.ports.ssl_direct,
                views: couch_api_base.as_deref().and_then(url_port).unwrap_or(0),
                views_tls: node.ports.https_capi,
                mgmt: port_of(&node.hostname).unwrap_or(0),
                mgmt_tls: node.ports.https_mgmt,
                ..ServicePorts::default()
            }),
        };

        Self {
            hostname,
            couch_api_base,
            ports,
            alternate_network,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn couch_api_base(&self) -> Option<&str> {
        self.couch_api_base.as_deref()
    }

    pub fn ports(&self) -> &ServicePorts {
        &self.ports
    }

    /// 是否正在使用外部备用地址。
    pub fn uses_alternate_network(&self) -> bool {
        self.alternate_network
    }

    pub fn is_kv_node(&self) -> bool {
        self.ports.kv > 0 || self.ports.kv_tls > 0
    }

    pub fn is_query_node(&self) -> bool {
        self.ports.query > 0 || self.ports.query_tls > 0
    }

    pub fn is_search_node(&self) -> bool {
        self.ports.search > 0 || self.ports.search_tls > 0
    }

    pub fn is_analytics_node(&self) -> bool {
        self.ports.analytics > 0 || self.ports.analytics_tls > 0
    }

    pub fn is_views_node(&self) -> bool {
        self.ports.views > 0 || self.ports.views_tls > 0
    }

    /// KV 服务端点；节点不提供对应（明文/TLS）端口时返回 `None`。
    pub fn kv_endpoint(&self, tls: bool) -> Option<HostEndpoint> {
        let port = if tls { self.ports.kv_tls } else { self.ports.kv };
        (port != 0).then(|| HostEndpoint::new(&self.hostname, port))
    }
}

fn uses_alternate_network(ext: &NodeExt, config: &BucketConfig) -> bool {
    if ext.external_hostname().is_none() {
        return false;
    }
    match config.network_resolution() {
        NetworkResolution::Default => false,
        NetworkResolution::External => true,
        NetworkResolution::Auto => config
            .surrogate_host()
            .is_some_and(|surrogate| surrogate != ext.host()),
    }
}

fn resolve_hostname(node: Option<&Node>, ext: Option<&NodeExt>, alternate: bool) -> String {
    let from_ext = ext.and_then(|ext| {
        if alternate {
            ext.external_hostname()
        } else {
            ext.hostname.as_deref()
        }
    });
    let raw = match from_ext {
        Some(hostname) if !hostname.trim().is_empty() => hostname,
        _ => node.map(|node| node.hostname.as_str()).unwrap_or(""),
    };
    if raw.contains(crate::HOST_PLACEHOLDER) {
        return "localhost".to_owned();
    }
    strip_port(raw).to_owned()
}

/// 由两个数组长度关系决定的合并分支。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MergeCase {
    /// 没有 `nodesExt`：只用 `nodes`。
    ExtAbsent,
    /// 没有 `nodes`：只用 `nodesExt`。
    NodesAbsent,
    /// 等长：按主机名配对，对不上时按位置。
    Aligned,
    /// `nodesExt` 更短：每个 `Node` 一条，能找到同主机扩展信息时附带。
    ExtShorter,
    /// `nodesExt` 更长：每个扩展节点一条，过滤掉没有 `Node` 对应的数据节点。
    ExtLonger,
}

impl MergeCase {
    pub(crate) fn classify(nodes: usize, ext: usize) -> Self {
        match (nodes, ext) {
            (_, 0) => MergeCase::ExtAbsent,
            (0, _) => MergeCase::NodesAbsent,
            (n, e) if n == e => MergeCase::Aligned,
            (n, e) if e < n => MergeCase::ExtShorter,
            _ => MergeCase::ExtLonger,
        }
    }
}

type Pair = (Option<usize>, Option<usize>);

/// 生成 `nodes`/`nodesExt` 的下标配对，顺序即输出顺序。
pub(crate) fn merge_plan(nodes: &[Node], ext: &[NodeExt]) -> Vec<Pair> {
    let mut used_ext = vec![false; ext.len()];
    let mut used_nodes = vec![false; nodes.len()];
    match MergeCase::classify(nodes.len(), ext.len()) {
        MergeCase::ExtAbsent => (0..nodes.len()).map(|idx| (Some(idx), None)).collect(),
        MergeCase::NodesAbsent => (0..ext.len()).map(|idx| (None, Some(idx))).collect(),
        MergeCase::Aligned => (0..nodes.len())
            .map(|idx| {
                let paired = find_ext(&nodes[idx], ext, &used_ext, idx)
                    .or_else(|| (!used_ext[idx]).then_some(idx))
                    .or_else(|| used_ext.iter().position(|used| !used));
                if let Some(ext_idx) = paired {
                    used_ext[ext_idx] = true;
                }
                (Some(idx), paired)
            })
            .collect(),
        MergeCase::ExtShorter => (0..nodes.len())
            .map(|idx| {
                let paired = find_ext(&nodes[idx], ext, &used_ext, idx);
                if let Some(ext_idx) = paired {
                    used_ext[ext_idx] = true;
                }
                (Some(idx), paired)
            })
            .collect(),
        MergeCase::ExtLonger => ext
            .iter()
            .enumerate()
            .filter_map(|(ext_idx, candidate)| {
                let node_idx = nodes
                    .iter()
                    .enumerate()
                    .position(|(idx, node)| !used_nodes[idx] && same_node(node, candidate));
                match node_idx {
                    Some(node_idx) => {
                        used_nodes[node_idx] = true;
                        Some((Some(node_idx), Some(ext_idx)))
                    }
                    None if candidate.services.kv == 0 => Some((None, Some(ext_idx))),
                    // 只剩扩展信息的数据节点：已被驱逐。
                    None => None,
                }
            })
            .collect(),
    }
}

fn same_node(node: &Node, ext: &NodeExt) -> bool {
    node.host() == ext.host()
        && (node.ports.direct == 0 || ext.services.kv == 0 || node.ports.direct == ext.services.kv)
}

fn find_ext(node: &Node, ext: &[NodeExt], used: &[bool], preferred: usize) -> Option<usize> {
    if preferred < ext.len() && !used[preferred] && same_node(node, &ext[preferred]) {
        return Some(preferred);
    }
    ext.iter()
        .enumerate()
        .position(|(idx, candidate)| !used[idx] && same_node(node, candidate))
}
