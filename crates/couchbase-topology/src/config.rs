//! `BucketConfig`：单个 bucket 拓扑的不可变快照。
//!
//! # 教案式说明
//! - **生命周期 (How)**：反序列化服务端文档 → [`BucketConfig::finish`] 替换 `$HOST` 占位符并按
//!   `serverList` 重排 `nodes`/`nodesExt` → 被丢弃（不够新）或发布为“当前配置”。发布后只以
//!   `Arc<BucketConfig>` 共享，不再修改；
//! - **相等性 (What)**：[`PartialEq`] 只比较“可观测的拓扑”：名称、认证类型、定位器、uuid、
//!   bucket 类型、重排后的节点集合与 vbucket 映射；修订号本身不参与比较；
//! - **版本 (What)**：[`BucketConfig::version`] 由 `revEpoch` 与 `rev` 即时派生，不单独存储。

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::HOST_PLACEHOLDER;
use crate::adapter::{NodeAdapter, ServicePorts, merge_plan};
use crate::endpoint::{HostEndpoint, strip_port};
use crate::error::TopologyError;
use crate::node::{Node, NodeExt};
use crate::vbucket::VBucketServerMap;
use crate::version::ConfigVersion;

/// 选择向调用方暴露默认地址还是外部备用地址。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkResolution {
    /// 始终使用默认网络地址。
    Default,
    /// 只要节点声明了外部地址即使用之。
    External,
    /// 下发配置的主机与节点默认主机名不一致时切换到外部地址。
    #[default]
    Auto,
}

/// bucket 拓扑快照，字段与服务端 JSON 一一对应。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uuid: String,
    /// 旧式数值修订号。
    #[serde(default)]
    pub rev: u64,
    #[serde(default)]
    pub rev_epoch: u64,
    #[serde(default)]
    pub node_locator: String,
    #[serde(default, alias = "bucketTypeName", skip_serializing_if = "String::is_empty")]
    pub bucket_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_type: String,
    #[serde(default)]
    pub bucket_capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bucket_capabilities_ver: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cluster_capabilities: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_capabilities_ver: Vec<u32>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub nodes_ext: Vec<NodeExt>,
    #[serde(
        default,
        rename = "vBucketServerMap",
        skip_serializing_if = "Option::is_none"
    )]
    pub vbucket_server_map: Option<VBucketServerMap>,
    #[serde(skip)]
    network_resolution: NetworkResolution,
    #[serde(skip)]
    surrogate_host: Option<String>,
}

impl BucketConfig {
    /// 构造只含名称与版本的空拓扑，常用于测试与引导占位。
    pub fn new(name: impl Into<String>, version: ConfigVersion) -> Self {
        Self {
            name: name.into(),
            rev: version.revision,
            rev_epoch: version.epoch,
            ..Self::default()
        }
    }

    /// 解析服务端文档并完成后处理。
    ///
    /// - `source_host`：返回该文档的节点主机，用于替换 `$HOST` 占位符并作为
    ///   [`NetworkResolution::Auto`] 的比较基准。
    pub fn from_json(bytes: &[u8], source_host: &str) -> Result<Self, TopologyError> {
        let mut config: BucketConfig = serde_json::from_slice(bytes)?;
        config.finish(source_host);
        Ok(config)
    }

    /// [`Self::from_json`] 的字符串版本。
    pub fn from_json_str(raw: &str, source_host: &str) -> Result<Self, TopologyError> {
        Self::from_json(raw.as_bytes(), source_host)
    }

    /// 以服务端字段名序列化。
    pub fn to_json(&self) -> Result<String, TopologyError> {
        Ok(serde_json::to_string(self)?)
    }

    /// 反序列化后的规范化步骤。
    ///
    /// 1. 以 `source_host` 替换节点、扩展节点与 `serverList` 中的 `$HOST`，缺失的扩展节点主机名回填为 `source_host`；
    /// 2. 记录 `source_host` 为代理主机；
    /// 3. 按 `serverList` 稳定重排 `nodes` 与 `nodesExt`，未出现在列表中的条目保持相对顺序追加在末尾。
    pub fn finish(&mut self, source_host: &str) {
        let source_host = strip_port(source_host).to_owned();
        for node in &mut self.nodes {
            if node.hostname.is_empty() {
                node.hostname.clone_from(&source_host);
            }
            replace_placeholder(&mut node.hostname, &source_host);
            if let Some(base) = node.couch_api_base.as_mut() {
                replace_placeholder(base, &source_host);
            }
        }
        for ext in &mut self.nodes_ext {
            let hostname = ext.hostname.get_or_insert_with(|| source_host.clone());
            replace_placeholder(hostname, &source_host);
        }
        if let Some(map) = self.vbucket_server_map.as_mut() {
            for server in &mut map.server_list {
                replace_placeholder(server, &source_host);
            }
        }
        self.surrogate_host = Some(source_host);
        self.reorder_by_server_list();
    }

    /// 设置网络解析策略，返回新的快照。
    pub fn with_network_resolution(mut self, resolution: NetworkResolution) -> Self {
        self.network_resolution = resolution;
        self
    }

    pub fn network_resolution(&self) -> NetworkResolution {
        self.network_resolution
    }

    /// 下发该配置的主机（去端口）。
    pub fn surrogate_host(&self) -> Option<&str> {
        self.surrogate_host.as_deref()
    }

    /// `(revEpoch, rev)`。
    pub fn version(&self) -> ConfigVersion {
        ConfigVersion::new(self.rev_epoch, self.rev)
    }

    /// 校验可路由性：必须携带 bucket 名称。
    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.name.is_empty() {
            return Err(TopologyError::MissingBucketName);
        }
        Ok(())
    }

    /// 合并 `nodes` 与 `nodesExt`，按 `serverList` 顺序返回节点视图。
    pub fn merged_nodes(&self) -> Vec<NodeAdapter> {
        merge_plan(&self.nodes, &self.nodes_ext)
            .into_iter()
            .map(|(node, ext)| {
                NodeAdapter::new(
                    node.map(|idx| &self.nodes[idx]),
                    ext.map(|idx| &self.nodes_ext[idx]),
                    self,
                )
            })
            .collect()
    }

    /// 合并后节点的主机名集合（无序）。
    pub fn hostnames(&self) -> BTreeSet<String> {
        self.merged_nodes()
            .into_iter()
            .map(|adapter| adapter.hostname().to_owned())
            .collect()
    }

    /// 合并后节点的身份集合：主机名连同全部服务端口（无序）。
    ///
    /// 同一主机上可能运行多个节点（本地多实例、容器端口映射），只比较主机名会把新增节点、
    /// 端口变化与服务增减都看成“无变化”。
    pub fn node_identities(&self) -> BTreeSet<(String, ServicePorts)> {
        self.merged_nodes()
            .into_iter()
            .map(|adapter| (adapter.hostname().to_owned(), *adapter.ports()))
            .collect()
    }

    /// 可用于引导其它 bucket 的 KV 端点。
    pub fn bootstrap_endpoints(&self, tls: bool) -> Vec<HostEndpoint> {
        self.merged_nodes()
            .iter()
            .filter_map(|adapter| adapter.kv_endpoint(tls))
            .collect()
    }

    /// bucket 是否声明了某项能力，例如 `collections`。
    pub fn has_capability(&self, capability: &str) -> bool {
        self.bucket_capabilities.iter().any(|cap| cap == capability)
    }

    fn reorder_by_server_list(&mut self) {
        let Some(map) = self.vbucket_server_map.as_ref() else {
            return;
        };
        let servers: Vec<(String, Option<u16>)> = map
            .server_list
            .iter()
            .map(|server| {
                let endpoint = HostEndpoint::parse(server);
                (
                    strip_port(server).to_owned(),
                    endpoint.map(|endpoint| endpoint.port()),
                )
            })
            .collect();
        let rank = |host: &str, kv_port: u16| -> usize {
            servers
                .iter()
                .position(|(server_host, port)| {
                    server_host == host && kv_port != 0 && *port == Some(kv_port)
                })
                .or_else(|| servers.iter().position(|(server_host, _)| server_host == host))
                .unwrap_or(usize::MAX)
        };
        self.nodes
            .sort_by_cached_key(|node| rank(node.host(), node.ports.direct));
        self.nodes_ext
            .sort_by_cached_key(|ext| rank(ext.host(), ext.services.kv));
    }
}

fn replace_placeholder(value: &mut String, host: &str) {
    if value.contains(HOST_PLACEHOLDER) {
        *value = value.replace(HOST_PLACEHOLDER, host);
    }
}

impl PartialEq for BucketConfig {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.auth_type == other.auth_type
            && self.node_locator == other.node_locator
            && self.uuid == other.uuid
            && self.bucket_type == other.bucket_type
            && self.nodes == other.nodes
            && self.nodes_ext == other.nodes_ext
            && self.vbucket_server_map == other.vbucket_server_map
    }
}

impl Eq for BucketConfig {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Services;

    const SINGLE_NODE: &str = r#"{
        "rev": 42,
        "revEpoch": 1,
        "name": "travel-sample",
        "uuid": "2b1c6fa2a0b0c6c7f0d2c6c1",
        "nodeLocator": "vbucket",
        "bucketCapabilities": ["collections", "durableWrite"],
        "nodes": [
            {"couchApiBase": "http://$HOST:8092/travel-sample", "hostname": "$HOST:8091",
             "ports": {"direct": 11210}}
        ],
        "nodesExt": [
            {"services": {"mgmt": 8091, "kv": 11210, "capi": 8092, "n1ql": 8093}, "thisNode": true}
        ],
        "vBucketServerMap": {
            "hashAlgorithm": "CRC",
            "numReplicas": 0,
            "serverList": ["$HOST:11210"],
            "vBucketMap": [[0], [0], [-1], [0]]
        },
        "ddocs": {"uri": "/pools/default/buckets/travel-sample/ddocs"}
    }"#;

    #[test]
    fn placeholder_is_replaced_with_source_host() {
        let config = BucketConfig::from_json_str(SINGLE_NODE, "10.1.1.5:8091").expect("parse");
        assert_eq!(config.nodes[0].hostname, "10.1.1.5:8091");
        assert_eq!(
            config.nodes[0].couch_api_base.as_deref(),
            Some("http://10.1.1.5:8092/travel-sample")
        );
        assert_eq!(config.nodes_ext[0].hostname.as_deref(), Some("10.1.1.5"));
        let map = config.vbucket_server_map.as_ref().expect("map");
        assert_eq!(map.server_list, vec!["10.1.1.5:11210".to_owned()]);
        assert_eq!(config.surrogate_host(), Some("10.1.1.5"));
        assert_eq!(config.version(), ConfigVersion::new(1, 42));
        assert!(config.has_capability("collections"));
    }

    #[test]
    fn vbucket_rows_round_trip_exactly() {
        let config = BucketConfig::from_json_str(SINGLE_NODE, "10.1.1.5").expect("parse");
        let json = config.to_json().expect("serialize");
        let reparsed = BucketConfig::from_json_str(&json, "10.1.1.5").expect("reparse");
        let map = reparsed.vbucket_server_map.expect("map");
        assert_eq!(map.vbucket_map, vec![vec![0], vec![0], vec![-1], vec![0]]);
        assert!(map.vbucket_map_forward.is_none());
    }

    #[test]
    fn equality_ignores_revision() {
        let a = BucketConfig::new("default", ConfigVersion::new(1, 5));
        let b = BucketConfig::new("default", ConfigVersion::new(2, 9));
        assert_eq!(a, b);
        let mut c = b.clone();
        c.nodes.push(Node::new("cb1.local:8091", 11210));
        assert_ne!(a, c);
    }

    #[test]
    fn missing_name_fails_validation() {
        let config = BucketConfig::new("", ConfigVersion::new(1, 1));
        assert!(matches!(
            config.validate(),
            Err(TopologyError::MissingBucketName)
        ));
    }

    #[test]
    fn malformed_document_is_reported() {
        let err = BucketConfig::from_json_str(r#"{"rev": "not-a-number"}"#, "cb1")
            .expect_err("malformed");
        assert!(matches!(err, TopologyError::Malformed { .. }));
    }

    #[test]
    fn unmatched_hosts_are_appended_in_original_order() {
        let mut config = BucketConfig::new("default", ConfigVersion::new(1, 1));
        config.nodes = vec![
            Node::new("zeta:8091", 11210),
            Node::new("b:8091", 11210),
            Node::new("omega:8091", 11210),
            Node::new("a:8091", 11210),
        ];
        config.nodes_ext = vec![NodeExt::new("b", Services::data(11210, 11207))];
        config.vbucket_server_map = Some(VBucketServerMap {
            server_list: vec!["a:11210".to_owned(), "b:11210".to_owned()],
            ..VBucketServerMap::default()
        });
        config.finish("a");
        let hosts: Vec<&str> = config.nodes.iter().map(Node::host).collect();
        assert_eq!(hosts, vec!["a", "b", "zeta", "omega"]);
    }
}
