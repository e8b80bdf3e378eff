//! 服务端配置文档中的节点 DTO。
//!
//! 字段名由服务端兼容性固定，序列化时省略零值端口与空字段，反序列化时忽略未知字段。

use serde::{Deserialize, Serialize};

use crate::endpoint::strip_port;

fn is_zero(port: &u16) -> bool {
    *port == 0
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// `nodes[]` 中的单个节点：只列出承载该 bucket 数据服务的节点。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// `host:8091` 形式的管理地址。
    #[serde(default)]
    pub hostname: String,
    #[serde(
        default,
        rename = "couchApiBase",
        skip_serializing_if = "Option::is_none"
    )]
    pub couch_api_base: Option<String>,
    #[serde(
        default,
        rename = "couchApiBaseHTTPS",
        skip_serializing_if = "Option::is_none"
    )]
    pub couch_api_base_https: Option<String>,
    #[serde(default)]
    pub ports: NodePorts,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
}

impl Node {
    /// 以主机名与 KV 端口构造最小节点，供测试与引导场景使用。
    pub fn new(hostname: impl Into<String>, kv_port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            ports: NodePorts {
                direct: kv_port,
                ..NodePorts::default()
            },
            ..Self::default()
        }
    }

    /// 去掉端口后的主机名。
    pub fn host(&self) -> &str {
        strip_port(&self.hostname)
    }
}

/// `nodes[].ports`。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePorts {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub direct: u16,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub proxy: u16,
    #[serde(default, rename = "sslDirect", skip_serializing_if = "is_zero")]
    pub ssl_direct: u16,
    #[serde(default, rename = "httpsMgmt", skip_serializing_if = "is_zero")]
    pub https_mgmt: u16,
    #[serde(default, rename = "httpsCAPI", skip_serializing_if = "is_zero")]
    pub https_capi: u16,
}

/// `nodesExt[]` 中的单个节点：覆盖集群全部节点及其服务端口，按主机名而非下标对应。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeExt {
    /// 缺失时表示“与下发配置的主机相同”，由 `BucketConfig::finish` 回填。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub services: Services,
    #[serde(
        default,
        rename = "alternateAddresses",
        skip_serializing_if = "Option::is_none"
    )]
    pub alternate_addresses: Option<AlternateAddresses>,
    #[serde(default, rename = "thisNode", skip_serializing_if = "is_false")]
    pub this_node: bool,
}

impl NodeExt {
    /// 以主机名与服务端口构造扩展节点。
    pub fn new(hostname: impl Into<String>, services: Services) -> Self {
        Self {
            hostname: Some(hostname.into()),
            services,
            ..Self::default()
        }
    }

    /// 去掉端口后的主机名；缺失时返回空串。
    pub fn host(&self) -> &str {
        self.hostname.as_deref().map(strip_port).unwrap_or("")
    }

    /// 外部网络备用主机名（非空时）。
    pub fn external_hostname(&self) -> Option<&str> {
        self.alternate_addresses
            .as_ref()
            .and_then(|alt| alt.external.as_ref())
            .map(|external| external.hostname.as_str())
            .filter(|hostname| !hostname.trim().is_empty())
    }
}

/// `nodesExt[].services`：各服务端口，0 表示节点不提供该服务。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Services {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub mgmt: u16,
    #[serde(default, rename = "mgmtSSL", skip_serializing_if = "is_zero")]
    pub mgmt_ssl: u16,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub kv: u16,
    #[serde(default, rename = "kvSSL", skip_serializing_if = "is_zero")]
    pub kv_ssl: u16,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub capi: u16,
    #[serde(default, rename = "capiSSL", skip_serializing_if = "is_zero")]
    pub capi_ssl: u16,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub n1ql: u16,
    #[serde(default, rename = "n1qlSSL", skip_serializing_if = "is_zero")]
    pub n1ql_ssl: u16,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub fts: u16,
    #[serde(default, rename = "ftsSSL", skip_serializing_if = "is_zero")]
    pub fts_ssl: u16,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cbas: u16,
    #[serde(default, rename = "cbasSSL", skip_serializing_if = "is_zero")]
    pub cbas_ssl: u16,
}

impl Services {
    /// 仅含数据服务（KV + 管理端口）的常见组合。
    pub fn data(kv: u16, kv_ssl: u16) -> Self {
        Self {
            mgmt: 8091,
            mgmt_ssl: 18091,
            kv,
            kv_ssl,
            ..Self::default()
        }
    }
}

/// `nodesExt[].alternateAddresses`。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternateAddresses {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<AlternateAddress>,
}

/// 外部网络的备用地址；端口集合可缺省，缺省时沿用默认网络端口。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternateAddress {
    #[serde(default)]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Services>,
}
