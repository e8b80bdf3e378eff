//! vbucket → 节点下标映射。
//!
//! 每一行形如 `[active, replica1, replica2, ...]`，元素为 `serverList` 下标，
//! `-1` 表示该分区暂无归属节点。`serverList` 是节点的权威顺序。

use serde::{Deserialize, Serialize};

use crate::endpoint::strip_port;

/// 分区尚未分配节点时的占位下标。
pub const NO_OWNER: i16 = -1;

/// `vBucketServerMap` 文档。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VBucketServerMap {
    #[serde(default, rename = "hashAlgorithm")]
    pub hash_algorithm: String,
    #[serde(default, rename = "numReplicas")]
    pub num_replicas: u32,
    #[serde(default, rename = "serverList")]
    pub server_list: Vec<String>,
    #[serde(default, rename = "vBucketMap")]
    pub vbucket_map: Vec<Vec<i16>>,
    /// 重平衡进行中才会出现的前向映射。
    #[serde(
        default,
        rename = "vBucketMapForward",
        skip_serializing_if = "Option::is_none"
    )]
    pub vbucket_map_forward: Option<Vec<Vec<i16>>>,
}

impl VBucketServerMap {
    /// 分区数量。
    pub fn num_vbuckets(&self) -> usize {
        self.vbucket_map.len()
    }

    /// 是否处于重平衡（存在前向映射）。
    pub fn is_rebalancing(&self) -> bool {
        self.vbucket_map_forward
            .as_ref()
            .is_some_and(|forward| !forward.is_empty())
    }

    /// 指定分区的活跃节点，形如 `host:port`。
    pub fn active_server(&self, vbucket: usize) -> Option<&str> {
        self.server_at(vbucket, 0)
    }

    /// 指定分区第 `replica`（从 1 开始）个副本所在节点。
    pub fn replica_server(&self, vbucket: usize, replica: usize) -> Option<&str> {
        if replica == 0 {
            return None;
        }
        self.server_at(vbucket, replica)
    }

    /// `serverList` 中去掉端口的主机名，保持原顺序。
    pub fn server_hosts(&self) -> impl Iterator<Item = &str> {
        self.server_list.iter().map(|server| strip_port(server))
    }

    /// 元素级、顺序敏感地比较映射、前向映射与服务器列表。
    ///
    /// 行的置换同样视为变化：下标的含义随之改变。
    pub fn routing_differs(&self, other: &Self) -> bool {
        self.vbucket_map != other.vbucket_map
            || self.vbucket_map_forward != other.vbucket_map_forward
            || self.server_list != other.server_list
    }

    fn server_at(&self, vbucket: usize, column: usize) -> Option<&str> {
        let index = *self.vbucket_map.get(vbucket)?.get(column)?;
        if index == NO_OWNER {
            return None;
        }
        let index = usize::try_from(index).ok()?;
        self.server_list.get(index).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> VBucketServerMap {
        VBucketServerMap {
            hash_algorithm: "CRC".to_owned(),
            num_replicas: 1,
            server_list: vec!["cb1.local:11210".to_owned(), "cb2.local:11210".to_owned()],
            vbucket_map: vec![vec![0, 1], vec![1, 0], vec![1, NO_OWNER]],
            vbucket_map_forward: None,
        }
    }

    #[test]
    fn resolves_active_and_replica_owners() {
        let map = map();
        assert_eq!(map.active_server(0), Some("cb1.local:11210"));
        assert_eq!(map.replica_server(0, 1), Some("cb2.local:11210"));
        assert_eq!(map.replica_server(2, 1), None);
        assert_eq!(map.active_server(9), None);
    }

    #[test]
    fn row_permutation_is_a_routing_change() {
        let before = map();
        let mut after = before.clone();
        after.vbucket_map.swap(0, 1);
        assert!(after.routing_differs(&before));
        assert!(!before.routing_differs(&before.clone()));
    }

    #[test]
    fn forward_map_marks_rebalance() {
        let mut map = map();
        assert!(!map.is_rebalancing());
        map.vbucket_map_forward = Some(vec![vec![1, 0]]);
        assert!(map.is_rebalancing());
    }
}
