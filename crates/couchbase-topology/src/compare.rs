//! 配置变更判定。
//!
//! 三个函数都是纯函数，`current` 为 `None` 表示尚无已接纳的配置，此时任何候选都算“变化”。

use crate::config::BucketConfig;

/// 候选配置是否应取代当前配置。
///
/// # 契约 (What)
/// - 名称与 `bucket_name` 不一致时恒为 `false`：绝不把其它 bucket 的配置应用到本 bucket；
/// - 没有当前配置时为 `true`；
/// - 否则当且仅当候选版本严格更新。
pub fn has_config_changes(
    candidate: &BucketConfig,
    current: Option<&BucketConfig>,
    bucket_name: &str,
) -> bool {
    if candidate.name != bucket_name {
        return false;
    }
    match current {
        None => true,
        Some(current) => candidate.version().is_newer_than(&current.version()),
    }
}

/// vbucket 映射、前向映射或服务器列表是否有任何元素级差异。
pub fn has_vbucket_map_changed(candidate: &BucketConfig, current: Option<&BucketConfig>) -> bool {
    let Some(current) = current else {
        return true;
    };
    match (&candidate.vbucket_server_map, &current.vbucket_server_map) {
        (Some(next), Some(prev)) => next.routing_differs(prev),
        (None, None) => false,
        _ => true,
    }
}

/// 合并后节点集合是否不同（无序比较）。
///
/// 节点以“主机名 + 全部服务端口”为身份：同主机新增节点、KV/TLS 端口变化、服务增减都算变化。
pub fn has_cluster_nodes_changed(candidate: &BucketConfig, current: Option<&BucketConfig>) -> bool {
    match current {
        None => true,
        Some(current) => candidate.node_identities() != current.node_identities(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::version::ConfigVersion;

    fn config(epoch: u64, rev: u64) -> BucketConfig {
        let mut config = BucketConfig::new("default", ConfigVersion::new(epoch, rev));
        config.nodes = vec![Node::new("cb1.local:8091", 11210)];
        config
    }

    #[test]
    fn wrong_bucket_is_never_a_change() {
        assert!(!has_config_changes(&config(1, 2), None, "other"));
    }

    #[test]
    fn absent_current_is_superseded() {
        assert!(has_config_changes(&config(0, 0), None, "default"));
        assert!(has_vbucket_map_changed(&config(0, 0), None));
        assert!(has_cluster_nodes_changed(&config(0, 0), None));
    }

    #[test]
    fn only_strictly_newer_versions_change() {
        let current = config(1, 5);
        assert!(has_config_changes(&config(1, 6), Some(&current), "default"));
        assert!(!has_config_changes(&config(1, 5), Some(&current), "default"));
        assert!(!has_config_changes(&config(0, 99), Some(&current), "default"));
    }

    #[test]
    fn hostname_change_is_a_node_change() {
        let current = config(1, 1);
        let mut candidate = config(1, 2);
        assert!(!has_cluster_nodes_changed(&candidate, Some(&current)));
        candidate.nodes[0].hostname = "cb9.local:8091".to_owned();
        assert!(has_cluster_nodes_changed(&candidate, Some(&current)));
    }

    #[test]
    fn second_node_on_the_same_host_is_a_node_change() {
        let mut current = BucketConfig::new("default", ConfigVersion::new(1, 1));
        current.nodes = vec![Node::new("127.0.0.1:9000", 12000)];
        let mut candidate = BucketConfig::new("default", ConfigVersion::new(1, 2));
        candidate.nodes = vec![
            Node::new("127.0.0.1:9000", 12000),
            Node::new("127.0.0.1:9001", 12002),
        ];
        assert_eq!(candidate.hostnames(), current.hostnames());
        assert!(has_cluster_nodes_changed(&candidate, Some(&current)));
    }

    #[test]
    fn port_or_service_change_is_a_node_change() {
        let current = config(1, 1);

        let mut kv_moved = config(1, 2);
        kv_moved.nodes[0].ports.direct = 11211;
        assert!(has_cluster_nodes_changed(&kv_moved, Some(&current)));

        let mut tls_added = config(1, 2);
        tls_added.nodes[0].ports.ssl_direct = 11207;
        assert!(has_cluster_nodes_changed(&tls_added, Some(&current)));
    }
}
