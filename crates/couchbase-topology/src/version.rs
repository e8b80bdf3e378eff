//! 配置版本：`(epoch, revision)` 二元组及其全序。
//!
//! # 教案式说明
//! - **契约 (What)**：先比较 `epoch`，相等时再比较 `revision`；字段声明顺序即比较顺序，
//!   因此直接派生 `Ord` 即满足字典序；
//! - **边界 (Edge)**：低 `epoch` 的候选即使 `revision` 更大也永远不是“更新”，
//!   以防持有陈旧纪元的节点上报虚高的修订号；缺失的当前版本总会被任何候选取代。

use core::cmp::Ordering;
use core::fmt;

use serde::{Deserialize, Serialize};

/// 配置版本值对象。
///
/// - `epoch`：仅在重大拓扑事件（如跨故障转移的重平衡完成）时递增的粗粒度世代；
/// - `revision`：同一纪元内单调递增的配置修订号。
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ConfigVersion {
    pub epoch: u64,
    pub revision: u64,
}

impl ConfigVersion {
    /// 尚未观察到任何配置时使用的版本。
    pub const ZERO: Self = Self::new(0, 0);

    /// 构造版本。
    pub const fn new(epoch: u64, revision: u64) -> Self {
        Self { epoch, revision }
    }

    /// 三态比较，等价于 [`Ord::cmp`]。
    pub fn compare(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }

    /// 严格“更新”判定：仅当 `self` 大于 `other` 时返回 `true`，相等不算更新。
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Greater
    }
}

impl fmt::Display for ConfigVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.epoch, self.revision)
    }
}

impl From<(u64, u64)> for ConfigVersion {
    fn from((epoch, revision): (u64, u64)) -> Self {
        Self::new(epoch, revision)
    }
}

/// 候选版本是否取代当前版本；`current` 缺失时恒为 `true`。
pub fn is_newer(candidate: ConfigVersion, current: Option<ConfigVersion>) -> bool {
    match current {
        None => true,
        Some(current) => candidate.is_newer_than(&current),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_dominates_revision() {
        let stale_epoch = ConfigVersion::new(1, 100);
        let fresh_epoch = ConfigVersion::new(2, 1);
        assert!(!stale_epoch.is_newer_than(&fresh_epoch));
        assert!(fresh_epoch.is_newer_than(&stale_epoch));
    }

    #[test]
    fn equal_versions_are_not_newer() {
        let v = ConfigVersion::new(3, 7);
        assert_eq!(v.compare(&v), Ordering::Equal);
        assert!(!v.is_newer_than(&v));
    }

    #[test]
    fn absent_current_is_always_superseded() {
        assert!(is_newer(ConfigVersion::ZERO, None));
        assert!(!is_newer(ConfigVersion::ZERO, Some(ConfigVersion::ZERO)));
    }

    #[test]
    fn display_uses_pair_notation() {
        assert_eq!(ConfigVersion::new(1, 3).to_string(), "(1,3)");
    }
}
