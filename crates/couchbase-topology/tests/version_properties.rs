//! `ConfigVersion` 全序性质。
//!
//! # 教案式说明
//! - **目标 (Why)**：版本比较是整个传播链路的唯一裁判，一旦出现非传递或非反对称的结果，
//!   下游就可能在两个配置之间来回摆动；
//! - **手法 (How)**：用 Proptest 生成任意 `(epoch, revision)`，逐条断言全序定律与纪元优先；
//! - **范围 (What)**：只覆盖纯函数，不涉及运行时。

use core::cmp::Ordering;

use couchbase_topology::{ConfigVersion, is_newer};
use proptest::prelude::*;

fn version() -> impl Strategy<Value = ConfigVersion> {
    (0u64..8, 0u64..8).prop_map(ConfigVersion::from)
}

proptest! {
    #[test]
    fn prop_compare_is_antisymmetric(a in version(), b in version()) {
        prop_assert_eq!(a.compare(&b), b.compare(&a).reverse());
        prop_assert!(!(a.is_newer_than(&b) && b.is_newer_than(&a)));
    }

    #[test]
    fn prop_compare_is_transitive(a in version(), b in version(), c in version()) {
        if a.compare(&b) != Ordering::Less && b.compare(&c) != Ordering::Less {
            prop_assert_ne!(a.compare(&c), Ordering::Less);
        }
    }

    #[test]
    fn prop_lower_epoch_is_never_newer(epoch in 0u64..1000, rev_low in any::<u64>(), rev_high in any::<u64>()) {
        let stale = ConfigVersion::new(epoch, rev_low);
        let fresh = ConfigVersion::new(epoch + 1, rev_high);
        prop_assert!(!stale.is_newer_than(&fresh));
        prop_assert!(is_newer(fresh, Some(stale)));
    }

    #[test]
    fn prop_newer_matches_strict_greater(a in version(), b in version()) {
        prop_assert_eq!(a.is_newer_than(&b), a.compare(&b) == Ordering::Greater);
        prop_assert!(is_newer(a, None));
    }
}

/// 纪元优先的具体样例：`(1,100)` 永远不比 `(2,1)` 新。
#[test]
fn epoch_dominance_sample() {
    assert!(!ConfigVersion::new(1, 100).is_newer_than(&ConfigVersion::new(2, 1)));
}
