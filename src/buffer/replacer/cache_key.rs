//! Eviction ranking key.

/// Rank of a cached entry: lower keys are evicted first.
///
/// Ordered by `ordering_value`, then `tiebreak`, then `id`. The derived
/// comparison is field by field, so extreme values never overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    pub ordering_value: i64,
    pub tiebreak: i64,
    pub id: i64,
}

impl CacheKey {
    pub fn new(ordering_value: i64, tiebreak: i64, id: i64) -> Self {
        Self {
            ordering_value,
            tiebreak,
            id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_orders_by_value_then_tiebreak_then_id() {
        let a = CacheKey::new(1, 9, 9);
        let b = CacheKey::new(2, 0, 0);
        assert!(a < b);

        let c = CacheKey::new(2, 1, 0);
        assert!(b < c);

        let d = CacheKey::new(2, 1, 5);
        assert!(c < d);
    }

    #[test]
    fn test_extreme_values() {
        let low = CacheKey::new(i64::MIN, 0, 0);
        let high = CacheKey::new(i64::MAX, 0, 0);
        assert!(low < high);
        assert!(high > low);

        let t1 = CacheKey::new(0, i64::MIN, 0);
        let t2 = CacheKey::new(0, i64::MAX, 0);
        assert!(t1 < t2);
    }

    proptest! {
        #[test]
        fn prop_total_order_matches_tuple(
            a in any::<(i64, i64, i64)>(),
            b in any::<(i64, i64, i64)>(),
        ) {
            let ka = CacheKey::new(a.0, a.1, a.2);
            let kb = CacheKey::new(b.0, b.1, b.2);
            prop_assert_eq!(ka.cmp(&kb), a.cmp(&b));
            prop_assert_eq!(ka.cmp(&kb), kb.cmp(&ka).reverse());
        }
    }
}
