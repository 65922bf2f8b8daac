use camlink::RetryPolicy;
use proptest::prelude::*;
use std::time::Duration;

#[test]
fn default_backoff_worked_example() {
    let policy = RetryPolicy::new(1_000, 10_000);
    assert_eq!(policy.next_delay(0), Duration::from_millis(1_000));
    assert_eq!(policy.next_delay(3), Duration::from_millis(8_000));
    assert_eq!(policy.next_delay(4), Duration::from_millis(10_000));
}

proptest! {
    #[test]
    fn next_delay_is_non_decreasing(
        base in 1u64..10_000,
        cap in 1u64..120_000,
        earlier in 0u32..64,
        later in 0u32..64,
    ) {
        prop_assume!(earlier <= later);
        let policy = RetryPolicy::new(base, cap);
        prop_assert!(policy.next_delay(earlier) <= policy.next_delay(later));
    }

    #[test]
    fn next_delay_is_bounded_by_cap(
        base in 1u64..10_000,
        cap in 1u64..120_000,
        attempt in 0u32..256,
    ) {
        let policy = RetryPolicy::new(base, cap);
        prop_assert!(policy.next_delay(attempt) <= Duration::from_millis(cap));
    }

    #[test]
    fn first_delay_is_base_or_cap(base in 1u64..120_000, cap in 1u64..120_000) {
        let policy = RetryPolicy::new(base, cap);
        prop_assert_eq!(
            policy.next_delay(0),
            Duration::from_millis(base.min(cap))
        );
    }

    #[test]
    fn should_retry_iff_below_budget(attempt in 0u32..512, max in 0u32..512) {
        let policy = RetryPolicy::default();
        prop_assert_eq!(policy.should_retry(attempt, max), attempt < max);
    }
}
