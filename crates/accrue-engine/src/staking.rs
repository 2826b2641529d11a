//! Pre-staking split of a user's own total.

/// Split `total` into `(standard, pre_staking)`.
///
/// `allocation` is the percentage of the total elected for pre-staking;
/// `bonus` is the percentage uplift applied to the pre-staked part.
pub fn split_pre_staking(total: f64, allocation: f64, bonus: f64) -> (f64, f64) {
    let allocation = allocation.clamp(0.0, 100.0);
    let standard = total * (100.0 - allocation) / 100.0;
    let pre_staking = total * allocation / 100.0 * (100.0 + bonus.max(0.0)) / 100.0;
    (standard, pre_staking)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_allocation_is_all_standard() {
        assert_eq!(split_pre_staking(80.0, 0.0, 50.0), (80.0, 0.0));
    }

    #[test]
    fn half_allocation_with_bonus() {
        assert_eq!(split_pre_staking(80.0, 50.0, 25.0), (40.0, 50.0));
    }

    #[test]
    fn allocation_is_clamped() {
        assert_eq!(split_pre_staking(10.0, 150.0, 0.0), (0.0, 10.0));
    }
}
