//! Denomination splitting and issuance pricing.

use crate::config::BPS_DENOMINATOR;

/// Break `total` into token amounts, largest denomination first.
///
/// With no denominations configured the answer is one token of exactly
/// `total`. Whatever the denominations can't express becomes one final
/// remainder token, so the amounts always sum to `total`.
pub fn split_into_denominations(total: u64, denominations: &[u64]) -> Vec<u64> {
    if total == 0 {
        return Vec::new();
    }
    if denominations.is_empty() {
        return vec![total];
    }

    let mut denoms: Vec<u64> = denominations.iter().copied().filter(|&d| d > 0).collect();
    denoms.sort_unstable_by(|a, b| b.cmp(a));
    denoms.dedup();

    let mut remaining = total;
    let mut out = Vec::new();
    for d in denoms {
        let count = remaining / d;
        out.extend(std::iter::repeat(d).take(count as usize));
        remaining -= count * d;
    }
    if remaining > 0 {
        out.push(remaining);
    }
    out
}

/// Ledger cost of issuing `total`: face value plus the fee, rounded up.
/// `None` on overflow.
pub fn issuance_cost(total: u64, fee_bps: u64) -> Option<u64> {
    let fee = (total as u128 * fee_bps as u128).div_ceil(BPS_DENOMINATOR as u128);
    u64::try_from(total as u128 + fee).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_denominations_means_one_exact_token() {
        assert_eq!(split_into_denominations(12_345, &[]), vec![12_345]);
    }

    #[test]
    fn greedy_largest_first() {
        assert_eq!(
            split_into_denominations(3_700, &[1_000, 500, 100]),
            vec![1_000, 1_000, 1_000, 500, 100, 100]
        );
    }

    #[test]
    fn remainder_token_when_inexpressible() {
        let parts = split_into_denominations(1_234, &[500, 100]);
        assert_eq!(parts, vec![500, 500, 100, 100, 34]);
        assert_eq!(parts.iter().sum::<u64>(), 1_234);
    }

    #[test]
    fn unsorted_duplicate_denominations() {
        assert_eq!(split_into_denominations(600, &[100, 500, 500]), vec![500, 100]);
    }

    #[test]
    fn zero_total_is_empty() {
        assert!(split_into_denominations(0, &[100]).is_empty());
    }

    #[test]
    fn cost_rounds_fee_up() {
        assert_eq!(issuance_cost(10_000, 0), Some(10_000));
        assert_eq!(issuance_cost(10_000, 25), Some(10_025));
        assert_eq!(issuance_cost(1, 1), Some(2));
        assert_eq!(issuance_cost(u64::MAX, 1), None);
    }
}
