//! Coin selection.
//!
//! Given the spendable tokens and a target, pick what to send. Preference
//! order:
//!
//! 1. one token of exactly the target;
//! 2. a subset that sums exactly to the target, found by a largest-first
//!    depth-first search capped at [`EXACT_SEARCH_BUDGET`] nodes;
//! 3. the smallest single divisible token larger than the target, divided;
//! 4. largest-first accumulation, dividing the token that overshoots.
//!
//! Only tokens this wallet was issued directly are divisible. Tokens received
//! from a peer are always spent whole.

use crate::token::TokenId;

/// Search nodes the exact-subset pass may visit before giving up and
/// falling back to division.
pub const EXACT_SEARCH_BUDGET: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub id: TokenId,
    pub amount: u64,
    pub divisible: bool,
}

/// What to send: whole tokens, plus at most one token to divide with the
/// portion of it that goes to the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub whole: Vec<TokenId>,
    pub split: Option<(TokenId, u64)>,
}

impl Selection {
    /// Every token the plan touches.
    pub fn token_ids(&self) -> Vec<TokenId> {
        let mut ids = self.whole.clone();
        ids.extend(self.split.map(|(id, _)| id));
        ids
    }

    fn whole(ids: Vec<TokenId>) -> Self {
        Self {
            whole: ids,
            split: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionError {
    /// The candidates don't add up to the target.
    Insufficient { available: u64 },
    /// Enough value, but no way to hit the target exactly without dividing
    /// a token that can't be divided.
    NoExactChange,
}

pub fn select(candidates: &[Candidate], target: u64) -> Result<Selection, SelectionError> {
    let available = candidates
        .iter()
        .fold(0u64, |acc, c| acc.saturating_add(c.amount));
    if target == 0 || available < target {
        return Err(SelectionError::Insufficient { available });
    }

    let mut sorted = candidates.to_vec();
    sorted.sort_by(|a, b| b.amount.cmp(&a.amount).then(a.id.cmp(&b.id)));

    if let Some(exact) = sorted.iter().rev().find(|c| c.amount == target) {
        return Ok(Selection::whole(vec![exact.id]));
    }

    if let Some(subset) = exact_subset(&sorted, target) {
        return Ok(Selection::whole(subset));
    }

    if let Some(single) = smallest_divisible_above(&sorted, target, &[]) {
        return Ok(Selection {
            whole: Vec::new(),
            split: Some((single.id, target)),
        });
    }

    accumulate(&sorted, target)
}

fn exact_subset(sorted: &[Candidate], target: u64) -> Option<Vec<TokenId>> {
    let mut suffix = vec![0u64; sorted.len() + 1];
    for i in (0..sorted.len()).rev() {
        suffix[i] = suffix[i + 1].saturating_add(sorted[i].amount);
    }
    let mut picked = Vec::new();
    let mut budget = EXACT_SEARCH_BUDGET;
    if search(sorted, &suffix, 0, target, &mut picked, &mut budget) {
        Some(picked.into_iter().map(|i| sorted[i].id).collect())
    } else {
        None
    }
}

fn search(
    sorted: &[Candidate],
    suffix: &[u64],
    from: usize,
    remaining: u64,
    picked: &mut Vec<usize>,
    budget: &mut usize,
) -> bool {
    if remaining == 0 {
        return true;
    }
    if *budget == 0 || suffix[from] < remaining {
        return false;
    }
    *budget -= 1;

    let mut last_tried = None;
    for i in from..sorted.len() {
        if suffix[i] < remaining || *budget == 0 {
            break;
        }
        let amount = sorted[i].amount;
        // Equal amounts at the same depth lead to the same subtree.
        if amount == 0 || amount > remaining || last_tried == Some(amount) {
            continue;
        }
        last_tried = Some(amount);
        picked.push(i);
        if search(sorted, suffix, i + 1, remaining - amount, picked, budget) {
            return true;
        }
        picked.pop();
    }
    false
}

fn smallest_divisible_above<'a>(
    sorted: &'a [Candidate],
    amount: u64,
    exclude: &[TokenId],
) -> Option<&'a Candidate> {
    sorted
        .iter()
        .rev()
        .find(|c| c.divisible && c.amount > amount && !exclude.contains(&c.id))
}

fn accumulate(sorted: &[Candidate], target: u64) -> Result<Selection, SelectionError> {
    let mut sum = 0u64;
    let mut whole = Vec::new();
    for c in sorted {
        let remaining = target - sum;
        if c.amount <= remaining {
            sum += c.amount;
            whole.push(c.id);
            if sum == target {
                return Ok(Selection::whole(whole));
            }
            continue;
        }
        // `c` overshoots.
        if c.divisible {
            return Ok(Selection {
                whole,
                split: Some((c.id, remaining)),
            });
        }
        // Fall back to any other divisible token big enough for the rest.
        return match smallest_divisible_above(sorted, remaining, &whole) {
            Some(d) => Ok(Selection {
                whole,
                split: Some((d.id, remaining)),
            }),
            None => Err(SelectionError::NoExactChange),
        };
    }
    Err(SelectionError::NoExactChange)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cands(amounts: &[(u64, bool)]) -> Vec<Candidate> {
        amounts
            .iter()
            .map(|&(amount, divisible)| Candidate {
                id: TokenId::random(),
                amount,
                divisible,
            })
            .collect()
    }

    fn amount_of(c: &[Candidate], id: &TokenId) -> u64 {
        c.iter().find(|x| x.id == *id).unwrap().amount
    }

    fn paid(c: &[Candidate], s: &Selection) -> u64 {
        s.whole.iter().map(|id| amount_of(c, id)).sum::<u64>()
            + s.split.map(|(_, p)| p).unwrap_or(0)
    }

    #[test]
    fn exact_single_token_wins() {
        let c = cands(&[(50, true), (30, true), (20, true), (10, true)]);
        let s = select(&c, 30).unwrap();
        assert_eq!(s.whole, vec![c[1].id]);
        assert!(s.split.is_none());
    }

    #[test]
    fn exact_subset_before_division() {
        let c = cands(&[(100, true), (20, false), (10, false)]);
        let s = select(&c, 30).unwrap();
        assert!(s.split.is_none());
        assert_eq!(paid(&c, &s), 30);
        assert_eq!(s.whole.len(), 2);
    }

    #[test]
    fn exact_subset_beyond_largest_first() {
        // Largest-first stalls at 50 + 30; the three 30s fit exactly.
        let c = cands(&[(50, true), (30, false), (30, false), (30, false)]);
        let s = select(&c, 90).unwrap();
        assert!(s.split.is_none());
        assert_eq!(s.whole.len(), 3);
        assert!(!s.whole.contains(&c[0].id));
        assert_eq!(paid(&c, &s), 90);
    }

    #[test]
    fn exact_subset_with_received_tokens_only() {
        // 60 leads nowhere; 35 + 35 + 30 is the only exact fit.
        let c = cands(&[(60, false), (35, false), (35, false), (30, false)]);
        let s = select(&c, 100).unwrap();
        assert!(s.split.is_none());
        assert_eq!(paid(&c, &s), 100);
    }

    #[test]
    fn smallest_divisible_above_target() {
        let c = cands(&[(500, true), (100, true), (40, false)]);
        let s = select(&c, 70).unwrap();
        assert!(s.whole.is_empty());
        assert_eq!(s.split, Some((c[1].id, 70)));
    }

    #[test]
    fn accumulate_and_divide_the_overshoot() {
        // Nothing single is big enough; 60 + 50 covers 90 with 50 divided.
        let c = cands(&[(60, false), (50, true)]);
        let s = select(&c, 90).unwrap();
        assert_eq!(s.whole, vec![c[0].id]);
        assert_eq!(s.split, Some((c[1].id, 30)));
        assert_eq!(paid(&c, &s), 90);
    }

    #[test]
    fn received_tokens_are_never_divided() {
        let c = cands(&[(100, false)]);
        assert_eq!(select(&c, 30), Err(SelectionError::NoExactChange));
    }

    #[test]
    fn overshoot_falls_back_to_another_divisible_token() {
        // 60 is taken whole, 50 overshoots but is not divisible; 45 covers
        // the remaining 40.
        let c = cands(&[(60, false), (50, false), (45, true)]);
        let s = select(&c, 100).unwrap();
        assert_eq!(paid(&c, &s), 100);
        assert!(s.split.is_some());
    }

    #[test]
    fn insufficient_reports_available() {
        let c = cands(&[(10, true), (5, true)]);
        assert_eq!(
            select(&c, 16),
            Err(SelectionError::Insufficient { available: 15 })
        );
        assert_eq!(
            select(&c, 0),
            Err(SelectionError::Insufficient { available: 15 })
        );
    }

    #[test]
    fn paid_amount_always_matches_target() {
        let c = cands(&[(1000, true), (500, true), (200, false), (70, false), (5, true)]);
        for target in 1..=1775 {
            if let Ok(s) = select(&c, target) {
                assert_eq!(paid(&c, &s), target, "target {target}");
                if let Some((id, p)) = s.split {
                    assert!(p < amount_of(&c, &id));
                }
            }
        }
    }
}
