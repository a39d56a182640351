//! The shared allocation budget.
//!
//! Built with `--cfg loom`, the budget uses loom's atomics so the claim,
//! credit and refund loops can be model-checked.

#[cfg(loom)]
use loom::sync::atomic::{AtomicIsize, AtomicU64, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering};

/// One word in the fixed-point unit of the credit remainder.
const FRACTION_ONE: u64 = 1 << 32;

/// Signed budget of allocation words, with sub-word credit carried over
/// between reports.
#[derive(Debug)]
pub struct PacerBudget {
    words: AtomicIsize,
    /// Credit below one word, in units of `1 / FRACTION_ONE` words.
    fraction: AtomicU64,
}

impl PacerBudget {
    /// Create a budget holding `words`.
    #[must_use]
    pub fn new(words: isize) -> Self {
        Self {
            words: AtomicIsize::new(words),
            fraction: AtomicU64::new(0),
        }
    }

    /// Whole words currently available. Negative after forced claims.
    #[must_use]
    pub fn load(&self) -> isize {
        self.words.load(Ordering::Acquire)
    }

    /// Re-baseline to `words`, dropping any carried remainder.
    pub fn reset(&self, words: isize) {
        self.fraction.store(0, Ordering::Release);
        self.words.store(words, Ordering::Release);
    }

    /// Add `amount` words of credit. The fractional part accumulates until it
    /// adds up to a whole word.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn credit(&self, amount: f64) {
        if amount.is_nan() || amount <= 0.0 {
            return;
        }
        let whole = amount.trunc();
        // Float to int casts saturate.
        let mut inc = whole as isize;
        let part = ((amount - whole) * FRACTION_ONE as f64) as u64;

        if part > 0 {
            let mut cur = self.fraction.load(Ordering::Acquire);
            loop {
                let sum = cur + part;
                let (next, carry) = if sum >= FRACTION_ONE {
                    (sum - FRACTION_ONE, 1)
                } else {
                    (sum, 0)
                };
                match self.fraction.compare_exchange_weak(
                    cur,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        inc = inc.saturating_add(carry);
                        break;
                    }
                    Err(actual) => cur = actual,
                }
            }
        }

        if inc > 0 {
            self.words.fetch_add(inc, Ordering::AcqRel);
        }
    }

    /// Take `cost` words. Without `force`, fails and leaves the budget alone
    /// when it cannot cover `cost`.
    pub fn try_claim(&self, cost: isize, force: bool) -> bool {
        let mut cur = self.words.load(Ordering::Acquire);
        loop {
            if cur < cost && !force {
                return false;
            }
            match self.words.compare_exchange_weak(
                cur,
                cur.saturating_sub(cost),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Give back `cost` words from an unused claim.
    pub fn refund(&self, cost: isize) {
        self.words.fetch_add(cost, Ordering::AcqRel);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_fractional_credit_accumulates() {
        let budget = PacerBudget::new(0);
        for _ in 0..100 {
            budget.credit(0.5);
        }
        assert_eq!(budget.load(), 50);
    }

    #[test]
    fn test_credit_carries_remainder_across_whole_words() {
        let budget = PacerBudget::new(0);
        budget.credit(2.75);
        assert_eq!(budget.load(), 2);
        budget.credit(0.25);
        assert_eq!(budget.load(), 3);
    }

    #[test]
    fn test_reset_drops_remainder() {
        let budget = PacerBudget::new(0);
        budget.credit(0.75);
        budget.reset(10);
        budget.credit(0.5);
        assert_eq!(budget.load(), 10);
    }

    #[test]
    fn test_non_positive_credit_is_ignored() {
        let budget = PacerBudget::new(4);
        budget.credit(0.0);
        budget.credit(-3.0);
        budget.credit(f64::NAN);
        assert_eq!(budget.load(), 4);
    }

    #[test]
    fn test_claim_and_refund() {
        let budget = PacerBudget::new(5);
        assert!(!budget.try_claim(6, false));
        assert_eq!(budget.load(), 5);
        assert!(budget.try_claim(6, true));
        assert_eq!(budget.load(), -1);
        budget.refund(6);
        assert_eq!(budget.load(), 5);
    }
}
