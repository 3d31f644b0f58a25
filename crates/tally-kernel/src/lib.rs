use std::time::Duration;

use tally_contracts::{TransactionKind, TransactionRecord};

/// Tokens granted when an account is provisioned on first read.
pub const INITIAL_GRANT: u64 = 60;
pub const INITIAL_GRANT_DESCRIPTION: &str = "Initial token allocation";

/// How long the display value takes to settle on a new balance.
pub const DEFAULT_TWEEN: Duration = Duration::from_millis(1500);

/// Sufficiency predicate: can `balance` cover a debit of `amount`?
pub fn covers(balance: u64, amount: u64) -> bool {
    balance >= amount
}

/// Signed view of a transaction amount: credits positive, debits negative.
pub fn signed_amount(kind: TransactionKind, amount: u64) -> i64 {
    match kind {
        TransactionKind::Credit => amount as i64,
        TransactionKind::Debit => -(amount as i64),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub consistent: bool,
    pub recorded_balance: u64,
    pub transaction_sum: i64,
    pub drift: i64,
}

/// Compares the recorded balance against the sum of the transaction history.
/// Drift is reported, never repaired; a non-zero drift means the balance row
/// was changed outside the debit/credit path.
pub fn reconcile(recorded_balance: u64, transactions: &[TransactionRecord]) -> Reconciliation {
    let transaction_sum: i64 = transactions
        .iter()
        .map(|t| signed_amount(t.kind, t.amount))
        .sum();
    let drift = recorded_balance as i64 - transaction_sum;
    Reconciliation {
        consistent: drift == 0,
        recorded_balance,
        transaction_sum,
        drift,
    }
}

/// Ease-out quartic: fast start, long settle. Input and output are clamped
/// to [0, 1].
pub fn ease_out_quart(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    1.0 - (1.0 - t).powi(4)
}

/// Presentation-only interpolation between two balance values. Holds no
/// clock and knows nothing about where the values came from; callers sample
/// it with whatever elapsed time their frame source provides.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayTween {
    pub from: f64,
    pub to: f64,
    pub duration: Duration,
}

impl DisplayTween {
    pub fn new(from: f64, to: f64, duration: Duration) -> Self {
        Self { from, to, duration }
    }

    /// Value at `elapsed` since the tween started. Once `elapsed` reaches
    /// the duration this returns exactly `to`, regardless of how the
    /// intermediate frames were sampled.
    pub fn value_at(&self, elapsed: Duration) -> f64 {
        if elapsed >= self.duration || self.duration.is_zero() {
            return self.to;
        }
        let progress = elapsed.as_secs_f64() / self.duration.as_secs_f64();
        self.from + (self.to - self.from) * ease_out_quart(progress)
    }

    pub fn finished(&self, elapsed: Duration) -> bool {
        elapsed >= self.duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn tx(kind: TransactionKind, amount: u64) -> TransactionRecord {
        TransactionRecord {
            id: Uuid::new_v4(),
            owner_id: "owner-1".to_string(),
            kind,
            amount,
            description: "test".to_string(),
            feature: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn covers_is_inclusive_at_the_boundary() {
        assert!(covers(60, 60));
        assert!(covers(60, 0));
        assert!(!covers(50, 75));
    }

    #[test]
    fn credit_then_debit_of_same_amount_sums_to_zero() {
        let sum = signed_amount(TransactionKind::Credit, 25)
            + signed_amount(TransactionKind::Debit, 25);
        assert_eq!(sum, 0);
    }

    #[test]
    fn reconcile_accepts_balance_matching_history() {
        let history = vec![
            tx(TransactionKind::Credit, 60),
            tx(TransactionKind::Debit, 15),
            tx(TransactionKind::Credit, 5),
        ];
        let report = reconcile(50, &history);
        assert!(report.consistent);
        assert_eq!(report.transaction_sum, 50);
        assert_eq!(report.drift, 0);
    }

    #[test]
    fn reconcile_reports_drift_for_tampered_balance() {
        let history = vec![tx(TransactionKind::Credit, 60)];
        let report = reconcile(75, &history);
        assert!(!report.consistent);
        assert_eq!(report.drift, 15);
    }

    #[test]
    fn ease_out_quart_hits_endpoints_exactly() {
        assert_eq!(ease_out_quart(0.0), 0.0);
        assert_eq!(ease_out_quart(1.0), 1.0);
        assert_eq!(ease_out_quart(-0.5), 0.0);
        assert_eq!(ease_out_quart(2.0), 1.0);
    }

    #[test]
    fn ease_out_quart_decelerates() {
        let early = ease_out_quart(0.25);
        let late = ease_out_quart(0.75) - ease_out_quart(0.5);
        assert!(early > late);
    }

    #[test]
    fn tween_converges_exactly_at_the_deadline() {
        let tween = DisplayTween::new(50.0, 110.0, DEFAULT_TWEEN);
        assert_eq!(tween.value_at(DEFAULT_TWEEN), 110.0);
        assert_eq!(tween.value_at(Duration::from_secs(60)), 110.0);
        assert!(tween.finished(DEFAULT_TWEEN));
    }

    #[test]
    fn tween_outcome_is_independent_of_frame_timing() {
        let tween = DisplayTween::new(0.0, 60.0, DEFAULT_TWEEN);
        // Sample at irregular instants; only the final sample matters.
        for ms in [1, 7, 333, 900, 1499] {
            let _ = tween.value_at(Duration::from_millis(ms));
        }
        assert_eq!(tween.value_at(Duration::from_millis(1500)), 60.0);
    }

    #[test]
    fn tween_moves_monotonically_toward_target() {
        let tween = DisplayTween::new(10.0, 70.0, DEFAULT_TWEEN);
        let mut last = tween.value_at(Duration::ZERO);
        for ms in (0..=1500).step_by(100) {
            let v = tween.value_at(Duration::from_millis(ms));
            assert!(v >= last);
            last = v;
        }
    }

    #[test]
    fn zero_duration_tween_is_already_at_target() {
        let tween = DisplayTween::new(10.0, 20.0, Duration::ZERO);
        assert_eq!(tween.value_at(Duration::ZERO), 20.0);
    }
}
