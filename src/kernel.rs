//! Pure token-bucket arithmetic.
//!
//! Every function in this module is a total integer function with no I/O:
//! the same inputs produce the same outputs on every node, which is what
//! allows many independent processes to agree on bucket state through a
//! shared store. All token quantities are **millitokens** (token × 1000)
//! and all timestamps are epoch milliseconds.
//!
//! ## Why integer only
//!
//! Token-bucket fractions must be reproducible across nodes. Floats lose
//! associativity and lose precision when serialized to the store's number
//! encoding, so every quantity here is integer millitokens and every
//! division is explicit integer division.
//!
//! ## Drift compensation
//!
//! [`refill`] only advances the refill timestamp by the time corresponding
//! to whole millitokens actually emitted. Without that inverse step,
//! accumulated rounding on frequent tiny refills drifts the clock ahead of
//! the tokens really delivered.

use std::time::{SystemTime, UNIX_EPOCH};

/// Millitokens per whole token.
pub const MILLI: i64 = 1_000;

/// A source of wall-clock time in epoch milliseconds.
///
/// Bucket state is coordinated through a shared store, so time must be
/// comparable across processes: this is deliberately wall-clock based,
/// not a per-process monotonic anchor. The abstraction exists so tests
/// can drive time deterministically.
pub trait TimeSource: Send + Sync {
    /// Returns the current time as epoch milliseconds.
    fn now_ms(&self) -> i64;
}

/// System clock time source backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    #[inline]
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or_default()
    }
}

/// Outcome of [`try_consume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryResult {
    /// The bucket had enough tokens; carries the post-consume state.
    Ok {
        /// Token balance after refill and consumption, in millitokens.
        tokens: i64,
        /// Refill timestamp after drift-compensated advance.
        last_refill_ms: i64,
    },

    /// The bucket did not have enough tokens; no state change.
    Rejected {
        /// Millitokens missing after the hypothetical refill.
        deficit_milli: i64,
        /// Upper bound on the wait until the deficit is refillable.
        retry_after_ms: i64,
    },
}

/// Lazily refills a bucket, returning `(tokens, last_refill_ms)`.
///
/// `to_add = elapsed × ra / rp_ms` millitokens are emitted (integer
/// division), the balance is clamped at `cp`, and the refill timestamp is
/// advanced only by `to_add × rp_ms / ra` — the time worth of the tokens
/// actually emitted.
///
/// # Panics
///
/// Panics if `ra` or `rp_ms` is not positive. Limit construction forbids
/// both, so hitting this is a programming error, not a data error.
#[inline]
pub fn refill(tk: i64, rf: i64, now_ms: i64, cp: i64, ra: i64, rp_ms: i64) -> (i64, i64) {
    assert!(ra > 0, "refill amount must be positive");
    assert!(rp_ms > 0, "refill period must be positive");

    let elapsed = now_ms - rf;
    if elapsed <= 0 {
        return (tk, rf);
    }

    let to_add = mul_div(elapsed, ra, rp_ms);
    if to_add == 0 {
        return (tk, rf);
    }

    let tokens = tk.saturating_add(to_add).min(cp);
    let advanced = rf + mul_div(to_add, rp_ms, ra);
    (tokens, advanced)
}

/// Refills, then consumes `need` whole tokens if the balance allows it.
///
/// On rejection the deficit and a retry-after upper bound are reported and
/// the caller must not persist any state change.
#[inline]
pub fn try_consume(
    tk: i64,
    rf: i64,
    now_ms: i64,
    cp: i64,
    ra: i64,
    rp_ms: i64,
    need: i64,
) -> TryResult {
    let (tokens, last_refill_ms) = refill(tk, rf, now_ms, cp, ra, rp_ms);
    let need_milli = need * MILLI;

    if tokens >= need_milli {
        TryResult::Ok { tokens: tokens - need_milli, last_refill_ms }
    } else {
        let deficit_milli = need_milli - tokens;
        TryResult::Rejected {
            deficit_milli,
            retry_after_ms: retry_after_ms(deficit_milli, ra, rp_ms),
        }
    }
}

/// Refills, then consumes `need` whole tokens unconditionally.
///
/// The balance may go negative: the bucket carries the overage as debt and
/// future refills pay it down before new capacity accumulates.
#[inline]
pub fn force_consume(
    tk: i64,
    rf: i64,
    now_ms: i64,
    cp: i64,
    ra: i64,
    rp_ms: i64,
    need: i64,
) -> (i64, i64) {
    let (tokens, last_refill_ms) = refill(tk, rf, now_ms, cp, ra, rp_ms);
    (tokens - need * MILLI, last_refill_ms)
}

/// Whether a refill alone, with no state change, would raise the balance
/// to at least `need` whole tokens.
///
/// The speculative acquire path uses this to split a failed conditional
/// write into *fast rejection* (refill would not help either) versus
/// *retry via the slow path* (refill would help, so re-read and decide).
/// Capacity clamping is deliberately ignored: an optimistic answer only
/// causes a slow-path re-read, never a wrong admission.
#[inline]
pub fn would_refill_satisfy(tk: i64, rf: i64, now_ms: i64, ra: i64, rp_ms: i64, need: i64) -> bool {
    assert!(ra > 0, "refill amount must be positive");
    assert!(rp_ms > 0, "refill period must be positive");

    let elapsed = now_ms - rf;
    if elapsed <= 0 {
        return tk >= need * MILLI;
    }
    tk.saturating_add(mul_div(elapsed, ra, rp_ms)) >= need * MILLI
}

/// Refilled balance clamped at capacity, reported in whole tokens.
#[inline]
pub fn available(tk: i64, rf: i64, now_ms: i64, cp: i64, ra: i64, rp_ms: i64) -> i64 {
    let (tokens, _) = refill(tk, rf, now_ms, cp, ra, rp_ms);
    tokens / MILLI
}

/// Upper bound on the wait, in milliseconds, until `deficit_milli` more
/// millitokens have been emitted.
#[inline]
pub fn retry_after_ms(deficit_milli: i64, ra: i64, rp_ms: i64) -> i64 {
    assert!(ra > 0, "refill amount must be positive");
    assert!(rp_ms > 0, "refill period must be positive");

    mul_div(deficit_milli, rp_ms, ra) + 1
}

/// `a × b / c` through an i128 intermediate so large refill amounts and
/// long elapsed intervals cannot overflow.
#[inline]
fn mul_div(a: i64, b: i64, c: i64) -> i64 {
    let wide = (a as i128) * (b as i128) / (c as i128);
    i64::try_from(wide).unwrap_or(i64::MAX)
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::sync::{Arc, Mutex};
    use super::TimeSource;

    /// Manually driven clock for deterministic tests.
    #[derive(Clone)]
    pub(crate) struct MockTimeSource {
        current_ms: Arc<Mutex<i64>>,
    }

    impl MockTimeSource {
        pub(crate) fn new(initial_ms: i64) -> Self {
            Self { current_ms: Arc::new(Mutex::new(initial_ms)) }
        }

        pub(crate) fn advance(&self, ms: i64) {
            let mut time = self.current_ms.lock().unwrap();
            *time += ms;
        }

        pub(crate) fn set(&self, ms: i64) {
            let mut time = self.current_ms.lock().unwrap();
            *time = ms;
        }
    }

    impl TimeSource for MockTimeSource {
        fn now_ms(&self) -> i64 {
            *self.current_ms.lock().unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // rpm-style limit: 100 tokens per minute, capacity 100 tokens.
    const CP: i64 = 100_000;
    const RA: i64 = 100_000;
    const RP: i64 = 60_000;

    #[test]
    fn it_refills_nothing_when_no_time_passed() {
        assert_eq!(refill(5_000, 1_000, 1_000, CP, RA, RP), (5_000, 1_000));
        assert_eq!(refill(5_000, 2_000, 1_000, CP, RA, RP), (5_000, 2_000));
    }

    #[test]
    fn it_refills_proportionally_to_elapsed_time() {
        // 600 ms at 100_000 milli / 60_000 ms emits exactly 1000 milli.
        let (tk, rf) = refill(0, 0, 600, CP, RA, RP);
        assert_eq!(tk, 1_000);
        assert_eq!(rf, 600);
    }

    #[test]
    fn it_clamps_refill_at_capacity() {
        let (tk, _) = refill(99_000, 0, 3_600_000, CP, RA, RP);
        assert_eq!(tk, CP);
    }

    #[test]
    fn it_compensates_drift_on_partial_tokens() {
        // 1 token per minute: one millitoken every 60 ms. 59 ms is worth no
        // whole millitoken, so neither balance nor clock may move — a naive
        // `rf = now` here would silently discard the accumulated sliver.
        let (ra, rp) = (1_000, 60_000);
        let (tk, rf) = refill(0, 0, 59, CP, ra, rp);
        assert_eq!((tk, rf), (0, 0));

        // At 61 ms one millitoken is emitted and the clock advances by
        // exactly the 60 ms that millitoken is worth, keeping the sliver.
        let (tk, rf) = refill(tk, rf, 61, CP, ra, rp);
        assert_eq!((tk, rf), (1, 60));

        let (tk, rf) = refill(tk, rf, 121, CP, ra, rp);
        assert_eq!((tk, rf), (2, 120));
    }

    #[test]
    fn it_emits_exactly_the_elapsed_amount_across_any_interleaving() {
        // Refill drift law: N interleaved refills emit the same total as one.
        let (ra, rp) = (1_000, 60_000);
        let checkpoints = [3, 7, 8, 13, 100, 101, 5_999, 6_000];
        let (mut tk, mut rf) = (0, 0);
        for now in checkpoints {
            let (t, r) = refill(tk, rf, now, CP, ra, rp);
            tk = t;
            rf = r;
        }

        let (single_tk, _) = refill(0, 0, 6_000, CP, ra, rp);
        assert_eq!(tk, single_tk);
        assert_eq!(tk, 6_000 * ra / rp);
    }

    #[test]
    fn it_consumes_when_tokens_suffice() {
        match try_consume(100_000, 0, 0, CP, RA, RP, 1) {
            TryResult::Ok { tokens, last_refill_ms } => {
                assert_eq!(tokens, 99_000);
                assert_eq!(last_refill_ms, 0);
            }
            TryResult::Rejected { .. } => panic!("expected Ok"),
        }
    }

    #[test]
    fn it_rejects_with_deficit_and_retry_after() {
        // tk=500, need 1 token: deficit 500 milli,
        // retry_after = 500 * 60_000 / 100_000 + 1 = 301 ms.
        match try_consume(500, 0, 0, CP, RA, RP, 1) {
            TryResult::Rejected { deficit_milli, retry_after_ms } => {
                assert_eq!(deficit_milli, 500);
                assert_eq!(retry_after_ms, 301);
            }
            TryResult::Ok { .. } => panic!("expected Rejected"),
        }
    }

    #[test]
    fn it_retry_after_is_an_upper_bound() {
        // After waiting retry_after_ms the refill must cover the deficit.
        for deficit in [1, 499, 500, 999, 1_000, 77_777] {
            let wait = retry_after_ms(deficit, RA, RP);
            let (tk, _) = refill(0, 0, wait, i64::MAX, RA, RP);
            assert!(tk >= deficit, "deficit {deficit}: waited {wait}, got {tk}");
        }
    }

    #[test]
    fn it_force_consumes_into_debt() {
        let (tk, _) = force_consume(500, 0, 0, CP, RA, RP, 2);
        assert_eq!(tk, 500 - 2_000);
    }

    #[test]
    fn it_pays_down_debt_before_building_balance() {
        let (tk, _) = force_consume(0, 0, 0, CP, RA, RP, 3);
        assert_eq!(tk, -3_000);

        // 600 ms emits 1000 milli which reduces the debt, not the balance.
        let (tk, _) = refill(tk, 0, 600, CP, RA, RP);
        assert_eq!(tk, -2_000);
    }

    #[test]
    fn it_predicts_whether_refill_helps() {
        // tk=500 needs 1 token; 301 ms of refill covers it, 100 ms does not.
        assert!(would_refill_satisfy(500, 0, 301, RA, RP, 1));
        assert!(!would_refill_satisfy(500, 0, 100, RA, RP, 1));

        // No elapsed time: decided on the balance alone.
        assert!(would_refill_satisfy(1_000, 500, 500, RA, RP, 1));
        assert!(!would_refill_satisfy(999, 500, 500, RA, RP, 1));
    }

    #[test]
    fn it_reports_availability_in_whole_tokens() {
        assert_eq!(available(99_499, 0, 0, CP, RA, RP), 99);
        assert_eq!(available(0, 0, 600, CP, RA, RP), 1);
        assert_eq!(available(-5_000, 0, 0, CP, RA, RP), -5);
    }

    #[test]
    fn it_survives_large_elapsed_intervals() {
        // A year of elapsed time against a fast refill must not overflow.
        let year_ms = 365 * 24 * 3_600_000i64;
        let (tk, rf) = refill(0, 0, year_ms, CP, 1_000_000_000, 1_000);
        assert_eq!(tk, CP);
        assert!(rf <= year_ms);
    }

    #[test]
    #[should_panic(expected = "refill amount must be positive")]
    fn it_panics_on_zero_refill_amount() {
        let _ = refill(0, 0, 1_000, CP, 0, RP);
    }

    #[test]
    #[should_panic(expected = "refill period must be positive")]
    fn it_panics_on_zero_refill_period() {
        let _ = refill(0, 0, 1_000, CP, RA, 0);
    }
}
