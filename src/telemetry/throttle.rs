use chrono::{DateTime, Local, TimeZone};

use crate::db::ThrottleState;

/// Minimum gap before the n-th prompt of the day, in minutes.
pub const PROMPT_DELAY_MINUTES: [i64; 5] = [0, 10, 20, 40, 60];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottlePolicy {
    pub max_per_day: u32,
}

impl ThrottlePolicy {
    pub const PROMPTS: ThrottlePolicy = ThrottlePolicy { max_per_day: 5 };
    pub const SITE_SURVEY: ThrottlePolicy = ThrottlePolicy { max_per_day: 3 };

    fn required_delay_ms(&self, count: u32) -> i64 {
        let minutes = PROMPT_DELAY_MINUTES
            .get(count as usize)
            .or_else(|| PROMPT_DELAY_MINUTES.last())
            .copied()
            .unwrap_or(0);
        minutes * 60 * 1000
    }

    /// Admits a prompt at `now_ms` and records it in `state`. The daily
    /// counter restarts once `state` predates `midnight_ms`.
    pub fn try_admit(&self, state: &mut ThrottleState, now_ms: i64, midnight_ms: i64) -> bool {
        if state.last_reset == 0 || state.last_reset < midnight_ms {
            *state = ThrottleState {
                last_shown: 0,
                count: 0,
                last_reset: midnight_ms,
            };
        }

        if state.count >= self.max_per_day {
            return false;
        }
        if now_ms - state.last_shown < self.required_delay_ms(state.count) {
            return false;
        }

        state.last_shown = now_ms;
        state.count += 1;
        true
    }
}

/// Start of the local day containing `now`, in epoch milliseconds.
pub fn local_midnight_ms(now: DateTime<Local>) -> i64 {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| Local.from_local_datetime(&midnight).earliest())
        .map(|midnight| midnight.timestamp_millis())
        .unwrap_or_else(|| now.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: i64 = 60 * 1000;
    const MIDNIGHT: i64 = 1_700_000_000_000;

    #[test]
    fn delays_grow_with_each_prompt() {
        let policy = ThrottlePolicy::PROMPTS;
        let mut state = ThrottleState::default();
        let t0 = MIDNIGHT + 8 * 60 * MINUTE;

        assert!(policy.try_admit(&mut state, t0, MIDNIGHT));
        // Second prompt needs 10 minutes.
        assert!(!policy.try_admit(&mut state, t0 + 9 * MINUTE, MIDNIGHT));
        assert!(policy.try_admit(&mut state, t0 + 10 * MINUTE, MIDNIGHT));
        // Third needs 20 after the second.
        assert!(!policy.try_admit(&mut state, t0 + 25 * MINUTE, MIDNIGHT));
        assert!(policy.try_admit(&mut state, t0 + 30 * MINUTE, MIDNIGHT));
        assert_eq!(state.count, 3);
        assert_eq!(state.last_shown, t0 + 30 * MINUTE);
    }

    #[test]
    fn daily_cap_and_reset() {
        let policy = ThrottlePolicy::SITE_SURVEY;
        let mut state = ThrottleState::default();
        let mut now = MIDNIGHT + MINUTE;
        for _ in 0..3 {
            assert!(policy.try_admit(&mut state, now, MIDNIGHT));
            now += 120 * MINUTE;
        }
        assert!(!policy.try_admit(&mut state, now, MIDNIGHT));

        let next_midnight = MIDNIGHT + 24 * 60 * MINUTE;
        assert!(policy.try_admit(&mut state, next_midnight + MINUTE, next_midnight));
        assert_eq!(state.count, 1);
        assert_eq!(state.last_reset, next_midnight);
    }

    #[test]
    fn midnight_is_not_after_now() {
        let now = Local::now();
        let midnight = local_midnight_ms(now);
        assert!(midnight <= now.timestamp_millis());
        assert!(now.timestamp_millis() - midnight < 25 * 60 * MINUTE);
    }
}
