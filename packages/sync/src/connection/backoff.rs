//! Capped exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::ConnectionConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base_ms: u64,
    cap_ms: u64,
    jitter: f64,
}

impl Backoff {
    pub fn new(base_ms: u64, cap_ms: u64, jitter: f64) -> Self {
        Self {
            base_ms,
            cap_ms: cap_ms.max(base_ms),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(
            config.backoff_base_ms,
            config.backoff_cap_ms,
            config.backoff_jitter,
        )
    }

    /// Un-jittered delay before reconnect attempt `attempt` (1-based):
    /// `min(cap, base * 2^(attempt - 1))`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        Duration::from_millis(self.base_ms.saturating_mul(factor).min(self.cap_ms))
    }

    /// Delay for `attempt` given a uniform `sample` in `[0, 1)`. The jitter
    /// shaves up to `jitter * ceiling` off the delay.
    pub fn delay_with(&self, attempt: u32, sample: f64) -> Duration {
        let ceiling = self.ceiling(attempt);
        ceiling.mul_f64(1.0 - self.jitter * sample.clamp(0.0, 1.0))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, rand::thread_rng().gen_range(0.0..1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_doubles_until_cap() {
        // テスト項目: 遅延は試行ごとに倍になり、上限で頭打ちになる
        // given (前提条件):
        let backoff = Backoff::new(1_000, 30_000, 0.5);

        // when (操作):
        let delays: Vec<u64> = (1..=7)
            .map(|attempt| backoff.ceiling(attempt).as_millis() as u64)
            .collect();

        // then (期待する結果):
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn test_ceiling_does_not_overflow() {
        // テスト項目: 非常に大きな試行回数でもオーバーフローせず上限を返す
        // given (前提条件):
        let backoff = Backoff::new(1_000, 30_000, 0.0);

        // when (操作):
        let delay = backoff.ceiling(200);

        // then (期待する結果):
        assert_eq!(delay, Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_shortens_delay_within_bounds() {
        // テスト項目: ジッターは遅延を最大 jitter 割合だけ短くする
        // given (前提条件):
        let backoff = Backoff::new(1_000, 30_000, 0.5);

        // when (操作):
        let none = backoff.delay_with(3, 0.0);
        let full = backoff.delay_with(3, 1.0);
        let random = backoff.delay(3);

        // then (期待する結果):
        assert_eq!(none, Duration::from_millis(4_000));
        assert_eq!(full, Duration::from_millis(2_000));
        assert!(random >= full && random <= none);
    }
}
