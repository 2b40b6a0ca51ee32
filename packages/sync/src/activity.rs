//! Local activity tracking and the presence heartbeat.
//!
//! `ActivityTracker` turns coarse input signals into a monotonic
//! "last active" timestamp. `HeartbeatScheduler` owns the heartbeat timer and
//! decides, on each tick, whether the local subject is online or away. That
//! decision is the only path from ONLINE to AWAY.

use std::{sync::Arc, time::Duration};

use kizuna_shared::time::Clock;

use crate::{
    config::PresenceConfig,
    domain::{PresenceStatus, Timestamp},
    scheduler::{Scheduler, TimerKey},
};

/// Kinds of local interaction that count as activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivitySignal {
    Pointer,
    Key,
    Touch,
    Scroll,
}

pub struct ActivityTracker {
    clock: Arc<dyn Clock>,
    last_activity_at: Timestamp,
    throttle_ms: u64,
}

impl ActivityTracker {
    /// Starts as active "now".
    pub fn new(clock: Arc<dyn Clock>, throttle_ms: u64) -> Self {
        let last_activity_at = Timestamp::new(clock.now_millis());
        Self {
            clock,
            last_activity_at,
            throttle_ms,
        }
    }

    /// Record a signal. Cheap enough to call on every input event: signals
    /// within the throttle window of the last recorded one are ignored.
    ///
    /// Returns whether the timestamp moved.
    pub fn record(&mut self, signal: ActivitySignal) -> bool {
        let now = Timestamp::new(self.clock.now_millis());
        if now <= self.last_activity_at {
            return false;
        }
        if now.millis_since(self.last_activity_at) < self.throttle_ms {
            return false;
        }
        tracing::trace!(?signal, "Recorded local activity");
        self.last_activity_at = now;
        true
    }

    pub fn last_activity_at(&self) -> Timestamp {
        self.last_activity_at
    }

    pub fn idle_millis(&self) -> u64 {
        Timestamp::new(self.clock.now_millis()).millis_since(self.last_activity_at)
    }
}

pub struct HeartbeatScheduler {
    scheduler: Scheduler,
    interval: Duration,
    away_timeout_ms: u64,
}

impl HeartbeatScheduler {
    pub fn new(scheduler: Scheduler, config: &PresenceConfig) -> Self {
        Self {
            scheduler,
            interval: config.heartbeat_interval(),
            away_timeout_ms: config.away_timeout_ms,
        }
    }

    pub fn start(&self) {
        self.scheduler
            .schedule_repeating(TimerKey::Heartbeat, self.interval);
    }

    pub fn stop(&self) {
        self.scheduler.cancel(&TimerKey::Heartbeat);
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_scheduled(&TimerKey::Heartbeat)
    }

    /// Status to announce on this tick: AWAY once idle time exceeds the
    /// threshold, ONLINE otherwise.
    pub fn evaluate(&self, tracker: &ActivityTracker) -> PresenceStatus {
        if tracker.idle_millis() > self.away_timeout_ms {
            PresenceStatus::Away
        } else {
            PresenceStatus::Online
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kizuna_shared::time::ManualClock;

    fn heartbeat() -> (HeartbeatScheduler, Scheduler) {
        let (scheduler, _fired) = Scheduler::new();
        let config = PresenceConfig {
            away_timeout_ms: 120_000,
            ..PresenceConfig::default()
        };
        (HeartbeatScheduler::new(scheduler.clone(), &config), scheduler)
    }

    #[test]
    fn test_record_is_throttled() {
        // テスト項目: スロットル期間内のシグナルは無視され、期間を過ぎると記録される
        // given (前提条件):
        let clock = ManualClock::new(10_000);
        let mut tracker = ActivityTracker::new(Arc::new(clock.clone()), 1_000);

        // when (操作):
        clock.advance(500);
        let within = tracker.record(ActivitySignal::Key);
        clock.advance(600);
        let after = tracker.record(ActivitySignal::Pointer);

        // then (期待する結果):
        assert!(!within);
        assert!(after);
        assert_eq!(tracker.last_activity_at(), Timestamp::new(11_100));
    }

    #[test]
    fn test_record_never_moves_backwards() {
        // テスト項目: 時計が巻き戻っても最終アクティビティ時刻は減少しない
        // given (前提条件):
        let clock = ManualClock::new(10_000);
        let mut tracker = ActivityTracker::new(Arc::new(clock.clone()), 0);

        // when (操作):
        clock.set(5_000);
        let recorded = tracker.record(ActivitySignal::Touch);

        // then (期待する結果):
        assert!(!recorded);
        assert_eq!(tracker.last_activity_at(), Timestamp::new(10_000));
    }

    #[tokio::test]
    async fn test_idle_121s_is_away() {
        // テスト項目: 121 秒間操作がない場合、次のハートビートで AWAY と判定される
        // given (前提条件):
        let clock = ManualClock::new(0);
        let tracker = ActivityTracker::new(Arc::new(clock.clone()), 1_000);
        let (heartbeat, _scheduler) = heartbeat();

        // when (操作):
        clock.advance(121_000);
        let status = heartbeat.evaluate(&tracker);

        // then (期待する結果):
        assert_eq!(status, PresenceStatus::Away);
    }

    #[tokio::test]
    async fn test_activity_at_119s_resets_window() {
        // テスト項目: 119 秒時点の操作でウィンドウがリセットされ、121 秒時点でも ONLINE のまま
        // given (前提条件):
        let clock = ManualClock::new(0);
        let mut tracker = ActivityTracker::new(Arc::new(clock.clone()), 1_000);
        let (heartbeat, _scheduler) = heartbeat();

        // when (操作):
        clock.advance(119_000);
        tracker.record(ActivitySignal::Scroll);
        clock.advance(2_000);
        let status = heartbeat.evaluate(&tracker);

        // then (期待する結果):
        assert_eq!(status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn test_start_and_stop_heartbeat_timer() {
        // テスト項目: start でハートビートタイマーが登録され、stop で解除される
        // given (前提条件):
        let (heartbeat, scheduler) = heartbeat();

        // when (操作):
        heartbeat.start();
        let running = heartbeat.is_running();
        heartbeat.stop();

        // then (期待する結果):
        assert!(running);
        assert!(!heartbeat.is_running());
        assert!(scheduler.is_empty());
    }
}
