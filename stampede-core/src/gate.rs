use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// Gate VU tasks park on while the run is paused. Active iterations finish;
/// new ones wait here until the gate opens again.
#[derive(Debug, Default)]
pub struct PauseGate {
    paused: AtomicBool,
    notify: Notify,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
        if !paused {
            self.notify.notify_waiters();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Resolves once the gate is open. Registers for wakeup before re-reading
    /// the flag so a concurrent resume can't be missed.
    pub async fn unpaused(&self) {
        loop {
            if !self.is_paused() {
                return;
            }
            let notified = self.notify.notified();
            if !self.is_paused() {
                return;
            }
            notified.await;
        }
    }
}

/// Accumulates time spent unpaused. Stage interpolation and the end-time
/// check both read this clock, so pausing freezes ramp position.
#[derive(Debug, Default)]
pub struct StageClock {
    accumulated: Duration,
    resumed_at: Option<Instant>,
}

impl StageClock {
    /// Reset at the start of a run.
    pub fn start(&mut self, paused: bool) {
        self.accumulated = Duration::ZERO;
        self.resumed_at = (!paused).then(Instant::now);
    }

    pub fn pause(&mut self) {
        if let Some(at) = self.resumed_at.take() {
            self.accumulated += at.elapsed();
        }
    }

    pub fn resume(&mut self) {
        if self.resumed_at.is_none() {
            self.resumed_at = Some(Instant::now());
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.accumulated + self.resumed_at.map(|at| at.elapsed()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gate_blocks_only_while_paused() {
        let gate = PauseGate::new();
        gate.unpaused().await;

        gate.set(true);
        assert!(gate.is_paused());
        let wait = gate.unpaused();
        tokio::pin!(wait);
        assert!(
            tokio::time::timeout(Duration::from_millis(20), &mut wait)
                .await
                .is_err()
        );

        gate.set(false);
        tokio::time::timeout(Duration::from_millis(100), wait)
            .await
            .unwrap_or_else(|_| panic!("gate did not open"));
    }

    #[test]
    fn clock_freezes_while_paused() {
        let mut clock = StageClock::default();
        clock.start(false);
        std::thread::sleep(Duration::from_millis(20));

        clock.pause();
        let frozen = clock.elapsed();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(clock.elapsed(), frozen);

        clock.resume();
        std::thread::sleep(Duration::from_millis(10));
        assert!(clock.elapsed() > frozen);
    }

    #[test]
    fn clock_started_paused_stays_at_zero() {
        let mut clock = StageClock::default();
        clock.start(true);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }
}
