use std::time::Duration;

use crate::options::Stage;

/// Piecewise-linear active-VU set-point in integer VU units.
///
/// With no stages the set-point is the constant `start`. With stages, each
/// segment interpolates from the previous stage's target (or `start`) to its
/// own over its duration; past the last stage the final target holds.
#[derive(Debug, Clone)]
pub struct VuSchedule {
    start: i64,
    stages: Vec<Stage>,
}

impl VuSchedule {
    pub fn new(start: i64, stages: Vec<Stage>) -> Self {
        Self { start, stages }
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn target_at(&self, elapsed: Duration) -> i64 {
        let mut stage_start = Duration::ZERO;
        let mut prev = self.start;

        for stage in &self.stages {
            let Some(duration) = stage.duration else {
                // An unbounded stage jumps to its target and holds it. The
                // loop only reaches it once `elapsed` has passed the stages
                // before it.
                return stage.target;
            };

            let stage_end = stage_start.saturating_add(duration);
            if elapsed < stage_end {
                return interpolate(prev, stage.target, elapsed - stage_start, duration);
            }
            stage_start = stage_end;
            prev = stage.target;
        }

        prev
    }
}

fn interpolate(from: i64, to: i64, elapsed: Duration, duration: Duration) -> i64 {
    if duration.is_zero() {
        return to;
    }

    let delta = (to as i128) - (from as i128);
    let num = elapsed.as_nanos() as i128;
    let den = (duration.as_nanos() as i128).max(1);

    let current = from as i128 + delta.saturating_mul(num) / den;
    current.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}
