use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stampede_metrics::{TagSet, Thresholds};

/// One segment of a piecewise-linear VU ramp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Time to interpolate from the previous target to this one. An absent
    /// duration jumps to the target and holds it for the rest of the run.
    pub duration: Option<Duration>,
    pub target: i64,
}

/// Run-wide configuration. Every field is optional so option sets can be
/// layered with [`Options::apply`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Start the run paused.
    pub paused: Option<bool>,

    /// Initial active VU count.
    pub vus: Option<i64>,

    /// VU pool cap; non-negative.
    pub vus_max: Option<i64>,

    /// Total run time; absent means the run only ends on cancellation or an
    /// iteration budget.
    pub duration: Option<Duration>,

    /// Total iteration budget across all VUs.
    pub iterations: Option<i64>,

    /// Piecewise-linear ramp of the active VU count; overrides the constant
    /// `vus` shape.
    pub stages: Option<Vec<Stage>>,

    /// Threshold expressions per metric key. Keys may carry a `{tag:value,…}`
    /// submetric suffix.
    pub thresholds: HashMap<String, Thresholds>,

    /// Tags merged into every sample as defaults; a sample's own tags win on
    /// collision.
    pub run_tags: TagSet,
}

impl Options {
    /// Layer `other` on top of `self`; fields set in `other` win.
    pub fn apply(mut self, other: Options) -> Options {
        if other.paused.is_some() {
            self.paused = other.paused;
        }
        if other.vus.is_some() {
            self.vus = other.vus;
        }
        if other.vus_max.is_some() {
            self.vus_max = other.vus_max;
        }
        if other.duration.is_some() {
            self.duration = other.duration;
        }
        if other.iterations.is_some() {
            self.iterations = other.iterations;
        }
        if other.stages.is_some() {
            self.stages = other.stages;
        }
        if !other.thresholds.is_empty() {
            self.thresholds = other.thresholds;
        }
        if !other.run_tags.is_empty() {
            self.run_tags = other.run_tags;
        }
        self
    }
}

/// Total duration of a ramp, or `None` when any stage is unbounded.
pub fn sum_stages(stages: &[Stage]) -> Option<Duration> {
    let mut total = Duration::ZERO;
    for stage in stages {
        total = total.saturating_add(stage.duration?);
    }
    Some(total)
}
