use std::sync::Arc;
use std::time::SystemTime;

use crate::metric::Metric;
use crate::tags::TagSet;

/// One telemetry datum emitted by an iteration or the transport layer.
#[derive(Debug, Clone)]
pub struct Sample {
    pub metric: Arc<Metric>,
    pub time: SystemTime,
    pub value: f64,
    pub tags: TagSet,
}

impl Sample {
    pub fn new(metric: Arc<Metric>, value: f64) -> Self {
        Self {
            metric,
            time: SystemTime::now(),
            value,
            tags: TagSet::new(),
        }
    }

    pub fn with_tags(metric: Arc<Metric>, value: f64, tags: TagSet) -> Self {
        Self {
            metric,
            time: SystemTime::now(),
            value,
            tags,
        }
    }
}
