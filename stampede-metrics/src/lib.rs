pub mod metric;
pub mod sample;
pub mod submetric;
pub mod tags;
pub mod thresholds;

pub use metric::{CounterSink, GaugeSink, Metric, MetricKind, RateSink, Sink, TrendSink};
pub use sample::Sample;
pub use submetric::{Submetric, parse_submetric};
pub use tags::TagSet;
pub use thresholds::{Threshold, Thresholds};
