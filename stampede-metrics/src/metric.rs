use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Rate,
    Trend,
}

/// Named aggregate over samples. Exactly one sink instance exists per metric
/// name in a registry; emitters share the definition through an `Arc`.
#[derive(Debug)]
pub struct Metric {
    name: String,
    kind: MetricKind,
    sink: Mutex<Sink>,
    tainted: AtomicBool,
}

impl Metric {
    pub fn new(name: impl Into<String>, kind: MetricKind) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kind,
            sink: Mutex::new(Sink::new(kind)),
            tainted: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn sink(&self) -> &Mutex<Sink> {
        &self.sink
    }

    pub fn add(&self, value: f64) {
        self.sink.lock().add(value);
    }

    /// Taint is one-way: a metric with a failed threshold stays tainted.
    pub fn taint(&self) {
        self.tainted.store(true, Ordering::Release);
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted.load(Ordering::Acquire)
    }
}

/// Kind-specific aggregation state for one metric.
#[derive(Debug, Clone)]
pub enum Sink {
    Counter(CounterSink),
    Gauge(GaugeSink),
    Rate(RateSink),
    Trend(TrendSink),
}

impl Sink {
    pub fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Sink::Counter(CounterSink::default()),
            MetricKind::Gauge => Sink::Gauge(GaugeSink::default()),
            MetricKind::Rate => Sink::Rate(RateSink::default()),
            MetricKind::Trend => Sink::Trend(TrendSink::default()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Sink::Counter(_) => MetricKind::Counter,
            Sink::Gauge(_) => MetricKind::Gauge,
            Sink::Rate(_) => MetricKind::Rate,
            Sink::Trend(_) => MetricKind::Trend,
        }
    }

    pub fn add(&mut self, value: f64) {
        match self {
            Sink::Counter(s) => s.add(value),
            Sink::Gauge(s) => s.add(value),
            Sink::Rate(s) => s.add(value),
            Sink::Trend(s) => s.add(value),
        }
    }
}

/// Running sum.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CounterSink {
    pub sum: f64,
}

impl CounterSink {
    fn add(&mut self, value: f64) {
        self.sum += value;
    }

    /// Per-second rate over the given run window.
    pub fn rate(&self, elapsed: Duration) -> f64 {
        if elapsed.is_zero() {
            0.0
        } else {
            self.sum / elapsed.as_secs_f64()
        }
    }
}

/// Last observed value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GaugeSink {
    pub value: f64,
}

impl GaugeSink {
    fn add(&mut self, value: f64) {
        self.value = value;
    }
}

/// Share of nonzero values.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateSink {
    pub trues: u64,
    pub total: u64,
}

impl RateSink {
    fn add(&mut self, value: f64) {
        self.total += 1;
        if value != 0.0 {
            self.trues += 1;
        }
    }

    pub fn rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.trues as f64 / self.total as f64
        }
    }
}

/// Retains every value so thresholds can ask for arbitrary percentiles.
/// The list is sorted lazily, only when an order statistic is read.
#[derive(Debug, Clone, Default)]
pub struct TrendSink {
    values: Vec<f64>,
    sorted: bool,
    sum: f64,
    min: f64,
    max: f64,
}

impl TrendSink {
    fn add(&mut self, value: f64) {
        if self.values.is_empty() {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.values.push(value);
        self.sorted = false;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn avg(&self) -> f64 {
        if self.values.is_empty() {
            0.0
        } else {
            self.sum / self.values.len() as f64
        }
    }

    pub fn med(&mut self) -> f64 {
        self.percentile(50.0)
    }

    /// Linear interpolation between the two nearest ranks.
    pub fn percentile(&mut self, pct: f64) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        if !self.sorted {
            self.values.sort_by(f64::total_cmp);
            self.sorted = true;
        }

        let last = self.values.len() - 1;
        let rank = (pct / 100.0).clamp(0.0, 1.0) * last as f64;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;
        if lo == hi {
            return self.values[lo];
        }
        let frac = rank - lo as f64;
        self.values[lo] + (self.values[hi] - self.values[lo]) * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_sums_and_derives_rate() {
        let mut sink = Sink::new(MetricKind::Counter);
        sink.add(10.0);
        sink.add(2.5);

        let Sink::Counter(c) = sink else {
            panic!("wrong sink kind")
        };
        assert_eq!(c.sum, 12.5);
        assert_eq!(c.rate(Duration::from_secs(5)), 2.5);
        assert_eq!(c.rate(Duration::ZERO), 0.0);
    }

    #[test]
    fn gauge_keeps_last_value() {
        let mut sink = Sink::new(MetricKind::Gauge);
        sink.add(1.0);
        sink.add(7.0);

        let Sink::Gauge(g) = sink else {
            panic!("wrong sink kind")
        };
        assert_eq!(g.value, 7.0);
    }

    #[test]
    fn rate_counts_nonzero_values() {
        let mut sink = Sink::new(MetricKind::Rate);
        for v in [1.0, 0.0, 1.0, 1.0] {
            sink.add(v);
        }

        let Sink::Rate(r) = sink else {
            panic!("wrong sink kind")
        };
        assert_eq!((r.trues, r.total), (3, 4));
        assert_eq!(r.rate(), 0.75);
    }

    #[test]
    fn trend_order_statistics() {
        let mut sink = TrendSink::default();
        for v in [30.0, 10.0, 20.0, 40.0] {
            sink.add(v);
        }

        assert_eq!(sink.len(), 4);
        assert_eq!(sink.min(), 10.0);
        assert_eq!(sink.max(), 40.0);
        assert_eq!(sink.avg(), 25.0);
        assert_eq!(sink.med(), 25.0);
        assert_eq!(sink.percentile(0.0), 10.0);
        assert_eq!(sink.percentile(100.0), 40.0);
        assert!((sink.percentile(95.0) - 38.5).abs() < 1e-9);
    }

    #[test]
    fn metric_taint_is_one_way() {
        let metric = Metric::new("my_metric", MetricKind::Gauge);
        assert!(!metric.is_tainted());
        metric.taint();
        metric.taint();
        assert!(metric.is_tainted());
    }

    #[test]
    fn metric_kind_string_forms() {
        assert_eq!(MetricKind::Trend.to_string(), "trend");
        assert_eq!("counter".parse::<MetricKind>(), Ok(MetricKind::Counter));
    }
}
