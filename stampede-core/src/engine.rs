use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use stampede_metrics::{
    Metric, MetricKind, Sample, Submetric, TagSet, Thresholds, parse_submetric,
};

use crate::collector::Collector;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::options::{Options, sum_stages};

/// How often thresholds are re-evaluated. The first evaluation happens
/// immediately, so abort-on-fail thresholds fire promptly even on short runs.
const THRESHOLD_TICK: Duration = Duration::from_secs(2);

/// How often the engine publishes its own vus / vus_max gauges.
const ENGINE_METRIC_TICK: Duration = Duration::from_secs(1);

/// Batches buffered between the executor and the sample router.
const ROUTER_BUFFER: usize = 128;

/// Top-level orchestrator: owns the metric registry, routes samples from the
/// executor into sinks and the collector, and runs the threshold loop.
pub struct Engine {
    executor: Box<dyn Executor>,
    collector: Option<Box<dyn Collector>>,
    options: Options,

    metrics: RwLock<HashMap<String, Arc<Metric>>>,
    thresholds: Mutex<HashMap<String, Thresholds>>,
    /// Submetrics indexed by base metric name, so per-sample matching is
    /// proportional to the submetrics of that one metric.
    submetrics: HashMap<String, Vec<Submetric>>,

    run_tags: TagSet,
    tainted: AtomicBool,
    run_started: Mutex<Option<Instant>>,

    metric_vus: Arc<Metric>,
    metric_vus_max: Arc<Metric>,
}

impl Engine {
    /// Build an engine around an executor, negotiating options with its
    /// runner and validating the scheduling configuration. Configuration
    /// errors are rejected here; nothing is spawned yet.
    pub async fn new(executor: Box<dyn Executor>, options: Options) -> Result<Self> {
        let options = match executor.runner() {
            Some(runner) => {
                let negotiated = runner.options().apply(options);
                runner.apply_options(negotiated.clone());
                negotiated
            }
            None => options,
        };

        executor.set_vus_max(options.vus_max.unwrap_or(0)).await?;
        executor.set_vus(options.vus.unwrap_or(0))?;
        executor.set_paused(options.paused.unwrap_or(false));

        let stages = options.stages.clone().unwrap_or_default();
        let mut end_time = options.duration;
        if !stages.is_empty() {
            executor.set_stages(stages.clone());
            if let Some(total) = sum_stages(&stages) {
                // The run endpoint is the later of the ramp end and the
                // configured duration.
                end_time = Some(end_time.map_or(total, |d| d.max(total)));
            }
        }
        executor.set_end_time(end_time);
        executor.set_end_iterations(options.iterations);

        let mut submetrics: HashMap<String, Vec<Submetric>> = HashMap::new();
        for name in options.thresholds.keys() {
            if !name.contains('{') {
                continue;
            }
            let (parent, tags) = parse_submetric(name).map_err(|source| Error::Submetric {
                metric: name.clone(),
                source,
            })?;
            submetrics.entry(parent.clone()).or_default().push(Submetric {
                name: name.clone(),
                parent,
                tags,
            });
        }

        Ok(Self {
            thresholds: Mutex::new(options.thresholds.clone()),
            run_tags: options.run_tags.clone(),
            options,
            executor,
            collector: None,
            metrics: RwLock::new(HashMap::new()),
            submetrics,
            tainted: AtomicBool::new(false),
            run_started: Mutex::new(None),
            metric_vus: Metric::new("vus", MetricKind::Gauge),
            metric_vus_max: Metric::new("vus_max", MetricKind::Gauge),
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn executor(&self) -> &dyn Executor {
        self.executor.as_ref()
    }

    pub fn set_collector(&mut self, collector: Box<dyn Collector>) {
        self.collector = Some(collector);
    }

    /// True once any threshold has evaluated false. Never reset.
    pub fn is_tainted(&self) -> bool {
        self.tainted.load(Ordering::Acquire)
    }

    pub fn get_metric(&self, name: &str) -> Option<Arc<Metric>> {
        self.metrics.read().get(name).cloned()
    }

    /// Drive the run to completion.
    ///
    /// Cancelling `ctx` (or an abort-on-fail threshold) initiates a graceful
    /// stop and is not an error: only the executor's own failures surface.
    pub async fn run(&self, ctx: CancellationToken) -> Result<()> {
        *self.run_started.lock() = Some(Instant::now());

        // The executor observes this token; aborting a run cancels it.
        let run_token = ctx.child_token();
        // Stops the threshold loop and the gauge emitter once the executor
        // is done.
        let aux_token = CancellationToken::new();
        // Stops the collector, only after the sample stream has drained.
        let collector_token = CancellationToken::new();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<Sample>>(ROUTER_BUFFER);

        let executor = async {
            let result = self.executor.run(run_token.clone(), out_tx).await;
            aux_token.cancel();
            result
        };

        let router = async {
            while let Some(batch) = out_rx.recv().await {
                self.process_samples(batch);
            }
            collector_token.cancel();
        };

        let thresholds = self.run_thresholds(aux_token.clone(), &run_token);

        let gauges = async {
            let mut ticker = tokio::time::interval(ENGINE_METRIC_TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = aux_token.cancelled() => break,
                    _ = ticker.tick() => self.emit_engine_samples(),
                }
            }
        };

        let collector = async {
            let Some(collector) = &self.collector else {
                return;
            };
            if let Err(err) = collector.init().await {
                warn!(%err, "collector init failed; its loop will not run");
                return;
            }
            debug!(link = %collector.link(), "collector started");
            collector.run(collector_token.clone()).await;
        };

        let (result, ..) = tokio::join!(executor, router, thresholds, gauges, collector);

        // One last evaluation over the fully-drained registry.
        self.process_thresholds(&run_token);

        result
    }

    /// Route a batch of samples into the registry, matching submetric sinks
    /// and the collector. Samples are processed in order; calls are
    /// serialized against threshold reads by the registry locks.
    pub fn process_samples(&self, samples: Vec<Sample>) {
        let mut forward = self
            .collector
            .as_ref()
            .map(|_| Vec::with_capacity(samples.len()));

        for mut sample in samples {
            if !self.run_tags.is_empty() {
                sample.tags.apply_defaults(&self.run_tags);
            }

            let metric = self.get_or_create(sample.metric.name(), || sample.metric.clone());
            metric.add(sample.value);

            if let Some(subs) = self.submetrics.get(sample.metric.name()) {
                for sub in subs {
                    if !sample.tags.contains_all(&sub.tags) {
                        continue;
                    }
                    let kind = sample.metric.kind();
                    let sub_metric =
                        self.get_or_create(&sub.name, || Metric::new(sub.name.clone(), kind));
                    sub_metric.add(sample.value);
                }
            }

            if let Some(forward) = &mut forward {
                forward.push(sample);
            }
        }

        if let (Some(collector), Some(forward)) = (&self.collector, forward) {
            collector.collect(forward);
        }
    }

    fn get_or_create(&self, name: &str, create: impl FnOnce() -> Arc<Metric>) -> Arc<Metric> {
        if let Some(metric) = self.metrics.read().get(name) {
            return metric.clone();
        }
        self.metrics
            .write()
            .entry(name.to_string())
            .or_insert_with(create)
            .clone()
    }

    /// Periodic threshold evaluation. Returns once `ctx` is done or an
    /// abort-on-fail threshold has cancelled `abort`.
    async fn run_thresholds(&self, ctx: CancellationToken, abort: &CancellationToken) {
        let mut ticker = tokio::time::interval(THRESHOLD_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = ticker.tick() => {
                    if self.process_thresholds(abort) {
                        return;
                    }
                }
            }
        }
    }

    /// Evaluate every configured threshold against the current sinks.
    /// Returns true when an abort-on-fail threshold failed; `abort` is
    /// cancelled at most once per run.
    fn process_thresholds(&self, abort: &CancellationToken) -> bool {
        let elapsed = self
            .run_started
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default();

        let metrics = self.metrics.read();
        let mut thresholds = self.thresholds.lock();
        let mut aborted = false;

        for (name, ths) in thresholds.iter_mut() {
            // Thresholds on metrics that never received a sample are not
            // evaluated; an unmatched submetric passes by construction.
            let Some(metric) = metrics.get(name) else {
                continue;
            };

            let mut sink = metric.sink().lock();
            let passed = match ths.run(&mut sink, elapsed) {
                Ok(passed) => passed,
                Err(err) => {
                    warn!(metric = %name, %err, "threshold evaluation failed");
                    false
                }
            };
            drop(sink);

            if passed {
                continue;
            }

            warn!(metric = %name, "threshold crossed");
            metric.taint();
            self.tainted.store(true, Ordering::Release);
            if ths.abort_on_fail() {
                abort.cancel();
                aborted = true;
            }
        }

        aborted
    }

    fn emit_engine_samples(&self) {
        self.process_samples(vec![
            Sample::new(self.metric_vus.clone(), self.executor.get_vus() as f64),
            Sample::new(
                self.metric_vus_max.clone(),
                self.executor.get_vus_max() as f64,
            ),
        ]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::InMemoryCollector;
    use crate::executor::LocalExecutor;
    use crate::options::Stage;
    use crate::runner::{MiniRunner, Runner};

    async fn new_test_engine(runner: Option<MiniRunner>, options: Options) -> Result<Engine> {
        let executor = LocalExecutor::new(runner.map(|r| Arc::new(r) as Arc<dyn Runner>));
        Engine::new(Box::new(executor), options).await
    }

    fn thresholds_for(name: &str, sources: &[&str]) -> HashMap<String, Thresholds> {
        let mut out = HashMap::new();
        out.insert(
            name.to_string(),
            Thresholds::new(sources).unwrap_or_else(|e| panic!("{e}")),
        );
        out
    }

    #[tokio::test]
    async fn new_engine_without_options() {
        new_test_engine(None, Options::default())
            .await
            .unwrap_or_else(|e| panic!("{e}"));
    }

    #[tokio::test]
    async fn new_engine_duration_options() {
        let engine = new_test_engine(
            None,
            Options {
                duration: Some(Duration::from_secs(10)),
                ..Options::default()
            },
        )
        .await
        .unwrap_or_else(|e| panic!("{e}"));
        assert!(engine.executor().get_stages().is_empty());
        assert_eq!(
            engine.executor().get_end_time(),
            Some(Duration::from_secs(10))
        );

        // Absent duration means an unbounded run.
        let engine = new_test_engine(None, Options::default())
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(engine.executor().get_end_time(), None);
    }

    #[tokio::test]
    async fn new_engine_stage_options() {
        let stage = Stage {
            duration: Some(Duration::from_secs(10)),
            target: 10,
        };

        let engine = new_test_engine(
            None,
            Options {
                stages: Some(vec![stage.clone()]),
                ..Options::default()
            },
        )
        .await
        .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(engine.executor().get_stages(), vec![stage.clone()]);
        assert_eq!(
            engine.executor().get_end_time(),
            Some(Duration::from_secs(10))
        );

        // An explicit duration longer than the ramp wins.
        let engine = new_test_engine(
            None,
            Options {
                duration: Some(Duration::from_secs(60)),
                stages: Some(vec![stage.clone()]),
                ..Options::default()
            },
        )
        .await
        .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(engine.executor().get_stages(), vec![stage]);
        assert_eq!(
            engine.executor().get_end_time(),
            Some(Duration::from_secs(60))
        );
    }

    #[tokio::test]
    async fn new_engine_iteration_options() {
        let engine = new_test_engine(
            None,
            Options {
                iterations: Some(100),
                ..Options::default()
            },
        )
        .await
        .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(engine.executor().get_end_iterations(), Some(100));
    }

    #[tokio::test]
    async fn new_engine_vu_options() {
        let engine = new_test_engine(None, Options::default())
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(engine.executor().get_vus_max(), 0);
        assert_eq!(engine.executor().get_vus(), 0);

        let engine = new_test_engine(
            None,
            Options {
                vus_max: Some(10),
                ..Options::default()
            },
        )
        .await
        .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(engine.executor().get_vus_max(), 10);
        assert_eq!(engine.executor().get_vus(), 0);

        let err = new_test_engine(
            None,
            Options {
                vus: Some(10),
                ..Options::default()
            },
        )
        .await
        .map(|_| ())
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "can't raise vu count (to 10) above vu cap (0)"
        );

        let err = new_test_engine(
            None,
            Options {
                vus_max: Some(-1),
                ..Options::default()
            },
        )
        .await
        .map(|_| ())
        .unwrap_err();
        assert_eq!(err.to_string(), "vu cap can't be negative");

        let err = new_test_engine(
            None,
            Options {
                vus: Some(10),
                vus_max: Some(1),
                ..Options::default()
            },
        )
        .await
        .map(|_| ())
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "can't raise vu count (to 10) above vu cap (1)"
        );

        let engine = new_test_engine(
            None,
            Options {
                vus: Some(1),
                vus_max: Some(10),
                ..Options::default()
            },
        )
        .await
        .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(engine.executor().get_vus_max(), 10);
        assert_eq!(engine.executor().get_vus(), 1);

        let engine = new_test_engine(
            None,
            Options {
                vus: Some(10),
                vus_max: Some(10),
                ..Options::default()
            },
        )
        .await
        .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(engine.executor().get_vus_max(), 10);
        assert_eq!(engine.executor().get_vus(), 10);
    }

    #[tokio::test]
    async fn new_engine_paused_options() {
        let engine = new_test_engine(None, Options::default())
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert!(!engine.executor().is_paused());

        let engine = new_test_engine(
            None,
            Options {
                paused: Some(false),
                ..Options::default()
            },
        )
        .await
        .unwrap_or_else(|e| panic!("{e}"));
        assert!(!engine.executor().is_paused());

        let engine = new_test_engine(
            None,
            Options {
                paused: Some(true),
                ..Options::default()
            },
        )
        .await
        .unwrap_or_else(|e| panic!("{e}"));
        assert!(engine.executor().is_paused());
    }

    #[tokio::test]
    async fn new_engine_registers_thresholds_and_submetrics() {
        let engine = new_test_engine(
            None,
            Options {
                thresholds: thresholds_for("my_metric", &[]),
                ..Options::default()
            },
        )
        .await
        .unwrap_or_else(|e| panic!("{e}"));
        assert!(engine.thresholds.lock().contains_key("my_metric"));
        assert!(engine.submetrics.is_empty());

        let engine = new_test_engine(
            None,
            Options {
                thresholds: thresholds_for("my_metric{tag:value}", &[]),
                ..Options::default()
            },
        )
        .await
        .unwrap_or_else(|e| panic!("{e}"));
        assert!(engine.thresholds.lock().contains_key("my_metric{tag:value}"));

        let subs = &engine.submetrics["my_metric"];
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].name, "my_metric{tag:value}");
        assert_eq!(subs[0].tags.get("tag"), Some("value"));

        let err = new_test_engine(
            None,
            Options {
                thresholds: thresholds_for("my_metric{broken", &[]),
                ..Options::default()
            },
        )
        .await
        .map(|_| ())
        .unwrap_err();
        assert!(matches!(err, Error::Submetric { .. }));
    }

    #[tokio::test]
    async fn run_exits_with_context() {
        let engine = new_test_engine(None, Options::default())
            .await
            .unwrap_or_else(|e| panic!("{e}"));

        let ctx = CancellationToken::new();
        let canceller = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                ctx.cancel();
            })
        };

        let started = Instant::now();
        engine.run(ctx).await.unwrap_or_else(|e| panic!("{e}"));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(90), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(400), "elapsed {elapsed:?}");

        canceller.await.unwrap_or_else(|e| panic!("{e}"));
    }

    #[tokio::test]
    async fn run_exits_with_executor() {
        let engine = new_test_engine(
            None,
            Options {
                vus: Some(10),
                vus_max: Some(10),
                iterations: Some(100),
                ..Options::default()
            },
        )
        .await
        .unwrap_or_else(|e| panic!("{e}"));

        engine
            .run(CancellationToken::new())
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(engine.executor().get_iterations(), 100);
    }

    #[test]
    fn process_samples_creates_the_metric() {
        let engine = sync_engine(Options::default());

        let metric = Metric::new("my_metric", MetricKind::Gauge);
        engine.process_samples(vec![Sample::with_tags(
            metric,
            1.25,
            TagSet::from_pairs([("a", "1")]),
        )]);

        let registered = engine.get_metric("my_metric").unwrap();
        assert_eq!(registered.kind(), MetricKind::Gauge);
        let sink = registered.sink().lock();
        let stampede_metrics::Sink::Gauge(g) = &*sink else {
            panic!("wrong sink kind")
        };
        assert_eq!(g.value, 1.25);
    }

    #[test]
    fn process_samples_feeds_matching_submetrics() {
        let engine = sync_engine(Options {
            thresholds: thresholds_for("my_metric{a:1}", &["1+1==2"]),
            ..Options::default()
        });

        let metric = Metric::new("my_metric", MetricKind::Gauge);
        engine.process_samples(vec![
            Sample::with_tags(metric.clone(), 1.25, TagSet::from_pairs([("a", "1")])),
            Sample::with_tags(metric, 2.5, TagSet::from_pairs([("a", "2")])),
        ]);

        let sub = engine
            .get_metric("my_metric{a:1}")
            .unwrap();
        let sink = sub.sink().lock();
        let stampede_metrics::Sink::Gauge(g) = &*sink else {
            panic!("wrong sink kind")
        };
        // Only the matching sample reached the submetric.
        assert_eq!(g.value, 1.25);
    }

    #[test]
    fn process_samples_applies_run_tags_as_defaults() {
        let mut engine = sync_engine(Options {
            run_tags: TagSet::from_pairs([("foo", "bar")]),
            ..Options::default()
        });
        let collector = InMemoryCollector::new();
        engine.set_collector(Box::new(collector.clone()));

        let metric = Metric::new("my_metric", MetricKind::Gauge);
        engine.process_samples(vec![Sample::new(metric.clone(), 1.25)]);
        assert_eq!(collector.samples()[0].tags.get("foo"), Some("bar"));

        collector.clear();
        engine.process_samples(vec![Sample::with_tags(
            metric,
            1.25,
            TagSet::from_pairs([("foo", "mine"), ("extra", "1")]),
        )]);
        let tags = &collector.samples()[0].tags;
        // The sample's own value wins on collision.
        assert_eq!(tags.get("foo"), Some("mine"));
        assert_eq!(tags.get("extra"), Some("1"));
    }

    #[tokio::test]
    async fn run_thresholds_aborts_on_failing_abort_threshold() {
        let mut thresholds = thresholds_for("my_metric", &["1+1==3"]);
        thresholds.get_mut("my_metric").unwrap().thresholds[0]
            .abort_on_fail = true;

        let engine = new_test_engine(
            None,
            Options {
                thresholds,
                ..Options::default()
            },
        )
        .await
        .unwrap_or_else(|e| panic!("{e}"));

        engine.process_samples(vec![Sample::with_tags(
            Metric::new("my_metric", MetricKind::Gauge),
            1.25,
            TagSet::from_pairs([("a", "1")]),
        )]);

        let ctx = CancellationToken::new();
        let abort = CancellationToken::new();
        engine.run_thresholds(ctx, &abort).await;

        assert!(abort.is_cancelled());
        assert!(engine.is_tainted());
    }

    #[tokio::test]
    async fn run_thresholds_exits_on_cancel() {
        let engine = new_test_engine(
            None,
            Options {
                thresholds: thresholds_for("my_metric", &["1+1==3"]),
                ..Options::default()
            },
        )
        .await
        .unwrap_or_else(|e| panic!("{e}"));

        let ctx = CancellationToken::new();
        ctx.cancel();
        let abort = CancellationToken::new();

        tokio::time::timeout(Duration::from_secs(1), engine.run_thresholds(ctx, &abort))
            .await
            .unwrap_or_else(|_| panic!("threshold loop did not exit"));
    }

    #[tokio::test]
    async fn process_thresholds_matrix() {
        struct Case {
            name: &'static str,
            key: &'static str,
            source: &'static str,
            abort: bool,
            pass: bool,
        }
        let cases = [
            Case { name: "passing", key: "my_metric", source: "1+1==2", abort: false, pass: true },
            Case { name: "failing", key: "my_metric", source: "1+1==3", abort: false, pass: false },
            Case { name: "aborting", key: "my_metric", source: "1+1==3", abort: true, pass: false },
            Case { name: "submetric,match,passing", key: "my_metric{a:1}", source: "1+1==2", abort: false, pass: true },
            Case { name: "submetric,match,failing", key: "my_metric{a:1}", source: "1+1==3", abort: false, pass: false },
            Case { name: "submetric,nomatch,passing", key: "my_metric{a:2}", source: "1+1==2", abort: false, pass: true },
            Case { name: "submetric,nomatch,failing", key: "my_metric{a:2}", source: "1+1==3", abort: false, pass: true },
        ];

        for case in cases {
            let mut thresholds = thresholds_for(case.key, &[case.source]);
            thresholds
                .get_mut(case.key)
                .unwrap()
                .thresholds[0]
                .abort_on_fail = case.abort;

            let engine = new_test_engine(
                None,
                Options {
                    thresholds,
                    ..Options::default()
                },
            )
            .await
            .unwrap_or_else(|e| panic!("{}: {e}", case.name));

            engine.process_samples(vec![Sample::with_tags(
                Metric::new("my_metric", MetricKind::Gauge),
                1.25,
                TagSet::from_pairs([("a", "1")]),
            )]);

            let abort = CancellationToken::new();
            let aborted = engine.process_thresholds(&abort);

            assert_eq!(case.pass, !engine.is_tainted(), "case {}", case.name);
            assert_eq!(case.abort, aborted, "case {}", case.name);
            assert_eq!(case.abort, abort.is_cancelled(), "case {}", case.name);
        }
    }

    /// Construction helper for the non-async tests above.
    fn sync_engine(options: Options) -> Engine {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap_or_else(|e| panic!("{e}"));
        rt.block_on(new_test_engine(None, options))
            .unwrap_or_else(|e| panic!("{e}"))
    }
}
