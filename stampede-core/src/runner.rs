use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use stampede_metrics::Sample;

use crate::error::Result;
use crate::options::Options;

/// The contract the engine requires of a workload provider.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Allocate a fresh VU. Called only while growing the pool toward the
    /// cap; may perform network setup.
    async fn new_vu(&self) -> Result<Box<dyn Vu>>;

    fn options(&self) -> Options;

    /// Receive the negotiated options before the run starts.
    fn apply_options(&self, options: Options);
}

/// A virtual user: a stateful object running one iteration at a time.
#[async_trait]
pub trait Vu: Send {
    /// Called whenever the VU re-enters the active set. Must be idempotent.
    fn reconfigure(&mut self, id: i64) -> Result<()>;

    /// Execute one iteration, returning the samples it produced. Must return
    /// promptly once `ctx` is cancelled; the executor never force-kills an
    /// iteration.
    async fn run_once(&mut self, ctx: CancellationToken) -> Result<Vec<Sample>>;
}

/// Boxed iteration future returned by [`MiniRunner`] functions.
pub type IterationFuture = Pin<Box<dyn Future<Output = Result<Vec<Sample>>> + Send>>;

type IterationFn = dyn Fn(CancellationToken) -> IterationFuture + Send + Sync;

/// Closure-backed runner for tests and embedders that don't carry a scripting
/// runtime. Every VU shares the same iteration function.
pub struct MiniRunner {
    func: Option<Arc<IterationFn>>,
    options: Mutex<Options>,
}

impl MiniRunner {
    pub fn new(
        func: impl Fn(CancellationToken) -> IterationFuture + Send + Sync + 'static,
    ) -> Self {
        Self {
            func: Some(Arc::new(func)),
            options: Mutex::new(Options::default()),
        }
    }

    /// A runner whose iterations do nothing and emit no samples.
    pub fn idle() -> Self {
        Self {
            func: None,
            options: Mutex::new(Options::default()),
        }
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = Mutex::new(options);
        self
    }
}

#[async_trait]
impl Runner for MiniRunner {
    async fn new_vu(&self) -> Result<Box<dyn Vu>> {
        Ok(Box::new(MiniRunnerVu {
            func: self.func.clone(),
            id: 0,
        }))
    }

    fn options(&self) -> Options {
        self.options.lock().clone()
    }

    fn apply_options(&self, options: Options) {
        *self.options.lock() = options;
    }
}

struct MiniRunnerVu {
    func: Option<Arc<IterationFn>>,
    #[allow(dead_code)]
    id: i64,
}

#[async_trait]
impl Vu for MiniRunnerVu {
    fn reconfigure(&mut self, id: i64) -> Result<()> {
        self.id = id;
        Ok(())
    }

    async fn run_once(&mut self, ctx: CancellationToken) -> Result<Vec<Sample>> {
        match &self.func {
            Some(func) => func(ctx).await,
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mini_runner_vus_run_the_shared_function() {
        let runner = MiniRunner::new(|_ctx| Box::pin(async { Ok(Vec::new()) }));
        let mut vu = runner.new_vu().await.unwrap_or_else(|e| panic!("{e}"));

        vu.reconfigure(1).unwrap_or_else(|e| panic!("{e}"));
        let samples = vu
            .run_once(CancellationToken::new())
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert!(samples.is_empty());
    }

    #[tokio::test]
    async fn idle_runner_emits_nothing() {
        let runner = MiniRunner::idle();
        let mut vu = runner.new_vu().await.unwrap_or_else(|e| panic!("{e}"));
        let samples = vu
            .run_once(CancellationToken::new())
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert!(samples.is_empty());
    }

    #[test]
    fn options_negotiation_replaces_the_stored_set() {
        let runner = MiniRunner::idle().with_options(Options {
            vus: Some(2),
            ..Options::default()
        });
        assert_eq!(runner.options().vus, Some(2));

        runner.apply_options(Options {
            vus: Some(5),
            ..Options::default()
        });
        assert_eq!(runner.options().vus, Some(5));
    }
}
