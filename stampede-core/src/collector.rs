use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use stampede_metrics::Sample;

/// External sink for the raw sample stream.
///
/// `collect` must not block: the engine calls it from the sample router and
/// will not await it. Buffer internally and flush from `run`.
#[async_trait]
pub trait Collector: Send + Sync {
    /// One-time setup before the run starts.
    async fn init(&self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Background loop. Must return promptly once `ctx` is cancelled; the
    /// engine cancels it only after the sample stream has drained, so a last
    /// flush on the way out sees everything.
    async fn run(&self, ctx: CancellationToken);

    /// Buffer a batch of samples.
    fn collect(&self, samples: Vec<Sample>);

    /// Human-readable destination, for end-of-run output.
    fn link(&self) -> String;
}

/// Collector that keeps every sample in memory. Useful for tests and for
/// embedders that post-process the stream themselves.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCollector {
    samples: Arc<Mutex<Vec<Sample>>>,
}

impl InMemoryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<Sample> {
        self.samples.lock().clone()
    }

    pub fn clear(&self) {
        self.samples.lock().clear();
    }
}

#[async_trait]
impl Collector for InMemoryCollector {
    async fn init(&self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }

    async fn run(&self, ctx: CancellationToken) {
        ctx.cancelled().await;
    }

    fn collect(&self, samples: Vec<Sample>) {
        self.samples.lock().extend(samples);
    }

    fn link(&self) -> String {
        "in-memory".to_string()
    }
}
