use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use stampede_metrics::Sample;

use crate::error::{Error, Result};
use crate::gate::{PauseGate, StageClock};
use crate::options::Stage;
use crate::runner::{Runner, Vu};
use crate::schedule::VuSchedule;

/// How often the controller recomputes the active-VU set-point. Setters
/// nudge it out of the sleep as well, so changes apply without waiting a
/// full tick.
const TICK: Duration = Duration::from_millis(100);

/// Batches buffered between VU tasks and the controller.
const SAMPLE_BUFFER: usize = 128;

/// The scheduling surface the engine drives.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Main loop: drives VUs until an end condition, forwarding sample
    /// batches to `out`. Samples stamped after the shutdown cutoff are
    /// discarded at this boundary.
    async fn run(&self, ctx: CancellationToken, out: mpsc::Sender<Vec<Sample>>) -> Result<()>;

    /// The workload provider, if one is configured.
    fn runner(&self) -> Option<Arc<dyn Runner>>;

    /// Grow or shrink the VU pool. Growing allocates through the runner.
    async fn set_vus_max(&self, max: i64) -> Result<()>;
    fn get_vus_max(&self) -> i64;

    fn set_vus(&self, vus: i64) -> Result<()>;
    fn get_vus(&self) -> i64;

    fn set_paused(&self, paused: bool);
    fn is_paused(&self) -> bool;

    fn set_stages(&self, stages: Vec<Stage>);
    fn get_stages(&self) -> Vec<Stage>;

    fn set_end_time(&self, end: Option<Duration>);
    fn get_end_time(&self) -> Option<Duration>;

    fn set_end_iterations(&self, iterations: Option<i64>);
    fn get_end_iterations(&self) -> Option<i64>;

    /// Completed iterations, success or error.
    fn get_iterations(&self) -> i64;
}

/// State VU tasks observe; behind an `Arc` so the tasks outlive any borrow
/// of the executor itself.
#[derive(Debug)]
struct Shared {
    paused: PauseGate,
    end_iterations: RwLock<Option<i64>>,
    /// Iterations handed out to VUs. Admission stops at the budget, so at
    /// most `end_iterations` ever start.
    started: AtomicI64,
    /// Iterations finished, success or error.
    completed: AtomicI64,
    /// Nudges the controller out of its tick sleep.
    wake: Notify,
}

struct VuSlot {
    /// `None` when no runner is configured: the slot still schedules no-op
    /// iterations so accounting works without a workload.
    vu: Option<Arc<tokio::sync::Mutex<Box<dyn Vu>>>>,
    deactivate: CancellationToken,
    active: bool,
}

/// In-process executor driving a pool of pre-allocated VUs.
pub struct LocalExecutor {
    runner: Option<Arc<dyn Runner>>,
    running: AtomicBool,
    pool: Mutex<Vec<VuSlot>>,
    vus_max: AtomicI64,
    vus: AtomicI64,
    next_vu_id: AtomicI64,
    stages: RwLock<Vec<Stage>>,
    end_time: RwLock<Option<Duration>>,
    clock: Mutex<StageClock>,
    shared: Arc<Shared>,
}

impl LocalExecutor {
    pub fn new(runner: Option<Arc<dyn Runner>>) -> Self {
        Self {
            runner,
            running: AtomicBool::new(false),
            pool: Mutex::new(Vec::new()),
            vus_max: AtomicI64::new(0),
            vus: AtomicI64::new(0),
            next_vu_id: AtomicI64::new(0),
            stages: RwLock::new(Vec::new()),
            end_time: RwLock::new(None),
            clock: Mutex::new(StageClock::default()),
            shared: Arc::new(Shared {
                paused: PauseGate::new(),
                end_iterations: RwLock::new(None),
                started: AtomicI64::new(0),
                completed: AtomicI64::new(0),
                wake: Notify::new(),
            }),
        }
    }

    /// Bring the set of running VU tasks in line with the set-point. Slots
    /// below the target are started, slots above it are told to wind down
    /// after their current iteration.
    fn reconcile(
        &self,
        target: i64,
        stop: &CancellationToken,
        tracker: &TaskTracker,
        out: &mpsc::Sender<Vec<Sample>>,
    ) {
        let mut pool = self.pool.lock();
        let target = target.clamp(0, pool.len() as i64) as usize;

        for (idx, slot) in pool.iter_mut().enumerate() {
            if idx < target && !slot.active {
                slot.active = true;
                slot.deactivate = CancellationToken::new();
                let id = self.next_vu_id.fetch_add(1, Ordering::Relaxed) + 1;
                tracker.spawn(vu_loop(
                    self.shared.clone(),
                    slot.vu.clone(),
                    id,
                    stop.clone(),
                    slot.deactivate.clone(),
                    out.clone(),
                ));
            } else if idx >= target && slot.active {
                slot.active = false;
                slot.deactivate.cancel();
            }
        }
    }

    async fn run_inner(
        &self,
        ctx: CancellationToken,
        out: mpsc::Sender<Vec<Sample>>,
    ) -> Result<()> {
        self.shared.started.store(0, Ordering::Release);
        self.shared.completed.store(0, Ordering::Release);
        self.clock.lock().start(self.shared.paused.is_paused());

        let stop = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (vu_tx, mut vu_rx) = mpsc::channel::<Vec<Sample>>(SAMPLE_BUFFER);

        // The ramp interpolates from the VU count configured at run start.
        let start_vus = self.get_vus();

        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let elapsed = self.clock.lock().elapsed();

            let target = {
                let stages = self.stages.read();
                if stages.is_empty() {
                    self.vus.load(Ordering::Acquire)
                } else {
                    VuSchedule::new(start_vus, stages.clone()).target_at(elapsed)
                }
            };
            self.reconcile(target, &stop, &tracker, &vu_tx);

            if let Some(end) = *self.end_time.read()
                && elapsed >= end
            {
                debug!(?elapsed, "end time reached");
                break;
            }
            if let Some(budget) = *self.shared.end_iterations.read()
                && self.shared.completed.load(Ordering::Acquire) >= budget
            {
                debug!(budget, "iteration budget reached");
                break;
            }

            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.shared.wake.notified() => {}
                batch = vu_rx.recv() => {
                    // The loop holds its own sender, so the channel can't
                    // close here.
                    if let Some(batch) = batch
                        && out.send(batch).await.is_err()
                    {
                        break;
                    }
                }
            }
        }

        // Cutoff is recorded before iteration contexts are cancelled, so a
        // VU returning late can't stamp samples under it.
        let cutoff = SystemTime::now();
        stop.cancel();
        {
            let mut pool = self.pool.lock();
            for slot in pool.iter_mut() {
                slot.active = false;
                slot.deactivate.cancel();
            }
        }
        tracker.close();
        drop(vu_tx);

        // Drain whatever the VUs still flush; the channel closes once every
        // task has dropped its sender. Keep draining even if the receiver is
        // gone, so no task stays blocked on a full buffer.
        while let Some(batch) = vu_rx.recv().await {
            let kept: Vec<Sample> = batch.into_iter().filter(|s| s.time <= cutoff).collect();
            if !kept.is_empty() {
                let _ = out.send(kept).await;
            }
        }
        tracker.wait().await;

        debug!(iterations = self.get_iterations(), "executor finished");
        Ok(())
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn run(&self, ctx: CancellationToken, out: mpsc::Sender<Vec<Sample>>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }
        let result = self.run_inner(ctx, out).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn runner(&self) -> Option<Arc<dyn Runner>> {
        self.runner.clone()
    }

    async fn set_vus_max(&self, max: i64) -> Result<()> {
        if max < 0 {
            return Err(Error::NegativeVuCap);
        }
        let current = self.vus.load(Ordering::Acquire);
        if max < current {
            return Err(Error::VuCapBelowCount {
                requested: max,
                current,
            });
        }

        let have = self.pool.lock().len() as i64;
        if max > have {
            // Allocate outside the pool lock; new_vu may do network setup.
            let mut fresh = Vec::with_capacity((max - have) as usize);
            for _ in have..max {
                let vu = match &self.runner {
                    Some(runner) => Some(Arc::new(tokio::sync::Mutex::new(runner.new_vu().await?))),
                    None => None,
                };
                fresh.push(vu);
            }
            let mut pool = self.pool.lock();
            for vu in fresh {
                pool.push(VuSlot {
                    vu,
                    deactivate: CancellationToken::new(),
                    active: false,
                });
            }
        } else if max < have {
            let mut pool = self.pool.lock();
            for slot in pool.drain(max as usize..) {
                slot.deactivate.cancel();
            }
        }

        self.vus_max.store(max, Ordering::Release);
        self.shared.wake.notify_one();
        Ok(())
    }

    fn get_vus_max(&self) -> i64 {
        self.vus_max.load(Ordering::Acquire)
    }

    fn set_vus(&self, vus: i64) -> Result<()> {
        if vus < 0 {
            return Err(Error::NegativeVus);
        }
        let cap = self.vus_max.load(Ordering::Acquire);
        if vus > cap {
            return Err(Error::VuCapExceeded {
                requested: vus,
                cap,
            });
        }
        self.vus.store(vus, Ordering::Release);
        self.shared.wake.notify_one();
        Ok(())
    }

    fn get_vus(&self) -> i64 {
        self.vus.load(Ordering::Acquire)
    }

    fn set_paused(&self, paused: bool) {
        if self.shared.paused.is_paused() == paused {
            return;
        }
        {
            let mut clock = self.clock.lock();
            if paused {
                clock.pause();
            } else {
                clock.resume();
            }
        }
        self.shared.paused.set(paused);
        self.shared.wake.notify_one();
    }

    fn is_paused(&self) -> bool {
        self.shared.paused.is_paused()
    }

    fn set_stages(&self, stages: Vec<Stage>) {
        *self.stages.write() = stages;
        self.shared.wake.notify_one();
    }

    fn get_stages(&self) -> Vec<Stage> {
        self.stages.read().clone()
    }

    fn set_end_time(&self, end: Option<Duration>) {
        *self.end_time.write() = end;
        self.shared.wake.notify_one();
    }

    fn get_end_time(&self) -> Option<Duration> {
        *self.end_time.read()
    }

    fn set_end_iterations(&self, iterations: Option<i64>) {
        *self.shared.end_iterations.write() = iterations;
        self.shared.wake.notify_one();
    }

    fn get_end_iterations(&self) -> Option<i64> {
        *self.shared.end_iterations.read()
    }

    fn get_iterations(&self) -> i64 {
        self.shared.completed.load(Ordering::Acquire)
    }
}

/// One VU's active period. Holds the slot lock for its whole lifetime, so a
/// reactivation spawned while the previous task is still draining waits its
/// turn instead of running the VU twice.
async fn vu_loop(
    shared: Arc<Shared>,
    vu: Option<Arc<tokio::sync::Mutex<Box<dyn Vu>>>>,
    id: i64,
    stop: CancellationToken,
    deactivate: CancellationToken,
    out: mpsc::Sender<Vec<Sample>>,
) {
    let mut guard = match &vu {
        Some(vu) => Some(vu.lock().await),
        None => None,
    };

    if let Some(vu) = guard.as_deref_mut()
        && let Err(err) = vu.reconfigure(id)
    {
        warn!(vu = id, %err, "vu reconfigure failed");
        return;
    }

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = deactivate.cancelled() => break,
            _ = shared.paused.unpaused() => {}
        }

        if let Some(budget) = *shared.end_iterations.read()
            && shared.started.fetch_add(1, Ordering::AcqRel) >= budget
        {
            shared.wake.notify_one();
            break;
        }

        match guard.as_deref_mut() {
            Some(vu) => match vu.run_once(stop.clone()).await {
                Ok(samples) => {
                    if !samples.is_empty() && out.send(samples).await.is_err() {
                        break;
                    }
                }
                // Iteration errors are counted but never abort the run.
                Err(err) => warn!(vu = id, %err, "iteration errored"),
            },
            // No workload configured: the iteration is a no-op, but it must
            // still yield or it would monopolize the worker thread.
            None => tokio::task::yield_now().await,
        }

        let completed = shared.completed.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(budget) = *shared.end_iterations.read()
            && completed >= budget
        {
            shared.wake.notify_one();
        }
    }
}
