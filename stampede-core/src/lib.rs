pub mod collector;
pub mod engine;
pub mod error;
pub mod executor;
pub mod gate;
pub mod options;
pub mod runner;
pub mod schedule;

pub use collector::{Collector, InMemoryCollector};
pub use engine::Engine;
pub use error::{Error, Result};
pub use executor::{Executor, LocalExecutor};
pub use options::{Options, Stage, sum_stages};
pub use runner::{IterationFuture, MiniRunner, Runner, Vu};
