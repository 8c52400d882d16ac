//! Background samplers that record system resource usage while a command runs.
//!
//! A [`Sampler`] wraps one [`StatsCollector`]. Starting it moves the
//! collector onto its own thread, which calls [`StatsCollector::collect`]
//! once per interval until [`RunningSampler::finish`] stops it and hands
//! back the accumulated [`Samples`].

mod collectors;
mod registry;
mod sampler;

pub use collectors::{CpuCollector, DiskCollector, MemoryCollector};
pub use registry::{CollectorConstructor, SamplerRegistry};
pub use sampler::{RunningSampler, Sampler, finish_all, start_all};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Polling interval used when none is configured, in seconds.
pub const DEFAULT_INTERVAL: f64 = 1.0;

/// One measurement: milliseconds since the Unix epoch and a percentage.
pub type Sample = (i64, f32);

/// Everything a sampler recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Samples {
    /// A single time series.
    Series(Vec<Sample>),
    /// One time series per mount point.
    PerMount(BTreeMap<String, Vec<Sample>>),
}

impl Samples {
    /// Number of polling ticks recorded.
    pub fn ticks(&self) -> usize {
        match self {
            Samples::Series(series) => series.len(),
            Samples::PerMount(mounts) => mounts.values().map(Vec::len).max().unwrap_or(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ticks() == 0
    }
}

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("unknown sampler `{name}` (available: {available})")]
    UnknownSampler { name: String, available: String },
    #[error("sampling interval must be a positive number of seconds, got {0}")]
    InvalidInterval(f64),
    #[error("failed to start the {name} sampler thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("the {name} sampler thread panicked")]
    Panicked { name: String },
}

/// A source of one system metric.
///
/// Implementations keep their own samples; the sampler thread owns the
/// collector while it runs, so no locking is involved.
pub trait StatsCollector: Send {
    /// Name the collector is registered and reported under.
    fn stat_name(&self) -> &'static str;

    /// Take one instantaneous sample.
    fn collect(&mut self);

    /// Consume the collector and return what it recorded.
    fn into_samples(self: Box<Self>) -> Samples;
}

/// Current time in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
