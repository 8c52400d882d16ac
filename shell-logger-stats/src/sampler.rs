use crate::{Samples, StatsCollector, StatsError};
use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

/// A collector paired with its polling interval, not yet running.
pub struct Sampler {
    interval: Duration,
    collector: Box<dyn StatsCollector>,
}

impl Sampler {
    /// Wrap `collector`, polling every `interval` seconds.
    pub fn new(collector: Box<dyn StatsCollector>, interval: f64) -> Result<Self, StatsError> {
        if !interval.is_finite() || interval <= 0.0 {
            return Err(StatsError::InvalidInterval(interval));
        }
        Ok(Self {
            interval: Duration::from_secs_f64(interval),
            collector,
        })
    }

    pub fn name(&self) -> &'static str {
        self.collector.stat_name()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Move the collector onto its own thread and start polling.
    ///
    /// The first sample is taken immediately.
    pub fn start(self) -> Result<RunningSampler, StatsError> {
        let name = self.name();
        let interval = self.interval;
        let mut collector = self.collector;
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name(format!("sampler-{name}"))
            .spawn(move || {
                let mut ticks = 0usize;
                loop {
                    collector.collect();
                    ticks += 1;
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        // Stop requested, or the handle was dropped.
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::trace!(sampler = name, ticks, "sampler stopped");
                collector
            })
            .map_err(|source| StatsError::Spawn {
                name: name.to_string(),
                source,
            })?;

        tracing::debug!(sampler = name, ?interval, "sampler started");
        Ok(RunningSampler {
            name,
            stop: stop_tx,
            handle,
        })
    }
}

/// A sampler whose thread is polling.
///
/// Dropping it without calling [`RunningSampler::finish`] stops the thread
/// and discards its samples.
pub struct RunningSampler {
    name: &'static str,
    stop: mpsc::Sender<()>,
    handle: thread::JoinHandle<Box<dyn StatsCollector>>,
}

impl RunningSampler {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop polling and return the recorded samples.
    pub fn finish(self) -> Result<Samples, StatsError> {
        // The thread may already have exited; a failed send is fine.
        let _ = self.stop.send(());
        let collector = self.handle.join().map_err(|_| StatsError::Panicked {
            name: self.name.to_string(),
        })?;
        Ok(collector.into_samples())
    }
}

/// Start every sampler, stopping the ones already started if one fails.
pub fn start_all(samplers: Vec<Sampler>) -> Result<Vec<RunningSampler>, StatsError> {
    let mut running = Vec::with_capacity(samplers.len());
    for sampler in samplers {
        match sampler.start() {
            Ok(handle) => running.push(handle),
            Err(e) => {
                for started in running {
                    let _ = started.finish();
                }
                return Err(e);
            }
        }
    }
    Ok(running)
}

/// Finish every running sampler, keyed by sampler name.
///
/// All samplers are stopped even when one of them fails; the first
/// failure is returned.
pub fn finish_all(running: Vec<RunningSampler>) -> Result<BTreeMap<String, Samples>, StatsError> {
    let mut results = BTreeMap::new();
    let mut first_error = None;
    for sampler in running {
        let name = sampler.name();
        match sampler.finish() {
            Ok(samples) => {
                tracing::debug!(sampler = name, ticks = samples.ticks(), "sampler finished");
                results.insert(name.to_string(), samples);
            }
            Err(e) => {
                tracing::warn!(sampler = name, "sampler failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    /// Records the tick index as its value.
    struct Counter(Vec<(i64, f32)>);

    impl StatsCollector for Counter {
        fn stat_name(&self) -> &'static str {
            "counter"
        }

        fn collect(&mut self) {
            let n = self.0.len();
            self.0.push((crate::now_millis(), n as f32));
        }

        fn into_samples(self: Box<Self>) -> Samples {
            Samples::Series(self.0)
        }
    }

    struct Exploding;

    impl StatsCollector for Exploding {
        fn stat_name(&self) -> &'static str {
            "exploding"
        }

        fn collect(&mut self) {
            panic!("collector failure");
        }

        fn into_samples(self: Box<Self>) -> Samples {
            Samples::Series(Vec::new())
        }
    }

    #[test]
    fn test_invalid_intervals() {
        for interval in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = Sampler::new(Box::new(Counter(Vec::new())), interval).err();
            assert!(matches!(err, Some(StatsError::InvalidInterval(_))));
        }
    }

    #[test]
    fn test_first_sample_is_immediate() {
        let sampler = Sampler::new(Box::new(Counter(Vec::new())), 60.0).unwrap();
        let running = sampler.start().unwrap();
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        let samples = running.finish().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(samples.ticks(), 1);
    }

    #[test]
    fn test_samples_are_ordered() {
        let sampler = Sampler::new(Box::new(Counter(Vec::new())), 0.01).unwrap();
        let running = sampler.start().unwrap();
        thread::sleep(Duration::from_millis(100));
        let Samples::Series(series) = running.finish().unwrap() else {
            panic!("expected a series");
        };
        assert!(series.len() >= 2);
        assert!(series.windows(2).all(|w| w[0].0 <= w[1].0 && w[0].1 < w[1].1));
    }

    #[test]
    fn test_panicking_collector_is_reported() {
        let sampler = Sampler::new(Box::new(Exploding), 0.01).unwrap();
        let running = sampler.start().unwrap();
        let err = running.finish().unwrap_err();
        assert!(matches!(err, StatsError::Panicked { ref name } if name == "exploding"));
    }

    #[test]
    fn test_finish_all_keys_by_name() {
        let running = start_all(vec![
            Sampler::new(Box::new(Counter(Vec::new())), 0.05).unwrap(),
        ])
        .unwrap();
        let results = finish_all(running).unwrap();
        assert!(results.contains_key("counter"));
    }
}
