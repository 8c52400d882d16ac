use crate::collectors::{CpuCollector, DiskCollector, MemoryCollector};
use crate::sampler::Sampler;
use crate::{StatsCollector, StatsError};
use std::collections::BTreeMap;
use std::fmt;

/// Builds a fresh collector.
pub type CollectorConstructor = fn() -> Box<dyn StatsCollector>;

fn cpu() -> Box<dyn StatsCollector> {
    Box::new(CpuCollector::new())
}

fn memory() -> Box<dyn StatsCollector> {
    Box::new(MemoryCollector::new())
}

fn disk() -> Box<dyn StatsCollector> {
    Box::new(DiskCollector::new())
}

/// Name-keyed table of the sampler kinds that can be requested.
#[derive(Clone, Default)]
pub struct SamplerRegistry {
    constructors: BTreeMap<&'static str, CollectorConstructor>,
}

impl fmt::Debug for SamplerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

impl SamplerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the `cpu`, `memory` and `disk` samplers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("cpu", cpu);
        registry.register("memory", memory);
        registry.register("disk", disk);
        registry
    }

    /// Add or replace a sampler kind.
    pub fn register(&mut self, name: &'static str, constructor: CollectorConstructor) {
        if self.constructors.insert(name, constructor).is_some() {
            tracing::debug!(sampler = name, "replaced registered sampler");
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.constructors.keys().copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Build one sampler by name.
    pub fn create(&self, name: &str, interval: f64) -> Result<Sampler, StatsError> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| StatsError::UnknownSampler {
                name: name.to_string(),
                available: self.names().collect::<Vec<_>>().join(", "),
            })?;
        Sampler::new(constructor(), interval)
    }

    /// Build every requested sampler.
    ///
    /// All names and the interval are validated before any collector is
    /// constructed, so a bad request has no side effects.
    pub fn create_all<S: AsRef<str>>(
        &self,
        names: &[S],
        interval: f64,
    ) -> Result<Vec<Sampler>, StatsError> {
        if !interval.is_finite() || interval <= 0.0 {
            return Err(StatsError::InvalidInterval(interval));
        }
        if let Some(unknown) = names.iter().find(|n| !self.contains(n.as_ref())) {
            return Err(StatsError::UnknownSampler {
                name: unknown.as_ref().to_string(),
                available: self.names().collect::<Vec<_>>().join(", "),
            });
        }
        names
            .iter()
            .map(|name| self.create(name.as_ref(), interval))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_names() {
        let registry = SamplerRegistry::with_defaults();
        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            vec!["cpu", "disk", "memory"]
        );
    }

    #[test]
    fn test_unknown_sampler() {
        let registry = SamplerRegistry::with_defaults();
        let err = registry.create("gpu", 1.0).err().unwrap();
        assert_eq!(
            err.to_string(),
            "unknown sampler `gpu` (available: cpu, disk, memory)"
        );
    }

    #[test]
    fn test_create_all_rejects_before_building() {
        let registry = SamplerRegistry::with_defaults();
        let err = registry.create_all(&["cpu", "gpu"], 1.0).err().unwrap();
        assert!(matches!(err, StatsError::UnknownSampler { ref name, .. } if name == "gpu"));

        let err = registry.create_all(&["cpu"], 0.0).err().unwrap();
        assert!(matches!(err, StatsError::InvalidInterval(_)));
    }

    #[test]
    fn test_create_all_preserves_order() {
        let registry = SamplerRegistry::with_defaults();
        let samplers = registry.create_all(&["memory", "cpu"], 0.5).unwrap();
        let names: Vec<_> = samplers.iter().map(Sampler::name).collect();
        assert_eq!(names, vec!["memory", "cpu"]);
    }

    #[test]
    fn test_register_custom_sampler() {
        let mut registry = SamplerRegistry::new();
        assert!(!registry.contains("memory"));
        registry.register("memory", memory);
        assert!(registry.create("memory", 1.0).is_ok());
    }
}
