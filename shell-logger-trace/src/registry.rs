use crate::tracers::{Ltrace, Strace};
use crate::{TraceError, TraceSpec, Tracer};
use std::fmt;

/// Builds a tracer for a request.
pub type TracerConstructor = fn(&TraceSpec) -> Box<dyn Tracer>;

fn strace(spec: &TraceSpec) -> Box<dyn Tracer> {
    Box::new(Strace::new(spec))
}

fn ltrace(spec: &TraceSpec) -> Box<dyn Tracer> {
    Box::new(Ltrace::new(spec))
}

/// The tracers a command can be wrapped with, looked up by exact name.
#[derive(Clone, Default)]
pub struct TracerRegistry {
    entries: Vec<(&'static str, TracerConstructor)>,
}

impl fmt::Debug for TracerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl TracerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding `strace` and `ltrace`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("strace", strace);
        registry.register("ltrace", ltrace);
        registry
    }

    /// Add a tracer. Registering a name twice makes lookups of it ambiguous.
    pub fn register(&mut self, name: &'static str, constructor: TracerConstructor) {
        self.entries.push((name, constructor));
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(name, _)| *name)
    }

    /// Build the tracer for `spec` and check its executable is installed.
    pub fn create(&self, spec: &TraceSpec) -> Result<Box<dyn Tracer>, TraceError> {
        let tracer = self.build(spec)?;
        let executable = tracer.executable();
        match which::which(executable) {
            Ok(path) => {
                tracing::debug!(
                    tracer = tracer.name(),
                    executable = %path.display(),
                    output = %tracer.output_path().display(),
                    "tracer ready"
                );
                Ok(tracer)
            }
            Err(source) => Err(TraceError::MissingExecutable {
                name: spec.tracer.clone(),
                executable: executable.to_string(),
                source,
            }),
        }
    }

    /// Build the tracer for `spec` without looking for its executable.
    pub fn build(&self, spec: &TraceSpec) -> Result<Box<dyn Tracer>, TraceError> {
        let mut matches = self.entries.iter().filter(|(name, _)| *name == spec.tracer);
        match (matches.next(), matches.count()) {
            (Some((_, constructor)), 0) => Ok(constructor(spec)),
            (Some(_), others) => Err(TraceError::AmbiguousTracer {
                name: spec.tracer.clone(),
                count: others + 1,
            }),
            (None, _) => Err(TraceError::UnknownTracer {
                name: spec.tracer.clone(),
                available: self.names().collect::<Vec<_>>().join(", "),
            }),
        }
    }
}
