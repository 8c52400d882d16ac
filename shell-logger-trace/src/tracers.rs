use crate::{TraceSpec, Tracer};
use std::borrow::Cow;
use std::path::{Path, PathBuf};

/// Build `<base> -o <path> [-c] [-e <expr>]`.
fn tracer_args(base: &str, output_path: &Path, summary: bool, expression: Option<&str>) -> String {
    let mut args = format!(
        "{base} -o {}",
        shell_escape::escape(output_path.to_string_lossy())
    );
    if summary {
        args.push_str(" -c");
    }
    if let Some(expression) = expression.filter(|e| !e.is_empty()) {
        args.push_str(" -e ");
        args.push_str(&shell_escape::escape(Cow::Borrowed(expression)));
    }
    args
}

/// System call tracing with `strace`, following forks.
#[derive(Debug, Clone)]
pub struct Strace {
    output_path: PathBuf,
    expression: Option<String>,
    summary: bool,
}

impl Strace {
    pub fn new(spec: &TraceSpec) -> Self {
        Self {
            output_path: spec.resolved_output_path(),
            expression: spec.expression.clone(),
            summary: spec.summary,
        }
    }
}

impl Tracer for Strace {
    fn name(&self) -> &'static str {
        "strace"
    }

    fn output_path(&self) -> &Path {
        &self.output_path
    }

    fn trace_args(&self) -> String {
        tracer_args(
            "strace -f",
            &self.output_path,
            self.summary,
            self.expression.as_deref(),
        )
    }
}

/// Library call tracing with `ltrace`, demangling C++ symbols and
/// following forks.
#[derive(Debug, Clone)]
pub struct Ltrace {
    output_path: PathBuf,
    expression: Option<String>,
    summary: bool,
}

impl Ltrace {
    pub fn new(spec: &TraceSpec) -> Self {
        Self {
            output_path: spec.resolved_output_path(),
            expression: spec.expression.clone(),
            summary: spec.summary,
        }
    }
}

impl Tracer for Ltrace {
    fn name(&self) -> &'static str {
        "ltrace"
    }

    fn output_path(&self) -> &Path {
        &self.output_path
    }

    fn trace_args(&self) -> String {
        tracer_args(
            "ltrace -C -f",
            &self.output_path,
            self.summary,
            self.expression.as_deref(),
        )
    }
}
