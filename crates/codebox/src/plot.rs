use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use thiserror::Error;

use crate::artifacts::ArtifactStore;

pub const DEFAULT_PYTHON: &str = "python3";

const EXIT_EXECUTION: i32 = 2;
const EXIT_UNAVAILABLE: i32 = 3;
const EXIT_SERIALIZATION: i32 = 4;

const PROBE_SCRIPT: &str = "import matplotlib";

const DRIVER_SCRIPT: &str = r#"import io, sys

report = sys.stderr

def fail(code, exc):
    report.write(str(exc) or type(exc).__name__)
    report.flush()
    sys.exit(code)

try:
    import matplotlib
    matplotlib.use("Agg")
    import matplotlib.pyplot as plt
except ImportError as exc:
    fail(3, exc)

source = sys.stdin.read()
sys.stderr = io.StringIO()
try:
    try:
        exec(compile(source, "<codebox>", "exec"), {"__name__": "__main__"})
    except BaseException as exc:
        fail(2, exc)
    try:
        plt.savefig(sys.argv[1])
    except Exception as exc:
        fail(4, exc)
finally:
    plt.close("all")
"#;

#[derive(Debug, Error)]
pub enum PlotError {
    #[error("Error: matplotlib is not installed. Please install with: pip install matplotlib")]
    Unavailable,
    #[error("Error generating plot: {0}")]
    Execution(String),
    #[error("Error generating plot: {0}")]
    Serialization(String),
    #[error("Error generating plot: failed to run {python}: {source}")]
    Spawn {
        python: String,
        #[source]
        source: std::io::Error,
    },
}

/// Runs plotting code in a fresh host interpreter per call.
pub struct PlotExecutor {
    python: String,
    available: bool,
    artifacts: Arc<ArtifactStore>,
}

impl PlotExecutor {
    /// Probes `python` for matplotlib once; the answer holds for the
    /// executor's lifetime.
    pub fn new(python: impl Into<String>, artifacts: Arc<ArtifactStore>) -> Self {
        let python = python.into();
        let available = probe_matplotlib(&python);
        if available {
            tracing::info!(%python, "plotting available");
        } else {
            tracing::warn!(%python, "matplotlib not importable; plot requests will fail");
        }
        Self {
            python,
            available,
            artifacts,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn artifacts(&self) -> &Arc<ArtifactStore> {
        &self.artifacts
    }

    /// On success the returned path exists, is non-empty and is tracked by
    /// the artifact store.
    pub fn generate_plot(&self, code: &str) -> Result<PathBuf, PlotError> {
        if !self.available {
            return Err(PlotError::Unavailable);
        }
        let output = self
            .artifacts
            .allocate()
            .map_err(|err| PlotError::Serialization(format!("cannot allocate image file: {err}")))?;

        match self.render(code, &output) {
            Ok(()) => {
                tracing::debug!(path = %output.display(), "plot rendered");
                self.artifacts.commit(output.clone());
                Ok(output)
            }
            Err(err) => {
                self.artifacts.discard(&output);
                Err(err)
            }
        }
    }

    fn render(&self, code: &str, output: &Path) -> Result<(), PlotError> {
        let spawn_error = |source| PlotError::Spawn {
            python: self.python.clone(),
            source,
        };
        let mut child = Command::new(&self.python)
            .arg("-c")
            .arg(DRIVER_SCRIPT)
            .arg(output)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        // The driver reads stdin before it runs anything. If it exits first,
        // its exit status explains the broken pipe better than the write error.
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(code.as_bytes()),
            None => Ok(()),
        };
        let finished = child.wait_with_output().map_err(spawn_error)?;
        let stderr = String::from_utf8_lossy(&finished.stderr).trim().to_owned();

        match finished.status.code() {
            Some(0) => written.map_err(spawn_error)?,
            Some(EXIT_UNAVAILABLE) => return Err(PlotError::Unavailable),
            Some(EXIT_SERIALIZATION) => return Err(PlotError::Serialization(stderr)),
            Some(EXIT_EXECUTION) => return Err(PlotError::Execution(stderr)),
            other => {
                let detail = if stderr.is_empty() {
                    format!("plot process exited with {other:?}")
                } else {
                    stderr
                };
                return Err(PlotError::Execution(detail));
            }
        }

        let size = fs::metadata(output)
            .map(|meta| meta.len())
            .map_err(|err| PlotError::Serialization(err.to_string()))?;
        if size == 0 {
            return Err(PlotError::Serialization("figure produced an empty image".to_owned()));
        }
        Ok(())
    }
}

fn probe_matplotlib(python: &str) -> bool {
    Command::new(python)
        .arg("-c")
        .arg(PROBE_SCRIPT)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
