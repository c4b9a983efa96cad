use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::artifacts::ArtifactStore;
use crate::config::CodeboxConfig;
use crate::llm::{LlmClient, LlmError, OllamaClient, infer};
use crate::logger::RequestLogger;
use crate::plot::{PlotError, PlotExecutor};
use crate::prompts::{Action, PLOT_SUCCESS_MESSAGE, build_prompt};
use crate::sandbox::SandboxExecutor;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Execution,
    PlottingUnavailable,
    Serialization,
    Transport,
    UnsupportedAction,
}

/// `image_path` is only ever set by a successful plot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionResult {
    pub text: String,
    pub image_path: Option<PathBuf>,
    pub fault: Option<FaultKind>,
}

impl ExecutionResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image_path: None,
            fault: None,
        }
    }

    pub fn image(path: PathBuf) -> Self {
        Self {
            text: PLOT_SUCCESS_MESSAGE.to_owned(),
            image_path: Some(path),
            fault: None,
        }
    }

    pub fn fault(kind: FaultKind, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image_path: None,
            fault: Some(kind),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.fault.is_none()
    }
}

impl From<&PlotError> for FaultKind {
    fn from(err: &PlotError) -> Self {
        match err {
            PlotError::Unavailable => FaultKind::PlottingUnavailable,
            PlotError::Serialization(_) => FaultKind::Serialization,
            PlotError::Execution(_) | PlotError::Spawn { .. } => FaultKind::Execution,
        }
    }
}

pub struct Dispatcher {
    sandbox: SandboxExecutor,
    plotter: PlotExecutor,
    llm: Arc<dyn LlmClient>,
    default_model: String,
    enable_logging: bool,
}

impl Dispatcher {
    pub fn new(
        sandbox: SandboxExecutor,
        plotter: PlotExecutor,
        llm: Arc<dyn LlmClient>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            sandbox,
            plotter,
            llm,
            default_model: default_model.into(),
            enable_logging: true,
        }
    }

    /// Builds every executor from `config`, probing for plotting support.
    pub fn from_config(config: &CodeboxConfig) -> anyhow::Result<Self> {
        let sandbox = SandboxExecutor::spawn(config.trust)?;
        let artifacts = Arc::new(ArtifactStore::new(config.plot_retention)?);
        let plotter = PlotExecutor::new(config.python.clone(), artifacts);
        let llm: Arc<dyn LlmClient> = Arc::new(OllamaClient::new(config.ollama_url.clone())?);
        let mut dispatcher = Self::new(sandbox, plotter, llm, config.default_model.clone());
        dispatcher.enable_logging = config.enable_logging;
        Ok(dispatcher)
    }

    pub fn artifacts(&self) -> &Arc<ArtifactStore> {
        self.plotter.artifacts()
    }

    pub fn plotting_available(&self) -> bool {
        self.plotter.is_available()
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Unknown actions are rejected without touching any executor.
    pub fn handle(&self, code: &str, action: &str, model: &str) -> ExecutionResult {
        let mut logger = RequestLogger::new(self.enable_logging);
        logger.log_request_start(action, model, code);
        let result = match action.parse::<Action>() {
            Ok(action) => self.run(code, action, model, &logger),
            Err(err) => ExecutionResult::fault(FaultKind::UnsupportedAction, format!("Error: {err}")),
        };
        logger.log_result(&result);
        result
    }

    pub fn dispatch(&self, code: &str, action: Action, model: &str) -> ExecutionResult {
        let mut logger = RequestLogger::new(self.enable_logging);
        logger.log_request_start(action.as_str(), model, code);
        let result = self.run(code, action, model, &logger);
        logger.log_result(&result);
        result
    }

    fn run(&self, code: &str, action: Action, model: &str, logger: &RequestLogger) -> ExecutionResult {
        let span = tracing::info_span!("dispatch", %action, model);
        let _entered = span.enter();
        match action {
            Action::Execute => match self.sandbox.execute(code) {
                Ok(output) => ExecutionResult::text(output),
                Err(fault) => ExecutionResult::fault(FaultKind::Execution, fault.message),
            },
            Action::Plot => match self.plotter.generate_plot(code) {
                Ok(path) => ExecutionResult::image(path),
                Err(err) => ExecutionResult::fault(FaultKind::from(&err), err.to_string()),
            },
            Action::Explain | Action::Rewrite | Action::Optimize | Action::Suggest => {
                let Some(prompt) = build_prompt(action, code) else {
                    return ExecutionResult::fault(
                        FaultKind::UnsupportedAction,
                        format!("Error: no prompt for action '{action}'"),
                    );
                };
                logger.log_prompt(action, &prompt);
                let model = self.resolve_model(model);
                match infer(self.llm.as_ref(), &prompt, model) {
                    Ok(text) => ExecutionResult::text(text),
                    Err(err) => transport_fault(&err),
                }
            }
        }
    }

    fn resolve_model<'a>(&'a self, model: &'a str) -> &'a str {
        let model = model.trim();
        if model.is_empty() {
            &self.default_model
        } else {
            model
        }
    }
}

fn transport_fault(err: &LlmError) -> ExecutionResult {
    ExecutionResult::fault(FaultKind::Transport, err.to_string())
}
