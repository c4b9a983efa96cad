use clap::Args;
use tracing_subscriber::EnvFilter;

use crate::artifacts::DEFAULT_RETENTION;
use crate::llm::DEFAULT_OLLAMA_URL;
use crate::plot::DEFAULT_PYTHON;
use crate::sandbox::TrustMode;

pub const DEFAULT_MODEL: &str = "devstral:24b";
pub const DEFAULT_MODEL_CHOICES: [&str; 2] = ["devstral:24b", "qwen2.5-coder:32b-instruct-q4_K_M"];

#[derive(Clone, Debug)]
pub struct CodeboxConfig {
    pub ollama_url: String,
    pub default_model: String,
    pub models: Vec<String>,
    pub python: String,
    pub trust: TrustMode,
    pub plot_retention: usize,
    pub enable_logging: bool,
}

impl Default for CodeboxConfig {
    fn default() -> Self {
        Self {
            ollama_url: DEFAULT_OLLAMA_URL.to_owned(),
            default_model: DEFAULT_MODEL.to_owned(),
            models: DEFAULT_MODEL_CHOICES.iter().map(|m| (*m).to_owned()).collect(),
            python: DEFAULT_PYTHON.to_owned(),
            trust: TrustMode::default(),
            plot_retention: DEFAULT_RETENTION,
            enable_logging: true,
        }
    }
}

/// Command line / environment flags shared by the `codebox` and `app` binaries.
#[derive(Args, Clone, Debug)]
pub struct CodeboxArgs {
    /// Ollama generate endpoint
    #[arg(long, env = "CODEBOX_OLLAMA_URL", default_value = DEFAULT_OLLAMA_URL)]
    pub ollama_url: String,

    /// Model used when a request does not name one
    #[arg(long, env = "CODEBOX_DEFAULT_MODEL", default_value = DEFAULT_MODEL)]
    pub default_model: String,

    /// Models offered to clients (comma separated)
    #[arg(
        long,
        env = "CODEBOX_MODELS",
        value_delimiter = ',',
        default_values_t = DEFAULT_MODEL_CHOICES.map(String::from)
    )]
    pub models: Vec<String>,

    /// Python interpreter with matplotlib used for plots
    #[arg(long, env = "CODEBOX_PYTHON", default_value = DEFAULT_PYTHON)]
    pub python: String,

    /// How much of the host executed code may reach
    #[arg(long, env = "CODEBOX_TRUST", value_enum, default_value_t = TrustMode::Restricted)]
    pub trust: TrustMode,

    /// Number of plot images kept on disk
    #[arg(long, env = "CODEBOX_PLOT_RETENTION", default_value_t = DEFAULT_RETENTION)]
    pub plot_retention: usize,

    /// Emit JSON-formatted log lines
    #[arg(long, env = "CODEBOX_LOG_JSON")]
    pub log_json: bool,
}

impl CodeboxArgs {
    pub fn to_config(&self) -> CodeboxConfig {
        let mut models = self.models.clone();
        if !models.iter().any(|model| model == &self.default_model) {
            models.insert(0, self.default_model.clone());
        }
        CodeboxConfig {
            ollama_url: self.ollama_url.clone(),
            default_model: self.default_model.clone(),
            models,
            python: self.python.clone(),
            trust: self.trust,
            plot_retention: self.plot_retention,
            enable_logging: true,
        }
    }
}

/// Installs the global tracing subscriber; `RUST_LOG` overrides the `info` default.
pub fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder
            .json()
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))
    } else {
        builder
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))
    }
}
