use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use codebox::config::{CodeboxArgs, init_tracing};
use codebox::{Action, Dispatcher};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Run, plot or ask a local model about a Python snippet.
#[derive(Parser)]
#[command(name = "codebox", version, about, long_about = None)]
struct Cli {
    /// execute, plot, explain, rewrite, optimize or suggest
    #[arg(short, long, default_value = "execute")]
    action: String,

    /// Model for the text-generation actions (defaults to --default-model)
    #[arg(short, long, default_value = "")]
    model: String,

    /// Source file; stdin when omitted
    file: Option<PathBuf>,

    #[command(flatten)]
    codebox: CodeboxArgs,
}

fn read_code(file: Option<&PathBuf>) -> anyhow::Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|err| anyhow::anyhow!("failed to read {}: {err}", path.display())),
        None => {
            let mut code = String::new();
            std::io::stdin().read_to_string(&mut code)?;
            Ok(code)
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.codebox.log_json)?;

    // Reject typos before paying for interpreter startup.
    if let Err(err) = cli.action.parse::<Action>() {
        eprintln!("Error: {err}");
        return Ok(ExitCode::FAILURE);
    }

    let code = read_code(cli.file.as_ref())?;
    let dispatcher = Dispatcher::from_config(&cli.codebox.to_config())?;
    let result = dispatcher.handle(&code, &cli.action, &cli.model);

    println!("{}", result.text);
    if let Some(path) = &result.image_path {
        // The artifact directory is removed when the dispatcher drops.
        let kept = std::env::temp_dir().join(
            path.file_name()
                .ok_or_else(|| anyhow::anyhow!("plot path has no file name"))?,
        );
        std::fs::copy(path, &kept)?;
        println!("{}", kept.display());
    }
    Ok(if result.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
