use clap::Parser;
use colored::*;
use local_agent::config::Config;
use local_agent::dialect::ShellEnvironment;
use local_agent::error_handling::{display_info, display_warning, enhance_error};
use local_agent::frontend::TerminalFrontend;
use local_agent::inference::OllamaClient;
use local_agent::logging::{get_logger, init_logger};
use local_agent::session::Session;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "local-agent")]
#[command(version)]
#[command(
    about = "🤖 local-agent: chat with a local model and run the commands it suggests",
    long_about = "An interactive agent backed by a local Ollama model. Shell commands in the model's replies are adapted to your shell and run only after you approve them."
)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write debug entries (command text, model replies) to the log file
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = init_logger(cli.debug) {
        eprintln!("Warning: Failed to initialize logger: {}", e);
    }

    let config = match cli.config {
        Some(path) => Config::load_from(Some(path)),
        None => Config::load(),
    };

    let shell = match ShellEnvironment::detect(config.shell.as_deref()) {
        Ok(shell) => shell,
        Err(e) => {
            enhance_error(&e).display();
            std::process::exit(1);
        }
    };

    if let Ok(logger) = get_logger() {
        if let Ok(logger_guard) = logger.lock() {
            let _ = logger_guard.log_startup(env!("CARGO_PKG_VERSION"), &config.model, &shell.program.to_string_lossy());
        }
    }

    println!("{}", "🤖 local-agent".bold().cyan());
    println!("   {} {} ({})", "shell:".dimmed(), shell.program.display(), shell.dialect);
    println!("   {} {}", "model:".dimmed(), config.model.green());
    if let Some(reason) = &shell.fallback_reason {
        display_warning(&format!("Using {} because {}", shell.program.display(), reason));
    }
    display_info("Type 'help' for usage or 'exit' to quit.");

    let working_dir = std::env::current_dir()?;
    let backend = OllamaClient::from_config(&config);
    let mut session = Session::new(backend, TerminalFrontend::new(), &config, &shell, working_dir);

    session.startup().await;
    session.run().await?;

    println!("{}", "Goodbye!".dimmed());
    Ok(())
}
