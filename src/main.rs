mod application;
mod config;
mod domain;
mod infrastructure;

use application::backend::CapabilityBackend;
use application::invoker::CapabilityInvoker;
use application::mediator::{Mediator, MediatorOptions};
use application::registry::CapabilityRegistry;
use application::session::{Outcome, Session};
use clap::Parser;
use config::AppConfig;
use infrastructure::mcp::McpServerProcess;
use infrastructure::model::OllamaClient;
use std::error::Error;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(
    name = "mcp-chatbot",
    version,
    about = "Interactive MCP chatbot client powered by a local Ollama model"
)]
struct Cli {
    /// Base URL of the Ollama server.
    #[arg(long)]
    model_url: Option<String>,
    /// Model name to request completions from.
    #[arg(long)]
    model: Option<String>,
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<String>,
    /// Maximum tool-call rounds per query.
    #[arg(long)]
    max_rounds: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    info!("Starting mcp-chatbot");
    let cli = Cli::parse();
    debug!(config = ?cli.config, model = ?cli.model, "CLI arguments parsed");

    let config_path = cli.config.as_deref().map(Path::new);
    let mut app_config = AppConfig::load(config_path)?;
    if let Some(url) = cli.model_url {
        app_config.model_url = url;
    }
    if let Some(model) = cli.model {
        app_config.model = model;
    }
    if let Some(max_rounds) = cli.max_rounds {
        app_config.max_rounds = max_rounds;
    }

    // Without a capability catalog no session command can be serviced, so
    // a failed handshake or discovery ends the process here.
    let process = McpServerProcess::connect(app_config.server.clone()).await?;
    let backend: Arc<dyn CapabilityBackend> = Arc::new(process.clone());
    let registry = Arc::new(CapabilityRegistry::discover(backend.as_ref()).await?);

    let provider = OllamaClient::new(app_config.model_url.clone());
    let invoker = Arc::new(CapabilityInvoker::new(backend, registry));
    let mediator = Mediator::new(
        provider,
        invoker.clone(),
        MediatorOptions {
            model: app_config.model.clone(),
            system_prompt: app_config.system_prompt.clone(),
            max_rounds: app_config.max_rounds,
        },
    );
    let session = Session::new(invoker, mediator);

    println!("{}", Session::<OllamaClient>::banner());
    run_repl(&session).await?;

    process.shutdown().await;
    info!("Session ended");
    Ok(())
}

async fn run_repl(session: &Session<OllamaClient>) -> Result<(), Box<dyn Error>> {
    let stdin = BufReader::new(io::stdin());
    let mut lines = stdin.lines();

    prompt()?;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            prompt()?;
            continue;
        }
        match session.handle(&line).await {
            Outcome::Quit => break,
            Outcome::Reply(text) => {
                if !text.is_empty() {
                    println!("{text}");
                }
            }
        }
        prompt()?;
    }
    Ok(())
}

fn prompt() -> std::io::Result<()> {
    print!("\nQuery: ");
    std::io::stdout().flush()
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .init();
    });
}
