use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use chatlink::config::Config;
use chatlink::db::Database;
use chatlink::pipeline::{scrape_link, validate_link};
use chatlink::render::WebDriverRenderer;
use chatlink::server::{self, AppState};

#[derive(Parser)]
#[command(name = "chatlink", about = "Save and replay shared chat transcripts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Address to listen on
        #[arg(long, env = "CHATLINK_BIND", default_value = "0.0.0.0:8000")]
        bind: String,
        #[command(flatten)]
        config: Config,
    },
    /// Render one share link and print its transcript as JSON
    Scrape {
        url: String,
        #[command(flatten)]
        config: Config,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve { bind, config } => {
            let db = Database::open(&config.db_path)
                .with_context(|| format!("opening {}", config.db_path.display()))?;
            let renderer = WebDriverRenderer::new(config.renderer_config())?;
            let state = AppState {
                db,
                renderer: Arc::new(renderer),
                render_timeout: config.render_timeout(),
                allowed_hosts: config.allowed_hosts(),
            };
            server::serve(&bind, state).await
        }
        Commands::Scrape { url, config } => {
            validate_link(&url, &config.allowed_hosts())?;
            let renderer = WebDriverRenderer::new(config.renderer_config())?;
            let transcript = scrape_link(&renderer, url.trim(), config.render_timeout()).await?;
            println!("{}", serde_json::to_string_pretty(&transcript)?);
            Ok(())
        }
    }
}
