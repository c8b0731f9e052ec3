use anyhow::Result;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use scout::config::Config;
use scout::db::DbHandle;
use scout::knowledge::KnowledgeStore;
use scout::llm::HttpChatModel;
use scout::server;

#[derive(Parser)]
#[command(name = "scout")]
#[command(version, about = "LLM research orchestrator")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one research query to completion, printing its event stream
    Ask { query: String },
    /// Embed stored research results that are still missing embeddings
    Backfill {
        #[arg(long, default_value = "50")]
        batch_size: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();

    let default_level = if cli.verbose { "scout=debug" } else { "scout=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = Config::from_env();

    match cli.command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            server::start_server(config).await
        }
        Commands::Ask { query } => ask(config, &query).await,
        Commands::Backfill { batch_size } => backfill(config, batch_size).await,
    }
}

/// One-shot session: submit, tail events until the terminal one, print the
/// persisted result.
async fn ask(config: Config, query: &str) -> Result<()> {
    let state = server::build_state(&config, |_| {})?;

    // Subscribe on the global channel first so the session's earliest
    // events are not missed.
    let mut stream = state.events.subscribe_global();
    let log_id = state.controller.start_session(query)?;

    while let Some(event) = stream.next().await {
        if event.log_id != log_id {
            continue;
        }
        println!("{:<28} {}", event.event_type, event.data);
        if event.is_terminal() {
            break;
        }
    }

    if let Some(result) = state.knowledge.find_by_log_id(log_id)? {
        println!("\n{}", serde_json::to_string_pretty(&result)?);
    }
    Ok(())
}

async fn backfill(config: Config, batch_size: usize) -> Result<()> {
    let db = DbHandle::open(&config.db_path)?;
    let model = std::sync::Arc::new(HttpChatModel::new(
        &config.llm.base_url,
        &config.llm.primary_model,
        &config.llm.embedding_model,
    ));
    let store = KnowledgeStore::new(db, model);

    let mut total = 0;
    loop {
        let processed = store.backfill_embeddings(batch_size).await?;
        total += processed;
        if processed < batch_size {
            break;
        }
    }
    println!("Backfilled {total} embeddings");
    Ok(())
}
