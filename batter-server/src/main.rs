mod ndjson;

use batter::{
    BatterError, BulkConfig, BulkSession, EngineError, Intent, MemoryEngine, SearchEngine,
};
use batter_http::{EngineConfig, HttpEngine};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "batter")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding engine.json
    #[arg(long, env = "BATTER_CONFIG_DIR", default_value = ".")]
    config_dir: PathBuf,
    /// Overrides the url from engine.json
    #[arg(long, env = "BATTER_ENGINE_URL")]
    engine_url: Option<String>,
    /// Run against an in-process engine instead of a cluster
    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Index every document of a newline-delimited JSON file
    Load {
        #[arg(long)]
        index: String,
        /// Relax replicas and refresh during the load, merge afterwards
        #[arg(long)]
        large: bool,
        file: PathBuf,
    },
    /// Delete every document matching a query
    Delete {
        #[arg(long)]
        index: String,
        /// Query DSL object, e.g. '{"term": {"project": "p1"}}'
        #[arg(long)]
        query: String,
    },
}

fn engine_for(cli: &Cli, index: &str) -> Result<Arc<dyn SearchEngine>, EngineError> {
    if cli.dry_run {
        let engine = MemoryEngine::new();
        engine.create_index(index, MemoryEngine::default_settings());
        return Ok(Arc::new(engine));
    }
    let mut config = EngineConfig::load_or_default(&cli.config_dir);
    if let Some(url) = &cli.engine_url {
        config = config.with_url(url.clone());
    }
    Ok(Arc::new(HttpEngine::new(&config)?))
}

async fn run_load(
    engine: Arc<dyn SearchEngine>,
    index: &str,
    large: bool,
    file: &Path,
) -> Result<batter::BulkSummary, BatterError> {
    let reader = BufReader::new(tokio::fs::File::open(file).await?);

    let intent = if large { Intent::Large } else { Intent::Regular };
    let mut session = BulkSession::builder(engine, index)
        .intent(intent)
        .config(BulkConfig::from_env())
        .open()
        .await?;

    let mut lines = reader.lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let action = match ndjson::action_from_line(index, &line) {
            Ok(Some(action)) => action,
            Ok(None) => continue,
            Err(reason) => {
                // Drain what was already queued so the index is not left relaxed.
                if let Err(e) = session.close().await {
                    tracing::error!("Failed to close session after bad input: {}", e);
                }
                return Err(BatterError::InvalidAction(format!(
                    "{} line {}: {}",
                    file.display(),
                    line_no,
                    reason
                )));
            }
        };
        session.submit(action).await?;
    }

    session.close().await
}

async fn run_delete(
    engine: Arc<dyn SearchEngine>,
    index: &str,
    query: &str,
) -> Result<batter::BulkSummary, BatterError> {
    let query: serde_json::Value = serde_json::from_str(query)?;
    if !query.is_object() {
        return Err(BatterError::InvalidAction(
            "query must be a JSON object".to_string(),
        ));
    }
    BulkSession::delete_by_query(engine, index, query).await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let index = match &cli.command {
        Command::Load { index, .. } | Command::Delete { index, .. } => index,
    };
    let engine = match engine_for(&cli, index) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let result = match &cli.command {
        Command::Load { index, large, file } => run_load(engine, index, *large, file).await,
        Command::Delete { index, query } => run_delete(engine, index, query).await,
    };

    match result {
        Ok(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if let Some(reason) = &summary.settings_restore_error {
                eprintln!("ALERT: {}", reason);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Error ({} phase): {}", e.phase(), e);
            std::process::exit(1);
        }
    }
}
