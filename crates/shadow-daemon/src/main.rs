//! `shadow-daemon` binary entry point. `clap`-derived subcommands: `serve`
//! (the long-running HTTP/WS process), `migrate` (apply pending sqlx
//! migrations and exit), and `index` (trigger a one-shot repository
//! indexing run from the CLI, useful for warming a namespace outside the
//! task lifecycle).

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use shadow_anthropic::AnthropicClient;
use shadow_daemon::background::{BackgroundServiceManager, OllamaEmbedder};
use shadow_daemon::http::{self, AppState};
use shadow_daemon::repo_lock::{InProcessLock, PgAdvisoryLock, RepoLock};
use shadow_daemon::store::{PostgresStore, Store};
use shadow_daemon::{Orchestrator, SessionHub, ShadowConfig};
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shadow-daemon", about = "Shadow agent orchestrator daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP + WebSocket server.
    Serve,
    /// Apply pending database migrations and exit.
    Migrate,
    /// Trigger a one-shot indexing run for a repository already checked out
    /// under the configured workspace root.
    Index {
        #[arg(long)]
        repo: String,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Arc::new(ShadowConfig::load()?);

    match cli.command {
        Commands::Migrate => {
            let pool = PgPool::connect(&config.database_url).await?;
            sqlx::migrate!("./migrations").run(&pool).await?;
            tracing::info!("migrations applied");
            Ok(())
        }
        Commands::Index { repo } => {
            let (store, repo_lock) = connect_store(&config).await?;
            let embedder = Arc::new(OllamaEmbedder::new("http://localhost:11434", "nomic-embed-text", 768));
            let provider = Arc::new(AnthropicClient::new(config.anthropic_api_key.clone()));
            let background = Arc::new(BackgroundServiceManager::new(
                store,
                repo_lock,
                config.clone(),
                embedder,
                provider,
            ));
            let workspace = config.workspace_root.join(repo.replace('/', "__"));
            background.index_namespace(repo, workspace).await?;
            tracing::info!("indexing complete");
            Ok(())
        }
        Commands::Serve => serve(config).await,
    }
}

async fn connect_store(config: &ShadowConfig) -> anyhow::Result<(Arc<dyn Store>, Arc<dyn RepoLock>)> {
    let pool = PgPool::connect(&config.database_url).await?;
    let store: Arc<dyn Store> = Arc::new(PostgresStore::with_pool(pool.clone()));
    let repo_lock: Arc<dyn RepoLock> = Arc::new(PgAdvisoryLock::new(pool));
    Ok((store, repo_lock))
}

async fn serve(config: Arc<ShadowConfig>) -> anyhow::Result<()> {
    let store: Arc<dyn Store> = Arc::new(PostgresStore::connect(&config.database_url).await?);
    let repo_lock: Arc<dyn RepoLock> = Arc::new(InProcessLock::new());

    let provider = Arc::new(AnthropicClient::new(config.anthropic_api_key.clone()));
    let hub = Arc::new(SessionHub::new());
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        hub.clone(),
        config.clone(),
        provider.clone(),
    ));

    let embedder = Arc::new(OllamaEmbedder::new("http://localhost:11434", "nomic-embed-text", 768));
    let background = Arc::new(BackgroundServiceManager::new(
        store.clone(),
        repo_lock.clone(),
        config.clone(),
        embedder,
        provider,
    ));

    let workspace_root: PathBuf = config.workspace_root.clone();
    let state = Arc::new(AppState {
        store,
        orchestrator,
        hub,
        background,
        repo_lock,
        webhook_secret: config.webhook_secret.clone(),
        workspace_root,
    });

    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    tracing::info!(addr = %config.http_addr, "shadow-daemon listening");
    axum::serve(listener, app).await?;
    Ok(())
}
