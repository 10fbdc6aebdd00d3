use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures::future::AbortHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use forge::api::{self, AppState};
use forge::config;
use forge::dispatch;
use forge::models::framework::FrameworkRegistry;
use forge::store::memory::MemoryStore;
use forge::store::postgres::PgStore;
use forge::store::{CredentialBackend, HistoryBackend};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = cli::Cli::parse();

    let result = match args.command {
        // These two need neither config nor storage.
        Some(cli::Commands::Frameworks) => {
            list_frameworks();
            Ok(())
        }
        Some(cli::Commands::Render { request }) => render(request),
        Some(cli::Commands::Serve { port, ephemeral }) => {
            let cfg = config::load()?;
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port, ephemeral).await
        }
        Some(cli::Commands::Credential { user, command }) => {
            let cfg = config::load()?;
            let db = PgStore::connect(&cfg.database_url).await?;
            handle_credential_command(&cfg, db, user, command).await
        }
        Some(cli::Commands::Generate { user, request }) => {
            let cfg = config::load()?;
            let db = PgStore::connect(&cfg.database_url).await?;
            generate(&cfg, db, user, request).await
        }
        None => {
            let cfg = config::load()?;
            let port = cfg.port;
            run_server(cfg, port, false).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG")
            .unwrap_or_else(|_| "forge=debug,promptcraft=debug,tower_http=debug".into()),
    );
    let json = std::env::var("FORGE_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    // Logs go to stderr so CLI output on stdout stays clean.
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run_server(cfg: config::Config, port: u16, ephemeral: bool) -> anyhow::Result<()> {
    let (credentials, history, db): (Arc<dyn CredentialBackend>, Arc<dyn HistoryBackend>, Option<PgStore>) =
        if ephemeral {
            tracing::warn!("Running with in-memory storage; keys and history are lost on exit");
            let memory = Arc::new(MemoryStore::new());
            (memory.clone() as Arc<dyn CredentialBackend>, memory as Arc<dyn HistoryBackend>, None)
        } else {
            tracing::info!("Connecting to database...");
            let db = PgStore::connect(&cfg.database_url).await?;

            tracing::info!("Running migrations...");
            db.migrate().await?;

            let shared = Arc::new(db.clone());
            (shared.clone() as Arc<dyn CredentialBackend>, shared as Arc<dyn HistoryBackend>, Some(db))
        };

    let state = Arc::new(AppState::build(cfg, credentials, history, db)?);
    let app = api::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("PromptCraft Forge listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}

fn list_frameworks() {
    let registry = FrameworkRegistry::builtin();
    println!("{:<8} {:<10} {}", "ID", "NAME", "SECTIONS");
    for f in registry.list() {
        println!("{:<8} {:<10} {}", f.id, f.display_name, f.component_names.join(", "));
    }
}

fn render(request: cli::RequestArgs) -> anyhow::Result<()> {
    let req = request.into_request();
    req.validate()?;
    let registry = FrameworkRegistry::builtin();
    let framework = registry
        .get(&req.framework_id)
        .with_context(|| format!("unknown framework: {}", req.framework_id))?;
    println!("{}", framework.render(&req));
    Ok(())
}

async fn handle_credential_command(
    cfg: &config::Config,
    db: PgStore,
    user: Uuid,
    cmd: cli::CredentialCommands,
) -> anyhow::Result<()> {
    let (store, _) = dispatch::build_services(cfg, Arc::new(db))?;

    match cmd {
        cli::CredentialCommands::Set { provider, key } => {
            store.save(user, provider, &key).await?;
            println!("{} key stored.", provider.display_name());
        }
        cli::CredentialCommands::GetStatus => {
            let rows = store.list_status(user).await?;
            if rows.is_empty() {
                println!("No credentials found.");
                return Ok(());
            }
            println!(
                "{:<10} {:<8} {:<8} {:<20} LAST ERROR",
                "PROVIDER", "KEY", "ACTIVE", "VALIDATED"
            );
            for r in rows {
                println!(
                    "{:<10} {:<8} {:<8} {:<20} {}",
                    r.provider,
                    r.key_hint,
                    r.is_active,
                    r.last_validated_at
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "never".into()),
                    r.last_validation_error.as_deref().unwrap_or("-"),
                );
            }
        }
        cli::CredentialCommands::Delete { provider } => {
            store.delete(user, provider).await?;
            println!("{} key removed.", provider.display_name());
        }
        cli::CredentialCommands::List => {
            let providers = store.list_configured(user).await?;
            if providers.is_empty() {
                println!("No credentials found.");
            }
            for p in providers {
                println!("{}", p);
            }
        }
        cli::CredentialCommands::Activate { provider } => {
            store.set_active(user, provider).await?;
            println!("{} is now the active provider.", provider.display_name());
        }
        cli::CredentialCommands::Validate { provider } => {
            let outcome = store.validate(user, provider).await?;
            match outcome.error {
                None => println!("{} key is valid.", provider.display_name()),
                Some(e) => println!("{} key failed validation: {}", provider.display_name(), e),
            }
        }
    }
    Ok(())
}

/// Ctrl-C cancels the in-flight call instead of killing the process.
async fn generate(
    cfg: &config::Config,
    db: PgStore,
    user: Uuid,
    request: cli::RequestArgs,
) -> anyhow::Result<()> {
    let (_, dispatcher) = dispatch::build_services(cfg, Arc::new(db))?;
    let req = request.into_request();

    let (handle, registration) = AbortHandle::new_pair();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.abort();
        }
    });

    let result = dispatcher.generate(user, &req, Some(registration)).await;
    watcher.abort();

    let result = result?;
    if let (Some(provider), Some(model)) = (result.provider_used, result.model_name_used.as_deref()) {
        tracing::info!(%provider, model, "generated");
    }
    println!("{}", result.prompt_text.unwrap_or_default());
    Ok(())
}
