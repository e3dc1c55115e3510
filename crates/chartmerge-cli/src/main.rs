use chartmerge_core::config::{SessionBackend, Settings};
use chartmerge_core::logging::init_logging;
use chartmerge_core::resource::collection_bundle;
use chartmerge_core::store::{
    FhirHttpStore, FileSessionStore, MemoryResourceStore, MemorySessionStore,
};
use chartmerge_core::{Resource, SessionStore};
use chartmerge_http::HttpServer;
use clap::{Parser, Subcommand};
use merge_engine::{MergeEngine, MergeOutcome};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "chartmerge",
    about = "Merge two patient records and resolve their conflicts"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the settings file
    #[arg(long, global = true, default_value = "settings.json")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API against the configured stores
    Serve,
    /// Merge two record files offline and print the result
    Merge {
        /// Left record: a Bundle or a single resource, as JSON
        left: PathBuf,
        /// Right record
        right: PathBuf,
        /// Override the configured match threshold
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Write a settings file with default values
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Show the effective configuration
    Status,
}

/// Settings from the config file, or defaults when there is none.
fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    if path.exists() {
        Settings::load(path)
    } else {
        Ok(Settings::default())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve => cmd_serve(&cli).await,
        Commands::Merge {
            left,
            right,
            threshold,
        } => cmd_merge(&cli, left, right, *threshold).await,
        Commands::InitConfig { force } => cmd_init_config(&cli, *force),
        Commands::Status => cmd_status(&cli),
    }
}

async fn cmd_serve(cli: &Cli) -> anyhow::Result<()> {
    let settings = load_settings(&cli.config)?;

    let _guard = init_logging(&settings.logging.dir, &settings.logging.filter)?;

    tracing::info!("Starting chartmerge...");

    let resources = Arc::new(FhirHttpStore::new(
        &settings.store.fhir_base_url,
        Duration::from_secs(settings.store.request_timeout_secs),
    )?);
    let sessions: Arc<dyn SessionStore> = match settings.store.session_backend {
        SessionBackend::Memory => Arc::new(MemorySessionStore::new()),
        SessionBackend::File => Arc::new(FileSessionStore::new(&settings.store.session_dir).await?),
    };
    let engine = Arc::new(MergeEngine::new(resources, sessions, &settings.merge));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let server = HttpServer::new(engine, settings.http.clone());
    let rx = shutdown_tx.subscribe();
    let handle = tokio::spawn(async move {
        if let Err(e) = server.start(rx).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    println!("chartmerge started. Press Ctrl+C to stop.");
    println!();
    println!("FHIR store: {}", settings.store.fhir_base_url);
    println!("HTTP API: http://0.0.0.0:{}", settings.http.port);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    let _ = shutdown_tx.send(());
    let _ = handle.await;
    tracing::info!("chartmerge stopped");

    Ok(())
}

async fn cmd_merge(
    cli: &Cli,
    left: &Path,
    right: &Path,
    threshold: Option<f64>,
) -> anyhow::Result<()> {
    let mut settings = load_settings(&cli.config)?;
    if let Some(threshold) = threshold {
        settings.merge.match_threshold = threshold;
        settings.validate()?;
    }

    let resources = Arc::new(MemoryResourceStore::new());
    let source1 = resources.seed(read_record(left)?);
    let source2 = resources.seed(read_record(right)?);
    let engine = MergeEngine::new(
        resources.clone(),
        Arc::new(MemorySessionStore::new()),
        &settings.merge,
    );

    let output = match engine.merge(&source1, &source2).await? {
        MergeOutcome::Merged(bundle) => bundle.into_value(),
        MergeOutcome::Conflicts { session, conflicts } => {
            let target = engine.target(&session.session_id).await?;
            serde_json::json!({
                "sessionId": session.session_id,
                "conflicts": collection_bundle(conflicts.iter().map(|c| c.to_resource())),
                "target": target,
            })
        }
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn read_record(path: &Path) -> anyhow::Result<Resource> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)?;
    Resource::from_value(value).map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))
}

fn cmd_init_config(cli: &Cli, force: bool) -> anyhow::Result<()> {
    if cli.config.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            cli.config.display()
        );
    }
    Settings::default().save(&cli.config)?;
    println!("Wrote default settings to {}", cli.config.display());
    Ok(())
}

fn cmd_status(cli: &Cli) -> anyhow::Result<()> {
    println!("chartmerge status");
    println!("=================");
    println!();

    let settings = if cli.config.exists() {
        println!("Configuration: {}", cli.config.display());
        Settings::load(&cli.config)?
    } else {
        println!("Configuration: defaults (run 'chartmerge init-config' to write a file)");
        Settings::default()
    };
    println!("  Anchor type: {}", settings.merge.anchor_type);
    println!("  Match threshold: {}", settings.merge.match_threshold);
    println!("  Float tolerance: {}", settings.merge.float_tolerance);
    println!("  FHIR store: {}", settings.store.fhir_base_url);
    println!("  Session backend: {:?}", settings.store.session_backend);
    println!("  HTTP API: port {}", settings.http.port);

    Ok(())
}
