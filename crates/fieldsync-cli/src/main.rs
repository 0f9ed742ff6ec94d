use clap::{Parser, Subcommand};
use fieldsync_core::config::Settings;
use fieldsync_core::identity::{classify, RecordOrigin};
use fieldsync_core::logging::init_logging;
use fieldsync_core::model::{BulkMode, PartitionKind, Strategy};
use fieldsync_core::store::{JsonDirStore, PartitionStore};
use fieldsync_reconcile::{
    ConflictQueue, ConflictQueueHandle, DatasetOrchestrator, PendingConflict, ReconcileError,
    ReconcileInput,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(
    name = "fieldsync",
    about = "Reconcile offline field edits across private, public and template partitions"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to .fieldsync data directory
    #[arg(long, default_value = ".fieldsync")]
    data_dir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run interactive setup wizard
    Setup,
    /// Show configuration and stored partition counts
    Status,
    /// Merge the stored partitions, asking about conflicts
    Reconcile {
        /// Answer conflicts through the HTTP API instead of the terminal
        #[arg(long)]
        http: bool,
    },
    /// Replace a layer's private edits with the template baseline
    ResetLayer {
        /// Layer id to reset
        layer: String,
    },
}

fn data_dir(cli: &Cli) -> PathBuf {
    cli.data_dir.clone()
}

fn settings_path(cli: &Cli) -> PathBuf {
    data_dir(cli).join("settings.json")
}

fn store_dir(cli: &Cli) -> PathBuf {
    data_dir(cli).join("store")
}

fn load_settings(cli: &Cli) -> Settings {
    match Settings::load(&settings_path(cli)) {
        Ok(s) => s,
        Err(_) => {
            eprintln!("No configuration found. Run 'fieldsync setup' first.");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Setup => cmd_setup(&cli).await,
        Commands::Status => cmd_status(&cli).await,
        Commands::Reconcile { http } => cmd_reconcile(&cli, *http).await,
        Commands::ResetLayer { layer } => cmd_reset_layer(&cli, layer).await,
    }
}

async fn cmd_setup(cli: &Cli) -> anyhow::Result<()> {
    let dir = data_dir(cli);
    std::fs::create_dir_all(&dir)?;

    println!();
    println!("fieldsync - Setup Wizard");
    println!("========================");
    println!();

    let own_user_id = dialoguer::Input::<String>::new()
        .with_prompt("Your user id")
        .interact_text()?;

    let strategies = [Strategy::Manual, Strategy::Latest, Strategy::SelfOwned];
    let labels = [
        "manual (ask about every conflict)",
        "latest (newest edit wins)",
        "self (my edit wins)",
    ];
    let strategy_idx = dialoguer::Select::new()
        .with_prompt("Default strategy")
        .items(&labels)
        .default(0)
        .interact()?;

    println!();
    let http_enabled = dialoguer::Confirm::new()
        .with_prompt("Enable HTTP conflict API?")
        .default(false)
        .interact()?;

    let mut settings = Settings::default();
    settings.user.own_user_id = own_user_id.trim().to_string();
    settings.reconcile.strategy = strategies[strategy_idx];
    settings.http.enabled = http_enabled;
    if http_enabled {
        settings.http.port = dialoguer::Input::new()
            .with_prompt("HTTP port")
            .default(settings.http.port)
            .interact_text()?;
    }

    settings.save(&settings_path(cli))?;

    println!();
    println!("Configuration saved to {}", settings_path(cli).display());
    println!();
    println!("Reconcile with: fieldsync reconcile");
    println!();

    Ok(())
}

async fn cmd_status(cli: &Cli) -> anyhow::Result<()> {
    println!("fieldsync Status");
    println!("================");
    println!();

    match Settings::load(&settings_path(cli)) {
        Ok(settings) => {
            println!("Configuration: Found");
            println!("  User: {}", settings.user.own_user_id);
            println!("  Strategy: {}", settings.reconcile.strategy);
            if settings.http.enabled {
                println!("  HTTP API: port {}", settings.http.port);
            }
        }
        Err(_) => {
            println!("Configuration: Not found");
            println!("  Run 'fieldsync setup' to configure");
        }
    }

    println!();
    let store = JsonDirStore::new(store_dir(cli)).await?;
    for kind in PartitionKind::ALL {
        let partitions = store.read_partitions(kind).await?;
        let records: usize = partitions.iter().map(|p| p.records.len()).sum();
        println!(
            "  {:<8} {} partitions, {} records",
            kind.as_str(),
            partitions.len(),
            records
        );
    }

    Ok(())
}

async fn cmd_reconcile(cli: &Cli, http: bool) -> anyhow::Result<()> {
    let settings = load_settings(cli);
    let own_user_id = settings.own_user_id()?.to_string();
    let _guard = init_logging(&data_dir(cli).join("logs"), &settings.logging)?;

    let store = Arc::new(JsonDirStore::new(store_dir(cli)).await?);
    let conflicts = ConflictQueue::spawn(own_user_id.clone(), settings.reconcile.queue_capacity);
    let orchestrator = DatasetOrchestrator::new(
        store.clone(),
        Arc::new(conflicts.clone()),
        own_user_id.clone(),
    )
    .with_strategy(settings.reconcile.strategy);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    if http {
        #[cfg(feature = "http")]
        {
            let server = fieldsync_http::ConflictServer::new(conflicts.clone(), settings.http.clone());
            let rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                if let Err(e) = server.start(rx).await {
                    tracing::error!(error = %e, "HTTP server error");
                }
            });
            println!("Answer conflicts at http://0.0.0.0:{}/v1/conflicts", settings.http.port);
        }
        #[cfg(not(feature = "http"))]
        {
            eprintln!("This build has no HTTP support.");
            std::process::exit(1);
        }
    } else {
        tokio::spawn(run_terminal_prompt(
            conflicts.clone(),
            own_user_id.clone(),
            shutdown_tx.subscribe(),
        ));
    }

    let ctrl_c = {
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(());
            }
        })
    };

    tracing::info!(user = %own_user_id, "Starting reconciliation");
    let input = ReconcileInput::load(store.as_ref()).await?;
    let result = orchestrator
        .reconcile_until_shutdown(&input, shutdown_tx.subscribe())
        .await;

    let _ = shutdown_tx.send(());
    conflicts.shutdown().await;
    ctrl_c.abort();

    match result {
        Ok(summary) => {
            println!();
            println!(
                "Reconciled {} layers ({} writes).",
                summary.layers.len(),
                summary.writes
            );
            Ok(())
        }
        Err(ReconcileError::Cancelled) => {
            println!("Reconciliation cancelled; finished layers were saved.");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

enum Choice {
    Candidate(usize),
    Bulk(BulkMode),
}

fn prompt_choice(pending: &PendingConflict, own_user_id: &str) -> anyhow::Result<Choice> {
    let mut items: Vec<String> = pending
        .candidates
        .iter()
        .map(|c| {
            let who = match classify(c, own_user_id) {
                RecordOrigin::Own => "mine".to_string(),
                RecordOrigin::Local => "this device".to_string(),
                RecordOrigin::Template => "template".to_string(),
                RecordOrigin::Foreign => c.owner_id.to_string(),
            };
            let when = c
                .updated_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            let deleted = if c.is_deleted() { " [deleted]" } else { "" };
            format!("{}: {} (updated {}){}", who, c.display_name, when, deleted)
        })
        .collect();
    items.push("Keep mine for all remaining conflicts".to_string());
    items.push("Keep latest for all remaining conflicts".to_string());

    println!();
    println!(
        "Record {} was edited by {} users.",
        pending.id,
        pending.candidates.len()
    );
    let idx = dialoguer::Select::new()
        .with_prompt("Which version should be kept?")
        .items(&items)
        .default(0)
        .interact()?;

    let n = pending.candidates.len();
    Ok(match idx {
        i if i < n => Choice::Candidate(i),
        i if i == n => Choice::Bulk(BulkMode::SelfOwned),
        _ => Choice::Bulk(BulkMode::Latest),
    })
}

async fn run_terminal_prompt(
    conflicts: ConflictQueueHandle,
    own_user_id: String,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let pending = tokio::select! {
            pending = conflicts.next_pending() => match pending {
                Some(pending) => pending,
                None => break,
            },
            _ = shutdown.recv() => break,
        };

        let (shown, own) = (pending.clone(), own_user_id.clone());
        let choice = match tokio::task::spawn_blocking(move || prompt_choice(&shown, &own)).await {
            Ok(Ok(choice)) => choice,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Conflict prompt failed");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "Conflict prompt panicked");
                break;
            }
        };

        let result = match choice {
            Choice::Candidate(i) => conflicts
                .handle_select_ticket(pending.ticket, pending.candidates[i].clone())
                .await,
            Choice::Bulk(mode) => conflicts.handle_bulk_select(mode).await.map(|_| ()),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, record_id = %pending.id, "Answer not accepted");
        }
    }
}

async fn cmd_reset_layer(cli: &Cli, layer: &str) -> anyhow::Result<()> {
    let settings = load_settings(cli);
    let own_user_id = settings.own_user_id()?.to_string();

    let store = Arc::new(JsonDirStore::new(store_dir(cli)).await?);
    let conflicts = ConflictQueue::spawn(own_user_id.clone(), settings.reconcile.queue_capacity);
    let orchestrator = DatasetOrchestrator::new(store, Arc::new(conflicts.clone()), own_user_id);

    if orchestrator.reset_layer(layer).await? {
        println!("Layer {} reset to its template.", layer);
    } else {
        eprintln!("Layer {} has no template; nothing to reset.", layer);
    }
    conflicts.shutdown().await;

    Ok(())
}
