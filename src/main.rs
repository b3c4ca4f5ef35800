use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use url_podcast_lib::commands;
use url_podcast_lib::config::Config;
use url_podcast_lib::database::EntryStatus;
use url_podcast_lib::error::AppError;
use url_podcast_lib::{logging, App};

#[derive(Parser)]
#[command(name = "url-podcast")]
#[command(about = "Turn article URLs into podcast episodes", version)]
struct Cli {
    /// Config file (defaults to <data dir>/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the processing and cleanup jobs on their intervals until Ctrl-C
    Run,

    /// Run one processing batch now
    Process,

    /// Run one cleanup sweep now
    Cleanup,

    /// Queue one or more URLs
    Add {
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Discard cached artifacts and convert an entry again
    Reprocess { entry: String },

    /// Reset a failed entry's retries
    Retry { entry: String },

    /// Show an entry with its episode and usage
    Show { entry: String },

    /// Queue counts, budget and lock state
    Status,

    /// List entries, newest first
    Entries {
        #[arg(long)]
        status: Option<EntryStatus>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// List published episodes, newest first
    Episodes {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

fn output<T: Serialize>(value: &T) -> Result<(), AppError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if let Err(e) = run(cli).await {
        log::error!("{}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let config = Config::load(cli.config.as_deref())?;
    let app = App::build(config)?;
    let db = app.db.as_ref();

    match cli.command {
        Commands::Run => run_daemon(&app).await,
        Commands::Process => output(&app.scheduler.run_processing_job().await?),
        Commands::Cleanup => output(&app.scheduler.run_cleanup_job().await),
        Commands::Add { urls } => {
            let mut added = Vec::with_capacity(urls.len());
            for url in &urls {
                added.push(commands::add_entry(db, url)?);
            }
            output(&added)
        }
        Commands::Reprocess { entry } => output(&commands::reprocess_entry(db, &entry)?),
        Commands::Retry { entry } => output(&commands::retry_entry(db, &entry)?),
        Commands::Show { entry } => output(&commands::get_entry_detail(db, &entry)?),
        Commands::Status => output(&commands::get_status(
            db,
            app.ledger.as_ref(),
            app.config.max_retries,
        )?),
        Commands::Entries { status, limit } => output(&commands::list_entries(db, status, limit)?),
        Commands::Episodes { limit } => output(&commands::list_episodes(db, limit)?),
    }
}

async fn run_daemon(app: &App) -> Result<(), AppError> {
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupt received, finishing current job");
        }
        shutdown.cancel();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let trigger = app.scheduler.trigger();
        let mut usr1 = signal(SignalKind::user_defined1())?;
        let stop = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    received = usr1.recv() => {
                        if received.is_none() {
                            break;
                        }
                        trigger.notify_one();
                    }
                }
            }
        });
    }

    app.scheduler.run(cancel).await;
    Ok(())
}
