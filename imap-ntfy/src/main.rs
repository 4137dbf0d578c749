use anyhow::Context;
use imap_ntfy::backend::imap::ImapBackend;
use imap_ntfy::bridge::{Bridge, Options};
use imap_ntfy::config::Config;
use imap_ntfy::notify::ntfy::Ntfy;
use imap_ntfy::scheduler::{Scheduler, Shutdown};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

fn main() -> ExitCode {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to load .env file: {e}");
        }
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = imap_ntfy::log::init(&config.log_filter) {
        eprintln!("Failed to initialize logging: {e}");
    }

    match run(&config) {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: &Config) -> anyhow::Result<()> {
    info!(
        "Starting imap-ntfy for {}@{}:{} folders={:?}",
        config.imap.username, config.imap.host, config.imap.port, config.folders
    );

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("Termination requested, finishing current work");
            shutdown.request();
        })
        .context("Failed to install termination signal handler")?;
    }

    let Some(store) = imap_ntfy::store::open_with_retry(
        &config.database_url,
        &config.folders,
        config.check_interval,
        &shutdown,
    )
    .context("Failed to initialize seen message store")?
    else {
        return Ok(());
    };
    let backend = Arc::new(ImapBackend::new(&config.imap));
    let notifier = Arc::new(Ntfy::new(&config.ntfy));
    let mut bridge = Bridge::new(backend, store, notifier, Options::from(config));

    let scheduler = Scheduler::new(config.check_interval);
    let worker = std::thread::Builder::new()
        .name("imap-ntfy-worker".to_owned())
        .spawn(move || scheduler.run(&mut bridge, &shutdown))
        .context("Failed to spawn worker thread")?;

    worker
        .join()
        .map_err(|_| anyhow::anyhow!("Worker thread panicked"))?;
    Ok(())
}
