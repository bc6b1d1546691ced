//! Headless sync daemon: keeps the local store of one terminal in step with
//! the backend until interrupted.
//!
//! ```text
//! pos-sync                      run until Ctrl-C
//! pos-sync login <connection>   store endpoint and key in the OS keyring
//! pos-sync logout               forget stored credentials
//! ```

use anyhow::{bail, Context};
use tracing::{info, warn};

use restaurant_pos_sync::config::Config;
use restaurant_pos_sync::{init_logging, storage, PosCore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None | Some("run") => run().await,
        Some("login") => {
            let raw = args.next().context("usage: pos-sync login <connection-string>")?;
            let url = storage::save_connection_string(&raw)?;
            println!("Credentials saved for {url}");
            Ok(())
        }
        Some("logout") => {
            storage::clear_credentials()?;
            println!("Credentials cleared");
            Ok(())
        }
        Some(other) => bail!("unknown command: {other}"),
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env().context("loading configuration")?;
    let _log_guard = init_logging(&config.log_dir());
    info!("Starting pos-sync v{}", env!("CARGO_PKG_VERSION"));
    if !storage::is_configured() {
        info!("No stored credentials, using environment configuration");
    }

    let core = PosCore::open(config).context("opening POS core")?;
    let tasks = core.start();

    let mut notifications = core.realtime.subscribe();
    let notices = tokio::spawn(async move {
        while let Ok(notification) = notifications.recv().await {
            info!(?notification, "notification");
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutting down");
    tasks.shutdown().await;
    notices.abort();

    let status = core.sync.current_status();
    if status.unsynced.total() > 0 {
        warn!(unsynced = ?status.unsynced, "Exiting with local changes not yet pushed");
    }
    Ok(())
}
