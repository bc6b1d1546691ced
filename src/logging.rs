//! Structured logging: console plus a daily rolling file under the data
//! directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Rolled log files kept on disk.
pub const MAX_LOG_FILES: usize = 10;

const LOG_FILE_PREFIX: &str = "pos-sync";
const DEFAULT_FILTER: &str = "info,restaurant_pos_sync=debug";

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// The returned guard flushes the file writer on drop; hold it for the
/// lifetime of the process.
pub fn init_logging(log_dir: &Path) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    if let Err(e) = fs::create_dir_all(log_dir) {
        eprintln!("Failed to create log directory {}: {e}", log_dir.display());
    }
    let pruned = prune_old_logs(log_dir);

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    install(
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer),
    );

    if pruned > 0 {
        tracing::debug!(pruned, "Pruned old log files");
    }
    guard
}

/// Set `subscriber` as the global default. An embedding shell or a test
/// harness may have installed one already; that one is kept.
fn install<S: SubscriberInitExt>(subscriber: S) -> bool {
    match subscriber.try_init() {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "Global subscriber already installed, keeping it");
            false
        }
    }
}

/// Keep only the newest `MAX_LOG_FILES` rolled logs. Returns how many were
/// removed.
pub fn prune_old_logs(log_dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, SystemTime)> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let name = path.file_name()?.to_str()?;
            if !path.is_file() || !name.starts_with(LOG_FILE_PREFIX) {
                return None;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            Some((path, modified))
        })
        .collect();

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_prune_keeps_newest_logs() {
        let dir = std::env::temp_dir().join(format!("pos-logs-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();

        let base = SystemTime::now() - Duration::from_secs(3600);
        for day in 0..(MAX_LOG_FILES + 3) {
            let path = dir.join(format!("{LOG_FILE_PREFIX}.2026-10-{:02}", day + 1));
            let file = fs::File::create(&path).unwrap();
            file.set_modified(base + Duration::from_secs(day as u64 * 60)).unwrap();
        }
        fs::write(dir.join("notes.txt"), "keep me").unwrap();

        assert_eq!(prune_old_logs(&dir), 3);
        assert!(!dir.join(format!("{LOG_FILE_PREFIX}.2026-10-01")).exists());
        assert!(dir.join(format!("{LOG_FILE_PREFIX}.2026-10-13")).exists());
        assert!(dir.join("notes.txt").exists());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_second_install_keeps_existing_subscriber() {
        install(tracing_subscriber::registry());
        assert!(!install(tracing_subscriber::registry().with(fmt::layer())));
    }

    #[test]
    fn test_prune_missing_dir_is_noop() {
        let dir = std::env::temp_dir().join(format!("pos-logs-missing-{}", uuid::Uuid::new_v4()));
        assert_eq!(prune_old_logs(&dir), 0);
    }
}
