//! Logging setup for the service binary.

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `level` when it is set. `level` is either a plain level or a
/// complete [`EnvFilter`] directive list. Invalid directives are ignored.
///
/// # Errors
///
/// Returns error if a global subscriber was already installed.
pub fn init(level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| directive(level));

    let filter = EnvFilter::builder().parse_lossy(directives);
    tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
}

/// Map level names commonly used by other tools onto `tracing` levels.
fn directive(level: &str) -> String {
    match level.trim().to_ascii_lowercase().as_str() {
        "warning" => "warn".to_owned(),
        "critical" | "fatal" => "error".to_owned(),
        "" => "info".to_owned(),
        _ => level.trim().to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_aliases() {
        assert_eq!(directive("WARNING"), "warn");
        assert_eq!(directive("critical"), "error");
        assert_eq!(directive("DEBUG"), "DEBUG");
        assert_eq!(directive(" "), "info");
        assert_eq!(
            directive("info,imap_ntfy=debug"),
            "info,imap_ntfy=debug"
        );
    }
}
